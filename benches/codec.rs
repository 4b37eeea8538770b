// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Rendezvous codec benchmarks.
//
// Run with:
//   cargo bench --bench codec
//
// Groups:
//   pack    — serialize a message at three value sizes
//   unpack  — deserialize the same frames
//
// Sizes bracket the store's real traffic: a rank-id record, one slice
// record, and one full devices-info blob.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use libsmem::codec::{Message, MsgType};

const SIZES: &[(&str, usize)] = &[
    ("rank_record_2", 2),
    ("slice_record_64", 64),
    ("devices_blob_16k", 16 * 1024),
];

fn build_message(value_size: usize) -> Message {
    let mut message = Message::with_key(MsgType::Set, "/trans/129/receivers_all_slices_info");
    message.values.push(vec![0xA5u8; value_size]);
    message
}

fn bench_pack(c: &mut Criterion) {
    let mut group = c.benchmark_group("pack");
    for &(name, size) in SIZES {
        let message = build_message(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &message, |b, message| {
            b.iter(|| black_box(message.pack().unwrap()));
        });
    }
    group.finish();
}

fn bench_unpack(c: &mut Criterion) {
    let mut group = c.benchmark_group("unpack");
    for &(name, size) in SIZES {
        let frame = build_message(size).pack().unwrap();
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(name), &frame, |b, frame| {
            b.iter(|| black_box(Message::unpack(frame).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pack, bench_unpack);
criterion_main!(benches);
