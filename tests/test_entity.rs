// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// End-to-end tests for transfer entities: two peers discovering each other
// through the rendezvous store and moving bytes with one-sided semantics.
//
// Discovery is driven by the 3-second watcher cycle (senders hold slice
// discovery for two cycles), so the data-path tests poll with generous
// deadlines.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use libsmem::mem::DEVICE_LARGE_PAGE;
use libsmem::{ErrCode, TransConfig, TransRole, TransferEntity};

static PORT_OFFSET: AtomicU16 = AtomicU16::new(0);

fn unique_port() -> u16 {
    29000 + (std::process::id() % 400) as u16 * 4 + PORT_OFFSET.fetch_add(1, Ordering::Relaxed)
}

struct AlignedBuf {
    ptr: *mut u8,
    layout: Layout,
}

impl AlignedBuf {
    fn new(size: usize) -> AlignedBuf {
        let layout = Layout::from_size_align(size, DEVICE_LARGE_PAGE as usize).unwrap();
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        AlignedBuf { ptr, layout }
    }

    fn addr(&self) -> u64 {
        self.ptr as u64
    }

    fn fill(&self, byte: u8, len: usize) {
        unsafe { std::ptr::write_bytes(self.ptr, byte, len) };
    }

    fn bytes(&self, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

fn receiver_config() -> TransConfig {
    TransConfig {
        role: TransRole::Receiver,
        start_config_server: true,
        ..TransConfig::default()
    }
}

fn sender_config() -> TransConfig {
    TransConfig {
        role: TransRole::Sender,
        ..TransConfig::default()
    }
}

/// Retry a write until the sender's watcher has imported the target slice.
fn write_when_discovered(
    sender: &TransferEntity,
    receiver_id: &str,
    local: u64,
    remote: u64,
    size: u64,
) {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        match sender.sync_write(&[local], receiver_id, &[remote], &[size]) {
            Ok(()) => return,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(200)),
            Err(e) => panic!("discovery never completed: {e}"),
        }
    }
}

#[test]
fn two_peers_write_and_batch_read() {
    let port = unique_port();
    let store_url = format!("tcp://127.0.0.1:{port}");
    let receiver_id = format!("127.0.0.1:{}", 5000 + port % 100);
    let sender_id = format!("127.0.0.1:{}", 5100 + port % 100);

    let receiver =
        TransferEntity::create(&receiver_id, &store_url, receiver_config()).expect("receiver");
    let sender = TransferEntity::create(&sender_id, &store_url, sender_config()).expect("sender");
    assert_eq!(receiver.name(), receiver_id);

    let remote_buf = AlignedBuf::new(DEVICE_LARGE_PAGE as usize);
    receiver
        .register_local_memory(remote_buf.addr(), 500 * 4, 0)
        .expect("register");

    // Single write lands in the receiver's buffer.
    let local_buf = AlignedBuf::new(4096);
    local_buf.fill(0x5A, 2000);
    write_when_discovered(&sender, &receiver_id, local_buf.addr(), remote_buf.addr(), 2000);
    assert!(remote_buf.bytes(2000).iter().all(|&b| b == 0x5A));

    // Interior offsets resolve through the same slice.
    local_buf.fill(0x21, 16);
    sender
        .sync_write(&[local_buf.addr()], &receiver_id, &[remote_buf.addr() + 512], &[16])
        .expect("offset write");
    assert!(remote_buf.bytes(2000)[512..528].iter().all(|&b| b == 0x21));

    // Batch read pulls the bytes back.
    let read_buf = AlignedBuf::new(4096);
    sender
        .sync_read(
            &[read_buf.addr(), read_buf.addr() + 1000],
            &receiver_id,
            &[remote_buf.addr(), remote_buf.addr() + 1000],
            &[1000, 1000],
        )
        .expect("batch read");
    assert_eq!(read_buf.bytes(2000), remote_buf.bytes(2000));

    // Out-of-slice target is rejected.
    assert_eq!(
        sender
            .sync_write(
                &[local_buf.addr()],
                &receiver_id,
                &[remote_buf.addr() + DEVICE_LARGE_PAGE],
                &[16],
            )
            .unwrap_err(),
        ErrCode::InvalidParam
    );

    sender.shutdown();
    receiver.shutdown();
}

#[test]
fn unknown_peer_is_rejected() {
    let port = unique_port();
    let store_url = format!("tcp://127.0.0.1:{port}");
    let name = format!("127.0.0.1:{}", 5200 + port % 100);
    let entity = TransferEntity::create(&name, &store_url, receiver_config()).expect("create");

    assert_eq!(
        entity
            .sync_write(&[0x1000], "127.0.0.9:9999", &[0x2000], &[8])
            .unwrap_err(),
        ErrCode::InvalidParam
    );
    assert_eq!(
        entity.sync_write(&[], "127.0.0.9:9999", &[], &[]).unwrap_err(),
        ErrCode::InvalidParam
    );
    entity.shutdown();
}

#[test]
fn sender_skips_registration() {
    let port = unique_port();
    let store_url = format!("tcp://127.0.0.1:{port}");
    let name = format!("127.0.0.1:{}", 5300 + port % 100);
    let config = TransConfig {
        role: TransRole::Sender,
        start_config_server: true,
        ..TransConfig::default()
    };
    let entity = TransferEntity::create(&name, &store_url, config).expect("create");

    let buf = AlignedBuf::new(DEVICE_LARGE_PAGE as usize);
    // Senders have nothing to publish; the call is a no-op success.
    entity.register_local_memory(buf.addr(), 4096, 0).expect("skip");
    assert_eq!(entity.register_local_memory(0, 4096, 0).unwrap_err(), ErrCode::InvalidParam);
    entity.shutdown();
}

#[test]
fn batch_registration_merges_ranges() {
    let port = unique_port();
    let store_url = format!("tcp://127.0.0.1:{port}");
    let name = format!("127.0.0.1:{}", 5400 + port % 100);
    let entity = TransferEntity::create(&name, &store_url, receiver_config()).expect("create");

    // Two halves of one large page merge into a single registration; a
    // distant page stays separate.
    let buf = AlignedBuf::new(4 * DEVICE_LARGE_PAGE as usize);
    let regions = [
        (buf.addr(), 1000),
        (buf.addr() + 1000, 1000),
        (buf.addr() + 3 * DEVICE_LARGE_PAGE, 1000),
    ];
    entity
        .register_local_memories(&regions, 0)
        .expect("batch register");

    entity.shutdown();
}

#[test]
fn invalid_names_rejected_at_create() {
    let port = unique_port();
    let store_url = format!("tcp://127.0.0.1:{port}");
    assert_eq!(
        TransferEntity::create("not-an-address", &store_url, receiver_config()).unwrap_err(),
        ErrCode::InvalidParam
    );
    assert_eq!(
        TransferEntity::create("127.0.0.1:7000", "garbage-url", receiver_config()).unwrap_err(),
        ErrCode::InvalidParam
    );
}

#[test]
fn destroy_then_recreate_same_name() {
    let port = unique_port();
    let store_url = format!("tcp://127.0.0.1:{port}");
    let name = format!("127.0.0.1:{}", 5500 + port % 100);

    let first = TransferEntity::create(&name, &store_url, receiver_config()).expect("first");
    let first_rank = first.rank_id();
    first.shutdown();
    drop(first);
    thread::sleep(Duration::from_millis(200));

    let second = TransferEntity::create(&name, &store_url, receiver_config()).expect("second");
    // The fresh server leases from zero again.
    assert_eq!(second.rank_id(), first_rank);
    second.shutdown();
}
