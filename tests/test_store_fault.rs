// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Tests for rank leasing, the rank-state watch, and the server-side fault
// recovery path (slot reclamation + restoration records).

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use libsmem::fault::FaultTracker;
use libsmem::helper::{
    RECEIVERS_COUNT_KEY, RECEIVERS_DEVICES_INFO_KEY, RECEIVERS_SLICES_COUNT_KEY,
    RECEIVERS_SLICES_INFO_KEY, STATUS_ABNORMAL, STATUS_NORMAL,
};
use libsmem::store::{GetValue, AUTO_RANK_KEY_PREFIX};
use libsmem::{ErrCode, KvStore, StoreServer, TcpStore};

static PORT_OFFSET: AtomicU16 = AtomicU16::new(0);

fn unique_port() -> u16 {
    25000 + (std::process::id() % 400) as u16 * 4 + PORT_OFFSET.fetch_add(1, Ordering::Relaxed)
}

fn rank_of(store: &TcpStore) -> u32 {
    // The lease key itself is per-link on the server side.
    let value = store
        .get(AUTO_RANK_KEY_PREFIX, 0)
        .expect("rank lease get")
        .into_bytes();
    assert_eq!(value.len(), 4);
    u32::from_le_bytes(value.try_into().unwrap())
}

#[test]
fn rank_lease_assigns_in_connect_order() {
    let port = unique_port();
    let _server = StoreServer::start("127.0.0.1", port, u32::MAX).expect("server");

    // All three ask the server to assign (rank_id < 0), world size 3.
    let c1 = TcpStore::startup("127.0.0.1", port, false, 3, -1, 5).expect("c1");
    let c2 = TcpStore::startup("127.0.0.1", port, false, 3, -1, 5).expect("c2");
    let c3 = TcpStore::startup("127.0.0.1", port, false, 3, -1, 5).expect("c3");

    assert_eq!(rank_of(&c1), 0);
    assert_eq!(rank_of(&c2), 1);
    assert_eq!(rank_of(&c3), 2);

    // The lease is stable per link.
    assert_eq!(rank_of(&c1), 0);
}

#[test]
fn rank_released_on_disconnect_and_reassigned() {
    let port = unique_port();
    let _server = StoreServer::start("127.0.0.1", port, u32::MAX).expect("server");

    let c1 = TcpStore::startup("127.0.0.1", port, false, 2, -1, 5).expect("c1");
    let c2 = TcpStore::startup("127.0.0.1", port, false, 2, -1, 5).expect("c2");
    assert_eq!(rank_of(&c1), 0);
    assert_eq!(rank_of(&c2), 1);

    c1.shutdown();
    thread::sleep(Duration::from_millis(200));

    // A newcomer reclaims the freed rank 0.
    let c3 = TcpStore::startup("127.0.0.1", port, false, 2, -1, 5).expect("c3");
    assert_eq!(rank_of(&c3), 0);
}

#[test]
fn rank_state_watch_notifies_on_peer_down() {
    let port = unique_port();
    let _server = StoreServer::start("127.0.0.1", port, u32::MAX).expect("server");

    // c1 announces rank 7 at connect time; c2 watches.
    let c1 = TcpStore::startup("127.0.0.1", port, false, 16, 7, 5).expect("c1");
    let c2 = TcpStore::startup("127.0.0.1", port, false, 16, 8, 5).expect("c2");

    let downed = Arc::new(AtomicU32::new(u32::MAX));
    let sink = Arc::clone(&downed);
    c2.watch_rank_state(Arc::new(move |rank| {
        sink.store(rank, Ordering::Release);
    }))
    .expect("watch rank state");

    thread::sleep(Duration::from_millis(100));
    c1.shutdown();

    let deadline = Instant::now() + Duration::from_secs(2);
    while downed.load(Ordering::Acquire) == u32::MAX {
        assert!(Instant::now() < deadline, "rank-down never arrived");
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(downed.load(Ordering::Acquire), 7);
}

/// Publish one device record and two slice records the way a receiver-side
/// helper does, so the fault tracker learns the link's slots.
fn publish_peer_state(store: &TcpStore, name: &str, rank: u16, device_unit: usize, slice_unit: usize) {
    let rank_key = format!("/trans/129/{AUTO_RANK_KEY_PREFIX}{name}");
    store.set(&rank_key, &rank.to_le_bytes()).expect("rank key");

    let mut device = vec![STATUS_NORMAL];
    device.extend_from_slice(&vec![rank as u8; device_unit - 1]);
    store
        .append(&format!("/trans/129/{RECEIVERS_DEVICES_INFO_KEY}"), &device)
        .expect("device info");
    store
        .add(&format!("/trans/129/{RECEIVERS_COUNT_KEY}"), 1)
        .expect("device count");

    for i in 0..2u8 {
        let mut slice = vec![STATUS_NORMAL];
        slice.extend_from_slice(&vec![i; slice_unit - 1]);
        store
            .append(&format!("/trans/129/{RECEIVERS_SLICES_INFO_KEY}"), &slice)
            .expect("slice info");
        store
            .add(&format!("/trans/129/{RECEIVERS_SLICES_COUNT_KEY}"), 1)
            .expect("slice count");
    }
}

#[test]
fn dead_link_slots_reclaimed_and_restored() {
    let port = unique_port();
    // The server lives inside the first client so the fault tracker hooks
    // land on it.
    let c1 = TcpStore::startup("127.0.0.1", port, true, 16, -1, 5).expect("c1");
    FaultTracker::instance().register(c1.as_ref());

    let c2 = TcpStore::startup("127.0.0.1", port, false, 16, -1, 5).expect("c2");

    let device_unit = 16;
    let slice_unit = 32;
    publish_peer_state(&c2, "peer_a", 0, device_unit, slice_unit);
    thread::sleep(Duration::from_millis(50));

    // Kill the publisher: its slots flip to ABNORMAL, counts drop.
    c2.shutdown();
    thread::sleep(Duration::from_millis(300));

    let devices = c1
        .get(&format!("/trans/129/{RECEIVERS_DEVICES_INFO_KEY}"), 0)
        .expect("devices blob")
        .into_bytes();
    assert_eq!(devices[0], STATUS_ABNORMAL);

    let slices = c1
        .get(&format!("/trans/129/{RECEIVERS_SLICES_INFO_KEY}"), 0)
        .expect("slices blob")
        .into_bytes();
    assert_eq!(slices[0], STATUS_ABNORMAL);
    assert_eq!(slices[slice_unit], STATUS_ABNORMAL);

    let device_count = c1
        .get(&format!("/trans/129/{RECEIVERS_COUNT_KEY}"), 0)
        .expect("device count")
        .into_bytes();
    assert_eq!(device_count, b"0");
    let slice_count = c1
        .get(&format!("/trans/129/{RECEIVERS_SLICES_COUNT_KEY}"), 0)
        .expect("slice count")
        .into_bytes();
    assert_eq!(slice_count, b"0");

    // The rank key is gone; the next GET of it serves the restoration
    // record under the Restore code: {rank, device slot, slice slots}.
    let rank_key = format!("/trans/129/{AUTO_RANK_KEY_PREFIX}peer_a");
    match c1.get(&rank_key, 0).expect("restore get") {
        GetValue::Restored(payload) => {
            assert_eq!(payload.len(), 8);
            assert_eq!(u16::from_le_bytes(payload[0..2].try_into().unwrap()), 0);
            assert_eq!(u16::from_le_bytes(payload[2..4].try_into().unwrap()), 0);
            let mut slots = vec![
                u16::from_le_bytes(payload[4..6].try_into().unwrap()),
                u16::from_le_bytes(payload[6..8].try_into().unwrap()),
            ];
            slots.sort_unstable();
            assert_eq!(slots, vec![0, 1]);
        }
        GetValue::Existing(_) => panic!("expected a restoration record"),
    }

    // The queue is consumed; a second GET sees a plain missing key.
    assert_eq!(c1.get(&rank_key, 0).unwrap_err(), ErrCode::NotExist);
}
