// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Tests for the store helper: rank leasing, device/slice publication, and
// diff-based discovery of peers.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use libsmem::helper::{
    StoreHelper, StoredSliceInfo, TransConfig, TransRole, TransSide, CONFIG_RECORD_LEN,
    RECEIVERS_SLICES_INFO_KEY, STATUS_ABNORMAL,
};
use libsmem::mem::ExchangeDesc;
use libsmem::net::WorkerSession;
use libsmem::store::GetValue;
use libsmem::{ErrCode, KvStore, StoreFactory, StoreServer};

static PORT_OFFSET: AtomicU16 = AtomicU16::new(0);

fn unique_port() -> u16 {
    27000 + (std::process::id() % 400) as u16 * 4 + PORT_OFFSET.fetch_add(1, Ordering::Relaxed)
}

fn desc(bytes: &[u8]) -> ExchangeDesc {
    ExchangeDesc::from_slice(bytes).expect("desc")
}

fn start_helper(port: u16, name: &str, role: TransRole) -> StoreHelper {
    let mut helper = StoreHelper::new(name, format!("tcp://127.0.0.1:{port}"), role);
    helper.initialize(129, false, 5).expect("initialize");
    helper
}

#[test]
fn role_none_is_rejected() {
    let port = unique_port();
    let _server = StoreServer::start("127.0.0.1", port, u32::MAX).expect("server");
    let mut helper = StoreHelper::new("x", format!("tcp://127.0.0.1:{port}"), TransRole::None);
    assert_eq!(helper.initialize(129, false, 5).unwrap_err(), ErrCode::InvalidParam);
}

#[test]
fn rank_lease_and_adoption() {
    let port = unique_port();
    let _server = StoreServer::start("127.0.0.1", port, u32::MAX).expect("server");

    let config = TransConfig::default();
    let mut first = start_helper(port, "worker_a", TransRole::Receiver);
    assert_eq!(first.generate_rank_id(&config).expect("lease"), 0);

    let mut second = start_helper(port, "worker_b", TransRole::Receiver);
    assert_eq!(second.generate_rank_id(&config).expect("lease"), 1);

    // Same name adopts the published rank instead of appending again.
    let mut again = start_helper(port, "worker_a", TransRole::Receiver);
    assert_eq!(again.generate_rank_id(&config).expect("adopt"), 0);

    // cluster_ranks_info holds exactly two records.
    let raw = StoreFactory::create_store("127.0.0.1", port, false, 0, 0, 5).expect("raw");
    let blob = raw
        .get("/trans/129/cluster_ranks_info", 0)
        .expect("blob")
        .into_bytes();
    assert_eq!(blob.len(), 2 * CONFIG_RECORD_LEN);

    first.destroy();
    second.destroy();
    again.destroy();
}

#[test]
fn device_discovery_diff() {
    let port = unique_port();
    let _server = StoreServer::start("127.0.0.1", port, u32::MAX).expect("server");

    // The receiver publishes its device; the sender-side helper watches the
    // receivers directory.
    let mut receiver = start_helper(port, "recv", TransRole::Receiver);
    receiver
        .store_device_info(TransSide::Receivers, &desc(&[0xAB; 32]))
        .expect("publish");

    let mut sender = start_helper(port, "send", TransRole::Sender);
    sender
        .store_device_info(TransSide::Senders, &desc(&[0xCD; 32]))
        .expect("publish");

    let found: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&found);
    sender
        .find_new_remote_ranks(TransSide::Receivers, &mut |descs| {
            let mut found = sink.lock().unwrap();
            for d in descs {
                found.push(d.as_slice().to_vec());
            }
            Ok(())
        })
        .expect("discover");
    assert_eq!(found.lock().unwrap().clone(), vec![vec![0xAB; 32]]);

    // Second cycle with no change reports nothing.
    found.lock().unwrap().clear();
    sender
        .find_new_remote_ranks(TransSide::Receivers, &mut |descs| {
            assert!(descs.is_empty());
            Ok(())
        })
        .expect("quiet cycle");

    receiver.destroy();
    sender.destroy();
}

#[test]
fn slice_discovery_add_and_remove() {
    let port = unique_port();
    let _server = StoreServer::start("127.0.0.1", port, u32::MAX).expect("server");

    let session = WorkerSession::parse("127.0.0.1:5322").expect("session");
    let info = StoredSliceInfo {
        session,
        address: 0x40_0000,
        size: 0x20_0000,
        rank: 3,
    };

    let mut receiver = start_helper(port, "recv", TransRole::Receiver);
    receiver.set_slice_export_size(32);
    receiver
        .store_device_info(TransSide::Receivers, &desc(&[0xAB; 32]))
        .expect("device");
    receiver
        .store_slice_info(TransSide::Receivers, &desc(&[0x11; 32]), &info)
        .expect("slice");

    let mut sender = start_helper(port, "send", TransRole::Sender);
    sender.set_slice_export_size(32);

    let added: Arc<Mutex<Vec<StoredSliceInfo>>> = Arc::new(Mutex::new(Vec::new()));
    let removed: Arc<Mutex<Vec<StoredSliceInfo>>> = Arc::new(Mutex::new(Vec::new()));
    let added_sink = Arc::clone(&added);
    let removed_sink = Arc::clone(&removed);
    let mut collect = move |descs: &[ExchangeDesc],
                            add: &[StoredSliceInfo],
                            rem: &[StoredSliceInfo]|
          -> libsmem::Result<()> {
        assert_eq!(descs.len(), add.len());
        added_sink.lock().unwrap().extend_from_slice(add);
        removed_sink.lock().unwrap().extend_from_slice(rem);
        Ok(())
    };

    sender
        .find_new_remote_slices(TransSide::Receivers, &mut collect)
        .expect("discover");
    {
        let added = added.lock().unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0], info);
        assert!(removed.lock().unwrap().is_empty());
    }

    // Flip the slot's status byte the way the fault handler does: the next
    // diff reports a removal.
    let raw = StoreFactory::create_store("127.0.0.1", port, false, 0, 0, 5).expect("raw");
    raw.write_at(
        &format!("/trans/129/{RECEIVERS_SLICES_INFO_KEY}"),
        &[STATUS_ABNORMAL],
        0,
    )
    .expect("flip");

    added.lock().unwrap().clear();
    sender
        .find_new_remote_slices(TransSide::Receivers, &mut collect)
        .expect("discover removal");
    assert!(added.lock().unwrap().is_empty());
    {
        let removed = removed.lock().unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0], info);
    }

    receiver.destroy();
    sender.destroy();
}

#[test]
fn restore_republishes_remembered_records() {
    let port = unique_port();
    let server = StoreServer::start("127.0.0.1", port, u32::MAX).expect("server");

    let mut helper = start_helper(port, "resilient", TransRole::Receiver);
    helper.set_slice_export_size(16);
    let config = TransConfig::default();
    let rank = helper.generate_rank_id(&config).expect("lease");
    helper
        .store_device_info(TransSide::Receivers, &desc(&[0x77; 16]))
        .expect("device");
    let session = WorkerSession::parse("127.0.0.1:9000").expect("session");
    helper
        .store_slice_info(
            TransSide::Receivers,
            &desc(&[0x33; 16]),
            &StoredSliceInfo {
                session,
                address: 0x10_0000,
                size: 0x20_0000,
                rank,
            },
        )
        .expect("slice");

    // Server restart wipes everything.
    server.shutdown();
    std::thread::sleep(std::time::Duration::from_millis(100));
    let _server = StoreServer::start("127.0.0.1", port, u32::MAX).expect("restart");
    helper.reconnect().expect("reconnect");

    helper.re_register_to_server(rank).expect("rank");
    helper.restore_device_info().expect("device restore");
    helper.restore_slice_info().expect("slice restore");

    let raw = StoreFactory::create_store("127.0.0.1", port, false, 0, 1, 5).expect("raw");
    let rank_key = "/trans/129/auto_ranking_key_resilient";
    match raw.get(rank_key, 0).expect("rank key restored") {
        GetValue::Existing(value) => {
            assert_eq!(value, rank.to_le_bytes().to_vec());
        }
        GetValue::Restored(_) => panic!("no fault queue on a fresh server"),
    }
    let devices = raw
        .get("/trans/129/receivers_devices_info", 0)
        .expect("devices")
        .into_bytes();
    assert_eq!(devices.len(), 17);

    helper.destroy();
}
