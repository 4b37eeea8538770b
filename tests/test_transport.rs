// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Tests for the transport layer: memory keys, the counter stream, the host
// transport over the loopback provider, the device state machine, and
// composite routing.
//
// The host transport is a process-wide singleton, so everything touching it
// serializes on HOST_LOCK.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use libsmem::transport::provider::LoopbackRpc;
use libsmem::transport::{
    CounterStream, DeviceTransport, PrepareOptions, RankPrepareInfo, TransportMemoryKey,
    TransportMemoryRegion, TransportOptions, TransportType, REG_MR_FLAG_DRAM, REG_MR_FLAG_HBM,
};
use libsmem::{ErrCode, HostTransport, TransportManager};

static PORT_OFFSET: AtomicU16 = AtomicU16::new(0);

fn unique_port() -> u16 {
    33000 + (std::process::id() % 400) as u16 * 8 + PORT_OFFSET.fetch_add(1, Ordering::Relaxed)
}

fn host_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

#[test]
fn memory_key_roundtrip() {
    let provider_key = [7u32, 6, 5, 4, 3, 2, 1, 0];
    let key = TransportMemoryKey::pack(
        TransportType::Hcom,
        0x1234_5678_9ABC_DEF0,
        0x0000_0001_0000_0000,
        &provider_key,
    );
    assert_eq!(key.transport_type(), TransportType::Hcom as u32);
    assert_eq!(key.addr(), 0x1234_5678_9ABC_DEF0);
    assert_eq!(key.size(), 0x0000_0001_0000_0000);
    assert_eq!(key.provider_key(), provider_key);

    assert_eq!(key.unpack(TransportType::Hcom).expect("unpack"), (
        0x1234_5678_9ABC_DEF0,
        0x0000_0001_0000_0000,
    ));
    // The wrong owner refuses the key.
    assert_eq!(key.unpack(TransportType::Hccp).unwrap_err(), ErrCode::InvalidParam);
}

#[test]
fn counter_stream_drains() {
    let stream = Arc::new(CounterStream::new(0));
    stream.submit_tasks(3);

    let worker_stream = Arc::clone(&stream);
    let worker = thread::spawn(move || {
        for _ in 0..3 {
            thread::sleep(Duration::from_millis(20));
            worker_stream.finish_one(true);
        }
    });

    stream.synchronize();
    worker.join().unwrap();

    // A failed submit unwinds without waking anyone.
    stream.submit_tasks(1);
    stream.finish_one(false);
    stream.synchronize();
}

#[test]
fn host_transport_one_sided() {
    let _guard = host_lock().lock().unwrap();
    let port = unique_port();
    let host = HostTransport::instance();
    host.open(&TransportOptions {
        rank_id: 0,
        rank_count: 2,
        nic: format!("tcp://127.0.0.1:{port}"),
        ..TransportOptions::default()
    })
    .expect("open");
    assert_eq!(host.nic(), format!("tcp://127.0.0.1:{port}"));

    // Local region.
    let mut local = vec![0x5Au8; 8192];
    let local_addr = local.as_mut_ptr() as u64;
    host.register_memory_region(&TransportMemoryRegion::new(local_addr, 8192, REG_MR_FLAG_DRAM))
        .expect("register");
    assert!(host.has_registered(local_addr, 8192));
    assert!(host.has_registered(local_addr + 100, 1000));
    assert!(!host.has_registered(local_addr, 8193));

    let key = host.query_memory_key(local_addr + 16).expect("key");
    assert_eq!(host.parse_memory_key(&key).expect("parse"), (local_addr, 8192));

    // Fabricate the peer: a second loopback service with its own region,
    // bound at the nic the peer would publish.
    let peer_nic = format!("tcp://127.0.0.1:{}", port + 1);
    let mut peer = vec![0u8; 8192];
    let peer_addr = peer.as_mut_ptr() as u64;
    let provider = LoopbackRpc::instance();
    use libsmem::transport::provider::RpcProvider;
    let peer_service = provider.create_service(0, "peer").expect("peer service");
    provider.bind(peer_service, &peer_nic).expect("peer bind");
    provider.start(peer_service).expect("peer start");
    let (_, peer_key) = provider
        .register_region(peer_service, peer_addr, 8192)
        .expect("peer region");

    let mut prepare = PrepareOptions::default();
    prepare.ranks.insert(
        1,
        RankPrepareInfo {
            nic: peer_nic,
            mem_keys: vec![TransportMemoryKey::pack(
                TransportType::Hcom,
                peer_addr,
                8192,
                &peer_key.0,
            )],
        },
    );
    host.prepare(&prepare).expect("prepare");
    host.connect().expect("connect");

    // Write then read back through the channel.
    host.write_remote(1, local_addr, peer_addr, 4096).expect("write");
    assert!(peer[..4096].iter().all(|&b| b == 0x5A));

    peer[..128].iter_mut().for_each(|b| *b = 0x77);
    host.read_remote(1, local_addr, peer_addr, 128).expect("read");
    assert_eq!(local[0], 0x77);

    // Async ops complete on the per-thread stream.
    host.write_remote_async(1, local_addr, peer_addr, 256).expect("async write");
    host.read_remote_async(1, local_addr, peer_addr, 256).expect("async read");
    host.synchronize(1).expect("synchronize");

    // Idempotent register cycle.
    host.unregister_memory_region(local_addr).expect("unregister");
    assert!(!host.has_registered(local_addr, 1));
    host.register_memory_region(&TransportMemoryRegion::new(local_addr, 8192, REG_MR_FLAG_DRAM))
        .expect("register again");

    host.close().expect("close");
    provider.destroy_service(peer_service);
}

#[test]
fn host_transport_rejects_bad_registration() {
    let _guard = host_lock().lock().unwrap();
    let port = unique_port();
    let host = HostTransport::instance();
    host.open(&TransportOptions {
        rank_id: 0,
        rank_count: 1,
        nic: format!("tcp://127.0.0.1:{port}"),
        ..TransportOptions::default()
    })
    .expect("open");

    // HBM-flagged memory does not belong to the host transport.
    let buf = vec![0u8; 64];
    assert_eq!(
        host.register_memory_region(&TransportMemoryRegion::new(
            buf.as_ptr() as u64,
            64,
            REG_MR_FLAG_HBM,
        ))
        .unwrap_err(),
        ErrCode::InvalidParam
    );
    assert_eq!(
        host.register_memory_region(&TransportMemoryRegion::new(0, 64, REG_MR_FLAG_DRAM))
            .unwrap_err(),
        ErrCode::InvalidParam
    );
    host.close().expect("close");
}

#[test]
fn device_transport_bring_up() {
    let device = DeviceTransport::new();
    let port = unique_port();
    device
        .open(&TransportOptions {
            rank_id: 0,
            rank_count: 2,
            device_id: 0,
            nic: format!("127.0.0.1:{port}"),
            ..TransportOptions::default()
        })
        .expect("open");
    assert_eq!(device.nic(), format!("127.0.0.1:{port}"));

    let mut local = vec![0xA1u8; 4096];
    let local_addr = local.as_mut_ptr() as u64;
    device
        .register_memory_region(&TransportMemoryRegion::new(local_addr, 4096, REG_MR_FLAG_HBM))
        .expect("register");
    let key = device.query_memory_key(local_addr).expect("key");
    assert_eq!(key.transport_type(), TransportType::Hccp as u32);
    assert_eq!(device.parse_memory_key(&key).expect("parse"), (local_addr, 4096));

    // One remote peer; the loopback driver reports sockets and QPs ready.
    let mut remote = vec![0u8; 4096];
    let remote_addr = remote.as_mut_ptr() as u64;
    let mut prepare = PrepareOptions::default();
    prepare.ranks.insert(
        1,
        RankPrepareInfo {
            nic: "127.0.0.2:9000".to_string(),
            mem_keys: vec![TransportMemoryKey::pack(
                TransportType::Hccp,
                remote_addr,
                4096,
                &[1, 2, 0, 0, 0, 0, 0, 0],
            )],
        },
    );
    device.prepare(&prepare).expect("prepare");
    device.connect().expect("connect");
    device.wait_for_connected(5_000_000_000).expect("ready");
    assert!(device.is_ready());

    device.write_remote(1, local_addr, remote_addr, 1024).expect("write");
    assert!(remote[..1024].iter().all(|&b| b == 0xA1));

    assert_eq!(
        device.read_remote_async(1, local_addr, remote_addr, 64).unwrap_err(),
        ErrCode::NotSupported
    );
    assert_eq!(device.synchronize(1).unwrap_err(), ErrCode::NotSupported);

    device.close().expect("close");
}

#[test]
fn compose_routes_by_flag_and_address() {
    let _guard = host_lock().lock().unwrap();
    let port = unique_port();
    let compose = libsmem::ComposeTransport::new();
    compose
        .open(&TransportOptions {
            rank_id: 0,
            rank_count: 2,
            device_id: 0,
            nic: format!(
                "host#tcp://127.0.0.1:{port};device#127.0.0.1:{}",
                port + 4
            ),
            ..TransportOptions::default()
        })
        .expect("open");
    let nic = compose.nic();
    assert!(nic.contains("host#tcp://127.0.0.1:"));
    assert!(nic.contains("device#127.0.0.1:"));

    let dram = vec![0u8; 4096];
    let dram_addr = dram.as_ptr() as u64;
    compose
        .register_memory_region(&TransportMemoryRegion::new(dram_addr, 4096, REG_MR_FLAG_DRAM))
        .expect("dram register");
    let hbm = vec![0u8; 4096];
    let hbm_addr = hbm.as_ptr() as u64;
    compose
        .register_memory_region(&TransportMemoryRegion::new(hbm_addr, 4096, REG_MR_FLAG_HBM))
        .expect("hbm register");

    // Keys come back stamped with the owning transport and parse through
    // the composite's word-0 dispatch.
    let dram_key = compose.query_memory_key(dram_addr).expect("dram key");
    assert_eq!(dram_key.transport_type(), TransportType::Hcom as u32);
    assert_eq!(compose.parse_memory_key(&dram_key).expect("parse"), (dram_addr, 4096));

    let hbm_key = compose.query_memory_key(hbm_addr).expect("hbm key");
    assert_eq!(hbm_key.transport_type(), TransportType::Hccp as u32);
    assert_eq!(compose.parse_memory_key(&hbm_key).expect("parse"), (hbm_addr, 4096));

    assert!(compose.has_registered(dram_addr, 4096));
    assert!(compose.has_registered(hbm_addr, 4096));

    assert_eq!(
        compose
            .register_memory_region(&TransportMemoryRegion::new(dram_addr + 1, 16, 0))
            .unwrap_err(),
        ErrCode::InvalidParam
    );
    assert_eq!(compose.synchronize(0).unwrap_err(), ErrCode::NotSupported);

    compose.unregister_memory_region(dram_addr).expect("unregister");
    assert!(!compose.has_registered(dram_addr, 4096));

    compose.close().expect("close");
}
