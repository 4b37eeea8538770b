// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Two transfer entities in one process: a receiver registers a buffer, a
// sender waits for discovery, writes a pattern into the receiver's buffer
// and reads it back.
//
// Usage:
//   demo_transfer [store_port]

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::thread;
use std::time::{Duration, Instant};

use libsmem::mem::DEVICE_LARGE_PAGE;
use libsmem::{EntityManager, TransConfig, TransRole};

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
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or(5432);
    let store_url = format!("tcp://127.0.0.1:{port}");
    let receiver_id = "127.0.0.1:5322";
    let sender_id = "127.0.0.1:5321";

    let receiver_cfg = TransConfig {
        role: TransRole::Receiver,
        start_config_server: true,
        ..TransConfig::default()
    };
    let sender_cfg = TransConfig {
        role: TransRole::Sender,
        ..TransConfig::default()
    };

    let manager = EntityManager::instance();
    let receiver = manager
        .create_entity(receiver_id, &store_url, receiver_cfg)
        .expect("create receiver");
    let sender = manager
        .create_entity(sender_id, &store_url, sender_cfg)
        .expect("create sender");

    let size = DEVICE_LARGE_PAGE;
    let remote_buf = AlignedBuf::new(size as usize);
    receiver
        .register_local_memory(remote_buf.addr(), size, 0)
        .expect("register receiver memory");
    println!("receiver registered {size} bytes at {:#x}", remote_buf.addr());

    // Wait until the sender's watcher has imported the receiver's slice.
    let local_buf = AlignedBuf::new(4096);
    unsafe {
        std::ptr::write_bytes(local_buf.ptr, 0x5A, 2000);
    }
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let ret = sender.sync_write(
            &[local_buf.addr()],
            receiver_id,
            &[remote_buf.addr()],
            &[2000],
        );
        match ret {
            Ok(()) => break,
            Err(_) if Instant::now() < deadline => thread::sleep(Duration::from_millis(200)),
            Err(e) => panic!("write never became possible: {e}"),
        }
    }
    println!("sender wrote 2000 bytes");

    let check = unsafe { std::slice::from_raw_parts(remote_buf.ptr, 2000) };
    assert!(check.iter().all(|&b| b == 0x5A));
    println!("receiver buffer verified");

    let read_buf = AlignedBuf::new(4096);
    sender
        .sync_read(&[read_buf.addr()], receiver_id, &[remote_buf.addr()], &[2000])
        .expect("read back");
    let check = unsafe { std::slice::from_raw_parts(read_buf.ptr, 2000) };
    assert!(check.iter().all(|&b| b == 0x5A));
    println!("read back verified");

    manager.remove_by_name(sender_id).ok();
    manager.remove_by_name(receiver_id).ok();
}
