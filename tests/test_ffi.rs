// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Tests for the C ABI. Init/uninit are process-global, so this file keeps
// everything inside one test.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ffi::{c_void, CStr, CString};
use std::thread;
use std::time::{Duration, Instant};

use libsmem::ffi::{
    smem_trans_batch_read, smem_trans_batch_register_mem, smem_trans_config_init,
    smem_trans_create, smem_trans_deregister_mem, smem_trans_destroy, smem_trans_init,
    smem_trans_last_error, smem_trans_read, smem_trans_register_mem, smem_trans_uninit,
    smem_trans_write, smem_trans_write_submit, smem_trans_config_t,
};
use libsmem::mem::DEVICE_LARGE_PAGE;
use libsmem::{ErrCode, TransRole};

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
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

fn port() -> u16 {
    38000 + (std::process::id() % 400) as u16
}

#[test]
fn c_abi_end_to_end() {
    // --- config defaults -------------------------------------------------
    assert_eq!(
        smem_trans_config_init(std::ptr::null_mut()),
        ErrCode::InvalidParam.code()
    );
    let mut config = smem_trans_config_t {
        role: 0,
        init_timeout: 0,
        device_id: 0,
        flags: 1,
        data_op_type: 0,
        start_config_server: true,
    };
    assert_eq!(smem_trans_config_init(&mut config), 0);
    assert_eq!(config.role, TransRole::Sender as u32);
    assert_eq!(config.init_timeout, 120);
    assert_eq!(config.device_id, u32::MAX);
    assert_eq!(config.flags, 0);
    assert!(!config.start_config_server);

    // --- calls before init are rejected ----------------------------------
    let store_url = CString::new(format!("tcp://127.0.0.1:{}", port())).unwrap();
    let receiver_id = CString::new("127.0.0.1:6321").unwrap();
    let sender_id = CString::new("127.0.0.1:6322").unwrap();
    let handle = smem_trans_create(store_url.as_ptr(), receiver_id.as_ptr(), &config);
    assert!(handle.is_null());

    assert_eq!(smem_trans_init(std::ptr::null()), ErrCode::InvalidParam.code());
    assert_eq!(smem_trans_init(&config), 0);
    assert_eq!(smem_trans_init(&config), 0, "re-init is a no-op");

    // --- create both peers ------------------------------------------------
    let mut receiver_config = config;
    receiver_config.role = TransRole::Receiver as u32;
    receiver_config.start_config_server = true;
    let receiver = smem_trans_create(store_url.as_ptr(), receiver_id.as_ptr(), &receiver_config);
    assert!(!receiver.is_null(), "{}", last_error_text(-1));

    let sender = smem_trans_create(store_url.as_ptr(), sender_id.as_ptr(), &config);
    assert!(!sender.is_null(), "{}", last_error_text(-1));

    assert!(
        smem_trans_create(store_url.as_ptr(), receiver_id.as_ptr(), &receiver_config).is_null(),
        "duplicate names are rejected"
    );

    // --- register the receiver buffer -------------------------------------
    let remote = AlignedBuf::new(DEVICE_LARGE_PAGE as usize);
    assert_eq!(
        smem_trans_register_mem(receiver, std::ptr::null_mut(), 2000, 0),
        ErrCode::InvalidParam.code()
    );
    assert_eq!(
        smem_trans_register_mem(receiver, remote.ptr as *mut c_void, 2000, 0),
        0
    );

    // --- write, then read back --------------------------------------------
    let local = AlignedBuf::new(4096);
    unsafe { std::ptr::write_bytes(local.ptr, 0x3C, 2000) };

    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let ret = smem_trans_write(
            sender,
            local.ptr as *const c_void,
            receiver_id.as_ptr(),
            remote.ptr as *mut c_void,
            2000,
            0,
        );
        if ret == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "discovery never completed: {ret}");
        thread::sleep(Duration::from_millis(200));
    }
    let written = unsafe { std::slice::from_raw_parts(remote.ptr, 2000) };
    assert!(written.iter().all(|&b| b == 0x3C));

    let readback = AlignedBuf::new(4096);
    assert_eq!(
        smem_trans_read(
            sender,
            readback.ptr as *mut c_void,
            receiver_id.as_ptr(),
            remote.ptr as *const c_void,
            2000,
            0,
        ),
        0
    );
    let got = unsafe { std::slice::from_raw_parts(readback.ptr, 2000) };
    assert!(got.iter().all(|&b| b == 0x3C));

    // Nonzero per-op flags are rejected.
    assert_eq!(
        smem_trans_write(
            sender,
            local.ptr as *const c_void,
            receiver_id.as_ptr(),
            remote.ptr as *mut c_void,
            16,
            1,
        ),
        ErrCode::InvalidParam.code()
    );

    // --- batch read --------------------------------------------------------
    let locals = [readback.ptr as *const c_void];
    let remotes = [remote.ptr as *const c_void];
    let sizes = [1000usize];
    assert_eq!(
        smem_trans_batch_read(
            sender,
            locals.as_ptr(),
            receiver_id.as_ptr(),
            remotes.as_ptr(),
            sizes.as_ptr(),
            1,
            0,
        ),
        0
    );

    // --- submit rides the sync path ----------------------------------------
    let mut stream_slot = 0u64;
    assert_eq!(
        smem_trans_write_submit(
            sender,
            local.ptr as *const c_void,
            receiver_id.as_ptr(),
            remote.ptr as *mut c_void,
            64,
            &mut stream_slot as *mut u64 as *mut c_void,
            0,
        ),
        0
    );
    assert_eq!(
        smem_trans_write_submit(
            sender,
            local.ptr as *const c_void,
            receiver_id.as_ptr(),
            remote.ptr as *mut c_void,
            64,
            std::ptr::null_mut(),
            0,
        ),
        ErrCode::InvalidParam.code()
    );

    // --- batch register validation -----------------------------------------
    assert_eq!(
        smem_trans_batch_register_mem(receiver, std::ptr::null(), std::ptr::null(), 0, 0),
        ErrCode::InvalidParam.code()
    );

    // --- deregister keeps published slots ----------------------------------
    assert_eq!(smem_trans_deregister_mem(receiver, remote.ptr as *mut c_void), 0);

    // --- unknown handle ----------------------------------------------------
    assert_eq!(
        smem_trans_register_mem(0xDEAD_BEEF as *mut c_void, remote.ptr as *mut c_void, 64, 0),
        ErrCode::ObjectNotExists.code()
    );

    // --- teardown ----------------------------------------------------------
    smem_trans_destroy(sender, 0);
    smem_trans_destroy(receiver, 0);
    smem_trans_destroy(std::ptr::null_mut(), 0);
    smem_trans_uninit(0);

    // Everything fails closed after uninit.
    assert_eq!(
        smem_trans_register_mem(receiver, remote.ptr as *mut c_void, 64, 0),
        ErrCode::NotInitialized.code()
    );
}

fn last_error_text(code: i32) -> String {
    unsafe {
        CStr::from_ptr(smem_trans_last_error(code))
            .to_string_lossy()
            .into_owned()
    }
}
