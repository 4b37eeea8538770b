// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Stable C ABI. Handles are opaque pointers owned by the entity registry;
// every entry validates the library-init flag and its pointer arguments and
// returns 0 on success or a negative code from the error catalog.

// C-facing names keep their header spelling.
#![allow(non_camel_case_types)]

use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::error::{error_string, set_last_error, ErrCode};
use crate::fault::FaultTracker;
use crate::helper::{TransConfig, TransDataOp, TransRole, DEFAULT_INIT_TIMEOUT};
use crate::registry::EntityManager;
use crate::store::StoreFactory;

/// C-visible transfer configuration.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct smem_trans_config_t {
    pub role: u32,
    pub init_timeout: u32,
    pub device_id: u32,
    pub flags: u32,
    pub data_op_type: u32,
    pub start_config_server: bool,
}

pub type smem_trans_t = *mut c_void;

static INITED: AtomicBool = AtomicBool::new(false);

fn parse_config(config: &smem_trans_config_t) -> Result<TransConfig, ErrCode> {
    let role = TransRole::from_u32(config.role)?;
    let data_op = match config.data_op_type {
        x if x == TransDataOp::Sdma as u32 => TransDataOp::Sdma,
        x if x == TransDataOp::Roce as u32 => TransDataOp::Roce,
        _ => return Err(ErrCode::InvalidParam),
    };
    Ok(TransConfig {
        role,
        init_timeout: config.init_timeout,
        device_id: config.device_id,
        flags: config.flags,
        data_op,
        start_config_server: config.start_config_server,
    })
}

unsafe fn parse_str<'a>(ptr: *const c_char) -> Result<&'a str, ErrCode> {
    if ptr.is_null() {
        return Err(ErrCode::InvalidParam);
    }
    let text = CStr::from_ptr(ptr).to_str().map_err(|_| ErrCode::InvalidParam)?;
    if text.is_empty() {
        return Err(ErrCode::InvalidParam);
    }
    Ok(text)
}

fn require_inited() -> Result<(), ErrCode> {
    if !INITED.load(Ordering::Acquire) {
        set_last_error("library not initialized");
        return Err(ErrCode::NotInitialized);
    }
    Ok(())
}

fn fail<T>(code: ErrCode, message: &str) -> Result<T, ErrCode> {
    set_last_error(message);
    Err(code)
}

/// Fill `config` with the defaults.
#[no_mangle]
pub extern "C" fn smem_trans_config_init(config: *mut smem_trans_config_t) -> i32 {
    if config.is_null() {
        set_last_error("config is null");
        return ErrCode::InvalidParam.code();
    }
    let defaults = TransConfig::default();
    unsafe {
        *config = smem_trans_config_t {
            role: defaults.role as u32,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            device_id: defaults.device_id,
            flags: 0,
            data_op_type: defaults.data_op as u32,
            start_config_server: false,
        };
    }
    0
}

/// Initialize the library once per process.
#[no_mangle]
pub extern "C" fn smem_trans_init(config: *const smem_trans_config_t) -> i32 {
    if config.is_null() {
        set_last_error("config is null");
        return ErrCode::InvalidParam.code();
    }
    if INITED.swap(true, Ordering::AcqRel) {
        info!("transfer library initialized already");
        return 0;
    }
    info!("transfer library initialized");
    0
}

/// Tear every entity and cached store down.
#[no_mangle]
pub extern "C" fn smem_trans_uninit(_flags: u32) {
    if !INITED.swap(false, Ordering::AcqRel) {
        return;
    }
    EntityManager::instance().remove_all();
    StoreFactory::destroy_all();
    FaultTracker::instance().reset();
    info!("transfer library uninitialized");
}

/// Create a transfer entity named `unique_id` coordinating through the
/// rendezvous store at `store_url`.
#[no_mangle]
pub extern "C" fn smem_trans_create(
    store_url: *const c_char,
    unique_id: *const c_char,
    config: *const smem_trans_config_t,
) -> smem_trans_t {
    let result = (|| {
        require_inited()?;
        let store_url = unsafe { parse_str(store_url) }?;
        let unique_id = unsafe { parse_str(unique_id) }?;
        if config.is_null() {
            return fail(ErrCode::InvalidParam, "config is null");
        }
        let config = parse_config(unsafe { &*config })?;
        let entity = EntityManager::instance().create_entity(unique_id, store_url, config)?;
        Ok(EntityManager::instance().handle_of(&entity))
    })();
    match result {
        Ok(ptr) => ptr as smem_trans_t,
        Err(e) => {
            set_last_error(format!("create transfer entity failed: {e}"));
            std::ptr::null_mut()
        }
    }
}

#[no_mangle]
pub extern "C" fn smem_trans_destroy(handle: smem_trans_t, _flags: u32) {
    if handle.is_null() {
        return;
    }
    if EntityManager::instance().remove_by_ptr(handle as usize).is_err() {
        set_last_error("handle not found");
    }
}

fn entity_of(handle: smem_trans_t) -> Result<std::sync::Arc<crate::entity::TransferEntity>, ErrCode> {
    if handle.is_null() {
        return fail(ErrCode::InvalidParam, "handle is null");
    }
    EntityManager::instance()
        .get_by_ptr(handle as usize)
        .map_err(|e| {
            set_last_error("handle not found");
            e
        })
}

#[no_mangle]
pub extern "C" fn smem_trans_register_mem(
    handle: smem_trans_t,
    address: *mut c_void,
    capacity: usize,
    flags: u32,
) -> i32 {
    let result = (|| {
        require_inited()?;
        if address.is_null() || capacity == 0 {
            return fail(ErrCode::InvalidParam, "invalid address or capacity");
        }
        let entity = entity_of(handle)?;
        entity.register_local_memory(address as u64, capacity as u64, flags)
    })();
    ErrCode::to_c(result)
}

#[no_mangle]
pub extern "C" fn smem_trans_batch_register_mem(
    handle: smem_trans_t,
    addresses: *const *mut c_void,
    capacities: *const usize,
    count: u32,
    flags: u32,
) -> i32 {
    let result = (|| {
        require_inited()?;
        if addresses.is_null() || capacities.is_null() || count == 0 {
            return fail(ErrCode::InvalidParam, "invalid batch arguments");
        }
        let entity = entity_of(handle)?;
        let addresses = unsafe { std::slice::from_raw_parts(addresses, count as usize) };
        let capacities = unsafe { std::slice::from_raw_parts(capacities, count as usize) };
        let mut regions = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            if addresses[i].is_null() || capacities[i] == 0 {
                return fail(ErrCode::InvalidParam, "invalid address or capacity in batch");
            }
            regions.push((addresses[i] as u64, capacities[i] as u64));
        }
        entity.register_local_memories(&regions, flags)
    })();
    ErrCode::to_c(result)
}

#[no_mangle]
pub extern "C" fn smem_trans_deregister_mem(handle: smem_trans_t, address: *mut c_void) -> i32 {
    let result = (|| {
        require_inited()?;
        if address.is_null() {
            return fail(ErrCode::InvalidParam, "address is null");
        }
        let entity = entity_of(handle)?;
        entity.deregister_local_memory(address as u64)
    })();
    ErrCode::to_c(result)
}

#[allow(clippy::too_many_arguments)]
fn transfer(
    handle: smem_trans_t,
    locals: &[u64],
    remote_unique_id: *const c_char,
    remotes: &[u64],
    sizes: &[u64],
    flags: u32,
    is_write: bool,
) -> Result<(), ErrCode> {
    require_inited()?;
    if flags != 0 {
        return fail(ErrCode::InvalidParam, "flags must be 0");
    }
    let remote = unsafe { parse_str(remote_unique_id) }?;
    let entity = entity_of(handle)?;
    if is_write {
        entity.sync_write(locals, remote, remotes, sizes)
    } else {
        entity.sync_read(locals, remote, remotes, sizes)
    }
}

#[no_mangle]
pub extern "C" fn smem_trans_write(
    handle: smem_trans_t,
    local_addr: *const c_void,
    remote_unique_id: *const c_char,
    remote_addr: *mut c_void,
    data_size: usize,
    flags: u32,
) -> i32 {
    let result = transfer(
        handle,
        &[local_addr as u64],
        remote_unique_id,
        &[remote_addr as u64],
        &[data_size as u64],
        flags,
        true,
    );
    ErrCode::to_c(result)
}

#[no_mangle]
pub extern "C" fn smem_trans_read(
    handle: smem_trans_t,
    local_addr: *mut c_void,
    remote_unique_id: *const c_char,
    remote_addr: *const c_void,
    data_size: usize,
    flags: u32,
) -> i32 {
    let result = transfer(
        handle,
        &[local_addr as u64],
        remote_unique_id,
        &[remote_addr as u64],
        &[data_size as u64],
        flags,
        false,
    );
    ErrCode::to_c(result)
}

unsafe fn batch_args(
    locals: *const *const c_void,
    remotes: *const *const c_void,
    sizes: *const usize,
    batch: u32,
) -> Result<(Vec<u64>, Vec<u64>, Vec<u64>), ErrCode> {
    if locals.is_null() || remotes.is_null() || sizes.is_null() || batch == 0 {
        return fail(ErrCode::InvalidParam, "invalid batch arguments");
    }
    let locals = std::slice::from_raw_parts(locals, batch as usize);
    let remotes = std::slice::from_raw_parts(remotes, batch as usize);
    let sizes = std::slice::from_raw_parts(sizes, batch as usize);
    Ok((
        locals.iter().map(|&p| p as u64).collect(),
        remotes.iter().map(|&p| p as u64).collect(),
        sizes.iter().map(|&s| s as u64).collect(),
    ))
}

#[no_mangle]
pub extern "C" fn smem_trans_batch_write(
    handle: smem_trans_t,
    local_addrs: *const *const c_void,
    remote_unique_id: *const c_char,
    remote_addrs: *const *const c_void,
    data_sizes: *const usize,
    batch_size: u32,
    flags: u32,
) -> i32 {
    let result = (|| {
        let (locals, remotes, sizes) =
            unsafe { batch_args(local_addrs, remote_addrs, data_sizes, batch_size) }?;
        transfer(handle, &locals, remote_unique_id, &remotes, &sizes, flags, true)
    })();
    ErrCode::to_c(result)
}

#[no_mangle]
pub extern "C" fn smem_trans_batch_read(
    handle: smem_trans_t,
    local_addrs: *const *const c_void,
    remote_unique_id: *const c_char,
    remote_addrs: *const *const c_void,
    data_sizes: *const usize,
    batch_size: u32,
    flags: u32,
) -> i32 {
    let result = (|| {
        let (locals, remotes, sizes) =
            unsafe { batch_args(local_addrs, remote_addrs, data_sizes, batch_size) }?;
        transfer(handle, &locals, remote_unique_id, &remotes, &sizes, flags, false)
    })();
    ErrCode::to_c(result)
}

#[no_mangle]
pub extern "C" fn smem_trans_write_submit(
    handle: smem_trans_t,
    local_addr: *const c_void,
    remote_unique_id: *const c_char,
    remote_addr: *mut c_void,
    data_size: usize,
    stream: *mut c_void,
    flags: u32,
) -> i32 {
    let result = (|| {
        require_inited()?;
        if stream.is_null() {
            return fail(ErrCode::InvalidParam, "stream is null");
        }
        if flags != 0 {
            return fail(ErrCode::InvalidParam, "flags must be 0");
        }
        let remote = unsafe { parse_str(remote_unique_id) }?;
        let entity = entity_of(handle)?;
        entity.submit_write(
            &[local_addr as u64],
            remote,
            &[remote_addr as u64],
            &[data_size as u64],
            stream as u64,
        )
    })();
    ErrCode::to_c(result)
}

#[no_mangle]
pub extern "C" fn smem_trans_read_submit(
    handle: smem_trans_t,
    local_addr: *mut c_void,
    remote_unique_id: *const c_char,
    remote_addr: *const c_void,
    data_size: usize,
    stream: *mut c_void,
    flags: u32,
) -> i32 {
    let result = (|| {
        require_inited()?;
        if stream.is_null() {
            return fail(ErrCode::InvalidParam, "stream is null");
        }
        if flags != 0 {
            return fail(ErrCode::InvalidParam, "flags must be 0");
        }
        let remote = unsafe { parse_str(remote_unique_id) }?;
        let entity = entity_of(handle)?;
        entity.submit_read(
            &[local_addr as u64],
            remote,
            &[remote_addr as u64],
            &[data_size as u64],
            stream as u64,
        )
    })();
    ErrCode::to_c(result)
}

#[no_mangle]
pub extern "C" fn smem_trans_batch_write_submit(
    handle: smem_trans_t,
    local_addrs: *const *const c_void,
    remote_unique_id: *const c_char,
    remote_addrs: *const *const c_void,
    data_sizes: *const usize,
    batch_size: u32,
    stream: *mut c_void,
    flags: u32,
) -> i32 {
    let result = (|| {
        require_inited()?;
        if stream.is_null() {
            return fail(ErrCode::InvalidParam, "stream is null");
        }
        let (locals, remotes, sizes) =
            unsafe { batch_args(local_addrs, remote_addrs, data_sizes, batch_size) }?;
        transfer(handle, &locals, remote_unique_id, &remotes, &sizes, flags, true)
    })();
    ErrCode::to_c(result)
}

#[no_mangle]
pub extern "C" fn smem_trans_batch_read_submit(
    handle: smem_trans_t,
    local_addrs: *const *const c_void,
    remote_unique_id: *const c_char,
    remote_addrs: *const *const c_void,
    data_sizes: *const usize,
    batch_size: u32,
    stream: *mut c_void,
    flags: u32,
) -> i32 {
    let result = (|| {
        require_inited()?;
        if stream.is_null() {
            return fail(ErrCode::InvalidParam, "stream is null");
        }
        let (locals, remotes, sizes) =
            unsafe { batch_args(local_addrs, remote_addrs, data_sizes, batch_size) }?;
        transfer(handle, &locals, remote_unique_id, &remotes, &sizes, flags, false)
    })();
    ErrCode::to_c(result)
}

thread_local! {
    static LAST_ERROR_C: std::cell::RefCell<CString> =
        std::cell::RefCell::new(CString::new("").unwrap());
}

/// Description of the last error on this thread, or of `code` when no
/// thread-local message is recorded.
#[no_mangle]
pub extern "C" fn smem_trans_last_error(code: i32) -> *const c_char {
    LAST_ERROR_C.with(|slot| {
        let message = crate::error::last_error();
        let text = if message.is_empty() {
            error_string(code).to_string()
        } else {
            message
        };
        let c = CString::new(text).unwrap_or_default();
        *slot.borrow_mut() = c;
        slot.borrow().as_ptr()
    })
}
