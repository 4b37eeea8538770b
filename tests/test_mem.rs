// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Tests for memory entities: window reservation, slice registration,
// descriptor export/import, copies.

use std::alloc::{alloc_zeroed, dealloc, Layout};

use libsmem::mem::{
    CopyDirection, ExchangeDesc, MemEntity, MemEntityOptions, MemKind, DEVICE_LARGE_PAGE,
    EXCHANGE_DESC_CAP,
};
use libsmem::ErrCode;

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

fn entity() -> MemEntity {
    MemEntity::create(7, MemEntityOptions::default()).expect("create entity")
}

#[test]
fn reserve_and_alloc() {
    let e = entity();
    assert_eq!(
        e.alloc_local_memory(MemKind::Device, 100).unwrap_err(),
        ErrCode::NotInitialized
    );

    e.reserve(4 * DEVICE_LARGE_PAGE).expect("reserve");
    e.reserve(4 * DEVICE_LARGE_PAGE).expect("reserve is idempotent");

    let a = e.alloc_local_memory(MemKind::Device, 100).expect("alloc");
    assert_eq!(a.size, DEVICE_LARGE_PAGE, "size rounds up to the large page");
    let b = e.alloc_local_memory(MemKind::Device, DEVICE_LARGE_PAGE).expect("alloc");
    assert_eq!(b.addr, a.addr + a.size);

    // Window exhausts after 4 pages.
    e.alloc_local_memory(MemKind::Device, 2 * DEVICE_LARGE_PAGE).expect("alloc");
    assert_eq!(
        e.alloc_local_memory(MemKind::Device, DEVICE_LARGE_PAGE).unwrap_err(),
        ErrCode::MallocFailed
    );
}

#[test]
fn register_requires_alignment() {
    let e = entity();
    let buf = AlignedBuf::new(2 * DEVICE_LARGE_PAGE as usize);
    assert!(e
        .register_local_memory(MemKind::Device, buf.addr() + 1, DEVICE_LARGE_PAGE)
        .is_err());
    assert!(e
        .register_local_memory(MemKind::Device, buf.addr(), 100)
        .is_err());
    let slice = e
        .register_local_memory(MemKind::Device, buf.addr(), DEVICE_LARGE_PAGE)
        .expect("aligned register");
    assert_eq!(slice.addr, buf.addr());

    // Overlap is rejected.
    assert!(e
        .register_local_memory(MemKind::Device, buf.addr(), 2 * DEVICE_LARGE_PAGE)
        .is_err());

    e.free_local_memory(slice.addr).expect("free");
    assert_eq!(e.free_local_memory(slice.addr).unwrap_err(), ErrCode::NotExist);
}

#[test]
fn register_free_register_is_idempotent() {
    let e = entity();
    let buf = AlignedBuf::new(DEVICE_LARGE_PAGE as usize);
    e.register_local_memory(MemKind::Device, buf.addr(), DEVICE_LARGE_PAGE)
        .expect("first");
    e.free_local_memory(buf.addr()).expect("free");
    e.register_local_memory(MemKind::Device, buf.addr(), DEVICE_LARGE_PAGE)
        .expect("second register after free");
    assert_eq!(e.slices().len(), 1);
}

#[test]
fn export_import_roundtrip() {
    let e = entity();
    let buf = AlignedBuf::new(DEVICE_LARGE_PAGE as usize);
    let slice = e
        .register_local_memory(MemKind::Device, buf.addr(), DEVICE_LARGE_PAGE)
        .expect("register");

    let desc = e.export_slice(&slice).expect("export");
    assert_eq!(desc.len(), e.export_slice_size());

    let importer = entity();
    let mapped = importer.import(&[desc]).expect("import");
    assert_eq!(mapped, vec![buf.addr()]);
    assert_eq!(importer.imported_size(buf.addr()), Some(DEVICE_LARGE_PAGE));

    importer.remove_import(buf.addr());
    assert_eq!(importer.imported_size(buf.addr()), None);
}

#[test]
fn entity_desc_yields_placeholder() {
    let e = entity();
    let desc = e.export_entity().expect("export entity");
    let mapped = entity().import(&[desc]).expect("import");
    assert_eq!(mapped, vec![0]);
}

#[test]
fn import_rejects_garbage() {
    let e = entity();
    let junk = ExchangeDesc::from_slice(&[1, 2, 3]).expect("desc");
    assert!(e.import(&[junk]).is_err());
}

#[test]
fn exchange_desc_capacity() {
    assert!(ExchangeDesc::from_slice(&vec![0u8; EXCHANGE_DESC_CAP]).is_ok());
    assert!(ExchangeDesc::from_slice(&vec![0u8; EXCHANGE_DESC_CAP + 1]).is_err());
}

#[test]
fn copy_data_moves_bytes() {
    let e = entity();
    let src = vec![0xAAu8; 4096];
    let mut dst = vec![0u8; 4096];
    e.copy_data(
        src.as_ptr() as u64,
        dst.as_mut_ptr() as u64,
        4096,
        CopyDirection::LocalDeviceToGlobalDevice,
    )
    .expect("copy");
    assert!(dst.iter().all(|&b| b == 0xAA));

    assert!(e
        .copy_data(0, dst.as_mut_ptr() as u64, 1, CopyDirection::GlobalDeviceToLocalDevice)
        .is_err());
}
