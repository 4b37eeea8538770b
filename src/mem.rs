// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Memory entities: the local container a transfer entity registers buffers
// into and imports peers' buffers from.
//
// An entity owns a reserved VA window, a set of local slices (allocated
// inside the window or registered from caller memory), and the imports
// obtained from peers' exchange descriptors. Descriptors are fixed-capacity
// opaque blobs so they can travel through the rendezvous store unchanged.
//
// This backend maps host memory. Descriptors carry `{pid, base, size}`;
// importing within the owning process resolves to the live address, so
// cooperating entities in one process exchange data through plain copies.
// Device-memory backends plug in behind the same surface.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, error};

use crate::error::{ErrCode, Result};

/// Device large page; slice addresses and sizes are aligned to this.
pub const DEVICE_LARGE_PAGE: u64 = 2 * 1024 * 1024;

/// Fixed capacity of an exchange descriptor blob.
pub const EXCHANGE_DESC_CAP: usize = 512;

const DESC_MAGIC: u32 = 0x4D45_4E54;
const DESC_KIND_ENTITY: u32 = 1;
const DESC_KIND_SLICE: u32 = 2;
/// magic + kind + pid + device id + base + size.
const DESC_LEN: usize = 4 + 4 + 4 + 4 + 8 + 8;

/// Opaque exchange blob published through the rendezvous store.
#[derive(Clone, Copy)]
pub struct ExchangeDesc {
    bytes: [u8; EXCHANGE_DESC_CAP],
    len: u32,
}

impl ExchangeDesc {
    pub fn from_slice(data: &[u8]) -> Result<ExchangeDesc> {
        if data.len() > EXCHANGE_DESC_CAP {
            return Err(ErrCode::InvalidParam);
        }
        let mut bytes = [0u8; EXCHANGE_DESC_CAP];
        bytes[..data.len()].copy_from_slice(data);
        Ok(ExchangeDesc {
            bytes,
            len: data.len() as u32,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for ExchangeDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ExchangeDesc(len={})", self.len)
    }
}

/// Entity flavors: which side initiates and where the backing memory lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    HbmAiCoreInitiate,
    HbmHostInitiate,
    HbmDramHostInitiate,
}

/// Engine driving bulk copies for this entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataOpKind {
    Mte,
    Roce,
    Sdma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemScope {
    InNode,
    CrossNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankKind {
    Static,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemKind {
    Device,
    Host,
}

/// Copy directions the transfer layer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyDirection {
    LocalHostToGlobalHost,
    LocalDeviceToGlobalDevice,
    GlobalHostToLocalHost,
    GlobalDeviceToLocalDevice,
}

#[derive(Debug, Clone)]
pub struct MemEntityOptions {
    pub kind: EntityKind,
    pub data_op: DataOpKind,
    pub scope: MemScope,
    pub rank_kind: RankKind,
    pub rank_count: u16,
    pub rank_id: u16,
    pub device_id: u32,
    pub va_space: u64,
    pub preferred_gva: u64,
}

impl Default for MemEntityOptions {
    fn default() -> MemEntityOptions {
        MemEntityOptions {
            kind: EntityKind::HbmHostInitiate,
            data_op: DataOpKind::Sdma,
            scope: MemScope::CrossNode,
            rank_kind: RankKind::Static,
            rank_count: 1,
            rank_id: 0,
            device_id: 0,
            va_space: 0,
            preferred_gva: 0,
        }
    }
}

/// One contiguous byte range the entity can serve remote access for.
#[derive(Debug, Clone, Copy)]
pub struct MemSlice {
    pub index: u32,
    pub kind: MemKind,
    pub addr: u64,
    pub size: u64,
    /// Whether the range lives inside the entity's reserved window.
    pub in_window: bool,
}

struct Window {
    base: u64,
    size: u64,
    used: u64,
    // Keeps the heap buffer alive; `base` points into it.
    _backing: Vec<u8>,
}

struct ImportRecord {
    size: u64,
}

struct EntityState {
    window: Option<Window>,
    slices: Vec<MemSlice>,
    imports: HashMap<u64, ImportRecord>,
    next_slice: u32,
}

/// A local memory entity.
pub struct MemEntity {
    id: u16,
    options: MemEntityOptions,
    state: Mutex<EntityState>,
}

impl MemEntity {
    pub fn create(id: u16, options: MemEntityOptions) -> Result<MemEntity> {
        if options.rank_count == 0 {
            return Err(ErrCode::InvalidParam);
        }
        Ok(MemEntity {
            id,
            options,
            state: Mutex::new(EntityState {
                window: None,
                slices: Vec::new(),
                imports: HashMap::new(),
                next_slice: 0,
            }),
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn options(&self) -> &MemEntityOptions {
        &self.options
    }

    /// Reserve the entity's VA window. Idempotent.
    pub fn reserve(&self, size: u64) -> Result<()> {
        if size == 0 || size % DEVICE_LARGE_PAGE != 0 {
            return Err(ErrCode::InvalidParam);
        }
        let mut state = self.state.lock().unwrap();
        if state.window.is_some() {
            return Ok(());
        }
        let backing = vec![0u8; size as usize];
        let base = backing.as_ptr() as u64;
        state.window = Some(Window {
            base,
            size,
            used: 0,
            _backing: backing,
        });
        debug!(entity = self.id, base, size, "window reserved");
        Ok(())
    }

    /// Allocate a slice inside the reserved window.
    pub fn alloc_local_memory(&self, kind: MemKind, size: u64) -> Result<MemSlice> {
        if size == 0 {
            return Err(ErrCode::InvalidParam);
        }
        let size = align_up(size, DEVICE_LARGE_PAGE);
        let mut state = self.state.lock().unwrap();
        let window = state.window.as_mut().ok_or(ErrCode::NotInitialized)?;
        if window.used + size > window.size {
            error!(entity = self.id, size, "window exhausted");
            return Err(ErrCode::MallocFailed);
        }
        let addr = window.base + window.used;
        window.used += size;
        debug_assert!(addr + size <= window.base + window.size);
        let slice = MemSlice {
            index: state.next_slice,
            kind,
            addr,
            size,
            in_window: true,
        };
        state.next_slice += 1;
        state.slices.push(slice);
        Ok(slice)
    }

    /// Register caller-owned memory as a slice. Address and size must be
    /// large-page aligned (the transfer layer aligns before calling).
    pub fn register_local_memory(&self, kind: MemKind, addr: u64, size: u64) -> Result<MemSlice> {
        if addr == 0 || size == 0 {
            return Err(ErrCode::InvalidParam);
        }
        if addr % DEVICE_LARGE_PAGE != 0 || size % DEVICE_LARGE_PAGE != 0 {
            return Err(ErrCode::InvalidParam);
        }
        let mut state = self.state.lock().unwrap();
        if state
            .slices
            .iter()
            .any(|s| s.addr < addr + size && addr < s.addr + s.size)
        {
            error!(entity = self.id, addr, size, "range overlaps a registered slice");
            return Err(ErrCode::InvalidParam);
        }
        let slice = MemSlice {
            index: state.next_slice,
            kind,
            addr,
            size,
            in_window: false,
        };
        state.next_slice += 1;
        state.slices.push(slice);
        debug!(entity = self.id, addr, size, "memory registered");
        Ok(slice)
    }

    pub fn free_local_memory(&self, addr: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.slices.len();
        state.slices.retain(|s| s.addr != addr);
        if state.slices.len() == before {
            return Err(ErrCode::NotExist);
        }
        Ok(())
    }

    /// Fixed byte length of a slice descriptor.
    pub fn export_slice_size(&self) -> usize {
        DESC_LEN
    }

    /// Export the entity itself (the device info published at create time).
    pub fn export_entity(&self) -> Result<ExchangeDesc> {
        self.make_desc(DESC_KIND_ENTITY, 0, 0)
    }

    /// Export one slice for peers to import.
    pub fn export_slice(&self, slice: &MemSlice) -> Result<ExchangeDesc> {
        self.make_desc(DESC_KIND_SLICE, slice.addr, slice.size)
    }

    fn make_desc(&self, desc_kind: u32, base: u64, size: u64) -> Result<ExchangeDesc> {
        let mut out = Vec::with_capacity(DESC_LEN);
        out.extend_from_slice(&DESC_MAGIC.to_le_bytes());
        out.extend_from_slice(&desc_kind.to_le_bytes());
        out.extend_from_slice(&std::process::id().to_le_bytes());
        out.extend_from_slice(&self.options.device_id.to_le_bytes());
        out.extend_from_slice(&base.to_le_bytes());
        out.extend_from_slice(&size.to_le_bytes());
        ExchangeDesc::from_slice(&out)
    }

    /// Import peer descriptors; slice descriptors yield one locally mapped
    /// address each, entity descriptors yield a 0 placeholder.
    pub fn import(&self, descs: &[ExchangeDesc]) -> Result<Vec<u64>> {
        let mut out = Vec::with_capacity(descs.len());
        let mut state = self.state.lock().unwrap();
        for desc in descs {
            let parsed = ParsedDesc::parse(desc)?;
            match parsed.kind {
                DESC_KIND_ENTITY => out.push(0),
                DESC_KIND_SLICE => {
                    if parsed.pid != std::process::id() {
                        // Cross-process mapping belongs to the device mmap
                        // collaborator, not this backend.
                        error!(
                            entity = self.id,
                            pid = parsed.pid,
                            "descriptor from another process cannot be mapped"
                        );
                        return Err(ErrCode::NotSupported);
                    }
                    state
                        .imports
                        .insert(parsed.base, ImportRecord { size: parsed.size });
                    out.push(parsed.base);
                }
                _ => return Err(ErrCode::InvalidParam),
            }
        }
        Ok(out)
    }

    /// Drop the import record for a peer base address.
    pub fn remove_import(&self, base: u64) {
        self.state.lock().unwrap().imports.remove(&base);
    }

    /// Byte length accessible at an imported base, if known.
    pub fn imported_size(&self, base: u64) -> Option<u64> {
        self.state.lock().unwrap().imports.get(&base).map(|r| r.size)
    }

    /// Bulk copy between a local address and a globally mapped address.
    pub fn copy_data(&self, src: u64, dst: u64, size: u64, direction: CopyDirection) -> Result<()> {
        if src == 0 || dst == 0 || size == 0 {
            return Err(ErrCode::InvalidParam);
        }
        let _ = direction;
        unsafe {
            std::ptr::copy(src as *const u8, dst as *mut u8, size as usize);
        }
        Ok(())
    }

    pub fn slices(&self) -> Vec<MemSlice> {
        self.state.lock().unwrap().slices.clone()
    }

    /// Tear everything down; the window backing is released.
    pub fn destroy(&self) {
        let mut state = self.state.lock().unwrap();
        state.slices.clear();
        state.imports.clear();
        state.window = None;
    }
}

struct ParsedDesc {
    kind: u32,
    pid: u32,
    base: u64,
    size: u64,
}

impl ParsedDesc {
    fn parse(desc: &ExchangeDesc) -> Result<ParsedDesc> {
        let data = desc.as_slice();
        if data.len() < DESC_LEN {
            return Err(ErrCode::InvalidParam);
        }
        let magic = u32::from_le_bytes(data[..4].try_into().unwrap());
        if magic != DESC_MAGIC {
            return Err(ErrCode::InvalidParam);
        }
        Ok(ParsedDesc {
            kind: u32::from_le_bytes(data[4..8].try_into().unwrap()),
            pid: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            base: u64::from_le_bytes(data[16..24].try_into().unwrap()),
            size: u64::from_le_bytes(data[24..32].try_into().unwrap()),
        })
    }
}

pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

pub(crate) fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}
