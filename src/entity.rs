// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Transfer entities: the per-process object a caller talks to.
//
// An entity owns a memory entity, a store helper, a background watcher
// thread and the map from imported peer slices to locally mapped addresses.
// The watcher drives the rendezvous dance: publish our device and slices,
// diff the peers' blobs every cycle, import what appeared, drop what died,
// and re-publish everything after a store-server restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{ErrCode, Result};
use crate::helper::{StoreHelper, StoredSliceInfo, TransConfig, TransDataOp, TransSide};
use crate::mem::{
    align_down, align_up, CopyDirection, DataOpKind, EntityKind, MemEntity, MemEntityOptions,
    MemKind, DEVICE_LARGE_PAGE,
};
use crate::net::{UrlParts, WorkerSession};

/// Entity id shared by every participant; it fixes the store key prefix.
pub const TRANS_ENTITY_ID: u16 = 129;

const WATCH_INTERVAL: Duration = Duration::from_secs(3);
/// Senders hold slice discovery for the first cycles so receivers publish
/// first.
const SLICE_DISCOVERY_DELAY_CYCLES: i64 = 2;

/// Where an imported peer slice landed locally.
#[derive(Debug, Clone, Copy)]
struct LocalMapping {
    mapped: u64,
    size: u64,
}

struct WatchControl {
    running: Mutex<bool>,
    cond: Condvar,
}

type RemoteSliceMap = HashMap<u64, BTreeMap<u64, LocalMapping>>;

/// A named transfer endpoint.
pub struct TransferEntity {
    name: String,
    config: TransConfig,
    session: WorkerSession,
    rank_id: u16,
    mem: Arc<MemEntity>,
    helper: Mutex<StoreHelper>,
    slice_info_size: usize,
    remote_slices: Arc<RwLock<RemoteSliceMap>>,
    watch: Arc<WatchControl>,
    watcher: Mutex<Option<thread::JoinHandle<()>>>,
    store_broken: Arc<AtomicBool>,
}

impl TransferEntity {
    /// Build a fully initialized entity: parse the name, open the store,
    /// create the memory entity, lease a rank, publish our device info and
    /// start the watcher.
    pub fn create(
        name: &str,
        store_url: &str,
        config: TransConfig,
    ) -> Result<Arc<TransferEntity>> {
        let session = WorkerSession::parse(name).map_err(|e| {
            error!(name, "unique id is not ip:port");
            e
        })?;
        UrlParts::parse(store_url)?;

        let mut helper = StoreHelper::new(name, store_url, config.role);
        helper.initialize(
            TRANS_ENTITY_ID,
            config.start_config_server,
            config.init_timeout as i32,
        )?;

        let mem = Arc::new(MemEntity::create(
            TRANS_ENTITY_ID,
            MemEntityOptions {
                kind: EntityKind::HbmHostInitiate,
                data_op: match config.data_op {
                    TransDataOp::Sdma => DataOpKind::Sdma,
                    TransDataOp::Roce => DataOpKind::Roce,
                },
                device_id: config.device_id,
                ..MemEntityOptions::default()
            },
        )?);

        let device_desc = mem.export_entity()?;
        let slice_info_size = mem.export_slice_size();
        helper.set_slice_export_size(slice_info_size);

        let rank_id = helper.generate_rank_id(&config)?;
        if config.role.sends() {
            helper.store_device_info(TransSide::Senders, &device_desc)?;
        }
        if config.role.receives() {
            helper.store_device_info(TransSide::Receivers, &device_desc)?;
        }

        let store_broken = Arc::new(AtomicBool::new(false));
        let broken_flag = Arc::clone(&store_broken);
        helper.register_broken_handler(Arc::new(move || {
            broken_flag.store(true, Ordering::Release);
        }));

        let entity = Arc::new(TransferEntity {
            name: name.to_string(),
            config,
            session,
            rank_id,
            mem,
            helper: Mutex::new(helper),
            slice_info_size,
            remote_slices: Arc::new(RwLock::new(HashMap::new())),
            watch: Arc::new(WatchControl {
                running: Mutex::new(true),
                cond: Condvar::new(),
            }),
            watcher: Mutex::new(None),
            store_broken,
        });

        let watch_entity = Arc::clone(&entity);
        let handle = thread::spawn(move || watch_entity.watch_task());
        *entity.watcher.lock().unwrap() = Some(handle);

        info!(name, rank_id, "transfer entity created");
        Ok(entity)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TransConfig {
        &self.config
    }

    pub fn session(&self) -> WorkerSession {
        self.session
    }

    pub fn rank_id(&self) -> u16 {
        self.rank_id
    }

    // -----------------------------------------------------------------------
    // Watcher
    // -----------------------------------------------------------------------

    fn watch_task(self: Arc<TransferEntity>) {
        debug!(name = %self.name, "watcher thread started");
        let control = Arc::clone(&self.watch);
        let mut cycles: i64 = 0;
        let mut guard = control.running.lock().unwrap();
        while *guard {
            self.watch_one_loop(cycles);
            cycles += 1;
            let (next, _) = control
                .cond
                .wait_timeout_while(guard, WATCH_INTERVAL, |running| *running)
                .unwrap();
            guard = next;
        }
        debug!(name = %self.name, "watcher thread exits");
    }

    fn watch_one_loop(&self, cycles: i64) {
        if self.store_broken.load(Ordering::Acquire) {
            self.try_recover_store();
            return;
        }

        if self.config.role.receives() {
            self.find_new_remote_senders();
        }
        if self.config.role.sends() && cycles >= SLICE_DISCOVERY_DELAY_CYCLES {
            self.find_new_remote_slices();
        }
    }

    /// After a broken store link: reconnect and re-publish everything the
    /// helper remembers. Errors are retried next cycle.
    fn try_recover_store(&self) {
        let mut helper = self.helper.lock().unwrap();
        if let Err(e) = helper.reconnect() {
            warn!(name = %self.name, "store reconnect failed, retrying: {e}");
            return;
        }
        helper.set_connected(true);
        let ret = helper
            .re_register_to_server(self.rank_id)
            .and_then(|_| helper.restore_device_info())
            .and_then(|_| helper.restore_slice_info());
        match ret {
            Ok(()) => {
                self.store_broken.store(false, Ordering::Release);
                info!(name = %self.name, "store state recovered after reconnect");
            }
            Err(e) => error!(name = %self.name, "store recovery failed: {e}"),
        }
    }

    fn find_new_remote_senders(&self) {
        let mem = Arc::clone(&self.mem);
        let mut helper = self.helper.lock().unwrap();
        let ret = helper.find_new_remote_ranks(TransSide::Senders, &mut |descs| {
            if descs.is_empty() {
                return Ok(());
            }
            mem.import(descs).map(|_| ())
        });
        if let Err(e) = ret {
            if e != ErrCode::NotExist {
                debug!(name = %self.name, "sender discovery skipped: {e}");
            }
        }
    }

    fn find_new_remote_slices(&self) {
        let mem = Arc::clone(&self.mem);
        let slices = Arc::clone(&self.remote_slices);
        let mut helper = self.helper.lock().unwrap();
        let ret = helper.find_new_remote_slices(
            TransSide::Receivers,
            &mut |descs, added, removed| {
                if !descs.is_empty() {
                    let mapped = mem.import(descs)?;
                    let mut map = slices.write().unwrap();
                    for (info, &addr) in added.iter().zip(mapped.iter()) {
                        debug!(
                            session = info.session.session_id(),
                            remote = info.address,
                            mapped = addr,
                            size = info.size,
                            "remote slice imported"
                        );
                        map.entry(info.session.session_id()).or_default().insert(
                            info.address,
                            LocalMapping {
                                mapped: addr,
                                size: info.size,
                            },
                        );
                    }
                }
                if !removed.is_empty() {
                    let mut map = slices.write().unwrap();
                    for info in removed {
                        if let Some(peer) = map.get_mut(&info.session.session_id()) {
                            if let Some(mapping) = peer.remove(&info.address) {
                                mem.remove_import(mapping.mapped);
                            }
                            if peer.is_empty() {
                                map.remove(&info.session.session_id());
                            }
                        }
                    }
                }
                Ok(())
            },
        );
        if let Err(e) = ret {
            if e != ErrCode::NotExist {
                debug!(name = %self.name, "slice discovery skipped: {e}");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    /// Register one caller buffer and publish it. The range is aligned to
    /// the device large page (address truncated, size rounded up).
    pub fn register_local_memory(&self, addr: u64, size: u64, _flags: u32) -> Result<()> {
        if addr == 0 || size == 0 {
            return Err(ErrCode::InvalidParam);
        }
        if !self.config.role.receives() {
            info!(name = %self.name, "sender side skips memory registration");
            return Ok(());
        }
        let (addr, size) = align_range(addr, size);
        self.register_one(addr, size)
    }

    /// Register several buffers at once; overlapping or adjacent aligned
    /// ranges are merged before registration.
    pub fn register_local_memories(&self, regions: &[(u64, u64)], _flags: u32) -> Result<()> {
        if regions.is_empty() {
            return Ok(());
        }
        if regions.iter().any(|&(addr, size)| addr == 0 || size == 0) {
            return Err(ErrCode::InvalidParam);
        }
        if !self.config.role.receives() {
            info!(name = %self.name, "sender side skips memory registration");
            return Ok(());
        }
        let mut aligned: Vec<(u64, u64)> = regions
            .iter()
            .map(|&(addr, size)| align_range(addr, size))
            .collect();
        for (addr, size) in combine_ranges(&mut aligned) {
            self.register_one(addr, size)?;
        }
        Ok(())
    }

    fn register_one(&self, addr: u64, size: u64) -> Result<()> {
        let slice = self.mem.register_local_memory(MemKind::Device, addr, size)?;
        let desc = self.mem.export_slice(&slice)?;
        if desc.len() != self.slice_info_size {
            error!(
                have = desc.len(),
                want = self.slice_info_size,
                "slice descriptor size mismatch"
            );
            self.mem.free_local_memory(slice.addr).ok();
            return Err(ErrCode::Error);
        }
        let info = StoredSliceInfo {
            session: self.session,
            address: addr,
            size,
            rank: self.rank_id,
        };
        let mut helper = self.helper.lock().unwrap();
        if let Err(e) = helper.store_slice_info(TransSide::Receivers, &desc, &info) {
            self.mem.free_local_memory(slice.addr).ok();
            return Err(e);
        }
        Ok(())
    }

    /// Deregistration keeps the published slot; the recovery path recycles
    /// slots, not this call.
    pub fn deregister_local_memory(&self, addr: u64) -> Result<()> {
        if addr == 0 {
            return Err(ErrCode::InvalidParam);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Data path
    // -----------------------------------------------------------------------

    /// Write each `(local, remote, size)` triple into the peer.
    pub fn sync_write(
        &self,
        locals: &[u64],
        remote_name: &str,
        remotes: &[u64],
        sizes: &[u64],
    ) -> Result<()> {
        self.sync_transfer(locals, remote_name, remotes, sizes, true)
    }

    /// Read each `(local, remote, size)` triple from the peer.
    pub fn sync_read(
        &self,
        locals: &[u64],
        remote_name: &str,
        remotes: &[u64],
        sizes: &[u64],
    ) -> Result<()> {
        self.sync_transfer(locals, remote_name, remotes, sizes, false)
    }

    fn sync_transfer(
        &self,
        locals: &[u64],
        remote_name: &str,
        remotes: &[u64],
        sizes: &[u64],
        is_write: bool,
    ) -> Result<()> {
        let batch = locals.len();
        if batch == 0 || remotes.len() != batch || sizes.len() != batch {
            return Err(ErrCode::InvalidParam);
        }
        let session = WorkerSession::parse(remote_name)?.session_id();

        let map = self.remote_slices.read().unwrap();
        let peer = map.get(&session).ok_or_else(|| {
            error!(remote_name, "peer session not found");
            ErrCode::InvalidParam
        })?;

        let mut mapped = Vec::with_capacity(batch);
        for i in 0..batch {
            let target = remotes[i];
            // Greatest slice base at or below the target address.
            let Some((&slice_addr, mapping)) = peer.range(..=target).next_back() else {
                error!(i, target, "remote address below every imported slice");
                return Err(ErrCode::InvalidParam);
            };
            if target + sizes[i] > slice_addr + mapping.size {
                error!(i, target, size = sizes[i], "remote range out of slice bounds");
                return Err(ErrCode::InvalidParam);
            }
            mapped.push(mapping.mapped + (target - slice_addr));
        }

        for i in 0..batch {
            let ret = if is_write {
                self.mem.copy_data(
                    locals[i],
                    mapped[i],
                    sizes[i],
                    CopyDirection::LocalDeviceToGlobalDevice,
                )
            } else {
                self.mem.copy_data(
                    mapped[i],
                    locals[i],
                    sizes[i],
                    CopyDirection::GlobalDeviceToLocalDevice,
                )
            };
            if let Err(e) = ret {
                error!(i, "copy failed: {e}");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stream submissions ride the synchronous path; completion is posted to
    /// the caller's stream by the device runtime.
    pub fn submit_write(
        &self,
        locals: &[u64],
        remote_name: &str,
        remotes: &[u64],
        sizes: &[u64],
        _stream: u64,
    ) -> Result<()> {
        self.sync_transfer(locals, remote_name, remotes, sizes, true)
    }

    pub fn submit_read(
        &self,
        locals: &[u64],
        remote_name: &str,
        remotes: &[u64],
        sizes: &[u64],
        _stream: u64,
    ) -> Result<()> {
        self.sync_transfer(locals, remote_name, remotes, sizes, false)
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Stop the watcher, drop imports, free slices, close the store.
    pub fn shutdown(&self) {
        {
            let mut running = self.watch.running.lock().unwrap();
            if !*running {
                return;
            }
            *running = false;
        }
        self.watch.cond.notify_one();
        let handle = self.watcher.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.join().ok();
        }

        self.remote_slices.write().unwrap().clear();
        self.helper.lock().unwrap().destroy();
        self.mem.destroy();
        info!(name = %self.name, "transfer entity destroyed");
    }
}

impl Drop for TransferEntity {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TransferEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferEntity")
            .field("name", &self.name)
            .field("rank_id", &self.rank_id)
            .finish()
    }
}

fn align_range(addr: u64, size: u64) -> (u64, u64) {
    let base = align_down(addr, DEVICE_LARGE_PAGE);
    let size = align_up(size + (addr - base), DEVICE_LARGE_PAGE);
    (base, size)
}

/// Sort and merge overlapping or touching ranges.
fn combine_ranges(input: &mut Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    input.sort_unstable();
    let mut out = Vec::with_capacity(input.len());
    let mut current = input[0];
    for &(addr, size) in input.iter().skip(1) {
        if current.0 + current.1 >= addr {
            let end = (addr + size).max(current.0 + current.1);
            current.1 = end - current.0;
        } else {
            out.push(current);
            current = (addr, size);
        }
    }
    out.push(current);
    out
}
