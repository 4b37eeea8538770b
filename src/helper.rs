// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Store helper: owns the `/trans/<entity-id>/` key conventions that turn the
// rendezvous store into a peer directory.
//
// Published records carry a leading status byte (NORMAL / ABNORMAL) so the
// server-side fault handler can invalidate a dead peer's slots in place and
// survivors can diff their cached view against the authoritative blob.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::error::{ErrCode, Result};
use crate::fault::FaultTracker;
use crate::mem::ExchangeDesc;
use crate::net::{UrlParts, WorkerSession};
use crate::store::{ClientBrokenFn, GetValue, KvStore, StoreFactory, AUTO_RANK_KEY_PREFIX};

pub const CLUSTER_RANKS_INFO_KEY: &str = "cluster_ranks_info";

pub const SENDERS_COUNT_KEY: &str = "senders_count";
pub const SENDERS_DEVICES_INFO_KEY: &str = "senders_devices_info";
pub const SENDERS_SLICES_COUNT_KEY: &str = "senders_slices_count";
pub const SENDERS_SLICES_INFO_KEY: &str = "senders_slices_info";

pub const RECEIVERS_COUNT_KEY: &str = "receivers_count";
pub const RECEIVERS_DEVICES_INFO_KEY: &str = "receivers_devices_info";
pub const RECEIVERS_SLICES_COUNT_KEY: &str = "receivers_slices_count";
pub const RECEIVERS_SLICES_INFO_KEY: &str = "receivers_slices_info";

pub const STATUS_ABNORMAL: u8 = 0;
pub const STATUS_NORMAL: u8 = 1;

/// Which directory of four keys a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransSide {
    Senders,
    Receivers,
}

impl TransSide {
    pub fn count_key(self) -> &'static str {
        match self {
            TransSide::Senders => SENDERS_COUNT_KEY,
            TransSide::Receivers => RECEIVERS_COUNT_KEY,
        }
    }

    pub fn devices_info_key(self) -> &'static str {
        match self {
            TransSide::Senders => SENDERS_DEVICES_INFO_KEY,
            TransSide::Receivers => RECEIVERS_DEVICES_INFO_KEY,
        }
    }

    pub fn slices_count_key(self) -> &'static str {
        match self {
            TransSide::Senders => SENDERS_SLICES_COUNT_KEY,
            TransSide::Receivers => RECEIVERS_SLICES_COUNT_KEY,
        }
    }

    pub fn slices_info_key(self) -> &'static str {
        match self {
            TransSide::Senders => SENDERS_SLICES_INFO_KEY,
            TransSide::Receivers => RECEIVERS_SLICES_INFO_KEY,
        }
    }
}

/// Transfer role of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TransRole {
    None = 0,
    Sender = 1,
    Receiver = 2,
    Both = 3,
}

impl TransRole {
    pub fn from_u32(raw: u32) -> Result<TransRole> {
        match raw {
            0 => Ok(TransRole::None),
            1 => Ok(TransRole::Sender),
            2 => Ok(TransRole::Receiver),
            3 => Ok(TransRole::Both),
            _ => Err(ErrCode::InvalidParam),
        }
    }

    pub fn sends(self) -> bool {
        matches!(self, TransRole::Sender | TransRole::Both)
    }

    pub fn receives(self) -> bool {
        matches!(self, TransRole::Receiver | TransRole::Both)
    }
}

/// Bulk data engine selected by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TransDataOp {
    Sdma = 1,
    Roce = 2,
}

/// Default create/connect budget, seconds.
pub const DEFAULT_INIT_TIMEOUT: u32 = 120;

/// Per-worker transfer configuration.
#[derive(Debug, Clone, Copy)]
pub struct TransConfig {
    pub role: TransRole,
    pub init_timeout: u32,
    pub device_id: u32,
    pub flags: u32,
    pub data_op: TransDataOp,
    pub start_config_server: bool,
}

impl Default for TransConfig {
    fn default() -> TransConfig {
        TransConfig {
            role: TransRole::Sender,
            init_timeout: DEFAULT_INIT_TIMEOUT,
            device_id: u32::MAX,
            flags: 0,
            data_op: TransDataOp::Sdma,
            start_config_server: false,
        }
    }
}

/// Fixed wire length of a config record inside `cluster_ranks_info`.
pub const CONFIG_RECORD_LEN: usize = 24;

impl TransConfig {
    pub fn to_record(&self) -> [u8; CONFIG_RECORD_LEN] {
        let mut out = [0u8; CONFIG_RECORD_LEN];
        out[..4].copy_from_slice(&(self.role as u32).to_le_bytes());
        out[4..8].copy_from_slice(&self.init_timeout.to_le_bytes());
        out[8..12].copy_from_slice(&self.device_id.to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.to_le_bytes());
        out[16..20].copy_from_slice(&(self.data_op as u32).to_le_bytes());
        out[20] = self.start_config_server as u8;
        out
    }
}

/// Slice metadata stored ahead of the opaque descriptor in a slice record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredSliceInfo {
    pub session: WorkerSession,
    pub address: u64,
    pub size: u64,
    pub rank: u16,
}

pub const STORED_SLICE_INFO_LEN: usize = 8 + 8 + 8 + 2;

impl StoredSliceInfo {
    pub fn to_bytes(&self) -> [u8; STORED_SLICE_INFO_LEN] {
        let mut out = [0u8; STORED_SLICE_INFO_LEN];
        out[..8].copy_from_slice(&self.session.to_bytes());
        out[8..16].copy_from_slice(&self.address.to_le_bytes());
        out[16..24].copy_from_slice(&self.size.to_le_bytes());
        out[24..26].copy_from_slice(&self.rank.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<StoredSliceInfo> {
        if bytes.len() < STORED_SLICE_INFO_LEN {
            return Err(ErrCode::InvalidParam);
        }
        Ok(StoredSliceInfo {
            session: WorkerSession::from_bytes(&bytes[..8])?,
            address: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
            size: u64::from_le_bytes(bytes[16..24].try_into().unwrap()),
            rank: u16::from_le_bytes(bytes[24..26].try_into().unwrap()),
        })
    }
}

/// Preferred slots a restarting worker must re-claim.
#[derive(Debug, Default)]
struct PreferredSlots {
    device_valid: bool,
    device_slot: u16,
    slice_slots: VecDeque<u16>,
}

/// The per-entity store conventions, stateful so re-registration after a
/// server restart lands in the same slots.
pub struct StoreHelper {
    name: String,
    store_url: String,
    role: TransRole,
    url: UrlParts,
    store: Option<Arc<dyn KvStore>>,
    device_exp_size: usize,
    slice_exp_size: usize,
    rank_record: Option<(u16, Vec<u8>)>,
    device_records: Vec<(TransSide, u16, Vec<u8>)>,
    slice_records: Vec<(TransSide, u16, Vec<u8>)>,
    preferred: PreferredSlots,
    last_sender_devices: Vec<u8>,
    last_receiver_devices: Vec<u8>,
    last_sender_slices: Vec<u8>,
    last_receiver_slices: Vec<u8>,
}

impl StoreHelper {
    pub fn new(name: impl Into<String>, store_url: impl Into<String>, role: TransRole) -> StoreHelper {
        StoreHelper {
            name: name.into(),
            store_url: store_url.into(),
            role,
            url: UrlParts::default(),
            store: None,
            device_exp_size: 0,
            slice_exp_size: 0,
            rank_record: None,
            device_records: Vec::new(),
            slice_records: Vec::new(),
            preferred: PreferredSlots::default(),
            last_sender_devices: Vec::new(),
            last_receiver_devices: Vec::new(),
            last_sender_slices: Vec::new(),
            last_receiver_slices: Vec::new(),
        }
    }

    /// Open the store client, scope it under `/trans/<entity-id>/`, install
    /// the fault-recovery hooks on the embedded server if this process runs
    /// one.
    pub fn initialize(&mut self, entity_id: u16, with_server: bool, retry_times: i32) -> Result<()> {
        if self.role == TransRole::None {
            error!("invalid transfer role");
            return Err(ErrCode::InvalidParam);
        }
        self.url = UrlParts::parse(&self.store_url)?;
        let base = StoreFactory::create_store(
            &self.url.ip,
            self.url.port,
            with_server,
            u32::MAX,
            -1,
            retry_times,
        )?;
        let scoped = StoreFactory::prefix_store(base, format!("/trans/{entity_id}/"));
        FaultTracker::instance().register(scoped.as_ref());
        self.store = Some(scoped);
        Ok(())
    }

    pub fn destroy(&mut self) {
        self.store = None;
        if !self.url.ip.is_empty() {
            StoreFactory::destroy_store(&self.url.ip, self.url.port);
        }
    }

    fn store(&self) -> Result<&Arc<dyn KvStore>> {
        self.store.as_ref().ok_or(ErrCode::NotInitialized)
    }

    pub fn set_slice_export_size(&mut self, size: usize) {
        self.slice_exp_size = size;
    }

    pub fn connected(&self) -> bool {
        self.store.as_ref().map(|s| s.connected()).unwrap_or(false)
    }

    pub fn set_connected(&self, status: bool) {
        if let Some(store) = &self.store {
            store.set_connected(status);
        }
    }

    pub fn reconnect(&self) -> Result<()> {
        self.store()?.reconnect_after_broken(3)
    }

    pub fn register_broken_handler(&self, handler: ClientBrokenFn) {
        if let Some(store) = &self.store {
            store.register_client_broken_handler(handler);
        }
    }

    // -----------------------------------------------------------------------
    // Rank lease
    // -----------------------------------------------------------------------

    /// Lease (or recover) this worker's stable rank id.
    pub fn generate_rank_id(&mut self, config: &TransConfig) -> Result<u16> {
        let key = format!("{AUTO_RANK_KEY_PREFIX}{}", self.name);
        let record = config.to_record().to_vec();

        match self.store()?.get(&key, 0) {
            Err(ErrCode::NotExist) => {
                let total = self.store()?.append(CLUSTER_RANKS_INFO_KEY, &record)?;
                let rank = (total as usize / CONFIG_RECORD_LEN - 1) as u16;
                self.store()?.set(&key, &rank.to_le_bytes())?;
                self.rank_record = Some((rank, record));
                info!(name = %self.name, rank, "rank id leased");
                Ok(rank)
            }
            Ok(GetValue::Restored(payload)) => self.recover_rank_information(&key, &payload, record),
            Ok(GetValue::Existing(value)) => {
                if value.len() != 2 {
                    error!(%key, "rank value has unexpected size {}", value.len());
                    return Err(ErrCode::Error);
                }
                let rank = u16::from_le_bytes(value[..2].try_into().unwrap());
                info!(name = %self.name, rank, "rank id adopted");
                Ok(rank)
            }
            Err(e) => {
                error!(%key, "rank lease get failed: {e}");
                Err(ErrCode::Error)
            }
        }
    }

    /// Payload layout: `{rank_id: u16, device_info_id: u16, slice_ids: [u16]}`
    /// packed little-endian, no count prefix.
    fn recover_rank_information(
        &mut self,
        key: &str,
        payload: &[u8],
        record: Vec<u8>,
    ) -> Result<u16> {
        if payload.len() < 4 || payload.len() % 2 != 0 {
            error!(key, "recovery payload has bad size {}", payload.len());
            return Err(ErrCode::Error);
        }
        let rank = u16::from_le_bytes(payload[..2].try_into().unwrap());
        self.preferred.device_valid = true;
        self.preferred.device_slot = u16::from_le_bytes(payload[2..4].try_into().unwrap());
        self.preferred.slice_slots.clear();
        for chunk in payload[4..].chunks_exact(2) {
            self.preferred
                .slice_slots
                .push_back(u16::from_le_bytes(chunk.try_into().unwrap()));
        }
        info!(
            name = %self.name,
            rank,
            device_slot = self.preferred.device_slot,
            slices = self.preferred.slice_slots.len(),
            "recovering into preferred slots"
        );

        let offset = rank as u32 * CONFIG_RECORD_LEN as u32;
        self.store()?.write_at(CLUSTER_RANKS_INFO_KEY, &record, offset)?;
        self.store()?.set(key, &rank.to_le_bytes())?;
        self.rank_record = Some((rank, record));
        Ok(rank)
    }

    /// Re-claim the rank key after a store-server restart.
    pub fn re_register_to_server(&mut self, rank: u16) -> Result<()> {
        let key = format!("{AUTO_RANK_KEY_PREFIX}{}", self.name);
        match self.store()?.get(&key, 0) {
            Err(ErrCode::NotExist) => {
                if let Some((slot, record)) = self.rank_record.clone() {
                    let offset = slot as u32 * record.len() as u32;
                    self.store()?.write_at(CLUSTER_RANKS_INFO_KEY, &record, offset)?;
                }
                self.store()?.set(&key, &rank.to_le_bytes())?;
                info!(name = %self.name, rank, "rank key re-registered");
                Ok(())
            }
            Ok(value) => {
                if value.into_bytes().len() != 2 {
                    error!(%key, "rank value has unexpected size");
                    return Err(ErrCode::Error);
                }
                Ok(())
            }
            Err(e) => {
                error!(%key, "re-register get failed: {e}");
                Err(ErrCode::Error)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Publication
    // -----------------------------------------------------------------------

    /// Publish this worker's device descriptor on `side`.
    pub fn store_device_info(&mut self, side: TransSide, desc: &ExchangeDesc) -> Result<()> {
        self.device_exp_size = desc.len();
        let mut value = Vec::with_capacity(1 + desc.len());
        value.push(STATUS_NORMAL);
        value.extend_from_slice(desc.as_slice());

        let slot = if self.preferred.device_valid {
            let slot = self.preferred.device_slot;
            self.preferred.device_valid = false;
            let offset = slot as u32 * value.len() as u32;
            debug!(key = side.devices_info_key(), slot, "writing device info at preferred slot");
            self.store()?.write_at(side.devices_info_key(), &value, offset)?;
            slot
        } else {
            debug!(key = side.devices_info_key(), len = value.len(), "appending device info");
            let total = self.store()?.append(side.devices_info_key(), &value)?;
            (total as usize / value.len() - 1) as u16
        };
        self.device_records.push((side, slot, value));

        self.store()?.add(side.count_key(), 1)?;
        Ok(())
    }

    /// Publish one slice record on `side`.
    pub fn store_slice_info(
        &mut self,
        side: TransSide,
        desc: &ExchangeDesc,
        info: &StoredSliceInfo,
    ) -> Result<()> {
        let mut value = Vec::with_capacity(1 + STORED_SLICE_INFO_LEN + desc.len());
        value.push(STATUS_NORMAL);
        value.extend_from_slice(&info.to_bytes());
        value.extend_from_slice(desc.as_slice());

        let slot = if let Some(slot) = self.preferred.slice_slots.pop_front() {
            let offset = slot as u32 * value.len() as u32;
            debug!(key = side.slices_info_key(), slot, "writing slice info at preferred slot");
            self.store()?.write_at(side.slices_info_key(), &value, offset)?;
            slot
        } else {
            let total = self.store()?.append(side.slices_info_key(), &value)?;
            (total as usize / value.len() - 1) as u16
        };
        self.slice_records.push((side, slot, value));

        let count = self.store()?.add(side.slices_count_key(), 1)?;
        debug!(key = side.slices_count_key(), count, "slice published");
        Ok(())
    }

    /// Re-publish the remembered device records after a server restart.
    pub fn restore_device_info(&mut self) -> Result<()> {
        info!(records = self.device_records.len(), "recovering device info");
        for (side, slot, value) in self.device_records.clone() {
            let offset = slot as u32 * value.len() as u32;
            self.store()?.write_at(side.devices_info_key(), &value, offset)?;
            self.store()?.add(side.count_key(), 1)?;
        }
        Ok(())
    }

    /// Re-publish the remembered slice records after a server restart.
    pub fn restore_slice_info(&mut self) -> Result<()> {
        info!(records = self.slice_records.len(), "recovering slice info");
        for (side, slot, value) in self.slice_records.clone() {
            let offset = slot as u32 * value.len() as u32;
            self.store()?.write_at(side.slices_info_key(), &value, offset)?;
            self.store()?.add(side.slices_count_key(), 1)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Diff `side`'s device blob against the cached view; changed or new
    /// NORMAL slots are handed to `cb` for import.
    pub fn find_new_remote_ranks(
        &mut self,
        side: TransSide,
        cb: &mut dyn FnMut(&[ExchangeDesc]) -> Result<()>,
    ) -> Result<()> {
        if self.device_exp_size == 0 {
            return Err(ErrCode::NotInitialized);
        }
        let total = self.store()?.add(side.count_key(), 0)?;
        let last = match side {
            TransSide::Senders => &self.last_sender_devices,
            TransSide::Receivers => &self.last_receiver_devices,
        };
        if total == 0 && last.is_empty() {
            return Ok(());
        }
        let values = self.store()?.get(side.devices_info_key(), 0)?.into_bytes();

        let record_len = 1 + self.device_exp_size;
        let last = match side {
            TransSide::Senders => &mut self.last_sender_devices,
            TransSide::Receivers => &mut self.last_receiver_devices,
        };
        let mut added = Vec::new();
        diff_records(last, &values, record_len, |_, new_payload| {
            added.push(ExchangeDesc::from_slice(new_payload))
        });
        let added: Result<Vec<ExchangeDesc>> = added.into_iter().collect();
        let added = added?;
        if !added.is_empty() {
            debug!(count = added.len(), "importing changed remote devices");
        }
        cb(&added)
    }

    /// Diff `side`'s slice blob. `cb` receives the descriptors to import,
    /// their slice infos, and the infos that turned ABNORMAL.
    pub fn find_new_remote_slices(
        &mut self,
        side: TransSide,
        cb: &mut dyn FnMut(&[ExchangeDesc], &[StoredSliceInfo], &[StoredSliceInfo]) -> Result<()>,
    ) -> Result<()> {
        if self.slice_exp_size == 0 {
            return Err(ErrCode::NotInitialized);
        }
        let total = self.store()?.add(side.slices_count_key(), 0)?;
        let last = match side {
            TransSide::Senders => &self.last_sender_slices,
            TransSide::Receivers => &self.last_receiver_slices,
        };
        if total == 0 && last.is_empty() {
            return Ok(());
        }
        let values = self.store()?.get(side.slices_info_key(), 0)?.into_bytes();

        let record_len = 1 + STORED_SLICE_INFO_LEN + self.slice_exp_size;
        let last = match side {
            TransSide::Senders => &mut self.last_sender_slices,
            TransSide::Receivers => &mut self.last_receiver_slices,
        };
        let mut added = Vec::new();
        let mut added_infos = Vec::new();
        let mut removed_infos = Vec::new();
        let parse_error = std::cell::Cell::new(false);
        diff_records_with_removal(
            last,
            &values,
            record_len,
            |_, payload| {
                match (
                    StoredSliceInfo::from_bytes(payload),
                    ExchangeDesc::from_slice(&payload[STORED_SLICE_INFO_LEN..]),
                ) {
                    (Ok(info), Ok(desc)) => {
                        added_infos.push(info);
                        added.push(desc);
                    }
                    _ => parse_error.set(true),
                }
            },
            |_, payload| match StoredSliceInfo::from_bytes(payload) {
                Ok(info) => removed_infos.push(info),
                Err(_) => parse_error.set(true),
            },
        );
        if parse_error.get() {
            error!("slice record failed to parse");
            return Err(ErrCode::Error);
        }
        if !added.is_empty() || !removed_infos.is_empty() {
            debug!(
                added = added.len(),
                removed = removed_infos.len(),
                "remote slice set changed"
            );
        }
        cb(&added, &added_infos, &removed_infos)
    }
}

/// Walk `new` against the cached `last` blob in `record_len` strides. Every
/// slot whose status transitions to NORMAL with changed payload invokes
/// `on_add` with the payload past the status byte. The cache follows the
/// authoritative blob but never shrinks.
fn diff_records(last: &mut Vec<u8>, new: &[u8], record_len: usize, mut on_add: impl FnMut(usize, &[u8])) {
    diff_records_with_removal(last, new, record_len, &mut on_add, |_, _| {});
}

fn diff_records_with_removal(
    last: &mut Vec<u8>,
    new: &[u8],
    record_len: usize,
    mut on_add: impl FnMut(usize, &[u8]),
    mut on_remove: impl FnMut(usize, &[u8]),
) {
    if *last == new {
        return;
    }
    let new_count = new.len() / record_len;
    let cur_count = last.len() / record_len;
    let min_count = new_count.min(cur_count);

    for i in 0..min_count {
        let cur = i * record_len;
        let cur_rec = cur..cur + record_len;
        let cur_normal = last[cur] == STATUS_NORMAL;
        let new_normal = new[cur] == STATUS_NORMAL;
        if cur_normal && new_normal {
            if last[cur + 1..cur + record_len] != new[cur + 1..cur + record_len] {
                // Same slot re-registered with fresh contents.
                on_add(i, &new[cur + 1..cur + record_len]);
                last[cur_rec].copy_from_slice(&new[cur..cur + record_len]);
            }
        } else if cur_normal && !new_normal {
            on_remove(i, &last[cur + 1..cur + record_len]);
            last[cur] = STATUS_ABNORMAL;
        } else if !cur_normal && new_normal {
            on_add(i, &new[cur + 1..cur + record_len]);
            last[cur_rec].copy_from_slice(&new[cur..cur + record_len]);
        }
    }

    // Growth: adopt the new slots. A shorter blob after a server restart is
    // not a failure and never shrinks the cache.
    if new_count > cur_count {
        last.resize(new.len().max(last.len()), 0);
        for i in min_count..new_count {
            let cur = i * record_len;
            if new[cur] == STATUS_NORMAL {
                on_add(i, &new[cur + 1..cur + record_len]);
            }
            last[cur..cur + record_len].copy_from_slice(&new[cur..cur + record_len]);
        }
    }
}
