// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Server-side fault recovery.
//
// The tracker shadows the store traffic to learn which slots each link owns:
// SET of a rank key binds the link to a rank, ADD records the count keys,
// APPEND/WRITE record the device/slice slot indexes. When a link dies its
// slots are flipped to ABNORMAL in place, the counts are decremented, and a
// restoration record is queued; the peer's next GET of its rank key is
// answered with that record under the `Restore` code.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};

use tracing::{debug, info, warn};

use crate::error::{ErrCode, Result};
use crate::helper::{
    RECEIVERS_COUNT_KEY, RECEIVERS_DEVICES_INFO_KEY, RECEIVERS_SLICES_COUNT_KEY,
    RECEIVERS_SLICES_INFO_KEY, SENDERS_COUNT_KEY, SENDERS_DEVICES_INFO_KEY,
    SENDERS_SLICES_COUNT_KEY, SENDERS_SLICES_INFO_KEY, STATUS_ABNORMAL,
};
use crate::store::{KvStore, OpHookOutcome, AUTO_RANK_KEY_PREFIX};

#[derive(Debug, Default, Clone)]
struct DeviceSlot {
    slot: u16,
    unit: usize,
    info_key: String,
    count_key: String,
}

#[derive(Debug, Default, Clone)]
struct SliceSlots {
    slots: Vec<u16>,
    unit: usize,
    info_key: String,
    count_key: String,
}

#[derive(Debug, Default, Clone)]
struct RankRecord {
    rank_id: u16,
    rank_key: String,
    device: DeviceSlot,
    slices: SliceSlots,
}

/// The restoration record queued for a dead rank: `{rank_id, device slot,
/// slice slots}`, serialized as packed little-endian u16s with no count
/// prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultRankIndex {
    pub rank_id: u16,
    pub device_info_id: u16,
    pub slice_ids: Vec<u16>,
}

impl FaultRankIndex {
    fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + 2 * self.slice_ids.len());
        out.extend_from_slice(&self.rank_id.to_le_bytes());
        out.extend_from_slice(&self.device_info_id.to_le_bytes());
        for id in &self.slice_ids {
            out.extend_from_slice(&id.to_le_bytes());
        }
        out
    }
}

#[derive(Default)]
struct TrackerState {
    ranks: HashMap<u32, RankRecord>,
    pending: VecDeque<FaultRankIndex>,
}

/// Process-wide tracker feeding the store server's recovery hooks.
pub struct FaultTracker {
    state: Mutex<TrackerState>,
}

fn is_device_count_key(key: &str) -> bool {
    key.contains(SENDERS_COUNT_KEY) || key.contains(RECEIVERS_COUNT_KEY)
}

fn is_slice_count_key(key: &str) -> bool {
    key.contains(SENDERS_SLICES_COUNT_KEY) || key.contains(RECEIVERS_SLICES_COUNT_KEY)
}

fn is_device_info_key(key: &str) -> bool {
    key.contains(SENDERS_DEVICES_INFO_KEY) || key.contains(RECEIVERS_DEVICES_INFO_KEY)
}

fn is_slice_info_key(key: &str) -> bool {
    key.contains(SENDERS_SLICES_INFO_KEY) || key.contains(RECEIVERS_SLICES_INFO_KEY)
}

impl FaultTracker {
    pub fn instance() -> &'static FaultTracker {
        static INSTANCE: OnceLock<FaultTracker> = OnceLock::new();
        INSTANCE.get_or_init(|| FaultTracker {
            state: Mutex::new(TrackerState::default()),
        })
    }

    /// Install the tracker's hooks through a store handle (they land on the
    /// embedded server; a pure client forwards them into the void).
    pub fn register(&'static self, store: &dyn KvStore) {
        store.register_server_op_hook(
            crate::codec::MsgType::Set as i16,
            Arc::new(move |link, key, value, kv| self.on_set(link, key, value, kv)),
        );
        store.register_server_op_hook(
            crate::codec::MsgType::Get as i16,
            Arc::new(move |link, key, value, kv| self.on_get(link, key, value, kv)),
        );
        store.register_server_op_hook(
            crate::codec::MsgType::Add as i16,
            Arc::new(move |link, key, value, kv| self.on_add(link, key, value, kv)),
        );
        store.register_server_op_hook(
            crate::codec::MsgType::Append as i16,
            Arc::new(move |link, key, value, kv| self.on_append(link, key, value, kv)),
        );
        store.register_server_op_hook(
            crate::codec::MsgType::Write as i16,
            Arc::new(move |link, key, value, kv| self.on_write(link, key, value, kv)),
        );
        store.register_server_broken_hook(Arc::new(move |link, kv| self.on_broken(link, kv)));
    }

    /// SET of a rank key binds `link` to a rank.
    fn on_set(
        &self,
        link: u32,
        key: &str,
        value: &mut Vec<u8>,
        _kv: &HashMap<String, Vec<u8>>,
    ) -> Result<OpHookOutcome> {
        if !key.contains(AUTO_RANK_KEY_PREFIX) {
            return Ok(OpHookOutcome::Pass);
        }
        if value.len() != 2 {
            return Err(ErrCode::Error);
        }
        let rank_id = u16::from_le_bytes(value[..2].try_into().unwrap());
        let mut state = self.state.lock().unwrap();
        state.ranks.insert(
            link,
            RankRecord {
                rank_id,
                rank_key: key.to_string(),
                ..RankRecord::default()
            },
        );
        info!(link, rank_id, key, "rank ownership recorded");
        Ok(OpHookOutcome::Pass)
    }

    /// GET of a rank key consumes the restoration FIFO.
    fn on_get(
        &self,
        _link: u32,
        key: &str,
        value: &mut Vec<u8>,
        _kv: &HashMap<String, Vec<u8>>,
    ) -> Result<OpHookOutcome> {
        if !key.contains(AUTO_RANK_KEY_PREFIX) {
            return Ok(OpHookOutcome::Pass);
        }
        let mut state = self.state.lock().unwrap();
        let Some(index) = state.pending.pop_front() else {
            return Ok(OpHookOutcome::Pass);
        };
        debug!(key, rank = index.rank_id, "serving restoration record");
        *value = index.to_bytes();
        Ok(OpHookOutcome::Object)
    }

    /// ADD on a count key records which count this link bumps.
    fn on_add(
        &self,
        link: u32,
        key: &str,
        _value: &mut Vec<u8>,
        _kv: &HashMap<String, Vec<u8>>,
    ) -> Result<OpHookOutcome> {
        if is_slice_count_key(key) {
            let mut state = self.state.lock().unwrap();
            let record = state.ranks.get_mut(&link).ok_or(ErrCode::InvalidParam)?;
            record.slices.count_key = key.to_string();
        } else if is_device_count_key(key) {
            let mut state = self.state.lock().unwrap();
            let record = state.ranks.get_mut(&link).ok_or(ErrCode::InvalidParam)?;
            record.device.count_key = key.to_string();
        }
        Ok(OpHookOutcome::Pass)
    }

    /// APPEND of an info record; the slot index follows from the blob size.
    fn on_append(
        &self,
        link: u32,
        key: &str,
        value: &mut Vec<u8>,
        kv: &HashMap<String, Vec<u8>>,
    ) -> Result<OpHookOutcome> {
        if !is_device_info_key(key) && !is_slice_info_key(key) {
            return Ok(OpHookOutcome::Pass);
        }
        let blob = kv.get(key).ok_or(ErrCode::InvalidParam)?;
        if value.is_empty() {
            return Err(ErrCode::InvalidParam);
        }
        let slot = (blob.len() / value.len() - 1) as u16;
        let unit = value.len();

        let mut state = self.state.lock().unwrap();
        let record = state.ranks.get_mut(&link).ok_or(ErrCode::InvalidParam)?;
        if is_device_info_key(key) {
            record.device.slot = slot;
            record.device.unit = unit;
            record.device.info_key = key.to_string();
            debug!(link, key, slot, "device slot recorded (append)");
        } else {
            record.slices.slots.push(slot);
            record.slices.unit = unit;
            record.slices.info_key = key.to_string();
            debug!(link, key, slot, "slice slot recorded (append)");
        }
        Ok(OpHookOutcome::Pass)
    }

    /// WRITE at a slot (the restore path); the index follows from the offset.
    fn on_write(
        &self,
        link: u32,
        key: &str,
        value: &mut Vec<u8>,
        _kv: &HashMap<String, Vec<u8>>,
    ) -> Result<OpHookOutcome> {
        if !is_device_info_key(key) && !is_slice_info_key(key) {
            return Ok(OpHookOutcome::Pass);
        }
        if value.len() <= 4 {
            return Err(ErrCode::InvalidParam);
        }
        let offset = u32::from_le_bytes(value[..4].try_into().unwrap()) as usize;
        let unit = value.len() - 4;
        let slot = (offset / unit) as u16;

        let mut state = self.state.lock().unwrap();
        let record = state.ranks.get_mut(&link).ok_or(ErrCode::InvalidParam)?;
        if is_device_info_key(key) {
            record.device.slot = slot;
            record.device.unit = unit;
            record.device.info_key = key.to_string();
            debug!(link, key, slot, "device slot recorded (write)");
        } else {
            record.slices.slots.push(slot);
            record.slices.unit = unit;
            record.slices.info_key = key.to_string();
            debug!(link, key, slot, "slice slot recorded (write)");
        }
        Ok(OpHookOutcome::Pass)
    }

    /// Flip the dead link's slots to ABNORMAL, decrement its counts, queue
    /// the restoration record.
    fn on_broken(&self, link: u32, kv: &mut HashMap<String, Vec<u8>>) {
        let mut state = self.state.lock().unwrap();
        let Some(record) = state.ranks.remove(&link) else {
            return;
        };
        info!(link, rank = record.rank_id, "reclaiming slots of dead link");
        kv.remove(&record.rank_key);

        if let Some(blob) = kv.get_mut(&record.device.info_key) {
            let offset = record.device.unit * record.device.slot as usize;
            if offset < blob.len() {
                blob[offset] = STATUS_ABNORMAL;
            }
        }
        decrement_count(kv, &record.device.count_key, 1);

        if let Some(blob) = kv.get_mut(&record.slices.info_key) {
            for &slot in &record.slices.slots {
                let offset = record.slices.unit * slot as usize;
                if offset < blob.len() {
                    blob[offset] = STATUS_ABNORMAL;
                }
            }
        }
        decrement_count(kv, &record.slices.count_key, record.slices.slots.len() as i64);

        state.pending.push_back(FaultRankIndex {
            rank_id: record.rank_id,
            device_info_id: record.device.slot,
            slice_ids: record.slices.slots,
        });
    }

    /// Drop all tracked state (tests and `smem_trans_uninit`).
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.ranks.clear();
        state.pending.clear();
    }
}

fn decrement_count(kv: &mut HashMap<String, Vec<u8>>, key: &str, by: i64) {
    if key.is_empty() || by == 0 {
        return;
    }
    let Some(stored) = kv.get_mut(key) else {
        return;
    };
    let text = String::from_utf8_lossy(stored).to_string();
    let Ok(current) = text.parse::<i64>() else {
        warn!(key, "count is not a number: {text}");
        return;
    };
    *stored = (current - by).to_string().into_bytes();
}
