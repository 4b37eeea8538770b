// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The rendezvous store: a TCP key-value service with blocking gets, atomic
// counters, append, compare-and-swap, in-place writes, key and rank watches,
// and server-side fault-recovery hooks.

mod client;
mod factory;
mod prefix;
mod server;

pub use client::TcpStore;
pub use factory::StoreFactory;
pub use prefix::PrefixStore;
pub use server::{StoreServer, AUTO_RANK_KEY_PREFIX};

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;

/// Outcome of a GET: either a plain value, or a recovery payload the server
/// synthesized for a restarting peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetValue {
    Existing(Vec<u8>),
    Restored(Vec<u8>),
}

impl GetValue {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            GetValue::Existing(v) | GetValue::Restored(v) => v,
        }
    }
}

/// Key-watch callback: `(value-if-ok, caller-visible key)`.
pub type WatchKeyFn = Arc<dyn Fn(Result<Vec<u8>>, &str) + Send + Sync>;
/// Rank-state watch callback, fired with the downed rank id.
pub type WatchRankFn = Arc<dyn Fn(u32) + Send + Sync>;
/// Client-side broken-link callback.
pub type ClientBrokenFn = Arc<dyn Fn() + Send + Sync>;

/// What a server-side op hook decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpHookOutcome {
    /// Continue with the normal handler.
    Pass,
    /// The hook filled `value` with a synthesized payload; the server replies
    /// `Restore` with it instead of consulting the map.
    Object,
}

/// Server-side op hook, invoked under the store lock before the opcode's own
/// handler: `(link_id, key, value, current kv map)`.
pub type ServerOpHook =
    Arc<dyn Fn(u32, &str, &mut Vec<u8>, &HashMap<String, Vec<u8>>) -> Result<OpHookOutcome> + Send + Sync>;
/// Server-side broken-link hook, free to mutate the kv map.
pub type ServerBrokenHook = Arc<dyn Fn(u32, &mut HashMap<String, Vec<u8>>) + Send + Sync>;

/// The store contract shared by the TCP client and the prefix façade.
///
/// Blocking calls park the calling thread until the server replies, the
/// server-side deadline fires (`Timeout`), or the link breaks (`IoError`).
pub trait KvStore: Send + Sync {
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// `timeout_ms`: 0 returns `NotExist` immediately on a missing key,
    /// positive waits up to that many milliseconds, negative waits forever.
    fn get(&self, key: &str, timeout_ms: i64) -> Result<GetValue>;

    /// Add to the stored decimal value (0 when absent); returns the new value.
    fn add(&self, key: &str, increment: i64) -> Result<i64>;

    fn remove(&self, key: &str) -> Result<()>;

    /// Extend the byte value; returns the new total size.
    fn append(&self, key: &str, value: &[u8]) -> Result<u64>;

    /// Compare-and-swap; returns the pre-call value on success and the
    /// current value when the expectation failed (no mutation then).
    fn cas(&self, key: &str, expect: &[u8], new: &[u8]) -> Result<Vec<u8>>;

    /// Write `value` in place at byte `offset`, zero-padding on growth.
    fn write_at(&self, key: &str, value: &[u8], offset: u32) -> Result<()>;

    /// Watch a key; the callback fires on every wake-up until `unwatch`.
    fn watch_key(&self, key: &str, notify: WatchKeyFn) -> Result<u32>;

    /// Subscribe to peer-link-down notifications.
    fn watch_rank_state(&self, notify: WatchRankFn) -> Result<u32>;

    fn unwatch(&self, wid: u32) -> Result<()>;

    fn connected(&self) -> bool;
    fn set_connected(&self, status: bool);
    fn reconnect_after_broken(&self, retry_times: i32) -> Result<()>;
    fn register_client_broken_handler(&self, handler: ClientBrokenFn);

    /// Register a fault-recovery hook on the embedded server (no-op when this
    /// process runs no server).
    fn register_server_op_hook(&self, opcode: i16, hook: ServerOpHook);
    fn register_server_broken_hook(&self, hook: ServerBrokenHook);

    /// Prefix accumulated by façades; the base store returns "".
    fn common_prefix(&self) -> String;
    /// The caller-visible key translated to the full store key.
    fn full_key(&self, key: &str) -> String;
}

/// Max key length the client accepts; the server tolerates up to 2048.
pub(crate) const MAX_KEY_LEN_CLIENT: usize = 1024;
pub(crate) const MAX_KEY_LEN_SERVER: usize = 2048;

pub(crate) fn check_key(key: &str) -> Result<()> {
    if key.is_empty() || key.len() > MAX_KEY_LEN_CLIENT || key.contains('\0') {
        return Err(crate::error::ErrCode::InvalidKey);
    }
    Ok(())
}
