// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Prefix-scoped view over a store. Every key is prepended with the view's
// prefix before being forwarded; watches hand the caller-visible key back to
// the callback. Views compose: prefixing a prefixed store concatenates.

use std::sync::Arc;

use crate::error::Result;
use crate::store::{
    ClientBrokenFn, GetValue, KvStore, ServerBrokenHook, ServerOpHook, WatchKeyFn, WatchRankFn,
};

pub struct PrefixStore {
    base: Arc<dyn KvStore>,
    prefix: String,
}

impl PrefixStore {
    pub fn new(base: Arc<dyn KvStore>, prefix: impl Into<String>) -> Arc<PrefixStore> {
        Arc::new(PrefixStore {
            base,
            prefix: prefix.into(),
        })
    }

    fn scoped(&self, key: &str) -> String {
        let mut out = String::with_capacity(self.prefix.len() + key.len());
        out.push_str(&self.prefix);
        out.push_str(key);
        out
    }
}

impl KvStore for PrefixStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.base.set(&self.scoped(key), value)
    }

    fn get(&self, key: &str, timeout_ms: i64) -> Result<GetValue> {
        self.base.get(&self.scoped(key), timeout_ms)
    }

    fn add(&self, key: &str, increment: i64) -> Result<i64> {
        self.base.add(&self.scoped(key), increment)
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.base.remove(&self.scoped(key))
    }

    fn append(&self, key: &str, value: &[u8]) -> Result<u64> {
        self.base.append(&self.scoped(key), value)
    }

    fn cas(&self, key: &str, expect: &[u8], new: &[u8]) -> Result<Vec<u8>> {
        self.base.cas(&self.scoped(key), expect, new)
    }

    fn write_at(&self, key: &str, value: &[u8], offset: u32) -> Result<()> {
        self.base.write_at(&self.scoped(key), value, offset)
    }

    fn watch_key(&self, key: &str, notify: WatchKeyFn) -> Result<u32> {
        let visible = key.to_string();
        self.base.watch_key(
            &self.scoped(key),
            Arc::new(move |result, _| notify(result, &visible)),
        )
    }

    fn watch_rank_state(&self, notify: WatchRankFn) -> Result<u32> {
        self.base.watch_rank_state(notify)
    }

    fn unwatch(&self, wid: u32) -> Result<()> {
        self.base.unwatch(wid)
    }

    fn connected(&self) -> bool {
        self.base.connected()
    }

    fn set_connected(&self, status: bool) {
        self.base.set_connected(status)
    }

    fn reconnect_after_broken(&self, retry_times: i32) -> Result<()> {
        self.base.reconnect_after_broken(retry_times)
    }

    fn register_client_broken_handler(&self, handler: ClientBrokenFn) {
        self.base.register_client_broken_handler(handler)
    }

    fn register_server_op_hook(&self, opcode: i16, hook: ServerOpHook) {
        self.base.register_server_op_hook(opcode, hook)
    }

    fn register_server_broken_hook(&self, hook: ServerBrokenHook) {
        self.base.register_server_broken_hook(hook)
    }

    fn common_prefix(&self) -> String {
        let mut out = self.base.common_prefix();
        out.push_str(&self.prefix);
        out
    }

    fn full_key(&self, key: &str) -> String {
        self.base.full_key(&self.scoped(key))
    }
}
