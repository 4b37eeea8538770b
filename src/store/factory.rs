// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Process-wide cache of store clients: entities targeting the same
// `ip:port` share one connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tracing::error;

use crate::error::Result;
use crate::store::{KvStore, PrefixStore, TcpStore};
use crate::transport::TlsConfig;

fn stores() -> &'static Mutex<HashMap<String, Arc<TcpStore>>> {
    static STORES: OnceLock<Mutex<HashMap<String, Arc<TcpStore>>>> = OnceLock::new();
    STORES.get_or_init(|| Mutex::new(HashMap::new()))
}

fn tls_state() -> &'static Mutex<TlsConfig> {
    static TLS: OnceLock<Mutex<TlsConfig>> = OnceLock::new();
    TLS.get_or_init(|| Mutex::new(TlsConfig::default()))
}

pub struct StoreFactory;

impl StoreFactory {
    /// Get or create the shared client for `ip:port`. When `with_server` the
    /// first creator also starts the server (tolerating a lost bind race).
    pub fn create_store(
        ip: &str,
        port: u16,
        with_server: bool,
        world_size: u32,
        rank_id: i32,
        retry_times: i32,
    ) -> Result<Arc<TcpStore>> {
        let key = format!("{ip}:{port}");
        let mut map = stores().lock().unwrap();
        if let Some(existing) = map.get(&key) {
            return Ok(Arc::clone(existing));
        }
        let store = TcpStore::startup(ip, port, with_server, world_size, rank_id, retry_times)
            .map_err(|e| {
                error!("store startup for {key} failed: {e}");
                e
            })?;
        map.insert(key, Arc::clone(&store));
        Ok(store)
    }

    /// Drop the cache entry; the connection closes when the last user lets
    /// go of its handle.
    pub fn destroy_store(ip: &str, port: u16) {
        let key = format!("{ip}:{port}");
        stores().lock().unwrap().remove(&key);
    }

    /// Wrap a store in a prefix-scoped view.
    pub fn prefix_store(base: Arc<dyn KvStore>, prefix: impl Into<String>) -> Arc<PrefixStore> {
        PrefixStore::new(base, prefix)
    }

    /// TLS material every store created afterwards carries.
    /// `MEMFABRIC_HYBRID_TLS_ENABLE` overrides the enable flag.
    pub fn set_tls_config(config: TlsConfig) {
        *tls_state().lock().unwrap() = config;
    }

    pub fn tls_config() -> TlsConfig {
        let mut config = tls_state().lock().unwrap().clone();
        match std::env::var("MEMFABRIC_HYBRID_TLS_ENABLE").as_deref() {
            Ok("0") => config.enable = false,
            Ok("1") => config.enable = true,
            _ => {}
        }
        config
    }
}

impl StoreFactory {
    /// Shut down every cached store (used by `smem_trans_uninit`).
    pub fn destroy_all() {
        let drained: Vec<Arc<TcpStore>> = {
            let mut map = stores().lock().unwrap();
            map.drain().map(|(_, store)| store).collect()
        };
        for store in drained {
            store.shutdown();
        }
    }
}
