// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Rendezvous store client: one persistent framed link to the server, a
// seq -> waiter table, a heartbeat thread, and reconnect-after-broken.
//
// Blocking calls park on a condvar until the reply frame lands; watch calls
// install a context that survives many replies. When the link breaks, every
// outstanding context is failed with `IoError` and the user-registered
// broken handler fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::codec::{Message, MsgType, HEARTBEAT_INTERVAL_MS, WATCH_RANK_DOWN_KEY};
use crate::error::{ErrCode, Result};
use crate::link::{Frame, TcpLink, RANK_AUTO_ASSIGN};
use crate::store::{
    check_key, ClientBrokenFn, GetValue, KvStore, ServerBrokenHook, ServerOpHook, StoreServer,
    WatchKeyFn, WatchRankFn,
};

/// A reply as seen by waiter contexts: link-header result + codec payload.
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    pub result: i16,
    pub payload: Vec<u8>,
}

trait ClientContext: Send + Sync {
    fn set_finished(&self, reply: Reply);
    fn set_failed_finish(&self);
    /// Blocking contexts leave the table on first reply; watch contexts stay.
    fn one_shot(&self) -> bool;
}

/// Context for one blocking request.
struct WaitContext {
    state: Mutex<(bool, Option<Reply>)>,
    cond: Condvar,
}

impl WaitContext {
    fn new() -> Arc<WaitContext> {
        Arc::new(WaitContext {
            state: Mutex::new((false, None)),
            cond: Condvar::new(),
        })
    }

    fn wait_finished(&self) -> Option<Reply> {
        let guard = self.state.lock().unwrap();
        let mut guard = self.cond.wait_while(guard, |(done, _)| !*done).unwrap();
        guard.1.take()
    }
}

impl ClientContext for WaitContext {
    fn set_finished(&self, reply: Reply) {
        let mut guard = self.state.lock().unwrap();
        *guard = (true, Some(reply));
        drop(guard);
        self.cond.notify_one();
    }

    fn set_failed_finish(&self) {
        let mut guard = self.state.lock().unwrap();
        *guard = (true, None);
        drop(guard);
        self.cond.notify_one();
    }

    fn one_shot(&self) -> bool {
        true
    }
}

/// Context for a watch: unpacks each reply and forwards the first value.
struct WatchContext {
    notify: Arc<dyn Fn(Result<Vec<u8>>) + Send + Sync>,
}

impl ClientContext for WatchContext {
    fn set_finished(&self, reply: Reply) {
        match Message::unpack(&reply.payload) {
            Ok((body, _)) if !body.values.is_empty() => {
                (self.notify)(Ok(body.values.into_iter().next().unwrap()));
            }
            _ => {
                error!("watch reply has no value");
                (self.notify)(Err(ErrCode::IoError));
            }
        }
    }

    fn set_failed_finish(&self) {
        (self.notify)(Err(ErrCode::IoError));
    }

    fn one_shot(&self) -> bool {
        false
    }
}

struct ClientInner {
    server_ip: String,
    server_port: u16,
    conn_rank: u64,
    link: Mutex<Option<Arc<TcpLink>>>,
    contexts: Mutex<HashMap<u32, Arc<dyn ClientContext>>>,
    seq_gen: AtomicU32,
    is_connect: AtomicBool,
    running: AtomicBool,
    broken_handler: Mutex<Option<ClientBrokenFn>>,
}

impl ClientInner {
    fn on_response(&self, frame: Frame) {
        debug!(seq = frame.header.seq, "client received reply");
        let context = {
            let mut contexts = self.contexts.lock().unwrap();
            let one_shot = contexts.get(&frame.header.seq).map(|ctx| ctx.one_shot());
            match one_shot {
                Some(true) => contexts.remove(&frame.header.seq),
                Some(false) => contexts.get(&frame.header.seq).map(Arc::clone),
                None => None,
            }
        };
        match context {
            Some(ctx) => ctx.set_finished(Reply {
                result: frame.header.result,
                payload: frame.payload,
            }),
            None => warn!(seq = frame.header.seq, "reply without a pending request"),
        }
    }

    fn on_broken(&self) {
        warn!("store link broken");
        self.is_connect.store(false, Ordering::Release);
        let handler = self.broken_handler.lock().unwrap().clone();
        if let Some(handler) = handler {
            handler();
        }
        let drained: Vec<Arc<dyn ClientContext>> = {
            let mut contexts = self.contexts.lock().unwrap();
            contexts.drain().map(|(_, ctx)| ctx).collect()
        };
        for ctx in drained {
            ctx.set_failed_finish();
        }
    }
}

/// TCP rendezvous store, client side, optionally with an embedded server.
pub struct TcpStore {
    inner: Arc<ClientInner>,
    server: Mutex<Option<StoreServer>>,
    heartbeat: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TcpStore {
    /// Start a client (and the server first when `with_server`), connecting
    /// with `retry_times` attempts. `rank_id < 0` asks the server to assign.
    pub fn startup(
        ip: &str,
        port: u16,
        with_server: bool,
        world_size: u32,
        rank_id: i32,
        retry_times: i32,
    ) -> Result<Arc<TcpStore>> {
        let server = if with_server {
            match StoreServer::start("0.0.0.0", port, world_size) {
                Ok(server) => Some(server),
                Err(ErrCode::ResourceInUse) => {
                    // Another process won the bind; being a plain client is fine.
                    info!("store server on port {port} already running");
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let conn_rank = if rank_id >= 0 {
            ((world_size as u64) << 32) | rank_id as u64
        } else {
            ((world_size as u64) << 32) | RANK_AUTO_ASSIGN as u64
        };

        // The link itself stays plain TCP; the handshake material is handed
        // to the channel provider by the transport layer.
        let tls = crate::store::StoreFactory::tls_config();
        if tls.enable {
            info!("store link TLS requested, certs at {}", tls.cert_path);
        }

        let inner = Arc::new(ClientInner {
            server_ip: ip.to_string(),
            server_port: port,
            conn_rank,
            link: Mutex::new(None),
            contexts: Mutex::new(HashMap::new()),
            seq_gen: AtomicU32::new(1),
            is_connect: AtomicBool::new(false),
            running: AtomicBool::new(true),
            broken_handler: Mutex::new(None),
        });

        let store = Arc::new(TcpStore {
            inner: Arc::clone(&inner),
            server: Mutex::new(server),
            heartbeat: Mutex::new(None),
        });
        store.connect_link(retry_times)?;

        let hb_inner = Arc::clone(&inner);
        let handle = thread::spawn(move || heartbeat_task(hb_inner));
        *store.heartbeat.lock().unwrap() = Some(handle);

        Ok(store)
    }

    fn connect_link(&self, retry_times: i32) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let response_inner = Arc::clone(&self.inner);
        let broken_inner = Arc::clone(&self.inner);
        let link = TcpLink::connect(
            &inner.server_ip,
            inner.server_port,
            inner.conn_rank,
            retry_times,
            Arc::new(move |frame| response_inner.on_response(frame)),
            Arc::new(move || broken_inner.on_broken()),
        )?;
        *inner.link.lock().unwrap() = Some(link);
        inner.is_connect.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the heartbeat, close the link (failing all in-flight calls with
    /// `IoError`) and shut the embedded server down.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        let handle = self.heartbeat.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.join().ok();
        }

        let link = self.inner.link.lock().unwrap().take();
        if let Some(link) = link {
            link.shutdown();
        }

        let server = self.server.lock().unwrap().take();
        if let Some(server) = server {
            server.shutdown();
        }
    }

    fn submit_blocking(&self, request: &Message) -> Result<Reply> {
        let packed = request.pack()?;
        let seq = self.inner.seq_gen.fetch_add(1, Ordering::Relaxed);
        let context = WaitContext::new();
        self.inner
            .contexts
            .lock()
            .unwrap()
            .insert(seq, Arc::clone(&context) as Arc<dyn ClientContext>);

        if let Err(e) = self.send_on_link(seq, &packed) {
            self.inner.contexts.lock().unwrap().remove(&seq);
            return Err(e);
        }
        context.wait_finished().ok_or(ErrCode::IoError)
    }

    fn submit_watch(
        &self,
        request: &Message,
        notify: Arc<dyn Fn(Result<Vec<u8>>) + Send + Sync>,
    ) -> Result<u32> {
        let packed = request.pack()?;
        let seq = self.inner.seq_gen.fetch_add(1, Ordering::Relaxed);
        let context = Arc::new(WatchContext { notify });
        self.inner
            .contexts
            .lock()
            .unwrap()
            .insert(seq, context as Arc<dyn ClientContext>);

        if let Err(e) = self.send_on_link(seq, &packed) {
            self.inner.contexts.lock().unwrap().remove(&seq);
            return Err(e);
        }
        Ok(seq)
    }

    fn send_on_link(&self, seq: u32, payload: &[u8]) -> Result<()> {
        let link = self.inner.link.lock().unwrap().clone();
        match link {
            Some(link) => link.send(seq, 0, payload),
            None => Err(ErrCode::NotInitialized),
        }
    }

    fn expect_value(reply: &Reply) -> Result<Vec<u8>> {
        let (body, _) = Message::unpack(&reply.payload)?;
        body.values.into_iter().next().ok_or(ErrCode::Error)
    }
}

impl Drop for TcpStore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn heartbeat_task(inner: Arc<ClientInner>) {
    const SLEEP_STEP_MS: u64 = 50;
    while inner.running.load(Ordering::Acquire) {
        if inner.is_connect.load(Ordering::Acquire) {
            let beat = Message::new(MsgType::Heartbeat);
            if let Ok(packed) = beat.pack() {
                let link = inner.link.lock().unwrap().clone();
                if let Some(link) = link {
                    if let Err(e) = link.send(0, 0, &packed) {
                        debug!("heartbeat send failed: {e}");
                    }
                }
            }
        }
        // Sleep in small steps so shutdown is prompt.
        let mut slept = 0;
        while slept < HEARTBEAT_INTERVAL_MS && inner.running.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(SLEEP_STEP_MS));
            slept += SLEEP_STEP_MS;
        }
    }
    info!("store heartbeat thread exits");
}

impl KvStore for TcpStore {
    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        check_key(key)?;
        let request = Message::with_key_value(MsgType::Set, key, value.to_vec());
        let reply = self.submit_blocking(&request)?;
        match ErrCode::from_code(reply.result as i32) {
            None => Ok(()),
            Some(code) => {
                error!(key, "set rejected: {code}");
                Err(code)
            }
        }
    }

    fn get(&self, key: &str, timeout_ms: i64) -> Result<GetValue> {
        check_key(key)?;
        let mut request = Message::with_key(MsgType::Get, key);
        request.user_tag = timeout_ms;
        let reply = self.submit_blocking(&request)?;
        match ErrCode::from_code(reply.result as i32) {
            None => Ok(GetValue::Existing(Self::expect_value(&reply)?)),
            Some(ErrCode::Restore) => Ok(GetValue::Restored(Self::expect_value(&reply)?)),
            Some(ErrCode::NotExist) => Err(ErrCode::NotExist),
            Some(code) => {
                warn!(key, timeout_ms, "get rejected: {code}");
                Err(code)
            }
        }
    }

    fn add(&self, key: &str, increment: i64) -> Result<i64> {
        check_key(key)?;
        let request = Message::with_key_value(
            MsgType::Add,
            key,
            increment.to_string().into_bytes(),
        );
        let reply = self.submit_blocking(&request)?;
        if let Some(code) = ErrCode::from_code(reply.result as i32) {
            error!(key, "add rejected: {code}");
            return Err(code);
        }
        let text = String::from_utf8_lossy(&reply.payload);
        text.parse().map_err(|_| ErrCode::Error)
    }

    fn remove(&self, key: &str) -> Result<()> {
        check_key(key)?;
        let request = Message::with_key(MsgType::Remove, key);
        let reply = self.submit_blocking(&request)?;
        match ErrCode::from_code(reply.result as i32) {
            None => Ok(()),
            Some(ErrCode::NotExist) => Err(ErrCode::NotExist),
            Some(code) => {
                error!(key, "remove rejected: {code}");
                Err(code)
            }
        }
    }

    fn append(&self, key: &str, value: &[u8]) -> Result<u64> {
        check_key(key)?;
        let request = Message::with_key_value(MsgType::Append, key, value.to_vec());
        let reply = self.submit_blocking(&request)?;
        if let Some(code) = ErrCode::from_code(reply.result as i32) {
            error!(key, "append rejected: {code}");
            return Err(code);
        }
        let text = String::from_utf8_lossy(&reply.payload);
        text.parse().map_err(|_| ErrCode::Error)
    }

    fn cas(&self, key: &str, expect: &[u8], new: &[u8]) -> Result<Vec<u8>> {
        check_key(key)?;
        let mut request = Message::with_key(MsgType::Cas, key);
        request.values.push(expect.to_vec());
        request.values.push(new.to_vec());
        let reply = self.submit_blocking(&request)?;
        if let Some(code) = ErrCode::from_code(reply.result as i32) {
            error!(key, "cas rejected: {code}");
            return Err(code);
        }
        Self::expect_value(&reply)
    }

    fn write_at(&self, key: &str, value: &[u8], offset: u32) -> Result<()> {
        check_key(key)?;
        let mut framed = Vec::with_capacity(4 + value.len());
        framed.extend_from_slice(&offset.to_le_bytes());
        framed.extend_from_slice(value);
        let request = Message::with_key_value(MsgType::Write, key, framed);
        let reply = self.submit_blocking(&request)?;
        match ErrCode::from_code(reply.result as i32) {
            None => Ok(()),
            Some(code) => {
                error!(key, offset, "write rejected: {code}");
                Err(code)
            }
        }
    }

    fn watch_key(&self, key: &str, notify: WatchKeyFn) -> Result<u32> {
        check_key(key)?;
        let request = Message::with_key(MsgType::Get, key);
        let visible_key = key.to_string();
        let wid = self.submit_watch(
            &request,
            Arc::new(move |result| notify(result, &visible_key)),
        )?;
        debug!(key, wid, "key watch installed");
        Ok(wid)
    }

    fn watch_rank_state(&self, notify: WatchRankFn) -> Result<u32> {
        let request = Message::with_key(MsgType::WatchRankState, WATCH_RANK_DOWN_KEY);
        let wid = self.submit_watch(
            &request,
            Arc::new(move |result: Result<Vec<u8>>| {
                if let Ok(value) = result {
                    if value.len() == 4 {
                        notify(u32::from_le_bytes(value[..4].try_into().unwrap()));
                    }
                }
            }),
        )?;
        debug!(wid, "rank-state watch installed");
        Ok(wid)
    }

    fn unwatch(&self, wid: u32) -> Result<()> {
        let mut contexts = self.inner.contexts.lock().unwrap();
        let is_watch = contexts.get(&wid).map(|ctx| !ctx.one_shot());
        if is_watch == Some(true) {
            contexts.remove(&wid);
            info!(wid, "unwatched");
            Ok(())
        } else {
            warn!(wid, "unwatch: no such watch");
            Err(ErrCode::NotExist)
        }
    }

    fn connected(&self) -> bool {
        self.inner.is_connect.load(Ordering::Acquire)
    }

    fn set_connected(&self, status: bool) {
        self.inner.is_connect.store(status, Ordering::Release);
    }

    fn reconnect_after_broken(&self, retry_times: i32) -> Result<()> {
        self.connect_link(retry_times)?;
        info!("reconnected to store server");
        Ok(())
    }

    fn register_client_broken_handler(&self, handler: ClientBrokenFn) {
        *self.inner.broken_handler.lock().unwrap() = Some(handler);
    }

    fn register_server_op_hook(&self, opcode: i16, hook: ServerOpHook) {
        match &*self.server.lock().unwrap() {
            Some(server) => server.register_op_hook(opcode, hook),
            None => info!("no embedded server, op hook ignored"),
        }
    }

    fn register_server_broken_hook(&self, hook: ServerBrokenHook) {
        match &*self.server.lock().unwrap() {
            Some(server) => server.register_broken_hook(hook),
            None => info!("no embedded server, broken hook ignored"),
        }
    }

    fn common_prefix(&self) -> String {
        String::new()
    }

    fn full_key(&self, key: &str) -> String {
        key.to_string()
    }
}
