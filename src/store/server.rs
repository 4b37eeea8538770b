// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Rendezvous store server.
//
// One thread accepts links, one reader thread per link parses request
// frames, a timer thread expires blocked GET waiters (1 ms tick), and a
// rank-state thread fans peer-down notifications out to subscribed links.
// The kv map, the waiter table and its two indexes live under one mutex;
// replies are always sent after that lock is released.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::codec::{Message, MsgType, WATCH_RANK_DOWN_KEY};
use crate::error::{ErrCode, Result};
use crate::link::{read_frame, Frame, ServerLink, OP_CONN, RANK_AUTO_ASSIGN};
use crate::store::{OpHookOutcome, ServerBrokenHook, ServerOpHook, MAX_KEY_LEN_SERVER};

/// Keys starting with this prefix take the rank-lease GET path.
pub const AUTO_RANK_KEY_PREFIX: &str = "auto_ranking_key_";

const TIMER_TICK: Duration = Duration::from_millis(1);

fn now_ms() -> i64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as i64
}

/// A blocked GET parked on the server.
struct StoreWaiter {
    deadline_ms: i64, // < 0: wait forever
    key: String,
    link: Arc<ServerLink>,
    seq: u32,
}

#[derive(Default)]
struct StoreState {
    kv: HashMap<String, Vec<u8>>,
    waiters: Slab<StoreWaiter>,
    key_waiters: HashMap<String, HashSet<usize>>,
    timed_waiters: BTreeMap<i64, HashSet<usize>>,
    world_size: u32,
    alive_ranks: HashSet<u32>,
    /// rank announced (or leased) per connected link; RANK_AUTO_ASSIGN until
    /// the link asks for one.
    link_ranks: HashMap<u32, u32>,
}

struct ServerInner {
    listen_port: u16,
    running: AtomicBool,
    state: Mutex<StoreState>,
    timer_cond: Condvar,
    links: Mutex<HashMap<u32, Arc<ServerLink>>>,
    rank_state: Mutex<RankState>,
    rank_cond: Condvar,
    op_hooks: Mutex<HashMap<i16, ServerOpHook>>,
    broken_hook: Mutex<Option<ServerBrokenHook>>,
}

// Link ids are process-unique so fault records never collide when several
// servers run in one process.
static LINK_ID_GEN: AtomicU32 = AtomicU32::new(1);

#[derive(Default)]
struct RankState {
    /// link id -> (reply link, request seq) of WATCH_RANK_STATE subscribers.
    waiters: HashMap<u32, (Arc<ServerLink>, u32)>,
    queue: VecDeque<u32>,
}

/// TCP rendezvous store server.
pub struct StoreServer {
    inner: Arc<ServerInner>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Bind with SO_REUSEADDR so a restarted server can re-take a port whose
/// previous connections still sit in TIME_WAIT.
#[cfg(unix)]
fn bind_listener(ip: &str, port: u16) -> std::io::Result<TcpListener> {
    use std::os::fd::FromRawFd;

    let addr: std::net::Ipv4Addr = ip
        .parse()
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "bad listen ip"))?;
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let one: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(addr).to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) != 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        if libc::listen(fd, 128) != 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        Ok(TcpListener::from_raw_fd(fd))
    }
}

impl StoreServer {
    /// Bind and start all service threads. `world_size == u32::MAX` means
    /// "adopt the first client's announcement".
    pub fn start(ip: &str, port: u16, world_size: u32) -> Result<StoreServer> {
        let listener = bind_listener(ip, port).map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                info!("store server port {port} already in use");
                ErrCode::ResourceInUse
            } else {
                error!("store server bind {ip}:{port} failed: {e}");
                ErrCode::Error
            }
        })?;
        listener.set_nonblocking(true).map_err(|_| ErrCode::Error)?;

        let inner = Arc::new(ServerInner {
            listen_port: port,
            running: AtomicBool::new(true),
            state: Mutex::new(StoreState {
                world_size,
                ..StoreState::default()
            }),
            timer_cond: Condvar::new(),
            links: Mutex::new(HashMap::new()),
            rank_state: Mutex::new(RankState::default()),
            rank_cond: Condvar::new(),
            op_hooks: Mutex::new(HashMap::new()),
            broken_hook: Mutex::new(None),
        });

        let mut threads = Vec::new();
        let accept_inner = Arc::clone(&inner);
        threads.push(thread::spawn(move || accept_task(accept_inner, listener)));
        let timer_inner = Arc::clone(&inner);
        threads.push(thread::spawn(move || timer_task(timer_inner)));
        let rank_inner = Arc::clone(&inner);
        threads.push(thread::spawn(move || rank_state_task(rank_inner)));

        debug!("store server listening on {ip}:{port}");
        Ok(StoreServer {
            inner,
            threads: Mutex::new(threads),
        })
    }

    pub fn port(&self) -> u16 {
        self.inner.listen_port
    }

    /// Install a fault-recovery hook for one opcode.
    pub fn register_op_hook(&self, opcode: i16, hook: ServerOpHook) {
        self.inner.op_hooks.lock().unwrap().insert(opcode, hook);
    }

    /// Install the broken-link hook.
    pub fn register_broken_hook(&self, hook: ServerBrokenHook) {
        *self.inner.broken_hook.lock().unwrap() = Some(hook);
    }

    /// Stop threads cooperatively, close every link, refuse new ones.
    pub fn shutdown(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("store server on port {} shutting down", self.inner.listen_port);

        {
            let _guard = self.inner.state.lock().unwrap();
            self.inner.timer_cond.notify_all();
        }
        {
            let _guard = self.inner.rank_state.lock().unwrap();
            self.inner.rank_cond.notify_all();
        }
        {
            let links = self.inner.links.lock().unwrap();
            for link in links.values() {
                link.close();
            }
        }

        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in threads {
            handle.join().ok();
        }
    }
}

impl Drop for StoreServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for StoreServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreServer")
            .field("port", &self.inner.listen_port)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Accept + per-link reader
// ---------------------------------------------------------------------------

fn accept_task(inner: Arc<ServerInner>, listener: TcpListener) {
    let mut readers: Vec<thread::JoinHandle<()>> = Vec::new();
    while inner.running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!("new connection from {peer}");
                if let Some(handle) = admit_link(&inner, stream) {
                    readers.push(handle);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                warn!("accept failed: {e}");
                thread::sleep(Duration::from_millis(10));
            }
        }
    }
    for handle in readers {
        handle.join().ok();
    }
}

/// Read the OP_CONN hello, register the link, spawn its reader.
fn admit_link(inner: &Arc<ServerInner>, stream: TcpStream) -> Option<thread::JoinHandle<()>> {
    stream.set_nonblocking(false).ok()?;
    stream.set_nodelay(true).ok();
    let peer = stream.peer_addr().ok()?;
    let mut read_half = stream.try_clone().ok()?;

    let hello = match read_frame(&mut read_half) {
        Ok(frame) if frame.header.opcode == OP_CONN && frame.payload.len() >= 8 => frame,
        _ => {
            warn!("connection from {peer} sent no hello, dropping");
            return None;
        }
    };
    let conn_rank = u64::from_le_bytes(hello.payload[..8].try_into().unwrap());
    let world_size = (conn_rank >> 32) as u32;
    let rank_id = (conn_rank & 0xFFFF_FFFF) as u32;

    let link_id = LINK_ID_GEN.fetch_add(1, Ordering::Relaxed);
    let link = Arc::new(ServerLink::new(link_id, peer, stream));
    inner.links.lock().unwrap().insert(link_id, Arc::clone(&link));
    info!(link = link_id, rank = rank_id, world = world_size, "new link from {peer}");

    {
        let mut state = inner.state.lock().unwrap();
        if state.world_size == u32::MAX {
            state.world_size = world_size;
            info!("world size fixed to {world_size}");
        }
        state.link_ranks.insert(link_id, rank_id);
        if rank_id != RANK_AUTO_ASSIGN {
            state.kv.insert(
                format!("{AUTO_RANK_KEY_PREFIX}{link_id}"),
                rank_id.to_le_bytes().to_vec(),
            );
            state.alive_ranks.insert(rank_id);
        }
    }

    let reader_inner = Arc::clone(inner);
    Some(thread::spawn(move || {
        loop {
            match read_frame(&mut read_half) {
                Ok(frame) => handle_request(&reader_inner, &link, frame),
                Err(e) => {
                    debug!(link = link_id, "reader exits: {e}");
                    break;
                }
            }
        }
        link.close();
        link_broken(&reader_inner, link_id);
    }))
}

// ---------------------------------------------------------------------------
// Request dispatch
// ---------------------------------------------------------------------------

fn handle_request(inner: &Arc<ServerInner>, link: &Arc<ServerLink>, frame: Frame) {
    let seq = frame.header.seq;
    let request = match Message::unpack(&frame.payload) {
        Ok((request, _)) => request,
        Err(_) => {
            error!(seq, "request has invalid body");
            reply_text(link, seq, ErrCode::InvalidMessage, "invalid request");
            return;
        }
    };

    match request.mt {
        MsgType::Set => set_handler(inner, link, seq, request),
        MsgType::Get => get_handler(inner, link, seq, request),
        MsgType::Add => add_handler(inner, link, seq, request),
        MsgType::Remove => remove_handler(inner, link, seq, request),
        MsgType::Append => append_handler(inner, link, seq, request),
        MsgType::Cas => cas_handler(inner, link, seq, request),
        MsgType::Write => write_handler(inner, link, seq, request),
        MsgType::WatchRankState => watch_rank_state_handler(inner, link, seq, request),
        MsgType::Heartbeat => {}
        MsgType::Invalid => {
            error!(seq, "invalid message type");
            reply_text(link, seq, ErrCode::InvalidMessage, "invalid request message type");
        }
    }
}

fn reply_text(link: &ServerLink, seq: u32, code: ErrCode, text: &str) {
    link.reply(seq, code.code() as i16, text.as_bytes());
}

fn reply_ok_text(link: &ServerLink, seq: u32, text: &str) {
    link.reply(seq, 0, text.as_bytes());
}

/// Reply with a codec frame carrying one value. `code` is the link-header
/// result (0 for success, `Restore` for synthesized recovery payloads).
fn reply_value(link: &ServerLink, seq: u32, code: i16, mt: MsgType, value: Vec<u8>) {
    let mut body = Message::new(mt);
    body.values.push(value);
    match body.pack() {
        Ok(packed) => link.reply(seq, code, &packed),
        Err(_) => reply_text(link, seq, ErrCode::InvalidMessage, "reply too large"),
    }
}

fn check_request(
    link: &ServerLink,
    seq: u32,
    request: &Message,
    keys: usize,
    values: usize,
) -> bool {
    if request.keys.len() != keys || request.values.len() != values {
        error!(seq, "request has invalid body");
        reply_text(link, seq, ErrCode::InvalidMessage, "invalid request: bad key/value count");
        return false;
    }
    if let Some(key) = request.keys.first() {
        if key.len() > MAX_KEY_LEN_SERVER {
            error!(seq, "key too long: {}", key.len());
            reply_text(link, seq, ErrCode::InvalidKey, "invalid request: key too long");
            return false;
        }
    }
    true
}

/// Run the registered hook for `opcode` under the store lock.
fn run_op_hook(
    inner: &ServerInner,
    opcode: MsgType,
    link_id: u32,
    key: &str,
    value: &mut Vec<u8>,
    kv: &HashMap<String, Vec<u8>>,
) -> Result<OpHookOutcome> {
    let hook = inner.op_hooks.lock().unwrap().get(&(opcode as i16)).cloned();
    match hook {
        Some(hook) => hook(link_id, key, value, kv),
        None => Ok(OpHookOutcome::Pass),
    }
}

// ---------------------------------------------------------------------------
// Opcode handlers
// ---------------------------------------------------------------------------

fn set_handler(inner: &Arc<ServerInner>, link: &Arc<ServerLink>, seq: u32, mut request: Message) {
    if !check_request(link, seq, &request, 1, 1) {
        return;
    }
    let key = request.keys.remove(0);
    let mut value = request.values.remove(0);

    let mut woken = Vec::new();
    let mut wake_value = Vec::new();
    {
        let mut state = inner.state.lock().unwrap();
        if run_op_hook(inner, MsgType::Set, link.id(), &key, &mut value, &state.kv).is_err() {
            drop(state);
            debug!(seq, %key, "set hook rejected the request");
            reply_text(link, seq, ErrCode::Error, "failed");
            return;
        }
        if state.kv.contains_key(&key) {
            state.kv.insert(key, value);
        } else {
            // Waiters are woken on insertion only, not on replacement.
            woken = take_key_waiters(&mut state, &key);
            wake_value = value.clone();
            state.kv.insert(key, value);
        }
    }

    reply_ok_text(link, seq, "success");
    wakeup_waiters(&woken, &wake_value);
}

fn get_handler(inner: &Arc<ServerInner>, link: &Arc<ServerLink>, seq: u32, mut request: Message) {
    if request.keys.len() != 1 || !request.values.is_empty() {
        error!(seq, "request has invalid body");
        reply_text(link, seq, ErrCode::InvalidMessage, "invalid request: one key, no values");
        return;
    }
    let key = request.keys.remove(0);
    if key.len() > MAX_KEY_LEN_SERVER {
        reply_text(link, seq, ErrCode::InvalidKey, "invalid request: key too long");
        return;
    }

    if key.starts_with(AUTO_RANK_KEY_PREFIX) {
        find_or_insert_rank(inner, link, seq, &key);
        return;
    }

    {
        let mut state = inner.state.lock().unwrap();
        if let Some(value) = state.kv.get(&key) {
            let value = value.clone();
            drop(state);
            reply_value(link, seq, 0, MsgType::Get, value);
            return;
        }

        // The fault-recovery hook may synthesize a restoration payload for a
        // reconnecting peer; such a GET answers `Restore`, not `Success`.
        let mut synthesized = Vec::new();
        if let Ok(OpHookOutcome::Object) =
            run_op_hook(inner, MsgType::Get, link.id(), &key, &mut synthesized, &state.kv)
        {
            drop(state);
            debug!(seq, %key, "get answered from fault info");
            reply_value(link, seq, ErrCode::Restore.code() as i16, MsgType::Get, synthesized);
            return;
        }

        if request.user_tag == 0 {
            drop(state);
            reply_text(link, seq, ErrCode::NotExist, "<not exist>");
            return;
        }

        let deadline_ms = if request.user_tag > 0 {
            now_ms() + request.user_tag
        } else {
            -1
        };
        let waiter = StoreWaiter {
            deadline_ms,
            key: key.clone(),
            link: Arc::clone(link),
            seq,
        };
        let id = state.waiters.insert(waiter);
        state.key_waiters.entry(key).or_default().insert(id);
        if deadline_ms >= 0 {
            state.timed_waiters.entry(deadline_ms).or_default().insert(id);
        }
    }
}

fn add_handler(inner: &Arc<ServerInner>, link: &Arc<ServerLink>, seq: u32, mut request: Message) {
    if !check_request(link, seq, &request, 1, 1) {
        return;
    }
    let key = request.keys.remove(0);
    let mut value = request.values.remove(0);

    let text = String::from_utf8_lossy(&value).to_string();
    let increment: i64 = match text.parse::<i64>() {
        Ok(n) if text == n.to_string() => n,
        _ => {
            error!(seq, %key, "add value is not a number");
            reply_text(link, seq, ErrCode::InvalidMessage, "invalid request: value should be a number");
            return;
        }
    };

    let mut woken = Vec::new();
    let mut wake_value = Vec::new();
    let response;
    {
        let mut state = inner.state.lock().unwrap();
        if increment > 0
            && run_op_hook(inner, MsgType::Add, link.id(), &key, &mut value, &state.kv).is_err()
        {
            drop(state);
            debug!(seq, %key, "add hook rejected the request");
            reply_text(link, seq, ErrCode::Error, "failed");
            return;
        }
        let stored = state.kv.get(&key).cloned();
        match stored {
            None => {
                response = increment;
                woken = take_key_waiters(&mut state, &key);
                wake_value = value.clone();
                state.kv.insert(key, value);
            }
            Some(stored) => {
                let stored_text = String::from_utf8_lossy(&stored).to_string();
                let stored_num: i64 = match stored_text.parse() {
                    Ok(n) => n,
                    Err(_) => {
                        drop(state);
                        error!(seq, "stored value is not a number: {stored_text}");
                        reply_text(link, seq, ErrCode::InvalidMessage, "stored value should be a number");
                        return;
                    }
                };
                response = stored_num.wrapping_add(increment);
                state.kv.insert(key, response.to_string().into_bytes());
            }
        }
    }

    reply_ok_text(link, seq, &response.to_string());
    wakeup_waiters(&woken, &wake_value);
}

fn remove_handler(inner: &Arc<ServerInner>, link: &Arc<ServerLink>, seq: u32, mut request: Message) {
    if request.keys.len() != 1 || !request.values.is_empty() {
        reply_text(link, seq, ErrCode::InvalidMessage, "invalid request: one key, no values");
        return;
    }
    let key = request.keys.remove(0);
    if key.len() > MAX_KEY_LEN_SERVER {
        reply_text(link, seq, ErrCode::InvalidKey, "invalid request: key too long");
        return;
    }

    let removed = inner.state.lock().unwrap().kv.remove(&key).is_some();
    if removed {
        reply_ok_text(link, seq, "success");
    } else {
        reply_text(link, seq, ErrCode::NotExist, "not exist");
    }
}

fn append_handler(inner: &Arc<ServerInner>, link: &Arc<ServerLink>, seq: u32, mut request: Message) {
    if !check_request(link, seq, &request, 1, 1) {
        return;
    }
    let key = request.keys.remove(0);
    let mut value = request.values.remove(0);

    let new_size;
    let mut woken = Vec::new();
    let mut wake_value = Vec::new();
    {
        let mut state = inner.state.lock().unwrap();
        if state.kv.contains_key(&key) {
            let stored = state.kv.get_mut(&key).unwrap();
            stored.extend_from_slice(&value);
            new_size = stored.len() as u64;
        } else {
            new_size = value.len() as u64;
            woken = take_key_waiters(&mut state, &key);
            wake_value = value.clone();
            state.kv.insert(key.clone(), value.clone());
        }
        if run_op_hook(inner, MsgType::Append, link.id(), &key, &mut value, &state.kv).is_err() {
            drop(state);
            debug!(seq, %key, "append hook rejected the request");
            reply_text(link, seq, ErrCode::Error, "failed");
            return;
        }
    }

    reply_ok_text(link, seq, &new_size.to_string());
    wakeup_waiters(&woken, &wake_value);
}

fn cas_handler(inner: &Arc<ServerInner>, link: &Arc<ServerLink>, seq: u32, mut request: Message) {
    if request.keys.len() != 1 || request.values.len() != 2 {
        reply_text(link, seq, ErrCode::InvalidMessage, "invalid request: count(key)=1 & count(value)=2");
        return;
    }
    let key = request.keys.remove(0);
    if key.len() > MAX_KEY_LEN_SERVER {
        reply_text(link, seq, ErrCode::InvalidKey, "invalid request: key too long");
        return;
    }
    let expect = request.values.remove(0);
    let exchange = request.values.remove(0);
    let wake_value = exchange.clone();

    let mut exists = Vec::new();
    let mut woken = Vec::new();
    {
        let mut state = inner.state.lock().unwrap();
        if state.kv.contains_key(&key) {
            let stored = state.kv.get_mut(&key).unwrap();
            if *stored == expect {
                exists = std::mem::replace(stored, exchange);
            } else {
                exists = stored.clone();
            }
        } else if expect.is_empty() {
            woken = take_key_waiters(&mut state, &key);
            state.kv.insert(key, exchange);
        }
    }

    reply_value(link, seq, 0, MsgType::Cas, exists);
    wakeup_waiters(&woken, &wake_value);
}

fn write_handler(inner: &Arc<ServerInner>, link: &Arc<ServerLink>, seq: u32, mut request: Message) {
    if !check_request(link, seq, &request, 1, 1) {
        return;
    }
    let key = request.keys.remove(0);
    let mut value = request.values.remove(0);
    if value.len() <= 4 {
        reply_text(link, seq, ErrCode::InvalidMessage, "invalid request: write needs offset + bytes");
        return;
    }
    let offset = u32::from_le_bytes(value[..4].try_into().unwrap()) as usize;
    let chunk_len = value.len() - 4;
    if offset > u16::MAX as usize * chunk_len {
        error!(seq, %key, offset, "write offset too large");
        reply_text(link, seq, ErrCode::InvalidKey, "invalid request: offset too large");
        return;
    }

    {
        let mut state = inner.state.lock().unwrap();
        let stored = state.kv.entry(key.clone()).or_insert_with(|| vec![0; offset + chunk_len]);
        if offset + chunk_len > stored.len() {
            stored.resize(offset + chunk_len, 0);
        }
        stored[offset..offset + chunk_len].copy_from_slice(&value[4..]);
        if run_op_hook(inner, MsgType::Write, link.id(), &key, &mut value, &state.kv).is_err() {
            drop(state);
            debug!(seq, %key, "write hook rejected the request");
            reply_text(link, seq, ErrCode::Error, "failed");
            return;
        }
    }

    reply_ok_text(link, seq, "success");
}

fn watch_rank_state_handler(
    inner: &Arc<ServerInner>,
    link: &Arc<ServerLink>,
    seq: u32,
    request: Message,
) {
    if request.keys.len() != 1 || request.keys[0] != WATCH_RANK_DOWN_KEY {
        reply_text(link, seq, ErrCode::InvalidMessage, "invalid request: bad watch key");
        return;
    }
    let mut rank_state = inner.rank_state.lock().unwrap();
    if rank_state.waiters.contains_key(&link.id()) {
        error!(link = link.id(), "already watching rank state");
        return;
    }
    rank_state.waiters.insert(link.id(), (Arc::clone(link), seq));
    debug!(link = link.id(), seq, "rank-state watch installed");
}

/// Lease-or-return for `auto_ranking_key_*` GETs: the first GET from a link
/// assigns the smallest rank id not currently alive.
fn find_or_insert_rank(inner: &Arc<ServerInner>, link: &Arc<ServerLink>, seq: u32, key: &str) {
    let ranking_key = format!("{key}{}", link.id());

    let mut state = inner.state.lock().unwrap();
    if let Some(stored) = state.kv.get(&ranking_key) {
        let stored = stored.clone();
        drop(state);
        debug!(seq, %ranking_key, "rank lease returned");
        reply_value(link, seq, 0, MsgType::Get, stored);
        return;
    }
    if state.alive_ranks.len() as u32 >= state.world_size {
        let alive = state.alive_ranks.len();
        let world = state.world_size;
        drop(state);
        error!("cannot lease rank, {alive} alive ranks reach world size {world}");
        reply_text(link, seq, ErrCode::Error, "error: no free rank below world size");
        return;
    }
    // Smallest rank id not currently alive.
    let rank = (0..state.world_size)
        .find(|r| !state.alive_ranks.contains(r))
        .unwrap();
    state.alive_ranks.insert(rank);
    state.link_ranks.insert(link.id(), rank);
    state.kv.insert(ranking_key.clone(), rank.to_le_bytes().to_vec());
    drop(state);

    info!(seq, %ranking_key, rank, "rank leased");
    reply_value(link, seq, 0, MsgType::Get, rank.to_le_bytes().to_vec());
}

// ---------------------------------------------------------------------------
// Waiter plumbing
// ---------------------------------------------------------------------------

/// Remove and return every waiter parked on `key` (store lock held).
fn take_key_waiters(state: &mut StoreState, key: &str) -> Vec<(Arc<ServerLink>, u32)> {
    let Some(ids) = state.key_waiters.remove(key) else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(ids.len());
    for id in ids {
        if !state.waiters.contains(id) {
            continue;
        }
        let waiter = state.waiters.remove(id);
        if waiter.deadline_ms >= 0 {
            if let Some(set) = state.timed_waiters.get_mut(&waiter.deadline_ms) {
                set.remove(&id);
                if set.is_empty() {
                    state.timed_waiters.remove(&waiter.deadline_ms);
                }
            }
        }
        out.push((waiter.link, waiter.seq));
    }
    out
}

/// One reply per woken waiter, shaped like a GET response.
fn wakeup_waiters(waiters: &[(Arc<ServerLink>, u32)], value: &[u8]) {
    if waiters.is_empty() {
        return;
    }
    let mut body = Message::new(MsgType::Get);
    body.values.push(value.to_vec());
    let Ok(packed) = body.pack() else { return };
    for (link, seq) in waiters {
        debug!(seq, "waking blocked get");
        link.reply(*seq, 0, &packed);
    }
}

fn timer_task(inner: Arc<ServerInner>) {
    let mut guard = inner.state.lock().unwrap();
    while inner.running.load(Ordering::Acquire) {
        let now = now_ms();
        let mut due = Vec::new();
        while let Some((&deadline, _)) = guard.timed_waiters.iter().next() {
            if deadline > now {
                break;
            }
            let ids = guard.timed_waiters.remove(&deadline).unwrap();
            for id in ids {
                if !guard.waiters.contains(id) {
                    continue;
                }
                let waiter = guard.waiters.remove(id);
                if let Some(set) = guard.key_waiters.get_mut(&waiter.key) {
                    set.remove(&id);
                    if set.is_empty() {
                        guard.key_waiters.remove(&waiter.key);
                    }
                }
                due.push((waiter.link, waiter.seq));
            }
        }
        drop(guard);

        for (link, seq) in due {
            debug!(seq, "blocked get timed out");
            reply_text(&link, seq, ErrCode::Timeout, "<timeout>");
        }

        guard = inner.state.lock().unwrap();
        let (next, _) = inner
            .timer_cond
            .wait_timeout_while(guard, TIMER_TICK, |_| inner.running.load(Ordering::Acquire))
            .unwrap();
        guard = next;
    }
}

fn rank_state_task(inner: Arc<ServerInner>) {
    loop {
        let mut guard = inner.rank_state.lock().unwrap();
        while guard.queue.is_empty() && inner.running.load(Ordering::Acquire) {
            guard = inner.rank_cond.wait(guard).unwrap();
        }
        if !inner.running.load(Ordering::Acquire) {
            return;
        }
        let rank_id = guard.queue.pop_front().unwrap();
        let watchers: Vec<(Arc<ServerLink>, u32)> = guard.waiters.values().cloned().collect();
        drop(guard);

        let mut body = Message::new(MsgType::WatchRankState);
        body.values.push(rank_id.to_le_bytes().to_vec());
        let Ok(packed) = body.pack() else { continue };
        for (link, seq) in watchers {
            debug!(rank_id, link = link.id(), "rank down notified");
            link.reply(seq, 0, &packed);
        }
    }
}

// ---------------------------------------------------------------------------
// Link teardown
// ---------------------------------------------------------------------------

fn link_broken(inner: &Arc<ServerInner>, link_id: u32) {
    info!(link = link_id, "link broken");
    inner.links.lock().unwrap().remove(&link_id);

    let mut downed_rank = None;
    {
        let mut state = inner.state.lock().unwrap();
        let announced = state.link_ranks.remove(&link_id);
        let lease_key = format!("{AUTO_RANK_KEY_PREFIX}{link_id}");
        if state.kv.remove(&lease_key).is_some() {
            if let Some(rank) = announced.filter(|&r| r != RANK_AUTO_ASSIGN) {
                state.alive_ranks.remove(&rank);
                downed_rank = Some(rank);
                info!(link = link_id, rank, "rank released");
            }
        }

        if state.link_ranks.is_empty() {
            // Last peer gone: the store holds nothing anyone still owns.
            info!("all client links broken, clearing store data");
            state.kv.clear();
            state.waiters.clear();
            state.key_waiters.clear();
            state.timed_waiters.clear();
            state.alive_ranks.clear();
            return;
        }

        let hook = inner.broken_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook(link_id, &mut state.kv);
        }
    }

    let mut rank_state = inner.rank_state.lock().unwrap();
    rank_state.waiters.remove(&link_id);
    if let Some(rank) = downed_rank {
        rank_state.queue.push_back(rank);
        inner.rank_cond.notify_one();
    }
}
