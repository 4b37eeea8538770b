// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Host transport: one-sided reads and writes over the process-wide RPC
// message-channel service.
//
// One instance per process (the underlying service is process-wide). State
// is per-rank: a memory-region table, a channel and a nic string, each
// behind its own mutex. Synchronous one-sided ops retry three times with
// 0/1/2 s backoff and force-reconnect the channel in between; async ops
// count completions on a lazily created per-thread stream.

use std::cell::RefCell;
use std::io::BufRead;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::error::{ErrCode, Result};
use crate::net::analyse_nic;
use crate::transport::provider::{
    LoopbackRpc, OneSideRequest, ProviderKey, RpcProvider,
};
use crate::transport::{
    CounterStream, PrepareOptions, TlsConfig, TransportManager, TransportMemoryKey,
    TransportMemoryRegion, TransportOptions, TransportType, REG_MR_FLAG_DRAM,
};

const RPC_SERVICE_NAME: &str = "smem_host_service";
/// Links per channel; the ubc protocol multiplexes internally and takes one.
const TRANS_EP_SIZE: u32 = 16;
const UBC_PREFIX: &str = "ubc://";
const ONE_SIDE_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy)]
struct HostMr {
    addr: u64,
    size: u64,
    key: ProviderKey,
    handle: u64,
}

struct HostState {
    service: u64,
    local_nic: String,
    local_ip: String,
    rank_id: u32,
    rank_count: u32,
    mrs: Vec<Arc<Mutex<Vec<HostMr>>>>,
    channels: Vec<Arc<Mutex<u64>>>,
    nics: Vec<Arc<Mutex<String>>>,
}

/// Process-wide host transport.
pub struct HostTransport {
    provider: Mutex<&'static dyn RpcProvider>,
    state: Mutex<Option<HostState>>,
    key_pass: Mutex<Vec<u8>>,
}

thread_local! {
    static STREAM: RefCell<Option<Arc<CounterStream>>> = const { RefCell::new(None) };
}

fn thread_stream() -> Arc<CounterStream> {
    STREAM.with(|slot| {
        Arc::clone(
            slot.borrow_mut()
                .get_or_insert_with(|| Arc::new(CounterStream::new(0))),
        )
    })
}

fn find_mr(mrs: &Mutex<Vec<HostMr>>, addr: u64) -> Result<HostMr> {
    let guard = mrs.lock().unwrap();
    guard
        .iter()
        .find(|mr| mr.addr <= addr && addr < mr.addr + mr.size)
        .copied()
        .ok_or(ErrCode::Error)
}

impl HostTransport {
    pub fn instance() -> Arc<HostTransport> {
        static INSTANCE: OnceLock<Arc<HostTransport>> = OnceLock::new();
        Arc::clone(INSTANCE.get_or_init(|| {
            Arc::new(HostTransport {
                provider: Mutex::new(LoopbackRpc::instance() as &'static dyn RpcProvider),
                state: Mutex::new(None),
                key_pass: Mutex::new(Vec::new()),
            })
        }))
    }

    /// Swap the RPC provider (before `open`).
    pub fn set_provider(&self, provider: &'static dyn RpcProvider) {
        *self.provider.lock().unwrap() = provider;
    }

    fn provider(&self) -> &'static dyn RpcProvider {
        *self.provider.lock().unwrap()
    }

    fn service(&self) -> Result<u64> {
        let state = self.state.lock().unwrap();
        state.as_ref().map(|s| s.service).ok_or(ErrCode::Error)
    }

    fn rank_tables(
        &self,
        rank: u32,
    ) -> Result<(u64, u32, Arc<Mutex<Vec<HostMr>>>, Arc<Mutex<u64>>, Arc<Mutex<String>>)> {
        let state = self.state.lock().unwrap();
        let state = state.as_ref().ok_or(ErrCode::Error)?;
        if rank >= state.rank_count {
            return Err(ErrCode::InvalidParam);
        }
        Ok((
            state.service,
            state.rank_id,
            Arc::clone(&state.mrs[rank as usize]),
            Arc::clone(&state.channels[rank as usize]),
            Arc::clone(&state.nics[rank as usize]),
        ))
    }

    fn self_mrs(&self) -> Result<(u32, Arc<Mutex<Vec<HostMr>>>)> {
        let state = self.state.lock().unwrap();
        let state = state.as_ref().ok_or(ErrCode::Error)?;
        Ok((
            state.rank_id,
            Arc::clone(&state.mrs[state.rank_id as usize]),
        ))
    }

    fn connect_channel(&self, rank: u32, url: &str) -> Result<()> {
        let (service, rank_id, _, channel_arc, _) = self.rank_tables(rank)?;
        let mut channel = channel_arc.lock().unwrap();
        if *channel != 0 {
            warn!(rank, url, "channel already connected");
            return Ok(());
        }
        let link_count = if url.starts_with(UBC_PREFIX) {
            1
        } else {
            TRANS_EP_SIZE
        };
        // The payload carries our rank id so the peer can name us when the
        // endpoint breaks.
        let payload = rank_id.to_string();
        match self.provider().connect(service, url, &payload, link_count) {
            Ok(ch) => {
                *channel = ch;
                debug!(rank, url, channel = ch, "channel connected");
                Ok(())
            }
            Err(e) => {
                error!(rank, url, "channel connect failed: {e}");
                Err(ErrCode::DlFunctionFailed)
            }
        }
    }

    fn force_reconnect(&self, rank: u32) {
        let Ok((_, _, _, channel_arc, nic_arc)) = self.rank_tables(rank) else {
            return;
        };
        *channel_arc.lock().unwrap() = 0;
        let url = nic_arc.lock().unwrap().clone();
        if url.is_empty() {
            return;
        }
        if let Err(e) = self.connect_channel(rank, &url) {
            error!(rank, "force reconnect failed: {e}");
        }
    }

    fn build_request(
        &self,
        rank: u32,
        local_addr: u64,
        remote_addr: u64,
        size: u64,
    ) -> Result<(u64, OneSideRequest)> {
        let (_, self_rank, _, channel_arc, _) = self.rank_tables(rank)?;
        let channel = *channel_arc.lock().unwrap();
        if channel == 0 {
            error!(rank, "rank is not connected");
            return Err(ErrCode::Error);
        }
        let (_, self_mrs) = self.self_mrs()?;
        let local = find_mr(&self_mrs, local_addr).map_err(|e| {
            error!(rank = self_rank, local_addr, "local address is not registered");
            e
        })?;
        let (_, _, rank_mrs, _, _) = self.rank_tables(rank)?;
        let remote = find_mr(&rank_mrs, remote_addr).map_err(|e| {
            error!(rank, remote_addr, "remote address is not prepared");
            e
        })?;
        Ok((
            channel,
            OneSideRequest {
                local_addr,
                remote_addr,
                size,
                local_key: local.key,
                remote_key: remote.key,
            },
        ))
    }

    fn inner_one_side(
        &self,
        rank: u32,
        local_addr: u64,
        remote_addr: u64,
        size: u64,
        is_write: bool,
    ) -> Result<()> {
        let (channel, req) = self.build_request(rank, local_addr, remote_addr, size)?;
        debug!(
            rank,
            channel,
            size,
            op = if is_write { "put" } else { "get" },
            "one-sided submit"
        );
        if is_write {
            self.provider().channel_put(channel, &req, None)
        } else {
            self.provider().channel_get(channel, &req, None)
        }
    }

    fn retrying_one_side(
        &self,
        rank: u32,
        local_addr: u64,
        remote_addr: u64,
        size: u64,
        is_write: bool,
    ) -> Result<()> {
        for attempt in 0..ONE_SIDE_RETRIES {
            match self.inner_one_side(rank, local_addr, remote_addr, size, is_write) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    error!(rank, attempt, "one-sided op failed: {e}");
                    let channel_down = self
                        .rank_tables(rank)
                        .map(|(_, _, _, ch, _)| *ch.lock().unwrap() == 0)
                        .unwrap_or(true);
                    if channel_down || matches!(e, ErrCode::IoError | ErrCode::DlFunctionFailed) {
                        self.force_reconnect(rank);
                    }
                }
            }
            if attempt < ONE_SIDE_RETRIES - 1 {
                thread::sleep(Duration::from_secs((attempt + 1) as u64));
            }
        }
        Err(ErrCode::Error)
    }

    fn async_one_side(
        &self,
        rank: u32,
        local_addr: u64,
        remote_addr: u64,
        size: u64,
        is_write: bool,
    ) -> Result<()> {
        let (channel, req) = self.build_request(rank, local_addr, remote_addr, size)?;
        let stream = thread_stream();
        let cb_stream = Arc::clone(&stream);
        stream.submit_tasks(1);
        let cb = Box::new(move || cb_stream.finish_one(true));
        let ret = if is_write {
            self.provider().channel_put(channel, &req, Some(cb))
        } else {
            self.provider().channel_get(channel, &req, Some(cb))
        };
        if ret.is_err() {
            stream.finish_one(false);
        }
        ret
    }

    /// Provider endpoint-broken event: the payload names the remote rank.
    pub fn on_endpoint_broken(&self, payload: &str) {
        let Ok(rank) = payload.parse::<u32>() else {
            error!(payload, "cannot parse rank from endpoint payload");
            return;
        };
        let Ok((service, _, _, channel_arc, _)) = self.rank_tables(rank) else {
            return;
        };
        let mut channel = channel_arc.lock().unwrap();
        if *channel != 0 {
            self.provider().disconnect(service, *channel);
            *channel = 0;
            info!(rank, "endpoint broken, channel closed");
        }
    }

    fn load_key_pass(&self, tls: &TlsConfig) -> Result<()> {
        if !tls.enable || tls.key_pass_path.is_empty() {
            return Ok(());
        }
        let file = std::fs::File::open(&tls.key_pass_path).map_err(|e| {
            error!(path = %tls.key_pass_path, "cannot open key pass file: {e}");
            ErrCode::Error
        })?;
        let mut line = String::new();
        std::io::BufReader::new(file)
            .read_line(&mut line)
            .map_err(|_| ErrCode::Error)?;
        *self.key_pass.lock().unwrap() = line.trim_end().as_bytes().to_vec();
        Ok(())
    }

    fn erase_key_pass(&self) {
        let mut pass = self.key_pass.lock().unwrap();
        pass.iter_mut().for_each(|b| *b = 0);
        pass.clear();
    }
}

impl TransportManager for HostTransport {
    fn open(&self, options: &TransportOptions) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            return Ok(());
        }
        if options.rank_count == 0 || options.rank_id >= options.rank_count {
            return Err(ErrCode::InvalidParam);
        }
        let nic = analyse_nic(&options.nic)?;
        let port = nic
            .port
            .checked_add(options.rank_id as u16)
            .ok_or(ErrCode::InvalidParam)?;
        let local_nic = format!("{}{}:{}", nic.protocol, nic.ip, port);
        info!(nic = %local_nic, "host transport opening");

        let provider = self.provider();
        let service = provider
            .create_service(options.protocol, RPC_SERVICE_NAME)
            .map_err(|e| {
                error!(nic = %options.nic, "create rpc service failed: {e}");
                ErrCode::DlFunctionFailed
            })?;
        self.load_key_pass(&options.tls)?;
        provider.bind(service, &local_nic)?;
        if let Err(e) = provider.start(service) {
            error!(nic = %local_nic, "start rpc service failed: {e}");
            provider.destroy_service(service);
            return Err(ErrCode::DlFunctionFailed);
        }

        let n = options.rank_count as usize;
        *state = Some(HostState {
            service,
            local_nic,
            local_ip: nic.ip,
            rank_id: options.rank_id,
            rank_count: options.rank_count,
            mrs: (0..n).map(|_| Arc::new(Mutex::new(Vec::new()))).collect(),
            channels: (0..n).map(|_| Arc::new(Mutex::new(0))).collect(),
            nics: (0..n).map(|_| Arc::new(Mutex::new(String::new()))).collect(),
        });
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let taken = self.state.lock().unwrap().take();
        let Some(state) = taken else {
            return Ok(());
        };
        self.erase_key_pass();
        let provider = self.provider();
        for channel_arc in &state.channels {
            let channel = *channel_arc.lock().unwrap();
            if channel != 0 {
                provider.disconnect(state.service, channel);
            }
        }
        provider.destroy_service(state.service);
        info!(nic = %state.local_nic, ip = %state.local_ip, "host transport closed");
        Ok(())
    }

    fn register_memory_region(&self, mr: &TransportMemoryRegion) -> Result<()> {
        if mr.addr == 0 || mr.size == 0 || mr.flags & REG_MR_FLAG_DRAM == 0 {
            return Err(ErrCode::InvalidParam);
        }
        let service = self.service()?;
        let (_, self_mrs) = self.self_mrs()?;
        if find_mr(&self_mrs, mr.addr).is_ok() {
            error!(addr = mr.addr, "address already registered");
            return Err(ErrCode::Error);
        }
        let (handle, key) = self
            .provider()
            .register_region(service, mr.addr, mr.size)
            .map_err(|e| {
                error!(addr = mr.addr, size = mr.size, "register region failed: {e}");
                ErrCode::DlFunctionFailed
            })?;
        self_mrs.lock().unwrap().push(HostMr {
            addr: mr.addr,
            size: mr.size,
            key,
            handle,
        });
        debug!(addr = mr.addr, size = mr.size, "memory region registered");
        Ok(())
    }

    fn unregister_memory_region(&self, addr: u64) -> Result<()> {
        if addr == 0 {
            return Err(ErrCode::InvalidParam);
        }
        let service = self.service()?;
        let (_, self_mrs) = self.self_mrs()?;
        let mut guard = self_mrs.lock().unwrap();
        let Some(pos) = guard.iter().position(|mr| mr.addr == addr) else {
            return Err(ErrCode::Error);
        };
        let mr = guard.remove(pos);
        drop(guard);
        self.provider().destroy_region(service, mr.handle);
        Ok(())
    }

    fn has_registered(&self, addr: u64, size: u64) -> bool {
        let Ok((_, self_mrs)) = self.self_mrs() else {
            return false;
        };
        let guard = self_mrs.lock().unwrap();
        guard
            .iter()
            .any(|mr| mr.addr <= addr && mr.addr + mr.size >= addr + size)
    }

    fn query_memory_key(&self, addr: u64) -> Result<TransportMemoryKey> {
        let (_, self_mrs) = self.self_mrs()?;
        let mr = find_mr(&self_mrs, addr).map_err(|e| {
            error!(addr, "no registered region covers the address");
            e
        })?;
        Ok(TransportMemoryKey::pack(
            TransportType::Hcom,
            mr.addr,
            mr.size,
            &mr.key.0,
        ))
    }

    fn parse_memory_key(&self, key: &TransportMemoryKey) -> Result<(u64, u64)> {
        key.unpack(TransportType::Hcom)
    }

    fn prepare(&self, options: &PrepareOptions) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            let state = state.as_ref().ok_or(ErrCode::Error)?;
            if options.ranks.keys().any(|&r| r >= state.rank_count) {
                error!("prepare rank beyond rank count {}", state.rank_count);
                return Err(ErrCode::InvalidParam);
            }
        }
        for (&rank, info) in &options.ranks {
            let (_, _, rank_mrs, _, nic_arc) = self.rank_tables(rank)?;
            *nic_arc.lock().unwrap() = info.nic.clone();
            let Some(key) = info.mem_keys.first() else {
                continue;
            };
            let (addr, size) = key.unpack(TransportType::Hcom)?;
            rank_mrs.lock().unwrap().push(HostMr {
                addr,
                size,
                key: ProviderKey(key.provider_key()),
                handle: 0,
            });
            debug!(rank, addr, size, "peer region prepared");
        }
        Ok(())
    }

    fn remove_ranks(&self, _ranks: &[u32]) -> Result<()> {
        warn!("host transport does not remove ranks");
        Ok(())
    }

    fn connect(&self) -> Result<()> {
        let (rank_id, rank_count) = {
            let state = self.state.lock().unwrap();
            let state = state.as_ref().ok_or(ErrCode::Error)?;
            (state.rank_id, state.rank_count)
        };
        for rank in 0..rank_count {
            if rank == rank_id {
                continue;
            }
            let (_, _, _, _, nic_arc) = self.rank_tables(rank)?;
            let url = nic_arc.lock().unwrap().clone();
            if url.is_empty() {
                continue;
            }
            self.connect_channel(rank, &url)?;
        }
        Ok(())
    }

    fn async_connect(&self) -> Result<()> {
        Ok(())
    }

    fn wait_for_connected(&self, _timeout_ns: i64) -> Result<()> {
        Ok(())
    }

    fn update_rank_options(&self, options: &PrepareOptions) -> Result<()> {
        let (rank_id, rank_count) = {
            let state = self.state.lock().unwrap();
            let state = state.as_ref().ok_or(ErrCode::Error)?;
            (state.rank_id, state.rank_count)
        };
        if options.ranks.keys().any(|&r| r >= rank_count) {
            return Err(ErrCode::InvalidParam);
        }
        for (&rank, info) in &options.ranks {
            if rank == rank_id {
                continue;
            }
            let (_, _, rank_mrs, _, _) = self.rank_tables(rank)?;
            if let Some(key) = info.mem_keys.first() {
                let (addr, size) = key.unpack(TransportType::Hcom)?;
                let mut guard = rank_mrs.lock().unwrap();
                guard.clear();
                guard.push(HostMr {
                    addr,
                    size,
                    key: ProviderKey(key.provider_key()),
                    handle: 0,
                });
            }
        }
        for rank in 0..rank_count {
            if rank == rank_id {
                continue;
            }
            let Some(info) = options.ranks.get(&rank) else {
                continue;
            };
            let (_, _, _, channel_arc, nic_arc) = self.rank_tables(rank)?;
            if *channel_arc.lock().unwrap() == 0 {
                *nic_arc.lock().unwrap() = info.nic.clone();
                self.connect_channel(rank, &info.nic)?;
            }
        }
        Ok(())
    }

    fn nic(&self) -> String {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.local_nic.clone())
            .unwrap_or_default()
    }

    fn read_remote(&self, rank: u32, local_addr: u64, remote_addr: u64, size: u64) -> Result<()> {
        self.retrying_one_side(rank, local_addr, remote_addr, size, false)
    }

    fn write_remote(&self, rank: u32, local_addr: u64, remote_addr: u64, size: u64) -> Result<()> {
        self.retrying_one_side(rank, local_addr, remote_addr, size, true)
    }

    fn read_remote_async(
        &self,
        rank: u32,
        local_addr: u64,
        remote_addr: u64,
        size: u64,
    ) -> Result<()> {
        self.async_one_side(rank, local_addr, remote_addr, size, false)
    }

    fn write_remote_async(
        &self,
        rank: u32,
        local_addr: u64,
        remote_addr: u64,
        size: u64,
    ) -> Result<()> {
        self.async_one_side(rank, local_addr, remote_addr, size, true)
    }

    fn synchronize(&self, _rank: u32) -> Result<()> {
        thread_stream().synchronize();
        Ok(())
    }
}
