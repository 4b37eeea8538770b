// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Device RDMA transport: socket-based out-of-band bring-up followed by
// queue-pair establishment against a whitelist of peers.
//
// Per-side state machine:
//   client: IDLE -> INIT -> SOCKET_CONNECTING -> SOCKET_CONNECTED
//         -> QP_CONNECTING -> READY -> EXITING
//   server: IDLE -> INIT -> SOCKET_LISTENING -> SOCKET_ACCEPTING
//         -> SOCKET_CONNECTED -> QP_CONNECTING -> READY -> EXITING
//
// The server side runs its socket-wait and QP bring-up on a detached task;
// `wait_for_connected` parks on the state condvar.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::{ErrCode, Result};
use crate::transport::provider::{
    AiQpInfo, LoopbackDriver, OneSideRequest, ProviderKey, QpAttributes, RdmaDriver,
};
use crate::transport::{
    PrepareOptions, TransportManager, TransportMemoryKey, TransportMemoryRegion,
    TransportOptions, TransportType, REG_MR_FLAG_HBM,
};

/// Socket-ready and qp-ready budgets.
const BRING_UP_TIMEOUT: Duration = Duration::from_secs(60);
const POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RdmaState {
    Idle,
    Init,
    SocketConnecting,
    SocketListening,
    SocketAccepting,
    SocketConnected,
    QpConnecting,
    Ready,
    Exiting,
}

/// One remote peer's connection material.
struct ChannelConnection {
    remote_ip: Ipv4Addr,
    socket: u64,
    fd: Option<u64>,
    qp: Option<u64>,
    qp_info: AiQpInfo,
    qp_status: i32,
}

impl ChannelConnection {
    fn new(remote_ip: Ipv4Addr, socket: u64) -> ChannelConnection {
        ChannelConnection {
            remote_ip,
            socket,
            fd: None,
            qp: None,
            qp_info: AiQpInfo::default(),
            qp_status: -1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DeviceMr {
    addr: u64,
    size: u64,
    lkey: u32,
    rkey: u32,
    handle: u64,
}

struct Machine {
    client_state: RdmaState,
    server_state: RdmaState,
}

struct DeviceShared {
    device_id: u32,
    listen_port: u16,
    device_ip: Ipv4Addr,
    rdma_handle: u64,
    local_nic: String,
    server_socket: Option<u64>,
    /// rank -> peer ip, from prepare options.
    rank_ips: HashMap<u32, Ipv4Addr>,
    local_mrs: Vec<DeviceMr>,
    /// rank -> regions published by that peer.
    remote_mrs: HashMap<u32, Vec<DeviceMr>>,
    client_conns: HashMap<Ipv4Addr, ChannelConnection>,
    server_conns: HashMap<Ipv4Addr, ChannelConnection>,
}

/// RDMA transport over the device driver.
pub struct DeviceTransport {
    driver: &'static dyn RdmaDriver,
    machine: Arc<(Mutex<Machine>, Condvar)>,
    shared: Arc<Mutex<Option<DeviceShared>>>,
}

impl DeviceTransport {
    pub fn new() -> Arc<DeviceTransport> {
        DeviceTransport::with_driver(LoopbackDriver::instance())
    }

    pub fn with_driver(driver: &'static dyn RdmaDriver) -> Arc<DeviceTransport> {
        Arc::new(DeviceTransport {
            driver,
            machine: Arc::new((
                Mutex::new(Machine {
                    client_state: RdmaState::Idle,
                    server_state: RdmaState::Idle,
                }),
                Condvar::new(),
            )),
            shared: Arc::new(Mutex::new(None)),
        })
    }

    fn set_client_state(machine: &Arc<(Mutex<Machine>, Condvar)>, state: RdmaState) {
        info!(?state, "client state");
        let mut guard = machine.0.lock().unwrap();
        guard.client_state = state;
        if state >= RdmaState::Ready {
            machine.1.notify_all();
        }
    }

    fn set_server_state(machine: &Arc<(Mutex<Machine>, Condvar)>, state: RdmaState) {
        info!(?state, "server state");
        let mut guard = machine.0.lock().unwrap();
        guard.server_state = state;
        if state >= RdmaState::Ready {
            machine.1.notify_all();
        }
    }

    pub fn is_ready(&self) -> bool {
        let guard = self.machine.0.lock().unwrap();
        guard.client_state == RdmaState::Ready || guard.server_state == RdmaState::Ready
    }

    /// Wait for the connected sockets to surface file descriptors.
    fn wait_sockets_ready(
        driver: &'static dyn RdmaDriver,
        conns: &mut HashMap<Ipv4Addr, ChannelConnection>,
    ) -> Result<()> {
        let deadline = Instant::now() + BRING_UP_TIMEOUT;
        let mut remaining: usize = conns.values().filter(|c| c.fd.is_none()).count();
        while remaining > 0 {
            if Instant::now() >= deadline {
                error!("waiting for sockets timed out, {remaining} pending");
                return Err(ErrCode::Timeout);
            }
            thread::sleep(POLL_INTERVAL);
            let pending: Vec<u64> = conns
                .values()
                .filter(|c| c.fd.is_none())
                .map(|c| c.socket)
                .collect();
            let ready = driver.poll_ready_sockets(&pending)?;
            for (socket, fd) in ready {
                // A listening socket surfaces one accepted fd per poll round.
                let Some(conn) = conns
                    .values_mut()
                    .find(|c| c.socket == socket && c.fd.is_none())
                else {
                    continue;
                };
                conn.fd = Some(fd);
                info!(ip = %conn.remote_ip, "socket ready");
                remaining -= 1;
            }
        }
        Ok(())
    }

    /// Create one AI queue pair per peer, connect asynchronously, poll until
    /// every QP reports connected.
    fn create_qps_waiting_ready(
        driver: &'static dyn RdmaDriver,
        rdma_handle: u64,
        conns: &mut HashMap<Ipv4Addr, ChannelConnection>,
    ) -> Result<()> {
        let attrs = QpAttributes::default();
        for conn in conns.values_mut() {
            let (qp, info) = driver.create_ai_qp(rdma_handle, &attrs).map_err(|e| {
                error!(ip = %conn.remote_ip, "create AI QP failed: {e}");
                ErrCode::DlFunctionFailed
            })?;
            conn.qp = Some(qp);
            conn.qp_info = info;
            let fd = conn.fd.ok_or(ErrCode::DlFunctionFailed)?;
            driver.connect_qp_async(qp, fd).map_err(|e| {
                error!(ip = %conn.remote_ip, "connect AI QP failed: {e}");
                ErrCode::DlFunctionFailed
            })?;
        }

        let deadline = Instant::now() + BRING_UP_TIMEOUT;
        while Instant::now() < deadline {
            let mut connecting = 0;
            for conn in conns.values_mut() {
                let qp = conn.qp.ok_or(ErrCode::DlFunctionFailed)?;
                let status = driver.qp_status(qp)?;
                conn.qp_status = status;
                if status != 1 {
                    connecting += 1;
                }
            }
            if connecting == 0 {
                return Ok(());
            }
            thread::sleep(POLL_INTERVAL);
        }
        Err(ErrCode::Timeout)
    }

    fn qp_for_rank(&self, rank: u32) -> Result<u64> {
        let shared = self.shared.lock().unwrap();
        let shared = shared.as_ref().ok_or(ErrCode::Error)?;
        let ip = shared.rank_ips.get(&rank).ok_or(ErrCode::InvalidParam)?;
        let conn = shared
            .client_conns
            .get(ip)
            .or_else(|| shared.server_conns.get(ip))
            .ok_or(ErrCode::Error)?;
        conn.qp.ok_or(ErrCode::Error)
    }

    fn one_side(&self, rank: u32, local_addr: u64, remote_addr: u64, size: u64, write: bool)
        -> Result<()> {
        let qp = self.qp_for_rank(rank)?;
        let (local, remote) = {
            let shared = self.shared.lock().unwrap();
            let shared = shared.as_ref().ok_or(ErrCode::Error)?;
            let local = shared
                .local_mrs
                .iter()
                .find(|mr| mr.addr <= local_addr && local_addr < mr.addr + mr.size)
                .copied()
                .ok_or(ErrCode::Error)?;
            let remote = shared
                .remote_mrs
                .get(&rank)
                .and_then(|mrs| {
                    mrs.iter()
                        .find(|mr| mr.addr <= remote_addr && remote_addr < mr.addr + mr.size)
                })
                .copied()
                .ok_or(ErrCode::Error)?;
            (local, remote)
        };
        let mut local_key = ProviderKey::default();
        local_key.0[0] = local.lkey;
        let mut remote_key = ProviderKey::default();
        remote_key.0[0] = remote.rkey;
        let req = OneSideRequest {
            local_addr,
            remote_addr,
            size,
            local_key,
            remote_key,
        };
        debug!(rank, qp, size, write, "posting one-sided verb");
        if write {
            self.driver.post_write(qp, &req)
        } else {
            self.driver.post_read(qp, &req)
        }
    }
}

impl TransportManager for DeviceTransport {
    /// `TsdOpen -> RaInit -> pick device IP -> RaRdevInit`, then INIT.
    fn open(&self, options: &TransportOptions) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        if shared.is_some() {
            return Ok(());
        }
        let port = options
            .nic
            .rsplit_once(':')
            .and_then(|(_, p)| p.parse::<u16>().ok())
            .ok_or(ErrCode::InvalidParam)?;

        self.driver.open_device(options.device_id).map_err(|e| {
            error!(device = options.device_id, "open device failed: {e}");
            ErrCode::DlFunctionFailed
        })?;
        let device_ip = self.driver.device_ip(options.device_id)?;
        let rdma_handle = self.driver.rdev_init(options.device_id, device_ip)?;
        info!(device = options.device_id, ip = %device_ip, "device opened");

        *shared = Some(DeviceShared {
            device_id: options.device_id,
            listen_port: port,
            device_ip,
            rdma_handle,
            local_nic: format!("{device_ip}:{port}"),
            server_socket: None,
            rank_ips: HashMap::new(),
            local_mrs: Vec::new(),
            remote_mrs: HashMap::new(),
            client_conns: HashMap::new(),
            server_conns: HashMap::new(),
        });
        drop(shared);
        Self::set_client_state(&self.machine, RdmaState::Init);
        Self::set_server_state(&self.machine, RdmaState::Init);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let taken = self.shared.lock().unwrap().take();
        let Some(mut shared) = taken else {
            return Ok(());
        };
        for conn in shared
            .client_conns
            .values_mut()
            .chain(shared.server_conns.values_mut())
        {
            if let Some(qp) = conn.qp.take() {
                self.driver.destroy_qp(qp);
            }
            self.driver.socket_close(conn.socket);
        }
        if let Some(socket) = shared.server_socket.take() {
            self.driver.socket_listen_stop(socket, shared.listen_port);
            self.driver.socket_close(socket);
        }
        Self::set_client_state(&self.machine, RdmaState::Exiting);
        Self::set_server_state(&self.machine, RdmaState::Exiting);
        Ok(())
    }

    fn register_memory_region(&self, mr: &TransportMemoryRegion) -> Result<()> {
        if mr.addr == 0 || mr.size == 0 || mr.flags & REG_MR_FLAG_HBM == 0 {
            return Err(ErrCode::InvalidParam);
        }
        let mut shared = self.shared.lock().unwrap();
        let shared = shared.as_mut().ok_or(ErrCode::Error)?;
        let reg = self
            .driver
            .register_mr(shared.rdma_handle, mr.addr, mr.size, mr.access)
            .map_err(|e| {
                error!(addr = mr.addr, size = mr.size, "register MR failed: {e}");
                ErrCode::DlFunctionFailed
            })?;
        shared.local_mrs.push(DeviceMr {
            addr: mr.addr,
            size: mr.size,
            lkey: reg.lkey,
            rkey: reg.rkey,
            handle: reg.handle,
        });
        Ok(())
    }

    fn unregister_memory_region(&self, addr: u64) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        let shared = shared.as_mut().ok_or(ErrCode::Error)?;
        let Some(pos) = shared.local_mrs.iter().position(|mr| mr.addr == addr) else {
            return Err(ErrCode::Error);
        };
        let mr = shared.local_mrs.remove(pos);
        self.driver.deregister_mr(shared.rdma_handle, mr.handle)?;
        Ok(())
    }

    fn has_registered(&self, addr: u64, size: u64) -> bool {
        let shared = self.shared.lock().unwrap();
        shared
            .as_ref()
            .map(|s| {
                s.local_mrs
                    .iter()
                    .any(|mr| mr.addr <= addr && mr.addr + mr.size >= addr + size)
            })
            .unwrap_or(false)
    }

    fn query_memory_key(&self, addr: u64) -> Result<TransportMemoryKey> {
        let shared = self.shared.lock().unwrap();
        let shared = shared.as_ref().ok_or(ErrCode::Error)?;
        let mr = shared
            .local_mrs
            .iter()
            .find(|mr| mr.addr <= addr && addr < mr.addr + mr.size)
            .ok_or(ErrCode::Error)?;
        let mut provider_key = [0u32; 8];
        provider_key[0] = mr.lkey;
        provider_key[1] = mr.rkey;
        Ok(TransportMemoryKey::pack(
            TransportType::Hccp,
            mr.addr,
            mr.size,
            &provider_key,
        ))
    }

    fn parse_memory_key(&self, key: &TransportMemoryKey) -> Result<(u64, u64)> {
        key.unpack(TransportType::Hccp)
    }

    /// Server-side bring-up: whitelist the peers, listen, then wait for all
    /// of them on a detached task.
    fn prepare(&self, options: &PrepareOptions) -> Result<()> {
        let machine = Arc::clone(&self.machine);
        Self::set_server_state(&machine, RdmaState::SocketListening);

        let (driver, rdma_handle) = {
            let mut shared = self.shared.lock().unwrap();
            let shared = shared.as_mut().ok_or(ErrCode::Error)?;

            let mut whitelist = Vec::new();
            for (&rank, info) in &options.ranks {
                let ip: Ipv4Addr = info
                    .nic
                    .split(':')
                    .next()
                    .unwrap_or("")
                    .parse()
                    .map_err(|_| ErrCode::InvalidParam)?;
                shared.rank_ips.insert(rank, ip);
                whitelist.push(ip);
                for key in &info.mem_keys {
                    let (addr, size) = key.unpack(TransportType::Hccp)?;
                    let provider_key = key.provider_key();
                    shared.remote_mrs.entry(rank).or_default().push(DeviceMr {
                        addr,
                        size,
                        lkey: provider_key[0],
                        rkey: provider_key[1],
                        handle: 0,
                    });
                }
                shared
                    .server_conns
                    .insert(ip, ChannelConnection::new(ip, 0));
            }

            let socket = self
                .driver
                .socket_init(shared.device_id, shared.device_ip)?;
            if let Err(e) = self.driver.socket_listen(socket, shared.listen_port) {
                warn!(port = shared.listen_port, "listen start failed: {e}");
                Self::set_server_state(&machine, RdmaState::Exiting);
                return Err(ErrCode::DlFunctionFailed);
            }
            if let Err(e) = self.driver.whitelist_add(socket, &whitelist) {
                error!("whitelist add failed: {e}");
                self.driver.socket_close(socket);
                Self::set_server_state(&machine, RdmaState::Exiting);
                return Err(ErrCode::DlFunctionFailed);
            }
            for conn in shared.server_conns.values_mut() {
                conn.socket = socket;
            }
            shared.server_socket = Some(socket);
            (self.driver, shared.rdma_handle)
        };

        Self::set_server_state(&machine, RdmaState::SocketAccepting);
        info!("listening for whitelisted peers");

        let shared_arc = Arc::clone(&self.shared);
        thread::spawn(move || {
            let mut conns = {
                let mut guard = shared_arc.lock().unwrap();
                let Some(shared) = guard.as_mut() else { return };
                std::mem::take(&mut shared.server_conns)
            };
            let ret = Self::wait_sockets_ready(driver, &mut conns);
            if ret.is_err() {
                Self::set_server_state(&machine, RdmaState::Exiting);
                return;
            }
            Self::set_server_state(&machine, RdmaState::SocketConnected);
            Self::set_server_state(&machine, RdmaState::QpConnecting);
            let ret = Self::create_qps_waiting_ready(driver, rdma_handle, &mut conns);
            {
                let mut guard = shared_arc.lock().unwrap();
                if let Some(shared) = guard.as_mut() {
                    shared.server_conns = conns;
                }
            }
            if ret.is_err() {
                Self::set_server_state(&machine, RdmaState::Exiting);
            } else {
                Self::set_server_state(&machine, RdmaState::Ready);
            }
        });
        Ok(())
    }

    fn remove_ranks(&self, ranks: &[u32]) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        let shared = shared.as_mut().ok_or(ErrCode::Error)?;
        for rank in ranks {
            if let Some(ip) = shared.rank_ips.remove(rank) {
                if let Some(mut conn) = shared
                    .client_conns
                    .remove(&ip)
                    .or_else(|| shared.server_conns.remove(&ip))
                {
                    if let Some(qp) = conn.qp.take() {
                        self.driver.destroy_qp(qp);
                    }
                    self.driver.socket_close(conn.socket);
                }
            }
            shared.remote_mrs.remove(rank);
        }
        Ok(())
    }

    /// Client-side bring-up: connect a socket to every server, wait until
    /// all are ready, then bring the queue pairs up.
    fn connect(&self) -> Result<()> {
        let machine = Arc::clone(&self.machine);
        let (driver, rdma_handle) = {
            let mut shared = self.shared.lock().unwrap();
            let shared = shared.as_mut().ok_or(ErrCode::Error)?;
            let servers: Vec<Ipv4Addr> = shared.rank_ips.values().copied().collect();
            for ip in servers {
                if shared.client_conns.contains_key(&ip) {
                    continue;
                }
                let socket = self
                    .driver
                    .socket_init(shared.device_id, shared.device_ip)?;
                self.driver
                    .socket_connect(socket, ip, shared.listen_port)
                    .map_err(|e| {
                        error!(%ip, "socket connect failed: {e}");
                        ErrCode::DlFunctionFailed
                    })?;
                shared
                    .client_conns
                    .insert(ip, ChannelConnection::new(ip, socket));
            }
            (self.driver, shared.rdma_handle)
        };

        Self::set_client_state(&machine, RdmaState::SocketConnecting);
        let mut conns = {
            let mut guard = self.shared.lock().unwrap();
            let shared = guard.as_mut().ok_or(ErrCode::Error)?;
            std::mem::take(&mut shared.client_conns)
        };
        let ret = Self::wait_sockets_ready(driver, &mut conns);
        if let Err(e) = ret {
            error!("client socket wait failed: {e}");
            Self::set_client_state(&machine, RdmaState::Exiting);
            return Err(e);
        }
        Self::set_client_state(&machine, RdmaState::SocketConnected);
        Self::set_client_state(&machine, RdmaState::QpConnecting);
        let ret = Self::create_qps_waiting_ready(driver, rdma_handle, &mut conns);
        {
            let mut guard = self.shared.lock().unwrap();
            if let Some(shared) = guard.as_mut() {
                shared.client_conns = conns;
            }
        }
        match ret {
            Ok(()) => {
                Self::set_client_state(&machine, RdmaState::Ready);
                Ok(())
            }
            Err(e) => {
                error!("client qp bring-up failed: {e}");
                Self::set_client_state(&machine, RdmaState::Exiting);
                Err(e)
            }
        }
    }

    fn async_connect(&self) -> Result<()> {
        let machine = Arc::clone(&self.machine);
        let shared = Arc::clone(&self.shared);
        let driver = self.driver;
        thread::spawn(move || {
            let transport = DeviceTransport {
                driver,
                machine,
                shared,
            };
            if let Err(e) = transport.connect() {
                error!("async connect failed: {e}");
            }
        });
        Ok(())
    }

    fn wait_for_connected(&self, timeout_ns: i64) -> Result<()> {
        let deadline = Duration::from_nanos(timeout_ns.max(0) as u64);
        let guard = self.machine.0.lock().unwrap();
        if guard.client_state > RdmaState::Ready || guard.server_state > RdmaState::Ready {
            return Err(ErrCode::Error);
        }
        let (guard, timeout) = self
            .machine
            .1
            .wait_timeout_while(guard, deadline, |m| {
                m.client_state < RdmaState::Ready && m.server_state < RdmaState::Ready
            })
            .unwrap();
        if timeout.timed_out() {
            return Err(ErrCode::Timeout);
        }
        if guard.client_state == RdmaState::Ready || guard.server_state == RdmaState::Ready {
            Ok(())
        } else {
            Err(ErrCode::Error)
        }
    }

    fn update_rank_options(&self, options: &PrepareOptions) -> Result<()> {
        let mut shared = self.shared.lock().unwrap();
        let shared = shared.as_mut().ok_or(ErrCode::Error)?;
        for (&rank, info) in &options.ranks {
            if let Some(ip) = info.nic.split(':').next().and_then(|s| s.parse().ok()) {
                shared.rank_ips.insert(rank, ip);
            }
            for key in &info.mem_keys {
                let (addr, size) = key.unpack(TransportType::Hccp)?;
                let provider_key = key.provider_key();
                let mrs = shared.remote_mrs.entry(rank).or_default();
                mrs.clear();
                mrs.push(DeviceMr {
                    addr,
                    size,
                    lkey: provider_key[0],
                    rkey: provider_key[1],
                    handle: 0,
                });
            }
        }
        Ok(())
    }

    fn nic(&self) -> String {
        self.shared
            .lock()
            .unwrap()
            .as_ref()
            .map(|s| s.local_nic.clone())
            .unwrap_or_default()
    }

    fn read_remote(&self, rank: u32, local_addr: u64, remote_addr: u64, size: u64) -> Result<()> {
        self.one_side(rank, local_addr, remote_addr, size, false)
    }

    fn write_remote(&self, rank: u32, local_addr: u64, remote_addr: u64, size: u64) -> Result<()> {
        self.one_side(rank, local_addr, remote_addr, size, true)
    }

    fn read_remote_async(&self, _rank: u32, _l: u64, _r: u64, _size: u64) -> Result<()> {
        Err(ErrCode::NotSupported)
    }

    fn write_remote_async(&self, _rank: u32, _l: u64, _r: u64, _size: u64) -> Result<()> {
        Err(ErrCode::NotSupported)
    }

    fn synchronize(&self, _rank: u32) -> Result<()> {
        Err(ErrCode::NotSupported)
    }
}
