// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Provider seams the transports drive: the host RPC/message-channel service
// and the device RDMA driver. Production builds plug the real libraries in
// behind these traits; the loopback implementations below serve in-process
// peers so the transports run end-to-end without a NIC or a device.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use tracing::{debug, error};

use crate::error::{ErrCode, Result};

/// Opaque provider-level key words carried inside a transport memory key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProviderKey(pub [u32; 8]);

/// A one-sided operation: both addresses plus their keys.
#[derive(Debug, Clone, Copy)]
pub struct OneSideRequest {
    pub local_addr: u64,
    pub remote_addr: u64,
    pub size: u64,
    pub local_key: ProviderKey,
    pub remote_key: ProviderKey,
}

pub type CompletionFn = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// Host RPC provider
// ---------------------------------------------------------------------------

pub trait RpcProvider: Send + Sync {
    fn create_service(&self, protocol: u32, name: &str) -> Result<u64>;
    fn destroy_service(&self, service: u64);
    fn bind(&self, service: u64, nic: &str) -> Result<()>;
    fn start(&self, service: u64) -> Result<()>;

    fn register_region(&self, service: u64, addr: u64, size: u64) -> Result<(u64, ProviderKey)>;
    fn destroy_region(&self, service: u64, handle: u64);

    fn connect(&self, service: u64, url: &str, payload: &str, link_count: u32) -> Result<u64>;
    fn disconnect(&self, service: u64, channel: u64);

    /// One-sided read (remote -> local). Completes synchronously unless a
    /// callback is supplied.
    fn channel_get(&self, channel: u64, req: &OneSideRequest, cb: Option<CompletionFn>)
        -> Result<()>;
    /// One-sided write (local -> remote).
    fn channel_put(&self, channel: u64, req: &OneSideRequest, cb: Option<CompletionFn>)
        -> Result<()>;
}

#[derive(Default)]
struct LoopbackService {
    nic: String,
    started: bool,
    regions: Vec<(u64, u64, u64)>, // handle, addr, size
}

#[derive(Default)]
struct LoopbackRpcState {
    services: HashMap<u64, LoopbackService>,
    bound: HashMap<String, u64>,
    channels: HashMap<u64, (u64, String)>, // channel -> (own service, remote nic)
}

/// In-process host provider: one-sided ops are plain copies between
/// registered regions of services living in this process.
pub struct LoopbackRpc {
    state: Mutex<LoopbackRpcState>,
    ids: AtomicU64,
}

impl LoopbackRpc {
    pub fn instance() -> &'static LoopbackRpc {
        static INSTANCE: OnceLock<LoopbackRpc> = OnceLock::new();
        INSTANCE.get_or_init(|| LoopbackRpc {
            state: Mutex::new(LoopbackRpcState::default()),
            ids: AtomicU64::new(1),
        })
    }

    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    fn check_covered(service: &LoopbackService, addr: u64, size: u64) -> bool {
        service
            .regions
            .iter()
            .any(|&(_, base, len)| base <= addr && addr + size <= base + len)
    }
}

impl RpcProvider for LoopbackRpc {
    fn create_service(&self, _protocol: u32, _name: &str) -> Result<u64> {
        let id = self.next_id();
        self.state
            .lock()
            .unwrap()
            .services
            .insert(id, LoopbackService::default());
        Ok(id)
    }

    fn destroy_service(&self, service: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(svc) = state.services.remove(&service) {
            state.bound.remove(&svc.nic);
        }
        state.channels.retain(|_, (owner, _)| *owner != service);
    }

    fn bind(&self, service: u64, nic: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.bound.contains_key(nic) {
            return Err(ErrCode::ResourceInUse);
        }
        let svc = state.services.get_mut(&service).ok_or(ErrCode::InvalidParam)?;
        svc.nic = nic.to_string();
        state.bound.insert(nic.to_string(), service);
        Ok(())
    }

    fn start(&self, service: u64) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let svc = state.services.get_mut(&service).ok_or(ErrCode::InvalidParam)?;
        svc.started = true;
        Ok(())
    }

    fn register_region(&self, service: u64, addr: u64, size: u64) -> Result<(u64, ProviderKey)> {
        if addr == 0 || size == 0 {
            return Err(ErrCode::InvalidParam);
        }
        let handle = self.next_id();
        let mut state = self.state.lock().unwrap();
        let svc = state.services.get_mut(&service).ok_or(ErrCode::InvalidParam)?;
        svc.regions.push((handle, addr, size));
        let mut key = ProviderKey::default();
        key.0[0] = handle as u32;
        key.0[1] = (handle >> 32) as u32;
        Ok((handle, key))
    }

    fn destroy_region(&self, service: u64, handle: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(svc) = state.services.get_mut(&service) {
            svc.regions.retain(|&(h, _, _)| h != handle);
        }
    }

    fn connect(&self, service: u64, url: &str, _payload: &str, _link_count: u32) -> Result<u64> {
        let mut state = self.state.lock().unwrap();
        if !state.bound.contains_key(url) {
            debug!(url, "no service bound at peer nic");
            return Err(ErrCode::IoError);
        }
        let channel = self.ids.fetch_add(1, Ordering::Relaxed);
        state.channels.insert(channel, (service, url.to_string()));
        Ok(channel)
    }

    fn disconnect(&self, _service: u64, channel: u64) {
        self.state.lock().unwrap().channels.remove(&channel);
    }

    fn channel_get(
        &self,
        channel: u64,
        req: &OneSideRequest,
        cb: Option<CompletionFn>,
    ) -> Result<()> {
        self.one_side(channel, req, false)?;
        if let Some(cb) = cb {
            cb();
        }
        Ok(())
    }

    fn channel_put(
        &self,
        channel: u64,
        req: &OneSideRequest,
        cb: Option<CompletionFn>,
    ) -> Result<()> {
        self.one_side(channel, req, true)?;
        if let Some(cb) = cb {
            cb();
        }
        Ok(())
    }
}

impl LoopbackRpc {
    fn one_side(&self, channel: u64, req: &OneSideRequest, to_remote: bool) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            let (own, remote_nic) = state.channels.get(&channel).ok_or(ErrCode::IoError)?;
            let own_svc = state.services.get(own).ok_or(ErrCode::IoError)?;
            let remote_id = *state.bound.get(remote_nic).ok_or(ErrCode::IoError)?;
            let remote_svc = state.services.get(&remote_id).ok_or(ErrCode::IoError)?;
            if !Self::check_covered(own_svc, req.local_addr, req.size)
                || !Self::check_covered(remote_svc, req.remote_addr, req.size)
            {
                error!("one-sided request outside registered regions");
                return Err(ErrCode::InvalidParam);
            }
        }
        unsafe {
            if to_remote {
                std::ptr::copy(
                    req.local_addr as *const u8,
                    req.remote_addr as *mut u8,
                    req.size as usize,
                );
            } else {
                std::ptr::copy(
                    req.remote_addr as *const u8,
                    req.local_addr as *mut u8,
                    req.size as usize,
                );
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Device RDMA driver
// ---------------------------------------------------------------------------

/// Fixed queue-pair attributes used for AI queue pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpAttributes {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_recv_sge: u32,
    pub send_cq_depth: u32,
    pub recv_dq_depth: u32,
    pub reliable_connected: bool,
}

impl Default for QpAttributes {
    fn default() -> QpAttributes {
        QpAttributes {
            max_send_wr: 128,
            max_recv_wr: 128,
            max_recv_sge: 1,
            send_cq_depth: 32768,
            recv_dq_depth: 128,
            reliable_connected: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AiQpInfo {
    pub qp_number: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct MrRegistration {
    pub handle: u64,
    pub lkey: u32,
    pub rkey: u32,
}

pub trait RdmaDriver: Send + Sync {
    fn open_device(&self, device_id: u32) -> Result<()>;
    /// The device's AF_INET address.
    fn device_ip(&self, device_id: u32) -> Result<Ipv4Addr>;
    fn rdev_init(&self, device_id: u32, ip: Ipv4Addr) -> Result<u64>;

    fn register_mr(&self, handle: u64, addr: u64, size: u64, access: i32) -> Result<MrRegistration>;
    fn deregister_mr(&self, handle: u64, mr: u64) -> Result<()>;

    fn socket_init(&self, device_id: u32, ip: Ipv4Addr) -> Result<u64>;
    fn socket_listen(&self, socket: u64, port: u16) -> Result<()>;
    fn socket_listen_stop(&self, socket: u64, port: u16);
    fn whitelist_add(&self, socket: u64, peers: &[Ipv4Addr]) -> Result<()>;
    fn socket_connect(&self, socket: u64, remote: Ipv4Addr, port: u16) -> Result<()>;
    /// Poll for ready sockets; returns `(socket, fd)` pairs.
    fn poll_ready_sockets(&self, sockets: &[u64]) -> Result<Vec<(u64, u64)>>;
    fn socket_close(&self, socket: u64);

    fn create_ai_qp(&self, handle: u64, attrs: &QpAttributes) -> Result<(u64, AiQpInfo)>;
    fn connect_qp_async(&self, qp: u64, fd: u64) -> Result<()>;
    /// 1 means connected.
    fn qp_status(&self, qp: u64) -> Result<i32>;
    fn destroy_qp(&self, qp: u64);

    fn post_read(&self, qp: u64, req: &OneSideRequest) -> Result<()>;
    fn post_write(&self, qp: u64, req: &OneSideRequest) -> Result<()>;
}

#[derive(Default)]
struct LoopbackDriverState {
    opened: HashMap<u32, bool>,
    sockets: HashMap<u64, bool>, // socket -> connect/listen issued
    qps: HashMap<u64, i32>,      // qp -> status
}

/// In-process device driver: sockets become ready immediately, queue pairs
/// report connected, verbs are plain copies.
pub struct LoopbackDriver {
    state: Mutex<LoopbackDriverState>,
    ids: AtomicU64,
}

impl LoopbackDriver {
    pub fn instance() -> &'static LoopbackDriver {
        static INSTANCE: OnceLock<LoopbackDriver> = OnceLock::new();
        INSTANCE.get_or_init(|| LoopbackDriver {
            state: Mutex::new(LoopbackDriverState::default()),
            ids: AtomicU64::new(1),
        })
    }
}

impl RdmaDriver for LoopbackDriver {
    fn open_device(&self, device_id: u32) -> Result<()> {
        self.state.lock().unwrap().opened.insert(device_id, true);
        Ok(())
    }

    fn device_ip(&self, _device_id: u32) -> Result<Ipv4Addr> {
        Ok(Ipv4Addr::LOCALHOST)
    }

    fn rdev_init(&self, device_id: u32, _ip: Ipv4Addr) -> Result<u64> {
        let opened = *self
            .state
            .lock()
            .unwrap()
            .opened
            .get(&device_id)
            .unwrap_or(&false);
        if !opened {
            return Err(ErrCode::DlFunctionFailed);
        }
        Ok(self.ids.fetch_add(1, Ordering::Relaxed))
    }

    fn register_mr(
        &self,
        _handle: u64,
        addr: u64,
        size: u64,
        _access: i32,
    ) -> Result<MrRegistration> {
        if addr == 0 || size == 0 {
            return Err(ErrCode::InvalidParam);
        }
        let handle = self.ids.fetch_add(1, Ordering::Relaxed);
        Ok(MrRegistration {
            handle,
            lkey: handle as u32,
            rkey: (handle as u32).wrapping_add(0x8000_0000),
        })
    }

    fn deregister_mr(&self, _handle: u64, _mr: u64) -> Result<()> {
        Ok(())
    }

    fn socket_init(&self, _device_id: u32, _ip: Ipv4Addr) -> Result<u64> {
        let socket = self.ids.fetch_add(1, Ordering::Relaxed);
        self.state.lock().unwrap().sockets.insert(socket, false);
        Ok(socket)
    }

    fn socket_listen(&self, socket: u64, _port: u16) -> Result<()> {
        self.state.lock().unwrap().sockets.insert(socket, true);
        Ok(())
    }

    fn socket_listen_stop(&self, _socket: u64, _port: u16) {}

    fn whitelist_add(&self, _socket: u64, _peers: &[Ipv4Addr]) -> Result<()> {
        Ok(())
    }

    fn socket_connect(&self, socket: u64, _remote: Ipv4Addr, _port: u16) -> Result<()> {
        self.state.lock().unwrap().sockets.insert(socket, true);
        Ok(())
    }

    fn poll_ready_sockets(&self, sockets: &[u64]) -> Result<Vec<(u64, u64)>> {
        let state = self.state.lock().unwrap();
        Ok(sockets
            .iter()
            .filter(|s| state.sockets.get(s).copied().unwrap_or(false))
            .map(|&s| (s, s | 0x1_0000_0000))
            .collect())
    }

    fn socket_close(&self, socket: u64) {
        self.state.lock().unwrap().sockets.remove(&socket);
    }

    fn create_ai_qp(&self, _handle: u64, _attrs: &QpAttributes) -> Result<(u64, AiQpInfo)> {
        let qp = self.ids.fetch_add(1, Ordering::Relaxed);
        self.state.lock().unwrap().qps.insert(qp, 0);
        Ok((
            qp,
            AiQpInfo {
                qp_number: qp as u32,
            },
        ))
    }

    fn connect_qp_async(&self, qp: u64, _fd: u64) -> Result<()> {
        self.state.lock().unwrap().qps.insert(qp, 1);
        Ok(())
    }

    fn qp_status(&self, qp: u64) -> Result<i32> {
        self.state
            .lock()
            .unwrap()
            .qps
            .get(&qp)
            .copied()
            .ok_or(ErrCode::DlFunctionFailed)
    }

    fn destroy_qp(&self, qp: u64) {
        self.state.lock().unwrap().qps.remove(&qp);
    }

    fn post_read(&self, qp: u64, req: &OneSideRequest) -> Result<()> {
        if self.qp_status(qp)? != 1 {
            return Err(ErrCode::IoError);
        }
        unsafe {
            std::ptr::copy(
                req.remote_addr as *const u8,
                req.local_addr as *mut u8,
                req.size as usize,
            );
        }
        Ok(())
    }

    fn post_write(&self, qp: u64, req: &OneSideRequest) -> Result<()> {
        if self.qp_status(qp)? != 1 {
            return Err(ErrCode::IoError);
        }
        unsafe {
            std::ptr::copy(
                req.local_addr as *const u8,
                req.remote_addr as *mut u8,
                req.size as usize,
            );
        }
        Ok(())
    }
}
