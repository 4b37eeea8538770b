// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Composite transport: optional host and device inner managers.
//
// The nic string is a semicolon-separated list of `host#...` and
// `device#...` entries. Registration routes by the DRAM/HBM flag bit,
// one-sided ops by the local address's registered range, key parsing by the
// key's first word. Prepare and update split each peer's nic list and key
// list between the inner managers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{debug, error};

use crate::error::{ErrCode, Result};
use crate::transport::{
    DeviceTransport, HostTransport, PrepareOptions, RankPrepareInfo, TransportManager,
    TransportMemoryKey, TransportMemoryRegion, TransportOptions, TransportType,
    REG_MR_FLAG_DRAM, REG_MR_FLAG_HBM,
};

const NIC_DELIMITER: char = ';';
const HOST_NIC_PREFIX: &str = "host#";
const DEVICE_NIC_PREFIX: &str = "device#";

#[derive(Debug, Clone, Copy)]
struct ComposeRegion {
    addr: u64,
    size: u64,
    transport: TransportType,
}

/// Routes every contract operation to the host or device inner manager.
pub struct ComposeTransport {
    host: Mutex<Option<Arc<dyn TransportManager>>>,
    device: Mutex<Option<Arc<dyn TransportManager>>>,
    nic_info: Mutex<String>,
    regions: Mutex<HashMap<u64, ComposeRegion>>,
}

impl ComposeTransport {
    pub fn new() -> Arc<ComposeTransport> {
        Arc::new(ComposeTransport {
            host: Mutex::new(None),
            device: Mutex::new(None),
            nic_info: Mutex::new(String::new()),
            regions: Mutex::new(HashMap::new()),
        })
    }

    fn by_type(&self, transport: TransportType) -> Option<Arc<dyn TransportManager>> {
        match transport {
            TransportType::Hccp => self.device.lock().unwrap().clone(),
            TransportType::Hcom => self.host.lock().unwrap().clone(),
            TransportType::Compose => None,
        }
    }

    fn by_address(&self, addr: u64) -> Option<Arc<dyn TransportManager>> {
        let regions = self.regions.lock().unwrap();
        let region = regions
            .values()
            .find(|r| r.addr <= addr && addr <= r.addr + r.size)?;
        let transport = region.transport;
        drop(regions);
        self.by_type(transport)
    }

    fn type_from_flags(flags: u32) -> Result<TransportType> {
        if flags & REG_MR_FLAG_DRAM != 0 {
            Ok(TransportType::Hcom)
        } else if flags & REG_MR_FLAG_HBM != 0 {
            Ok(TransportType::Hccp)
        } else {
            Err(ErrCode::InvalidParam)
        }
    }

    /// Keep one prefix's entries of each peer's nic list and key list.
    fn split_options(options: &PrepareOptions, host_side: bool) -> PrepareOptions {
        let prefix = if host_side {
            HOST_NIC_PREFIX
        } else {
            DEVICE_NIC_PREFIX
        };
        let want = if host_side {
            TransportType::Hcom as u32
        } else {
            TransportType::Hccp as u32
        };
        let mut out = PrepareOptions::default();
        for (&rank, info) in &options.ranks {
            let mut split = RankPrepareInfo::default();
            for nic in info.nic.split(NIC_DELIMITER) {
                if let Some(rest) = nic.strip_prefix(prefix) {
                    split.nic = rest.to_string();
                }
            }
            for key in &info.mem_keys {
                if key.transport_type() == want {
                    split.mem_keys.push(*key);
                }
            }
            out.ranks.insert(rank, split);
        }
        out
    }

    fn for_each_inner(&self, mut f: impl FnMut(&Arc<dyn TransportManager>) -> Result<()>)
        -> Result<()> {
        if let Some(host) = self.host.lock().unwrap().clone() {
            f(&host)?;
        }
        if let Some(device) = self.device.lock().unwrap().clone() {
            f(&device)?;
        }
        Ok(())
    }
}

impl TransportManager for ComposeTransport {
    fn open(&self, options: &TransportOptions) -> Result<()> {
        for nic in options.nic.split(NIC_DELIMITER) {
            if nic.is_empty() {
                continue;
            }
            let ret = if let Some(rest) = nic.strip_prefix(HOST_NIC_PREFIX) {
                let mut inner = options.clone();
                inner.nic = rest.to_string();
                let host = HostTransport::instance();
                let ret = host.open(&inner);
                if ret.is_ok() {
                    let host_dyn: Arc<dyn TransportManager> = host;
                    *self.host.lock().unwrap() = Some(host_dyn);
                }
                ret
            } else if let Some(rest) = nic.strip_prefix(DEVICE_NIC_PREFIX) {
                let mut inner = options.clone();
                inner.nic = rest.to_string();
                let device = DeviceTransport::new();
                let ret = device.open(&inner);
                if ret.is_ok() {
                    let device_dyn: Arc<dyn TransportManager> = device;
                    *self.device.lock().unwrap() = Some(device_dyn);
                }
                ret
            } else {
                Err(ErrCode::InvalidParam)
            };
            if ret.is_err() {
                error!(nic, "open inner transport failed");
                self.close().ok();
                return Err(ErrCode::Error);
            }
        }

        let mut nic_info = String::new();
        if let Some(host) = self.host.lock().unwrap().clone() {
            nic_info.push_str(HOST_NIC_PREFIX);
            nic_info.push_str(&host.nic());
            nic_info.push(NIC_DELIMITER);
        }
        if let Some(device) = self.device.lock().unwrap().clone() {
            nic_info.push_str(DEVICE_NIC_PREFIX);
            nic_info.push_str(&device.nic());
            nic_info.push(NIC_DELIMITER);
        }
        *self.nic_info.lock().unwrap() = nic_info;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if let Some(device) = self.device.lock().unwrap().take() {
            device.close()?;
        }
        if let Some(host) = self.host.lock().unwrap().take() {
            host.close()?;
        }
        self.regions.lock().unwrap().clear();
        Ok(())
    }

    fn register_memory_region(&self, mr: &TransportMemoryRegion) -> Result<()> {
        let transport_type = Self::type_from_flags(mr.flags)?;
        let transport = self.by_type(transport_type).ok_or(ErrCode::InvalidParam)?;
        transport.register_memory_region(mr).map_err(|e| {
            error!(addr = mr.addr, size = mr.size, "register region failed: {e}");
            e
        })?;
        self.regions.lock().unwrap().insert(
            mr.addr,
            ComposeRegion {
                addr: mr.addr,
                size: mr.size,
                transport: transport_type,
            },
        );
        Ok(())
    }

    fn unregister_memory_region(&self, addr: u64) -> Result<()> {
        let region = {
            let regions = self.regions.lock().unwrap();
            regions.get(&addr).copied()
        };
        let Some(region) = region else {
            error!(addr, "address was never registered");
            return Err(ErrCode::InvalidParam);
        };
        let transport = self.by_type(region.transport).ok_or(ErrCode::Error)?;
        transport.unregister_memory_region(addr).map_err(|e| {
            error!(addr, "unregister region failed: {e}");
            ErrCode::DlFunctionFailed
        })?;
        self.regions.lock().unwrap().remove(&addr);
        Ok(())
    }

    fn has_registered(&self, addr: u64, size: u64) -> bool {
        let transport = {
            let regions = self.regions.lock().unwrap();
            let Some(region) = regions.get(&addr) else {
                return false;
            };
            region.transport
        };
        self.by_type(transport)
            .map(|t| t.has_registered(addr, size))
            .unwrap_or(false)
    }

    fn query_memory_key(&self, addr: u64) -> Result<TransportMemoryKey> {
        let transport = {
            let regions = self.regions.lock().unwrap();
            let region = regions.get(&addr).ok_or(ErrCode::InvalidParam)?;
            region.transport
        };
        let transport = self.by_type(transport).ok_or(ErrCode::Error)?;
        transport.query_memory_key(addr)
    }

    fn parse_memory_key(&self, key: &TransportMemoryKey) -> Result<(u64, u64)> {
        if key.transport_type() == TransportType::Hccp as u32 {
            if let Some(device) = self.device.lock().unwrap().clone() {
                return device.parse_memory_key(key);
            }
        }
        if key.transport_type() == TransportType::Hcom as u32 {
            if let Some(host) = self.host.lock().unwrap().clone() {
                return host.parse_memory_key(key);
            }
        }
        error!(word0 = key.transport_type(), "no transport owns this key");
        Err(ErrCode::Error)
    }

    fn prepare(&self, options: &PrepareOptions) -> Result<()> {
        if let Some(host) = self.host.lock().unwrap().clone() {
            let split = Self::split_options(options, true);
            host.prepare(&split)?;
        }
        if let Some(device) = self.device.lock().unwrap().clone() {
            let split = Self::split_options(options, false);
            device.prepare(&split)?;
        }
        Ok(())
    }

    fn remove_ranks(&self, ranks: &[u32]) -> Result<()> {
        let mut last = Ok(());
        if let Some(host) = self.host.lock().unwrap().clone() {
            if let Err(e) = host.remove_ranks(ranks) {
                error!("host remove ranks failed: {e}");
                last = Err(e);
            }
        }
        if let Some(device) = self.device.lock().unwrap().clone() {
            if let Err(e) = device.remove_ranks(ranks) {
                error!("device remove ranks failed: {e}");
                last = Err(e);
            }
        }
        last
    }

    fn connect(&self) -> Result<()> {
        self.for_each_inner(|inner| inner.connect())
    }

    fn async_connect(&self) -> Result<()> {
        self.for_each_inner(|inner| inner.async_connect())
    }

    fn wait_for_connected(&self, timeout_ns: i64) -> Result<()> {
        self.for_each_inner(|inner| inner.wait_for_connected(timeout_ns))
    }

    fn update_rank_options(&self, options: &PrepareOptions) -> Result<()> {
        if let Some(host) = self.host.lock().unwrap().clone() {
            let split = Self::split_options(options, true);
            host.update_rank_options(&split)?;
        }
        if let Some(device) = self.device.lock().unwrap().clone() {
            let split = Self::split_options(options, false);
            device.update_rank_options(&split)?;
        }
        Ok(())
    }

    fn nic(&self) -> String {
        self.nic_info.lock().unwrap().clone()
    }

    fn read_remote(&self, rank: u32, local_addr: u64, remote_addr: u64, size: u64) -> Result<()> {
        let transport = self.by_address(local_addr).ok_or(ErrCode::Error)?;
        debug!(rank, local_addr, size, "composite read routed");
        transport.read_remote(rank, local_addr, remote_addr, size)
    }

    fn write_remote(&self, rank: u32, local_addr: u64, remote_addr: u64, size: u64) -> Result<()> {
        let transport = self.by_address(local_addr).ok_or(ErrCode::Error)?;
        debug!(rank, local_addr, size, "composite write routed");
        transport.write_remote(rank, local_addr, remote_addr, size)
    }

    fn read_remote_async(&self, _rank: u32, _l: u64, _r: u64, _size: u64) -> Result<()> {
        error!("composite transport does not support async reads");
        Err(ErrCode::NotSupported)
    }

    fn write_remote_async(&self, _rank: u32, _l: u64, _r: u64, _size: u64) -> Result<()> {
        error!("composite transport does not support async writes");
        Err(ErrCode::NotSupported)
    }

    fn synchronize(&self, _rank: u32) -> Result<()> {
        error!("composite transport does not support synchronize");
        Err(ErrCode::NotSupported)
    }
}
