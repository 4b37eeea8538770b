// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Address grammar of the fabric:
// - store URLs      `tcp://<ipv4>:<port>` (bare `<ipv4>:<port>` accepted for
//   peer names)
// - transport nics  `<proto>://<ipv4>[/<mask>]:<port>` where a mask selects
//   the local interface on that subnet
// - worker sessions, the 8-byte binary form of a peer's `ip:port` unique id.

use std::net::Ipv4Addr;

use crate::error::{ErrCode, Result};

/// Nic protocols the host transport recognizes.
pub const NIC_PROTOCOLS: [&str; 4] = ["tcp", "mte", "roce", "ubc"];

/// Extraction of `<ip>:<port>` out of a store URL or peer name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlParts {
    pub ip: String,
    pub port: u16,
}

impl UrlParts {
    /// Accepts `tcp://<ipv4>:<port>` or a bare `<ipv4>:<port>`.
    pub fn parse(url: &str) -> Result<UrlParts> {
        let rest = url.strip_prefix("tcp://").unwrap_or(url);
        let (ip, port) = rest.rsplit_once(':').ok_or(ErrCode::InvalidParam)?;
        if ip.parse::<Ipv4Addr>().is_err() {
            return Err(ErrCode::InvalidParam);
        }
        let port: u32 = port.parse().map_err(|_| ErrCode::InvalidParam)?;
        if port == 0 || port > u16::MAX as u32 {
            return Err(ErrCode::InvalidParam);
        }
        Ok(UrlParts {
            ip: ip.to_string(),
            port: port as u16,
        })
    }
}

/// Parsed transport nic, after mask resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicParts {
    /// Protocol with the `://` suffix kept, e.g. `"tcp://"`.
    pub protocol: String,
    pub ip: String,
    pub port: u16,
}

/// Parse a nic string; when the ip carries a `/<mask>` suffix, the local
/// interface sitting on that subnet is selected instead.
pub fn analyse_nic(nic: &str) -> Result<NicParts> {
    let (proto, rest) = nic.split_once("://").ok_or(ErrCode::InvalidParam)?;
    if !NIC_PROTOCOLS.contains(&proto) {
        return Err(ErrCode::InvalidParam);
    }
    let (host, port) = rest.rsplit_once(':').ok_or(ErrCode::InvalidParam)?;
    let port: u32 = port.parse().map_err(|_| ErrCode::InvalidParam)?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(ErrCode::InvalidParam);
    }
    let port = port as u16;
    let protocol = format!("{proto}://");

    let ip = match host.split_once('/') {
        None => {
            host.parse::<Ipv4Addr>().map_err(|_| ErrCode::InvalidParam)?;
            host.to_string()
        }
        Some((net, mask)) => {
            let net: Ipv4Addr = net.parse().map_err(|_| ErrCode::InvalidParam)?;
            let mask: u32 = mask.parse().map_err(|_| ErrCode::InvalidParam)?;
            if mask > 32 {
                return Err(ErrCode::InvalidParam);
            }
            select_local_ip(net, mask)?.to_string()
        }
    };

    Ok(NicParts { protocol, ip, port })
}

/// Scan local interfaces and return the first AF_INET address on the
/// `net/<mask>` subnet.
#[cfg(unix)]
pub fn select_local_ip(net: Ipv4Addr, mask: u32) -> Result<Ipv4Addr> {
    let net_mask: u32 = if mask == 0 {
        0
    } else {
        (!0u32) << (32 - mask)
    };
    let target = u32::from(net) & net_mask;

    let mut if_addrs: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut if_addrs) } != 0 {
        return Err(ErrCode::Error);
    }

    let mut found = None;
    let mut cursor = if_addrs;
    while !cursor.is_null() {
        let ifa = unsafe { &*cursor };
        cursor = ifa.ifa_next;
        if ifa.ifa_addr.is_null() {
            continue;
        }
        let family = unsafe { (*ifa.ifa_addr).sa_family };
        if family != libc::AF_INET as libc::sa_family_t {
            continue;
        }
        let sin = ifa.ifa_addr as *const libc::sockaddr_in;
        let local = u32::from_be(unsafe { (*sin).sin_addr.s_addr });
        if local & net_mask == target {
            found = Some(Ipv4Addr::from(local));
            break;
        }
    }
    unsafe { libc::freeifaddrs(if_addrs) };

    found.ok_or(ErrCode::Error)
}

/// Identity of a transfer worker, the binary form of its `ip:port` name.
/// `address` is the ipv4 in host byte order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct WorkerSession {
    pub address: u32,
    pub port: u16,
    pub reserved: u16,
}

impl WorkerSession {
    /// Parse a `<ipv4>:<port>` unique id.
    pub fn parse(name: &str) -> Result<WorkerSession> {
        let parts = UrlParts::parse(name)?;
        let ip: Ipv4Addr = parts.ip.parse().map_err(|_| ErrCode::InvalidParam)?;
        Ok(WorkerSession {
            address: u32::from(ip),
            port: parts.port,
            reserved: 0,
        })
    }

    /// Pack into the 8-byte wire form used inside slice records.
    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.address.to_le_bytes());
        out[4..6].copy_from_slice(&self.port.to_le_bytes());
        out[6..8].copy_from_slice(&self.reserved.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<WorkerSession> {
        if bytes.len() < 8 {
            return Err(ErrCode::InvalidParam);
        }
        Ok(WorkerSession {
            address: u32::from_le_bytes(bytes[..4].try_into().unwrap()),
            port: u16::from_le_bytes(bytes[4..6].try_into().unwrap()),
            reserved: u16::from_le_bytes(bytes[6..8].try_into().unwrap()),
        })
    }

    /// Collapse into one u64, the session key of the remote-slice map.
    pub fn session_id(self) -> u64 {
        u64::from_le_bytes(self.to_bytes())
    }
}
