//! TCP connection table: summary counts for snapshots and the full listing
//! behind `/api/connections`. Linux reads `/proc/net/tcp{,6}` directly.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use sysinfo::Networks;

use crate::cache::CacheCell;
use crate::process::ProcessTracker;
use crate::types::{ConnectionDetails, ConnectionInfo, ConnectivityMetrics};

use super::network::is_loopback;

const TTL: Duration = Duration::from_secs(2);

const VPN_PREFIXES: &[&str] = &["utun", "tun", "wg", "ppp", "ipsec"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Established,
    Listen,
    Other,
}

impl TcpState {
    fn from_hex(code: &str) -> Self {
        match code {
            "01" => TcpState::Established,
            "0A" => TcpState::Listen,
            _ => TcpState::Other,
        }
    }

    fn label(self) -> &'static str {
        match self {
            TcpState::Established => "ESTABLISHED",
            TcpState::Listen => "LISTEN",
            TcpState::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSocket {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: TcpState,
    pub inode: u64,
}

/// Decode a `/proc/net/tcp` address such as `0100007F:1F90`. Each 32-bit
/// word of the address is in host (little-endian) order.
pub fn decode_addr(field: &str) -> Option<SocketAddr> {
    let (ip_hex, port_hex) = field.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let ip = match ip_hex.len() {
        8 => {
            let word = u32::from_str_radix(ip_hex, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(word.swap_bytes()))
        }
        32 => {
            let mut bytes = [0u8; 16];
            for (i, chunk) in bytes.chunks_mut(4).enumerate() {
                let word = u32::from_str_radix(ip_hex.get(i * 8..i * 8 + 8)?, 16).ok()?;
                chunk.copy_from_slice(&word.swap_bytes().to_be_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(bytes))
        }
        _ => return None,
    };
    Some(SocketAddr::new(ip, port))
}

/// Parse the body of `/proc/net/tcp` or `/proc/net/tcp6`.
pub fn parse_proc_net(text: &str) -> Vec<RawSocket> {
    text.lines()
        .skip(1)
        .filter_map(|line| {
            let f: Vec<&str> = line.split_whitespace().collect();
            if f.len() < 10 {
                return None;
            }
            Some(RawSocket {
                local: decode_addr(f[1])?,
                remote: decode_addr(f[2])?,
                state: TcpState::from_hex(f[3]),
                inode: f[9].parse().ok()?,
            })
        })
        .collect()
}

/// True for tunnel-style interface names.
pub fn is_vpn_interface(name: &str) -> bool {
    VPN_PREFIXES.iter().any(|p| name.starts_with(p))
}

pub struct ConnectionTable {
    tracker: Arc<ProcessTracker>,
    nets: Mutex<Networks>,
    summary: CacheCell<ConnectivityMetrics>,
    details: CacheCell<ConnectionDetails>,
}

impl ConnectionTable {
    pub fn new(tracker: Arc<ProcessTracker>) -> Self {
        Self {
            tracker,
            nets: Mutex::new(Networks::new()),
            summary: CacheCell::new(TTL),
            details: CacheCell::new(TTL),
        }
    }

    /// Established/listening counts plus VPN detection.
    pub fn summary(&self) -> anyhow::Result<ConnectivityMetrics> {
        self.summary.try_get(|| {
            let sockets = read_sockets()?;
            let mut m = ConnectivityMetrics::default();
            for s in &sockets {
                match s.state {
                    TcpState::Established => m.active_connections += 1,
                    TcpState::Listen => m.listening_ports += 1,
                    TcpState::Other => {}
                }
            }
            if let Some(iface) = self.vpn_interface() {
                m.vpn_active = true;
                m.vpn_interface = iface;
            }
            Ok(m)
        })
    }

    /// Every established and listening socket with its owning process.
    pub fn details(&self) -> ConnectionDetails {
        self.details.get(|| {
            let sockets = match read_sockets() {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(error = %e, "connection listing unavailable");
                    return ConnectionDetails::default();
                }
            };
            let owners = socket_owners();
            let mut d = ConnectionDetails::default();
            for s in sockets {
                if s.state == TcpState::Other {
                    continue;
                }
                let pid = owners.get(&s.inode).copied().unwrap_or(0);
                let info = ConnectionInfo {
                    process: self.process_name(pid),
                    pid,
                    protocol: "TCP".to_string(),
                    local: s.local.to_string(),
                    remote: if s.state == TcpState::Listen {
                        "*".to_string()
                    } else {
                        s.remote.to_string()
                    },
                    state: s.state.label().to_string(),
                };
                if s.state == TcpState::Listen {
                    d.listening.push(info);
                } else {
                    d.active.push(info);
                }
            }
            d
        })
    }

    fn process_name(&self, pid: u32) -> String {
        if pid == 0 {
            return "kernel/unknown".to_string();
        }
        self.tracker
            .resolve_name(pid)
            .or_else(|| proc_comm(pid))
            .unwrap_or_else(|| format!("PID {pid}"))
    }

    fn vpn_interface(&self) -> Option<String> {
        let mut nets = self.nets.lock().unwrap_or_else(PoisonError::into_inner);
        nets.refresh(true);
        let mut names: Vec<&String> = nets
            .iter()
            .filter(|(name, data)| {
                !is_loopback(name)
                    && is_vpn_interface(name)
                    && data.ip_networks().iter().any(|n| match n.addr {
                        IpAddr::V4(_) => true,
                        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) != 0xfe80,
                    })
            })
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names.first().map(|n| n.to_string())
    }
}

#[cfg(target_os = "linux")]
fn read_sockets() -> anyhow::Result<Vec<RawSocket>> {
    use anyhow::Context;
    let mut out = parse_proc_net(
        &std::fs::read_to_string("/proc/net/tcp").context("reading /proc/net/tcp")?,
    );
    // IPv6 may be disabled entirely.
    if let Ok(v6) = std::fs::read_to_string("/proc/net/tcp6") {
        out.extend(parse_proc_net(&v6));
    }
    Ok(out)
}

#[cfg(not(target_os = "linux"))]
fn read_sockets() -> anyhow::Result<Vec<RawSocket>> {
    anyhow::bail!("connection table is only available on Linux")
}

/// Socket inode to owning pid, from `/proc/*/fd`. Unreadable processes are
/// skipped, so without privileges only our own user's sockets resolve.
#[cfg(target_os = "linux")]
fn socket_owners() -> HashMap<u64, u32> {
    let mut owners = HashMap::new();
    let Ok(procs) = std::fs::read_dir("/proc") else {
        return owners;
    };
    for entry in procs.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let Ok(fds) = std::fs::read_dir(entry.path().join("fd")) else {
            continue;
        };
        for fd in fds.flatten() {
            let Ok(target) = std::fs::read_link(fd.path()) else {
                continue;
            };
            let target = target.to_string_lossy();
            if let Some(inode) = target
                .strip_prefix("socket:[")
                .and_then(|s| s.strip_suffix(']'))
                .and_then(|s| s.parse().ok())
            {
                owners.insert(inode, pid);
            }
        }
    }
    owners
}

#[cfg(not(target_os = "linux"))]
fn socket_owners() -> HashMap<u64, u32> {
    HashMap::new()
}

#[cfg(target_os = "linux")]
fn proc_comm(pid: u32) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(not(target_os = "linux"))]
fn proc_comm(_pid: u32) -> Option<String> {
    None
}
