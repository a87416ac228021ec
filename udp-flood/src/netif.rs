//! Network interface lookups: autodetection, addresses, and indices.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use anyhow::{bail, Context, Result};
use nix::ifaddrs::getifaddrs;
use tracing::debug;

use crate::packet::MacAddr;

/// Port used for the route probe. Nothing is ever sent to it.
const PROBE_PORT: u16 = 53;

/// Find the interface the kernel would route `target` through.
///
/// Connects a throwaway UDP socket (no traffic is sent), reads back the bound
/// local address, and matches it against the host's interface addresses.
pub fn detect_interface(target: Ipv4Addr) -> Result<String> {
    let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).context("binding probe socket")?;
    probe
        .connect(SocketAddrV4::new(target, PROBE_PORT))
        .with_context(|| format!("no route to {}", target))?;

    let local = match probe.local_addr().context("reading probe socket address")? {
        SocketAddr::V4(addr) => *addr.ip(),
        SocketAddr::V6(addr) => bail!("probe bound to unexpected address {}", addr),
    };
    debug!(%target, %local, "route probe resolved local address");

    interface_with_addr(local)?
        .with_context(|| format!("no interface carries local address {}", local))
}

/// Name of the interface that owns `addr`, if any.
fn interface_with_addr(addr: Ipv4Addr) -> Result<Option<String>> {
    let found = getifaddrs()
        .context("listing interface addresses")?
        .find(|ifa| ipv4_of(ifa) == Some(addr))
        .map(|ifa| ifa.interface_name);
    Ok(found)
}

/// First IPv4 address assigned to `iface`.
pub fn interface_ipv4(iface: &str) -> Result<Option<Ipv4Addr>> {
    let found = getifaddrs()
        .context("listing interface addresses")?
        .filter(|ifa| ifa.interface_name == iface)
        .find_map(|ifa| ipv4_of(&ifa));
    Ok(found)
}

/// Hardware address of `iface`.
pub fn interface_mac(iface: &str) -> Result<MacAddr> {
    getifaddrs()
        .context("listing interface addresses")?
        .filter(|ifa| ifa.interface_name == iface)
        .find_map(|ifa| {
            ifa.address
                .as_ref()
                .and_then(|addr| addr.as_link_addr())
                .and_then(|link| link.addr())
        })
        .map(MacAddr)
        .with_context(|| format!("interface '{}' has no hardware address", iface))
}

/// Kernel index of `iface`.
pub fn interface_index(iface: &str) -> Result<u32> {
    let idx = nix::net::if_::if_nametoindex(iface)
        .with_context(|| format!("interface '{}' not found", iface))?;
    Ok(idx)
}

/// TX queues the kernel exposes for `iface` (`/sys/class/net/<iface>/queues/tx-*`).
pub fn tx_queue_count(iface: &str) -> Option<u32> {
    let entries = std::fs::read_dir(format!("/sys/class/net/{}/queues", iface)).ok()?;
    let count = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("tx-"))
        .count() as u32;
    (count > 0).then_some(count)
}

fn ipv4_of(ifa: &nix::ifaddrs::InterfaceAddress) -> Option<Ipv4Addr> {
    ifa.address
        .as_ref()
        .and_then(|addr| addr.as_sockaddr_in())
        .map(|sin| *SocketAddrV4::from(*sin).ip())
}
