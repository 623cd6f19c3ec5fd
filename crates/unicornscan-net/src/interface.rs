//! Network interface detection
//!
//! Enumerates interfaces, picks the one that can reach a target, and builds
//! the interface snapshot that rides inside send-workunits (source IP,
//! netmask, MAC, MTU). IPv4 only.

use pnet::datalink;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;
use unicornscan_core::InterfaceSnapshot;

/// Errors from interface operations
#[derive(Error, Debug)]
pub enum InterfaceError {
    /// No suitable interface found
    #[error("No suitable network interface found for target {0}")]
    NoInterfaceFound(Ipv4Addr),

    /// Interface has no IPv4 address
    #[error("Interface {0} has no IPv4 address")]
    NoAddresses(String),

    /// Named interface does not exist
    #[error("Invalid interface: {0}")]
    InvalidInterface(String),
}

/// One interface with its IPv4 configuration.
#[derive(Debug, Clone)]
pub struct NetInterface {
    pub name: String,
    pub mac: Option<[u8; 6]>,
    /// (address, netmask) pairs.
    pub ipv4: Vec<(Ipv4Addr, Ipv4Addr)>,
    pub is_up: bool,
    pub is_loopback: bool,
}

impl NetInterface {
    /// First IPv4 address, if any.
    pub fn first_ipv4(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        self.ipv4.first().copied()
    }

    /// Whether `target` is on one of this interface's subnets.
    pub fn is_local(&self, target: Ipv4Addr) -> bool {
        self.ipv4.iter().any(|(addr, mask)| {
            let a = u32::from(*addr);
            let m = u32::from(*mask);
            let t = u32::from(target);
            (a & m) == (t & m)
        })
    }

    /// Build the snapshot carried by workunits.
    ///
    /// pnet does not expose the MTU, so the Ethernet default stands in; the
    /// sender only uses it to cap payload sizes.
    pub fn snapshot(&self) -> Result<InterfaceSnapshot, InterfaceError> {
        let (ipv4, netmask) = self
            .first_ipv4()
            .ok_or_else(|| InterfaceError::NoAddresses(self.name.clone()))?;
        Ok(InterfaceSnapshot {
            name: self.name.clone(),
            ipv4,
            netmask,
            mac: self.mac.unwrap_or([0; 6]),
            mtu: 1500,
        })
    }
}

/// Enumerate all interfaces with their IPv4 configuration.
pub fn enumerate_interfaces() -> Vec<NetInterface> {
    datalink::interfaces()
        .into_iter()
        .map(|iface| {
            let ipv4 = iface
                .ips
                .iter()
                .filter_map(|net| match (net.ip(), net.mask()) {
                    (IpAddr::V4(addr), IpAddr::V4(mask)) => Some((addr, mask)),
                    _ => None,
                })
                .collect();
            NetInterface {
                name: iface.name.clone(),
                mac: iface.mac.map(|mac| mac.octets()),
                ipv4,
                is_up: iface.is_up(),
                is_loopback: iface.is_loopback(),
            }
        })
        .collect()
}

/// Find an interface by name.
pub fn find_by_name(name: &str) -> Result<NetInterface, InterfaceError> {
    enumerate_interfaces()
        .into_iter()
        .find(|iface| iface.name == name)
        .ok_or_else(|| InterfaceError::InvalidInterface(name.to_string()))
}

/// Pick the interface to reach `target`: a subnet match wins, then the first
/// up non-loopback interface with an address, then loopback as a last resort.
pub fn find_for_target(target: Ipv4Addr) -> Result<NetInterface, InterfaceError> {
    let interfaces = enumerate_interfaces();

    if let Some(iface) = interfaces
        .iter()
        .find(|i| i.is_up && !i.is_loopback && i.is_local(target))
    {
        return Ok(iface.clone());
    }

    if let Some(iface) = interfaces
        .iter()
        .find(|i| i.is_up && !i.is_loopback && !i.ipv4.is_empty())
    {
        return Ok(iface.clone());
    }

    interfaces
        .into_iter()
        .find(|i| i.is_up && !i.ipv4.is_empty())
        .ok_or(InterfaceError::NoInterfaceFound(target))
}
