//! Target expression parsing and host expansion
//!
//! A target expression is a single IPv4 address or a CIDR block. Expansion is
//! lazy: the host iterator walks a linear index and, when randomized order is
//! requested, routes it through a Blackrock permutation, so arbitrarily large
//! blocks cost no memory. Network and broadcast addresses are skipped for
//! prefixes shorter than /31.

use crate::crypto::BlackRock;
use crate::error::{Error, Result};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// A scan target: one IPv4 network (a /32 for single hosts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    network: Ipv4Network,
}

impl Target {
    /// Parse `a.b.c.d` or `a.b.c.d/nn`.
    ///
    /// # Examples
    ///
    /// ```
    /// use unicornscan_core::target::Target;
    ///
    /// let t = Target::parse("192.168.77.0/28").unwrap();
    /// assert_eq!(t.host_count(), 14);
    /// assert!(Target::parse("10.1.2.3").unwrap().is_single_host());
    /// ```
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::InvalidTarget("empty target".to_string()));
        }

        if let Ok(network) = input.parse::<Ipv4Network>() {
            return Ok(Self { network });
        }

        if let Ok(addr) = input.parse::<Ipv4Addr>() {
            let network = Ipv4Network::new(addr, 32)?;
            return Ok(Self { network });
        }

        Err(Error::InvalidTarget(format!(
            "cannot parse `{}` as IPv4 address or CIDR",
            input
        )))
    }

    /// Build directly from a network.
    pub fn from_network(network: Ipv4Network) -> Self {
        Self { network }
    }

    /// The underlying network.
    pub fn network(&self) -> Ipv4Network {
        self.network
    }

    /// The base address of the block.
    pub fn base(&self) -> Ipv4Addr {
        self.network.network()
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.network.prefix()
    }

    /// Whether this is a single host.
    pub fn is_single_host(&self) -> bool {
        self.network.prefix() == 32
    }

    /// Number of scannable hosts (network/broadcast excluded below /31).
    pub fn host_count(&self) -> u64 {
        let prefix = self.network.prefix();
        let size = 1u64 << (32 - prefix as u64);
        if prefix < 31 {
            size - 2
        } else {
            size
        }
    }

    /// Iterate hosts in address order.
    pub fn hosts(&self) -> TargetHosts {
        TargetHosts::new(*self, None)
    }

    /// Iterate hosts in a shuffled order determined by `seed`.
    pub fn hosts_shuffled(&self, seed: u64) -> TargetHosts {
        TargetHosts::new(*self, Some(seed))
    }

    /// Whether `addr` falls inside this target.
    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        self.network.contains(addr)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single_host() {
            write!(f, "{}", self.network.ip())
        } else {
            write!(f, "{}", self.network)
        }
    }
}

/// Lazy host iterator over a target block.
pub struct TargetHosts {
    base: u32,
    count: u64,
    skip_edges: bool,
    index: u64,
    rock: Option<BlackRock>,
}

impl TargetHosts {
    fn new(target: Target, seed: Option<u64>) -> Self {
        let prefix = target.network.prefix();
        let size = 1u64 << (32 - prefix as u64);
        let skip_edges = prefix < 31;
        let count = if skip_edges { size - 2 } else { size };

        Self {
            base: u32::from(target.network.network()),
            count,
            skip_edges,
            index: 0,
            rock: seed.map(|s| BlackRock::new(count.max(1), s, 3)),
        }
    }
}

impl Iterator for TargetHosts {
    type Item = Ipv4Addr;

    fn next(&mut self) -> Option<Self::Item> {
        if self.index >= self.count {
            return None;
        }

        let ordinal = match &self.rock {
            Some(rock) => rock.shuffle(self.index),
            None => self.index,
        };
        self.index += 1;

        // Offset past the network address when edges are skipped.
        let offset = if self.skip_edges { ordinal + 1 } else { ordinal };
        Some(Ipv4Addr::from(self.base.wrapping_add(offset as u32)))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.count - self.index) as usize;
        (remaining, Some(remaining))
    }
}

/// Parse a whitespace/comma-free list of target expressions.
pub fn parse_targets(inputs: &[String]) -> Result<Vec<Target>> {
    if inputs.is_empty() {
        return Err(Error::InvalidTarget("no targets given".to_string()));
    }
    inputs.iter().map(|s| Target::parse(s)).collect()
}
