//! Phase filter: the ARP cache between compound-scan phases
//!
//! During an ARP phase the listener's reports populate this set; when the
//! next non-ARP phase is planned, the live hosts are drained out of it and
//! aggregated into workunit target blocks. Storing an address twice
//! refreshes its MAC (hosts do change adapters mid-scan, and a refreshed
//! reply always wins).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::debug;

/// IP to MAC map of hosts that answered the ARP phase.
#[derive(Debug, Clone, Default)]
pub struct PhaseFilter {
    entries: HashMap<Ipv4Addr, [u8; 6]>,
}

impl PhaseFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a live host. Returns true when the address was new.
    pub fn store(&mut self, ipaddr: Ipv4Addr, hwaddr: [u8; 6]) -> bool {
        let fresh = self.entries.insert(ipaddr, hwaddr).is_none();
        if fresh {
            debug!(ip = %ipaddr, "phase filter: stored ARP response");
        }
        fresh
    }

    /// Whether a host was seen live. An empty filter passes everything, so
    /// single-phase scans are unaffected.
    pub fn check(&self, ipaddr: Ipv4Addr) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        self.entries.contains_key(&ipaddr)
    }

    /// Hosts recorded so far.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// MAC recorded for a host, if present.
    pub fn hwaddr(&self, ipaddr: Ipv4Addr) -> Option<[u8; 6]> {
        self.entries.get(&ipaddr).copied()
    }

    /// Drain the live set for the next phase, sorted by address.
    pub fn drain_sorted(&mut self) -> Vec<Ipv4Addr> {
        let mut addrs: Vec<Ipv4Addr> = self.entries.drain().map(|(ip, _)| ip).collect();
        addrs.sort();
        addrs
    }
}
