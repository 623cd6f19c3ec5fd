//! Workunit model
//!
//! A workunit is a self-contained unit of scan work. Send-workunits are
//! plans for emitting one probe family against one target block; recv-
//! workunits tell a listener what to capture and how to filter it. Both
//! carry the scan's SYN-cookie key so correlation works with no shared
//! state beyond the plan itself.
//!
//! Workunit IDs are handed out by a monotonic counter owned by the planner
//! and are unique within a scan.

use crate::config::TcpFlags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

/// Protocol tag magics for send-workunits.
pub const TCP_SEND_MAGIC: u32 = 0x1a1b1c1d;
pub const UDP_SEND_MAGIC: u32 = 0x2a2b2c2d;
pub const ARP_SEND_MAGIC: u32 = 0x3a3b3c3d;
pub const ICMP_SEND_MAGIC: u32 = 0x4a4b4c4d;
pub const IP_SEND_MAGIC: u32 = 0x5a5b5c5d;

/// Protocol tag magics for recv-workunits.
pub const TCP_RECV_MAGIC: u32 = 0x6a6b6c6d;
pub const UDP_RECV_MAGIC: u32 = 0x7a7b7c7d;
pub const ARP_RECV_MAGIC: u32 = 0x8a8b8c8d;
pub const ICMP_RECV_MAGIC: u32 = 0x9a9b9c9d;
pub const IP_RECV_MAGIC: u32 = 0xaaabacad;

/// Lifecycle of a workunit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkunitStatus {
    Queued,
    InFlight,
    Done,
    Failed,
}

impl WorkunitStatus {
    pub fn as_u8(self) -> u8 {
        match self {
            WorkunitStatus::Queued => 0,
            WorkunitStatus::InFlight => 1,
            WorkunitStatus::Done => 2,
            WorkunitStatus::Failed => 3,
        }
    }

    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => WorkunitStatus::InFlight,
            2 => WorkunitStatus::Done,
            3 => WorkunitStatus::Failed,
            _ => WorkunitStatus::Queued,
        }
    }
}

/// Snapshot of the source interface a workunit will use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSnapshot {
    pub name: String,
    pub ipv4: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub mac: [u8; 6],
    pub mtu: u32,
}

impl InterfaceSnapshot {
    /// A loopback-ish placeholder for tests and dry runs.
    pub fn placeholder() -> Self {
        Self {
            name: "lo".to_string(),
            ipv4: Ipv4Addr::new(127, 0, 0, 1),
            netmask: Ipv4Addr::new(255, 0, 0, 0),
            mac: [0; 6],
            mtu: 65536,
        }
    }
}

/// Plan for emitting one probe family against one target block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendWorkunit {
    /// Protocol tag (one of the `*_SEND_MAGIC` values).
    pub magic: u32,
    /// Unique within the scan.
    pub id: u32,
    pub status: WorkunitStatus,
    /// Blind re-emissions per probe.
    pub repeats: u32,
    /// Rate cap for this workunit.
    pub pps: u32,
    /// Source interface snapshot.
    pub iface: InterfaceSnapshot,
    /// Target block base address.
    pub target: Ipv4Addr,
    /// Target block prefix length.
    pub prefix: u8,
    /// IP ToS byte.
    pub tos: u8,
    /// TTL range; equal values give a fixed TTL, a range drives tcptrace.
    pub ttl_min: u8,
    pub ttl_max: u8,
    /// Raw IP options blob, copied verbatim into the header.
    pub ip_options: Vec<u8>,
    /// IP fragment-offset field value.
    pub frag_off: u16,
    /// Fixed source port, or -1 to randomize per probe.
    pub src_port: i32,
    /// TCP flags for TCP probes.
    pub tcp_flags: TcpFlags,
    /// Raw TCP options blob; empty means the stock default options.
    pub tcp_options: Vec<u8>,
    /// TCP window.
    pub window: u16,
    /// Per-scan SYN-cookie key.
    pub syn_key: u32,
    /// Port expression to iterate.
    pub port_str: String,
}

impl SendWorkunit {
    /// Whether this workunit drives TTL-iterating trace probes.
    pub fn is_trace(&self) -> bool {
        self.ttl_max > self.ttl_min
    }
}

impl fmt::Display for SendWorkunit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "send-wu {} {}/{} ports {} pps {} x{}",
            self.id, self.target, self.prefix, self.port_str, self.pps, self.repeats
        )
    }
}

/// Plan for a listener: what to capture, how long to linger, what to report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecvWorkunit {
    /// Protocol tag (one of the `*_RECV_MAGIC` values).
    pub magic: u32,
    /// Unique within the scan.
    pub id: u32,
    pub status: WorkunitStatus,
    /// Seconds of post-send quiescence before the listener declares done.
    pub recv_timeout: u16,
    /// Which wire layers to include in reports (bitmask; 0 = none).
    pub ret_layers: u8,
    /// Capture in promiscuous mode.
    pub promisc: bool,
    /// Report frames with bad network checksums instead of dropping them.
    pub report_broken_net: bool,
    /// Report frames with bad transport checksums.
    pub report_broken_trans: bool,
    /// Complete a handshake and grab a banner on SYN-ACK.
    pub do_connect: bool,
    /// Must equal the sender's key.
    pub syn_key: u32,
    /// Override for the generated BPF filter.
    pub pcap_filter: Option<String>,
    /// Interface to capture on.
    pub iface: String,
}

/// Progress counters a drone reports per workunit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkunitStats {
    pub id: u32,
    /// Probes emitted (senders) or reports produced (listeners).
    pub count: u64,
    /// Set once the workunit is drained.
    pub done: bool,
}
