//! Response report types and dedupe keys
//!
//! Reports are the listener's output: one record per interesting response,
//! authenticated by the SYN cookie before it ever becomes a report. The
//! aggregator dedupes on 64-bit keys whose layout makes tree order equal
//! address order, so a plain in-order walk emits sorted results.

use crate::config::TcpFlags;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Magic stamped on every IP report.
pub const IP_REPORT_MAGIC: u32 = 0xd2d19ff2;

/// Magic stamped on every ARP report.
pub const ARP_REPORT_MAGIC: u32 = 0xd9d82aca;

/// Magic stamped on trace-path reports ("TRPT").
pub const TRACE_PATH_MAGIC: u32 = 0x54525054;

/// Maximum hops carried in a trace-path report.
pub const TRACE_PATH_MAX_HOPS: usize = 64;

/// Report flag: the frame's network-layer checksum was wrong.
pub const REPORT_BADNETWORK_CKSUM: u16 = 0x0001;

/// Report flag: the frame's transport-layer checksum was wrong.
pub const REPORT_BADTRANSPORT_CKSUM: u16 = 0x0002;

/// Post-processing data attached to a report by enrichment hooks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputData {
    /// OS guess from a fingerprint matcher.
    Os(String),
    /// Service banner (raw grab or binary-parse summary).
    Banner(String),
}

/// One response event for an IP-level probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpReport {
    /// `IP_REPORT_MAGIC`.
    pub magic: u32,
    /// Source port of the response as seen on the wire: the target's
    /// answering port (the port we probed).
    pub sport: u16,
    /// Destination port of the response: our local source port, possibly
    /// carrying payload-index or TTL encoding.
    pub dport: u16,
    /// IP protocol of the response.
    pub proto: u8,
    /// ICMP type, or the TCP flag byte.
    pub type_: u16,
    /// ICMP code; unused for TCP/UDP.
    pub subtype: u16,
    /// Address our probe claimed to come from.
    pub send_addr: Ipv4Addr,
    /// The scanned host.
    pub host_addr: Ipv4Addr,
    /// For ICMP errors, the intermediate hop that answered.
    pub trace_addr: Ipv4Addr,
    /// TTL observed on the wire.
    pub ttl: u8,
    /// Capture timestamp.
    pub recv_time: DateTime<Utc>,
    /// Bad-checksum flags.
    pub flags: u16,
    /// Our expected ISN (the cookie).
    pub mseq: u32,
    /// The target's sequence number.
    pub tseq: u32,
    /// TCP window size.
    pub window_size: u16,
    /// Ethernet source MAC when the responder was L2-local.
    pub eth_hwaddr: Option<[u8; 6]>,
    /// Enrichment results, in attach order.
    pub output: Vec<OutputData>,
    /// Raw response payload bytes, when layer return was requested.
    pub packet: Option<Vec<u8>>,
}

impl IpReport {
    /// A blank report for the given endpoints; callers fill in the rest.
    pub fn new(host_addr: Ipv4Addr, send_addr: Ipv4Addr, sport: u16, dport: u16, proto: u8) -> Self {
        Self {
            magic: IP_REPORT_MAGIC,
            sport,
            dport,
            proto,
            type_: 0,
            subtype: 0,
            send_addr,
            host_addr,
            trace_addr: Ipv4Addr::UNSPECIFIED,
            ttl: 0,
            recv_time: Utc::now(),
            flags: 0,
            mseq: 0,
            tseq: 0,
            window_size: 0,
            eth_hwaddr: None,
            output: Vec::new(),
            packet: None,
        }
    }

    /// Whether this is a TCP response carrying SYN+ACK (open port).
    pub fn is_open_tcp(&self) -> bool {
        self.proto == 6
            && TcpFlags(self.type_ as u8).has(TcpFlags::SYN.with(TcpFlags::ACK))
    }

    /// Whether this is a TCP RST (closed port).
    pub fn is_closed_tcp(&self) -> bool {
        self.proto == 6 && TcpFlags(self.type_ as u8).has(TcpFlags::RST)
    }

    /// Dedupe key: high 32 bits are the host address, then the responding
    /// port, then a 16-bit fold of the send address. Key order is host order.
    pub fn key(&self) -> u64 {
        ip_report_key(self.host_addr, self.sport, self.send_addr)
    }
}

/// One ARP reply event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArpReport {
    /// `ARP_REPORT_MAGIC`.
    pub magic: u32,
    /// Hardware address from the reply.
    pub hwaddr: [u8; 6],
    /// The answering host.
    pub ipaddr: Ipv4Addr,
    /// Capture timestamp.
    pub recv_time: DateTime<Utc>,
    /// Bad-checksum flags (kept for symmetry; ARP has no checksum).
    pub flags: u16,
    /// Raw frame bytes, when layer return was requested.
    pub packet: Option<Vec<u8>>,
}

impl ArpReport {
    pub fn new(ipaddr: Ipv4Addr, hwaddr: [u8; 6]) -> Self {
        Self {
            magic: ARP_REPORT_MAGIC,
            hwaddr,
            ipaddr,
            recv_time: Utc::now(),
            flags: 0,
            packet: None,
        }
    }

    /// Dedupe key: IP in the high 32 bits (sort-by-key = sort-by-IP), a
    /// folded MAC below.
    pub fn key(&self) -> u64 {
        arp_report_key(self.ipaddr, &self.hwaddr)
    }
}

/// Hop flags for trace reports.
pub const TRACE_HOP_NONE: u8 = 0x00;
pub const TRACE_HOP_RECV: u8 = 0x01;
pub const TRACE_HOP_DEST: u8 = 0x02;
pub const TRACE_HOP_UNREACH: u8 = 0x04;

/// One hop of a completed traceroute path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracePathHop {
    /// Router that answered (ICMP source, or the target itself).
    pub router_addr: Ipv4Addr,
    /// Position in the path (the TTL that elicited the answer).
    pub hop_number: u8,
    /// Round-trip time in microseconds; 0 when unknown.
    pub rtt_us: u32,
    /// `TRACE_HOP_*` flags.
    pub flags: u8,
}

/// Complete traceroute path, emitted once per finished session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracePathReport {
    /// `TRACE_PATH_MAGIC`.
    pub magic: u32,
    /// Destination we traced toward.
    pub target_addr: Ipv4Addr,
    /// Destination port used for the probes.
    pub target_port: u16,
    /// 1 if the destination answered, 0 if we ran out of TTLs.
    pub complete: bool,
    /// Hops in send (TTL) order.
    pub hops: Vec<TracePathHop>,
}

/// Compute the IP-report dedupe key.
pub fn ip_report_key(host: Ipv4Addr, sport: u16, send: Ipv4Addr) -> u64 {
    let host = u32::from(host) as u64;
    let send = u32::from(send);
    let folded = ((send >> 16) as u16 ^ (send & 0xffff) as u16) as u64;
    (host << 32) | ((sport as u64) << 16) | folded
}

/// Compute the ARP-report dedupe key.
pub fn arp_report_key(host: Ipv4Addr, mac: &[u8; 6]) -> u64 {
    let host = u32::from(host) as u64;
    let folded = u32::from_be_bytes([mac[0] ^ mac[1], mac[3] ^ mac[2], mac[4], mac[5]]) as u64;
    (host << 32) | folded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_key_sorts_by_host() {
        let a = ip_report_key(Ipv4Addr::new(10, 0, 0, 1), 80, Ipv4Addr::new(1, 2, 3, 4));
        let b = ip_report_key(Ipv4Addr::new(10, 0, 0, 2), 22, Ipv4Addr::new(1, 2, 3, 4));
        assert!(a < b, "lower address must sort first regardless of port");
    }

    #[test]
    fn test_ip_key_distinguishes_port_and_sender() {
        let host = Ipv4Addr::new(10, 0, 0, 1);
        let k1 = ip_report_key(host, 80, Ipv4Addr::new(1, 2, 3, 4));
        let k2 = ip_report_key(host, 81, Ipv4Addr::new(1, 2, 3, 4));
        let k3 = ip_report_key(host, 80, Ipv4Addr::new(1, 2, 3, 5));
        assert_ne!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_arp_key_sorts_by_ip() {
        let mac_a = [0xde, 0xad, 0xbe, 0xef, 0x00, 0x01];
        let mac_b = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
        let a = arp_report_key(Ipv4Addr::new(192, 168, 77, 3), &mac_b);
        let b = arp_report_key(Ipv4Addr::new(192, 168, 77, 4), &mac_a);
        assert!(a < b);
    }

    #[test]
    fn test_report_flag_composition() {
        let mut report = IpReport::new(
            Ipv4Addr::new(10, 0, 0, 9),
            Ipv4Addr::new(10, 0, 0, 1),
            80,
            55555,
            6,
        );
        report.flags |= REPORT_BADNETWORK_CKSUM;
        report.flags |= REPORT_BADTRANSPORT_CKSUM;
        // Both bad-checksum flags may coexist on one report.
        assert_eq!(
            report.flags,
            REPORT_BADNETWORK_CKSUM | REPORT_BADTRANSPORT_CKSUM
        );
    }

    #[test]
    fn test_tcp_state_helpers() {
        let mut report = IpReport::new(
            Ipv4Addr::new(10, 0, 0, 9),
            Ipv4Addr::new(10, 0, 0, 1),
            22,
            55555,
            6,
        );
        report.type_ = (TcpFlags::SYN.with(TcpFlags::ACK)).bits() as u16;
        assert!(report.is_open_tcp());
        assert!(!report.is_closed_tcp());

        report.type_ = (TcpFlags::RST.with(TcpFlags::ACK)).bits() as u16;
        assert!(report.is_closed_tcp());
        assert!(!report.is_open_tcp());
    }
}
