//! Network plumbing for unicornscan
//!
//! The byte-wise packet codec (build and parse, RFC 1071 checksums), the
//! capture/injection abstraction over pcap with BPF filtering, interface
//! detection, and the Linux receive-offload guard. Everything here is
//! stateless with respect to the scan; probe correlation lives in
//! `unicornscan-core`.

pub mod capture;
pub mod checksum;
pub mod interface;
pub mod offload;
pub mod packet;
pub mod wire;

pub use capture::{strip_link, CapturedFrame, LinkLayer, PacketCapture, PcapCapture};
pub use interface::{enumerate_interfaces, find_by_name, find_for_target, NetInterface};
pub use offload::OffloadGuard;
pub use packet::{
    build_arp_request, build_ethernet, build_icmp_echo, build_udp, default_tcp_options,
    parse_embedded_probe, ArpView, EmbeddedProbe, EthernetView, IcmpView, Ipv4Builder, Ipv4View,
    TcpBuilder, TcpView, UdpView, ETHERTYPE_ARP, ETHERTYPE_IPV4, ICMP_DEST_UNREACH, ICMP_ECHO,
    ICMP_ECHO_REPLY, ICMP_TIME_EXCEEDED, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP, MAC_BROADCAST,
};
