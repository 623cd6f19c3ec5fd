//! Frame builders and parsers for Ethernet/ARP/IPv4/TCP/UDP/ICMP
//!
//! Builders produce complete wire-ready byte vectors with checksums filled
//! in; parsers are zero-copy views over captured frames that expose header
//! fields and payload slices. Both sides use the explicit byte readers in
//! [`crate::wire`]; nothing here relies on struct layout or alignment.
//!
//! Option blobs (IP options, TCP options) are copied verbatim and padded to
//! 32-bit boundaries; the caller owns their contents.

use crate::checksum;
use crate::wire::{put_u16_be, put_u32_be, u16_be, u32_be};
use std::net::Ipv4Addr;

/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// EtherType for ARP.
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// IP protocol numbers.
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// ICMP types the listener understands.
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_DEST_UNREACH: u8 = 3;
pub const ICMP_ECHO: u8 = 8;
pub const ICMP_TIME_EXCEEDED: u8 = 11;

/// The broadcast MAC.
pub const MAC_BROADCAST: [u8; 6] = [0xff; 6];

/// Stock TCP options for outbound SYNs:
/// MSS=1460, SACK-permitted, NOP, NOP, window scale 7, NOP pad.
pub fn default_tcp_options() -> Vec<u8> {
    vec![
        0x02, 0x04, 0x05, 0xb4, // MSS 1460
        0x04, 0x02, // SACK permitted
        0x01, 0x01, // NOP NOP
        0x03, 0x03, 0x07, // WScale 7
        0x01, // NOP pad to 12 bytes
    ]
}

/// Build an Ethernet II frame around a payload.
pub fn build_ethernet(dst: &[u8; 6], src: &[u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(14 + payload.len());
    frame.extend_from_slice(dst);
    frame.extend_from_slice(src);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Parsed view of an Ethernet II frame.
#[derive(Debug, Clone, Copy)]
pub struct EthernetView<'a> {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ethertype: u16,
    pub payload: &'a [u8],
}

impl<'a> EthernetView<'a> {
    pub fn parse(frame: &'a [u8]) -> Option<Self> {
        if frame.len() < 14 {
            return None;
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&frame[0..6]);
        src.copy_from_slice(&frame[6..12]);
        Some(Self {
            dst,
            src,
            ethertype: u16_be(frame, 12)?,
            payload: &frame[14..],
        })
    }
}

/// Build an ARP request asking who-has `target_ip` (28-byte ARP body).
pub fn build_arp_request(src_mac: &[u8; 6], src_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    let mut arp = vec![0u8; 28];
    put_u16_be(&mut arp, 0, 1); // hardware: Ethernet
    put_u16_be(&mut arp, 2, ETHERTYPE_IPV4); // protocol: IPv4
    arp[4] = 6; // hardware size
    arp[5] = 4; // protocol size
    put_u16_be(&mut arp, 6, 1); // opcode: request
    arp[8..14].copy_from_slice(src_mac);
    arp[14..18].copy_from_slice(&src_ip.octets());
    // target MAC left zero
    arp[24..28].copy_from_slice(&target_ip.octets());
    arp
}

/// Parsed view of an ARP packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpView {
    pub opcode: u16,
    pub sender_mac: [u8; 6],
    pub sender_ip: Ipv4Addr,
    pub target_mac: [u8; 6],
    pub target_ip: Ipv4Addr,
}

impl ArpView {
    pub const OP_REQUEST: u16 = 1;
    pub const OP_REPLY: u16 = 2;

    pub fn parse(body: &[u8]) -> Option<Self> {
        if body.len() < 28 {
            return None;
        }
        // Only Ethernet/IPv4 ARP is interesting.
        if u16_be(body, 0)? != 1 || u16_be(body, 2)? != ETHERTYPE_IPV4 {
            return None;
        }
        if body[4] != 6 || body[5] != 4 {
            return None;
        }
        let mut sender_mac = [0u8; 6];
        let mut target_mac = [0u8; 6];
        sender_mac.copy_from_slice(&body[8..14]);
        target_mac.copy_from_slice(&body[18..24]);
        Some(Self {
            opcode: u16_be(body, 6)?,
            sender_mac,
            sender_ip: Ipv4Addr::new(body[14], body[15], body[16], body[17]),
            target_mac,
            target_ip: Ipv4Addr::new(body[24], body[25], body[26], body[27]),
        })
    }

    pub fn is_reply(&self) -> bool {
        self.opcode == Self::OP_REPLY
    }
}

/// IPv4 header builder.
#[derive(Debug, Clone)]
pub struct Ipv4Builder {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub ttl: u8,
    pub tos: u8,
    pub id: u16,
    pub frag_off: u16,
    pub options: Vec<u8>,
}

impl Ipv4Builder {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, proto: u8) -> Self {
        Self {
            src,
            dst,
            proto,
            ttl: 64,
            tos: 0,
            id: 0,
            frag_off: 0,
            options: Vec::new(),
        }
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn id(mut self, id: u16) -> Self {
        self.id = id;
        self
    }

    pub fn frag_off(mut self, frag_off: u16) -> Self {
        self.frag_off = frag_off;
        self
    }

    pub fn options(mut self, options: Vec<u8>) -> Self {
        self.options = options;
        self
    }

    /// Emit the header plus payload, checksum computed.
    pub fn build(&self, payload: &[u8]) -> Vec<u8> {
        // Options padded to a 32-bit boundary; IHL caps options at 40 bytes.
        let mut options = self.options.clone();
        options.truncate(40);
        while options.len() % 4 != 0 {
            options.push(0); // EOL padding
        }

        let header_len = 20 + options.len();
        let total_len = header_len + payload.len();
        let mut pkt = vec![0u8; total_len];

        pkt[0] = 0x40 | (header_len / 4) as u8; // version 4 + IHL
        pkt[1] = self.tos;
        put_u16_be(&mut pkt, 2, total_len as u16);
        put_u16_be(&mut pkt, 4, self.id);
        put_u16_be(&mut pkt, 6, self.frag_off);
        pkt[8] = self.ttl;
        pkt[9] = self.proto;
        // checksum at 10..12 stays zero for the computation
        pkt[12..16].copy_from_slice(&self.src.octets());
        pkt[16..20].copy_from_slice(&self.dst.octets());
        pkt[20..20 + options.len()].copy_from_slice(&options);

        let cksum = checksum::rfc1071(&pkt[..header_len]);
        put_u16_be(&mut pkt, 10, cksum);

        pkt[header_len..].copy_from_slice(payload);
        pkt
    }
}

/// Parsed view of an IPv4 packet.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4View<'a> {
    pub header_len: usize,
    pub tos: u8,
    pub total_len: u16,
    pub id: u16,
    pub frag_off: u16,
    pub ttl: u8,
    pub proto: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    header: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> Ipv4View<'a> {
    pub fn parse(pkt: &'a [u8]) -> Option<Self> {
        if pkt.len() < 20 {
            return None;
        }
        if pkt[0] >> 4 != 4 {
            return None;
        }
        let header_len = ((pkt[0] & 0x0f) as usize) * 4;
        if header_len < 20 || pkt.len() < header_len {
            return None;
        }
        let total_len = u16_be(pkt, 2)?;
        // Tolerate captures longer than total_len (padding) but not shorter
        // headers than claimed payload.
        let end = (total_len as usize).clamp(header_len, pkt.len());
        Some(Self {
            header_len,
            tos: pkt[1],
            total_len,
            id: u16_be(pkt, 4)?,
            frag_off: u16_be(pkt, 6)?,
            ttl: pkt[8],
            proto: pkt[9],
            src: Ipv4Addr::new(pkt[12], pkt[13], pkt[14], pkt[15]),
            dst: Ipv4Addr::new(pkt[16], pkt[17], pkt[18], pkt[19]),
            header: &pkt[..header_len],
            payload: &pkt[header_len..end],
        })
    }

    /// RFC 1071 verification over the header bytes.
    pub fn checksum_ok(&self) -> bool {
        checksum::verify(self.header)
    }
}

/// TCP segment builder.
#[derive(Debug, Clone)]
pub struct TcpBuilder {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub urgent: u16,
    pub options: Vec<u8>,
}

impl TcpBuilder {
    pub fn new(sport: u16, dport: u16, flags: u8) -> Self {
        Self {
            sport,
            dport,
            seq: 0,
            ack: 0,
            flags,
            window: 4096,
            urgent: 0,
            options: Vec::new(),
        }
    }

    pub fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn ack(mut self, ack: u32) -> Self {
        self.ack = ack;
        self
    }

    pub fn window(mut self, window: u16) -> Self {
        self.window = window;
        self
    }

    pub fn options(mut self, options: Vec<u8>) -> Self {
        self.options = options;
        self
    }

    /// Emit the segment with the pseudo-header checksum for `src`/`dst`.
    pub fn build(&self, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let mut options = self.options.clone();
        options.truncate(40);
        while options.len() % 4 != 0 {
            options.push(0x01); // NOP padding
        }

        let header_len = 20 + options.len();
        let mut seg = vec![0u8; header_len + payload.len()];

        put_u16_be(&mut seg, 0, self.sport);
        put_u16_be(&mut seg, 2, self.dport);
        put_u32_be(&mut seg, 4, self.seq);
        put_u32_be(&mut seg, 8, self.ack);
        seg[12] = ((header_len / 4) as u8) << 4;
        seg[13] = self.flags;
        put_u16_be(&mut seg, 14, self.window);
        // checksum at 16..18 zero for now
        put_u16_be(&mut seg, 18, self.urgent);
        seg[20..20 + options.len()].copy_from_slice(&options);
        seg[header_len..].copy_from_slice(payload);

        let cksum = checksum::transport(src, dst, IPPROTO_TCP, &seg);
        put_u16_be(&mut seg, 16, cksum);
        seg
    }
}

/// Parsed view of a TCP segment.
#[derive(Debug, Clone, Copy)]
pub struct TcpView<'a> {
    pub sport: u16,
    pub dport: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub header_len: usize,
    segment: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> TcpView<'a> {
    pub fn parse(seg: &'a [u8]) -> Option<Self> {
        if seg.len() < 20 {
            return None;
        }
        let header_len = ((seg[12] >> 4) as usize) * 4;
        if header_len < 20 || seg.len() < header_len {
            return None;
        }
        Some(Self {
            sport: u16_be(seg, 0)?,
            dport: u16_be(seg, 2)?,
            seq: u32_be(seg, 4)?,
            ack: u32_be(seg, 8)?,
            flags: seg[13],
            window: u16_be(seg, 14)?,
            header_len,
            segment: seg,
            payload: &seg[header_len..],
        })
    }

    /// Pseudo-header checksum verification.
    pub fn checksum_ok(&self, src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        checksum::verify_transport(src, dst, IPPROTO_TCP, self.segment)
    }
}

/// Build a UDP datagram with the pseudo-header checksum.
pub fn build_udp(src: Ipv4Addr, dst: Ipv4Addr, sport: u16, dport: u16, payload: &[u8]) -> Vec<u8> {
    let len = 8 + payload.len();
    let mut dgram = vec![0u8; len];
    put_u16_be(&mut dgram, 0, sport);
    put_u16_be(&mut dgram, 2, dport);
    put_u16_be(&mut dgram, 4, len as u16);
    dgram[8..].copy_from_slice(payload);

    let mut cksum = checksum::transport(src, dst, IPPROTO_UDP, &dgram);
    if cksum == 0 {
        cksum = 0xffff; // UDP transmits all-ones for a zero checksum
    }
    put_u16_be(&mut dgram, 6, cksum);
    dgram
}

/// Parsed view of a UDP datagram.
#[derive(Debug, Clone, Copy)]
pub struct UdpView<'a> {
    pub sport: u16,
    pub dport: u16,
    pub length: u16,
    pub checksum: u16,
    datagram: &'a [u8],
    pub payload: &'a [u8],
}

impl<'a> UdpView<'a> {
    pub fn parse(dgram: &'a [u8]) -> Option<Self> {
        if dgram.len() < 8 {
            return None;
        }
        Some(Self {
            sport: u16_be(dgram, 0)?,
            dport: u16_be(dgram, 2)?,
            length: u16_be(dgram, 4)?,
            checksum: u16_be(dgram, 6)?,
            datagram: dgram,
            payload: &dgram[8..],
        })
    }

    /// Checksum verification; zero means "not computed" and passes.
    pub fn checksum_ok(&self, src: Ipv4Addr, dst: Ipv4Addr) -> bool {
        if self.checksum == 0 {
            return true;
        }
        checksum::verify_transport(src, dst, IPPROTO_UDP, self.datagram)
    }
}

/// Build an ICMP echo request.
pub fn build_icmp_echo(ident: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut msg = vec![0u8; 8 + payload.len()];
    msg[0] = ICMP_ECHO;
    put_u16_be(&mut msg, 4, ident);
    put_u16_be(&mut msg, 6, seq);
    msg[8..].copy_from_slice(payload);
    let cksum = checksum::rfc1071(&msg);
    put_u16_be(&mut msg, 2, cksum);
    msg
}

/// Parsed view of an ICMP message.
#[derive(Debug, Clone, Copy)]
pub struct IcmpView<'a> {
    pub type_: u8,
    pub code: u8,
    message: &'a [u8],
    /// Bytes after the 8-byte ICMP header.
    pub payload: &'a [u8],
}

impl<'a> IcmpView<'a> {
    pub fn parse(msg: &'a [u8]) -> Option<Self> {
        if msg.len() < 8 {
            return None;
        }
        Some(Self {
            type_: msg[0],
            code: msg[1],
            message: msg,
            payload: &msg[8..],
        })
    }

    pub fn checksum_ok(&self) -> bool {
        checksum::verify(self.message)
    }

    /// Echo identifier for echo/echo-reply messages.
    pub fn echo_ident(&self) -> Option<u16> {
        u16_be(self.message, 4)
    }

    /// Echo sequence for echo/echo-reply messages.
    pub fn echo_seq(&self) -> Option<u16> {
        u16_be(self.message, 6)
    }

    /// For Destination-Unreachable and Time-Exceeded: the quoted original
    /// datagram (IP header + at least 8 transport bytes, per RFC 792).
    pub fn embedded_datagram(&self) -> Option<Ipv4View<'a>> {
        if self.type_ != ICMP_DEST_UNREACH && self.type_ != ICMP_TIME_EXCEEDED {
            return None;
        }
        Ipv4View::parse(self.payload)
    }
}

/// Ports recovered from the quoted datagram inside an ICMP error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedProbe {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub sport: u16,
    pub dport: u16,
    /// TCP sequence number when the quote includes it (it fits inside the
    /// guaranteed 8 transport bytes), letting the listener verify the SYN
    /// cookie of the original probe.
    pub tcp_seq: Option<u32>,
}

/// Extract the original probe tuple from an ICMP error's quoted datagram.
/// Only the first 8 transport bytes are guaranteed present; ports live there
/// for both TCP and UDP, and for TCP the sequence number rounds them out.
pub fn parse_embedded_probe(icmp: &IcmpView<'_>) -> Option<EmbeddedProbe> {
    let inner = icmp.embedded_datagram()?;
    if inner.payload.len() < 4 {
        return None;
    }
    let tcp_seq = if inner.proto == IPPROTO_TCP {
        u32_be(inner.payload, 4)
    } else {
        None
    };
    Some(EmbeddedProbe {
        src: inner.src,
        dst: inner.dst,
        proto: inner.proto,
        sport: u16_be(inner.payload, 0)?,
        dport: u16_be(inner.payload, 2)?,
        tcp_seq,
    })
}
