//! Passive response capture and classification
//!
//! The listener owns a pcap handle with a BPF filter shaped by the current
//! recv-workunit and turns raw frames into reports. It keeps no connection
//! table: a response is trusted if and only if the SYN cookie recomputed
//! from its headers matches what the sender must have embedded.
//!
//! Classification, per frame:
//! - ARP reply: ARP report (the master feeds it to the phase filter during
//!   an ARP phase).
//! - TCP SYN-ACK or RST: cookie check against `ack - 1`, then an open or
//!   closed report. A SYN-ACK whose destination port carries TTL encoding
//!   completes the matching trace session instead.
//! - ICMP echo reply: cookie check against the echo ident/seq pair.
//! - ICMP Destination-Unreachable / Time-Exceeded: the quoted original
//!   datagram gives back the probe tuple; its cookie is checked against the
//!   quoted TCP sequence number. Time-Exceeded for a trace-encoded source
//!   port records a hop; everything else reports with `trace_addr` set.
//! - UDP: the source port must be one the recv-workunit expects.
//!
//! Checksum failures drop the frame unless broken-report mode was requested,
//! in which case the report goes out flagged.

use crate::trace::TraceTable;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};
use unicornscan_core::workunit::ARP_RECV_MAGIC;
use unicornscan_core::{
    decode_trace_ttl, syn_cookie, ArpReport, IpReport, RecvWorkunit, Result, TcpFlags,
    REPORT_BADNETWORK_CKSUM, REPORT_BADTRANSPORT_CKSUM, TRACE_HOP_RECV, TRACE_HOP_UNREACH,
};
use unicornscan_net::{
    parse_embedded_probe, strip_link, ArpView, IcmpView, Ipv4View, PacketCapture, TcpView,
    UdpView, ETHERTYPE_ARP, ETHERTYPE_IPV4, ICMP_DEST_UNREACH, ICMP_ECHO_REPLY,
    ICMP_TIME_EXCEEDED, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP,
};

/// What one frame classified into.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Ip(IpReport),
    Arp(ArpReport),
    /// A trace hop was recorded into the table; nothing to forward yet.
    TraceHop,
}

/// Everything classification needs besides the frame itself.
#[derive(Debug, Clone)]
pub struct ListenerContext {
    /// The scan's cookie key (must match the send-workunits).
    pub syn_key: u32,
    /// Our source address as probes claimed it.
    pub local_ip: Ipv4Addr,
    /// Netmask of the capture interface, for L2-locality of responders.
    pub netmask: Ipv4Addr,
    /// Report instead of drop on bad network checksum.
    pub report_broken_net: bool,
    /// Report instead of drop on bad transport checksum.
    pub report_broken_trans: bool,
    /// Ports a UDP response may legitimately come from.
    pub expected_udp_ports: HashSet<u16>,
    /// Request raw payload bytes attached to reports.
    pub want_payload: bool,
}

impl ListenerContext {
    /// Build from a recv-workunit plus the scan facts it does not carry.
    pub fn from_workunit(
        wu: &RecvWorkunit,
        local_ip: Ipv4Addr,
        netmask: Ipv4Addr,
        expected_udp_ports: HashSet<u16>,
    ) -> Self {
        Self {
            syn_key: wu.syn_key,
            local_ip,
            netmask,
            report_broken_net: wu.report_broken_net,
            report_broken_trans: wu.report_broken_trans,
            expected_udp_ports,
            want_payload: wu.ret_layers != 0 || wu.do_connect,
        }
    }

    fn is_l2_local(&self, addr: Ipv4Addr) -> bool {
        let m = u32::from(self.netmask);
        (u32::from(addr) & m) == (u32::from(self.local_ip) & m)
    }
}

/// Drop counters kept by the classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenStats {
    pub frames: u64,
    pub reports: u64,
    pub bad_cksum_dropped: u64,
    pub cookie_mismatch: u64,
    pub unexpected_port: u64,
    pub unparsed: u64,
}

/// Frame classifier plus the trace state it updates in place.
pub struct Classifier {
    ctx: ListenerContext,
    trace: Option<Arc<Mutex<TraceTable>>>,
    pub stats: ListenStats,
}

impl Classifier {
    pub fn new(ctx: ListenerContext) -> Self {
        Self {
            ctx,
            trace: None,
            stats: ListenStats::default(),
        }
    }

    pub fn with_trace_table(mut self, table: Arc<Mutex<TraceTable>>) -> Self {
        self.trace = Some(table);
        self
    }

    /// Classify one link-stripped frame.
    ///
    /// `ethertype` and `src_mac` come from the link header when the framing
    /// has one; `when` is the capture timestamp.
    pub fn classify(
        &mut self,
        net: &[u8],
        ethertype: Option<u16>,
        src_mac: Option<[u8; 6]>,
        when: DateTime<Utc>,
    ) -> Option<ListenerEvent> {
        self.stats.frames += 1;

        if ethertype == Some(ETHERTYPE_ARP) {
            return self.classify_arp(net, when);
        }
        if ethertype.is_some() && ethertype != Some(ETHERTYPE_IPV4) {
            return None;
        }
        self.classify_ipv4(net, src_mac, when)
    }

    fn classify_arp(&mut self, body: &[u8], when: DateTime<Utc>) -> Option<ListenerEvent> {
        let arp = ArpView::parse(body).or_else(|| {
            self.stats.unparsed += 1;
            None
        })?;
        if !arp.is_reply() {
            return None;
        }
        let mut report = ArpReport::new(arp.sender_ip, arp.sender_mac);
        report.recv_time = when;
        self.stats.reports += 1;
        Some(ListenerEvent::Arp(report))
    }

    fn classify_ipv4(
        &mut self,
        net: &[u8],
        src_mac: Option<[u8; 6]>,
        when: DateTime<Utc>,
    ) -> Option<ListenerEvent> {
        let ip = Ipv4View::parse(net).or_else(|| {
            self.stats.unparsed += 1;
            None
        })?;

        // Only traffic aimed at us is interesting.
        if ip.dst != self.ctx.local_ip {
            return None;
        }

        let mut flags = 0u16;
        if !ip.checksum_ok() {
            if !self.ctx.report_broken_net {
                self.stats.bad_cksum_dropped += 1;
                return None;
            }
            flags |= REPORT_BADNETWORK_CKSUM;
        }

        let event = match ip.proto {
            IPPROTO_TCP => self.classify_tcp(&ip, flags, when),
            IPPROTO_UDP => self.classify_udp(&ip, flags, when),
            IPPROTO_ICMP => self.classify_icmp(&ip, flags, when),
            _ => None,
        };

        match event {
            Some(ListenerEvent::Ip(mut report)) => {
                // L2-local responders get their MAC attached for history
                // tracking downstream.
                if let Some(mac) = src_mac {
                    if self.ctx.is_l2_local(report.host_addr) {
                        report.eth_hwaddr = Some(mac);
                    }
                }
                self.stats.reports += 1;
                Some(ListenerEvent::Ip(report))
            }
            other => other,
        }
    }

    fn classify_tcp(
        &mut self,
        ip: &Ipv4View<'_>,
        mut flags: u16,
        when: DateTime<Utc>,
    ) -> Option<ListenerEvent> {
        let tcp = TcpView::parse(ip.payload).or_else(|| {
            self.stats.unparsed += 1;
            None
        })?;

        if !tcp.checksum_ok(ip.src, ip.dst) {
            if !self.ctx.report_broken_trans {
                self.stats.bad_cksum_dropped += 1;
                return None;
            }
            flags |= REPORT_BADTRANSPORT_CKSUM;
        }

        let th = TcpFlags(tcp.flags);
        let syn_ack = th.has(TcpFlags::SYN.with(TcpFlags::ACK));
        let rst = th.has(TcpFlags::RST);
        if !syn_ack && !rst {
            return None;
        }

        // The response's dport is our original source port; its sport is the
        // port we probed. The cookie was computed over the probe orientation.
        if !unicornscan_core::verify_cookie(
            tcp.ack,
            self.ctx.local_ip,
            ip.src,
            tcp.dport,
            tcp.sport,
            self.ctx.syn_key,
        ) {
            self.stats.cookie_mismatch += 1;
            trace!(src = %ip.src, sport = tcp.sport, "cookie mismatch, spurious");
            return None;
        }

        // A SYN-ACK answering a TTL-encoded probe completes its trace.
        if syn_ack {
            if let (Some(table), Some(ttl)) = (&self.trace, decode_trace_ttl(tcp.dport)) {
                table
                    .lock()
                    .get_mut(ip.src, tcp.sport)
                    .map(|session| session.record_destination(ttl, when));
                return Some(ListenerEvent::TraceHop);
            }
        }

        let mut report = IpReport::new(ip.src, ip.dst, tcp.sport, tcp.dport, IPPROTO_TCP);
        report.type_ = tcp.flags as u16;
        report.ttl = ip.ttl;
        report.recv_time = when;
        report.flags = flags;
        report.mseq = tcp.ack.wrapping_sub(1);
        report.tseq = tcp.seq;
        report.window_size = tcp.window;
        if self.ctx.want_payload && !tcp.payload.is_empty() {
            report.packet = Some(tcp.payload.to_vec());
        }
        Some(ListenerEvent::Ip(report))
    }

    fn classify_udp(
        &mut self,
        ip: &Ipv4View<'_>,
        mut flags: u16,
        when: DateTime<Utc>,
    ) -> Option<ListenerEvent> {
        let udp = UdpView::parse(ip.payload).or_else(|| {
            self.stats.unparsed += 1;
            None
        })?;

        if !udp.checksum_ok(ip.src, ip.dst) {
            if !self.ctx.report_broken_trans {
                self.stats.bad_cksum_dropped += 1;
                return None;
            }
            flags |= REPORT_BADTRANSPORT_CKSUM;
        }

        // Responses come back from the port we probed.
        if !self.ctx.expected_udp_ports.is_empty()
            && !self.ctx.expected_udp_ports.contains(&udp.sport)
        {
            self.stats.unexpected_port += 1;
            return None;
        }

        let mut report = IpReport::new(ip.src, ip.dst, udp.sport, udp.dport, IPPROTO_UDP);
        report.ttl = ip.ttl;
        report.recv_time = when;
        report.flags = flags;
        if self.ctx.want_payload && !udp.payload.is_empty() {
            report.packet = Some(udp.payload.to_vec());
        }
        Some(ListenerEvent::Ip(report))
    }

    fn classify_icmp(
        &mut self,
        ip: &Ipv4View<'_>,
        mut flags: u16,
        when: DateTime<Utc>,
    ) -> Option<ListenerEvent> {
        let icmp = IcmpView::parse(ip.payload).or_else(|| {
            self.stats.unparsed += 1;
            None
        })?;

        if !icmp.checksum_ok() {
            if !self.ctx.report_broken_trans {
                self.stats.bad_cksum_dropped += 1;
                return None;
            }
            flags |= REPORT_BADTRANSPORT_CKSUM;
        }

        match icmp.type_ {
            ICMP_ECHO_REPLY => {
                // Echo probes carried the cookie split across ident/seq.
                let cookie = syn_cookie(self.ctx.local_ip, ip.src, 0, 0, self.ctx.syn_key);
                let carried = ((icmp.echo_ident()? as u32) << 16) | icmp.echo_seq()? as u32;
                if cookie != carried {
                    self.stats.cookie_mismatch += 1;
                    return None;
                }
                let mut report = IpReport::new(ip.src, ip.dst, 0, 0, IPPROTO_ICMP);
                report.type_ = icmp.type_ as u16;
                report.subtype = icmp.code as u16;
                report.ttl = ip.ttl;
                report.recv_time = when;
                report.flags = flags;
                Some(ListenerEvent::Ip(report))
            }
            ICMP_DEST_UNREACH | ICMP_TIME_EXCEEDED => {
                let probe = parse_embedded_probe(&icmp).or_else(|| {
                    self.stats.unparsed += 1;
                    None
                })?;

                // The quote must be one of our probes.
                if probe.src != self.ctx.local_ip {
                    return None;
                }
                if let Some(seq) = probe.tcp_seq {
                    let expected = syn_cookie(
                        probe.src,
                        probe.dst,
                        probe.sport,
                        probe.dport,
                        self.ctx.syn_key,
                    );
                    if seq != expected {
                        self.stats.cookie_mismatch += 1;
                        return None;
                    }
                }

                // Trace-encoded source ports route Time-Exceeded (and
                // unreachable) answers into the trace table.
                if let (Some(table), Some(ttl)) = (&self.trace, decode_trace_ttl(probe.sport)) {
                    let hop_flags = if icmp.type_ == ICMP_TIME_EXCEEDED {
                        TRACE_HOP_RECV
                    } else {
                        TRACE_HOP_UNREACH
                    };
                    table
                        .lock()
                        .get_mut(probe.dst, probe.dport)
                        .map(|session| session.record_hop(ttl, ip.src, when, hop_flags));
                    return Some(ListenerEvent::TraceHop);
                }

                let mut report =
                    IpReport::new(probe.dst, probe.src, probe.dport, probe.sport, IPPROTO_ICMP);
                report.type_ = icmp.type_ as u16;
                report.subtype = icmp.code as u16;
                report.trace_addr = ip.src;
                report.ttl = ip.ttl;
                report.recv_time = when;
                report.flags = flags;
                Some(ListenerEvent::Ip(report))
            }
            _ => None,
        }
    }
}

/// Build the default BPF filter for a recv-workunit.
///
/// ARP and ICMP always pass (phase filter and trace hops need them); the
/// transport clause pins responses to our address.
pub fn default_bpf_filter(wu: &RecvWorkunit, local_ip: Ipv4Addr) -> String {
    if let Some(filter) = &wu.pcap_filter {
        return filter.clone();
    }
    if wu.magic == ARP_RECV_MAGIC {
        return "arp".to_string();
    }
    format!(
        "arp or (icmp and dst host {ip}) or ((tcp or udp) and dst host {ip})",
        ip = local_ip
    )
}

/// The listener half of a drone: capture loop feeding a report channel.
pub struct Listener {
    capture: Box<dyn PacketCapture>,
    classifier: Classifier,
}

impl Listener {
    pub fn new(capture: Box<dyn PacketCapture>, classifier: Classifier) -> Self {
        Self {
            capture,
            classifier,
        }
    }

    /// Run until quiescence after the senders finish.
    ///
    /// `senders_done` flips once the last send-workunit drains; from then on
    /// the loop exits after `recv_timeout` seconds with no matching frames.
    /// Events go out through `emit`. Returns the final counters.
    pub fn run(
        mut self,
        recv_timeout: Duration,
        senders_done: Arc<AtomicBool>,
        mut emit: impl FnMut(ListenerEvent),
    ) -> Result<ListenStats> {
        let link = self.capture.link_layer();
        let mut quiet_since: Option<Instant> = None;

        info!(timeout = ?recv_timeout, "listener running");
        loop {
            match self.capture.next_frame()? {
                Some(frame) => {
                    let when = Utc
                        .timestamp_opt(frame.ts_sec, (frame.ts_usec as u32) * 1000)
                        .single()
                        .unwrap_or_else(Utc::now);
                    if let Some((net, ethertype, src_mac)) = strip_link(link, &frame.data) {
                        if let Some(event) =
                            self.classifier.classify(net, ethertype, src_mac, when)
                        {
                            quiet_since = None;
                            emit(event);
                        }
                    }
                }
                None => {
                    // Read timeout: check for post-send quiescence.
                    if senders_done.load(Ordering::Acquire) {
                        let since = quiet_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= recv_timeout {
                            break;
                        }
                    }
                }
            }
        }

        debug!(stats = ?self.classifier.stats, "listener done");
        Ok(self.classifier.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unicornscan_core::workunit::{WorkunitStatus, TCP_RECV_MAGIC};
    use unicornscan_core::{encode_trace_port, TRACE_HOP_DEST};
    use unicornscan_net::{
        build_arp_request, build_ethernet, build_icmp_echo, build_udp, checksum, Ipv4Builder,
        TcpBuilder,
    };

    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 77, 1);
    const TARGET: Ipv4Addr = Ipv4Addr::new(192, 168, 77, 5);
    const KEY: u32 = 0xc0ffee;

    fn ctx() -> ListenerContext {
        ListenerContext {
            syn_key: KEY,
            local_ip: LOCAL,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            report_broken_net: false,
            report_broken_trans: false,
            expected_udp_ports: HashSet::from([53, 161]),
            want_payload: true,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    /// A SYN-ACK answering our probe to (TARGET, dport) from sport `ours`.
    fn syn_ack(ours: u16, dport: u16) -> Vec<u8> {
        let isn = syn_cookie(LOCAL, TARGET, ours, dport, KEY);
        let tcp = TcpBuilder::new(dport, ours, 0x12)
            .seq(0x11223344)
            .ack(isn.wrapping_add(1))
            .window(5840)
            .build(TARGET, LOCAL, &[]);
        Ipv4Builder::new(TARGET, LOCAL, IPPROTO_TCP)
            .ttl(64)
            .build(&tcp)
    }

    #[test]
    fn test_syn_ack_becomes_open_report() {
        let mut classifier = Classifier::new(ctx());
        let net = syn_ack(51000, 22);
        let event = classifier
            .classify(&net, Some(ETHERTYPE_IPV4), None, now())
            .unwrap();
        match event {
            ListenerEvent::Ip(report) => {
                assert_eq!(report.host_addr, TARGET);
                assert_eq!(report.send_addr, LOCAL);
                assert_eq!(report.sport, 22);
                assert_eq!(report.dport, 51000);
                assert_eq!(report.proto, IPPROTO_TCP);
                assert!(report.is_open_tcp());
                assert_eq!(report.ttl, 64);
                assert_eq!(report.window_size, 5840);
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_rst_becomes_closed_report() {
        let isn = syn_cookie(LOCAL, TARGET, 51000, 81, KEY);
        let tcp = TcpBuilder::new(81, 51000, 0x14) // RST|ACK
            .ack(isn.wrapping_add(1))
            .build(TARGET, LOCAL, &[]);
        let net = Ipv4Builder::new(TARGET, LOCAL, IPPROTO_TCP).build(&tcp);

        let mut classifier = Classifier::new(ctx());
        let event = classifier
            .classify(&net, Some(ETHERTYPE_IPV4), None, now())
            .unwrap();
        match event {
            ListenerEvent::Ip(report) => assert!(report.is_closed_tcp()),
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_cookie_mismatch_dropped_silently() {
        let tcp = TcpBuilder::new(22, 51000, 0x12)
            .ack(0xdeadbeef) // not our cookie
            .build(TARGET, LOCAL, &[]);
        let net = Ipv4Builder::new(TARGET, LOCAL, IPPROTO_TCP).build(&tcp);

        let mut classifier = Classifier::new(ctx());
        assert!(classifier
            .classify(&net, Some(ETHERTYPE_IPV4), None, now())
            .is_none());
        assert_eq!(classifier.stats.cookie_mismatch, 1);
    }

    #[test]
    fn test_foreign_destination_ignored() {
        let other = Ipv4Addr::new(192, 168, 77, 200);
        let isn = syn_cookie(LOCAL, TARGET, 51000, 22, KEY);
        let tcp = TcpBuilder::new(22, 51000, 0x12)
            .ack(isn.wrapping_add(1))
            .build(TARGET, other, &[]);
        let net = Ipv4Builder::new(TARGET, other, IPPROTO_TCP).build(&tcp);

        let mut classifier = Classifier::new(ctx());
        assert!(classifier
            .classify(&net, Some(ETHERTYPE_IPV4), None, now())
            .is_none());
    }

    #[test]
    fn test_bad_transport_cksum_dropped_then_flagged() {
        let mut net = syn_ack(51000, 22);
        // Flip a TCP payload-adjacent byte to break the transport checksum
        // but leave the IP header alone.
        let ip_header_len = 20;
        net[ip_header_len + 15] ^= 0x01; // window byte

        let mut classifier = Classifier::new(ctx());
        assert!(classifier
            .classify(&net, Some(ETHERTYPE_IPV4), None, now())
            .is_none());
        assert_eq!(classifier.stats.bad_cksum_dropped, 1);

        // Broken-report mode turns the drop into a flagged report.
        let mut broken_ctx = ctx();
        broken_ctx.report_broken_trans = true;
        let mut classifier = Classifier::new(broken_ctx);
        let event = classifier
            .classify(&net, Some(ETHERTYPE_IPV4), None, now())
            .unwrap();
        match event {
            ListenerEvent::Ip(report) => {
                assert_ne!(report.flags & REPORT_BADTRANSPORT_CKSUM, 0);
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_arp_reply_reported() {
        let mut arp = build_arp_request(&[0xaa; 6], TARGET, LOCAL);
        arp[6] = 0;
        arp[7] = 2; // opcode reply
        let mut classifier = Classifier::new(ctx());
        let event = classifier
            .classify(&arp, Some(ETHERTYPE_ARP), Some([0xaa; 6]), now())
            .unwrap();
        match event {
            ListenerEvent::Arp(report) => {
                assert_eq!(report.ipaddr, TARGET);
                assert_eq!(report.hwaddr, [0xaa; 6]);
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_arp_request_not_reported() {
        let arp = build_arp_request(&[0xaa; 6], TARGET, LOCAL);
        let mut classifier = Classifier::new(ctx());
        assert!(classifier
            .classify(&arp, Some(ETHERTYPE_ARP), None, now())
            .is_none());
    }

    #[test]
    fn test_local_responder_mac_attached() {
        let net = syn_ack(51000, 22);
        let mut classifier = Classifier::new(ctx());
        let frame = build_ethernet(&[1; 6], &[0x0c; 6], ETHERTYPE_IPV4, &net);
        let (stripped, ethertype, src_mac) =
            strip_link(unicornscan_net::LinkLayer::Ethernet, &frame).unwrap();
        let event = classifier
            .classify(stripped, ethertype, src_mac, now())
            .unwrap();
        match event {
            ListenerEvent::Ip(report) => assert_eq!(report.eth_hwaddr, Some([0x0c; 6])),
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_udp_expected_port_gating() {
        let dns = build_udp(TARGET, LOCAL, 53, 51000, b"\x12\x34\x81\x80");
        let net = Ipv4Builder::new(TARGET, LOCAL, IPPROTO_UDP).build(&dns);
        let mut classifier = Classifier::new(ctx());
        let event = classifier
            .classify(&net, Some(ETHERTYPE_IPV4), None, now())
            .unwrap();
        match event {
            ListenerEvent::Ip(report) => {
                assert_eq!(report.proto, IPPROTO_UDP);
                assert_eq!(report.sport, 53);
                assert_eq!(report.packet.as_deref(), Some(&b"\x12\x34\x81\x80"[..]));
            }
            other => panic!("wrong event: {:?}", other),
        }

        // Port 9999 is not in the expected set.
        let stray = build_udp(TARGET, LOCAL, 9999, 51000, b"hi");
        let net = Ipv4Builder::new(TARGET, LOCAL, IPPROTO_UDP).build(&stray);
        assert!(classifier
            .classify(&net, Some(ETHERTYPE_IPV4), None, now())
            .is_none());
        assert_eq!(classifier.stats.unexpected_port, 1);
    }

    #[test]
    fn test_echo_reply_cookie_checked() {
        let cookie = syn_cookie(LOCAL, TARGET, 0, 0, KEY);
        let mut echo = build_icmp_echo((cookie >> 16) as u16, cookie as u16, b"unicornscan");
        echo[0] = ICMP_ECHO_REPLY;
        // Rechecksum after the type change.
        echo[2] = 0;
        echo[3] = 0;
        let ck = checksum::rfc1071(&echo);
        echo[2..4].copy_from_slice(&ck.to_be_bytes());
        let net = Ipv4Builder::new(TARGET, LOCAL, IPPROTO_ICMP).build(&echo);

        let mut classifier = Classifier::new(ctx());
        let event = classifier
            .classify(&net, Some(ETHERTYPE_IPV4), None, now())
            .unwrap();
        match event {
            ListenerEvent::Ip(report) => {
                assert_eq!(report.proto, IPPROTO_ICMP);
                assert_eq!(report.type_, ICMP_ECHO_REPLY as u16);
                assert_eq!(report.host_addr, TARGET);
            }
            other => panic!("wrong event: {:?}", other),
        }

        // A foreign echo reply (wrong ident/seq) is spurious.
        let stray = build_icmp_echo(1, 2, b"x");
        let mut stray_reply = stray.clone();
        stray_reply[0] = ICMP_ECHO_REPLY;
        stray_reply[2] = 0;
        stray_reply[3] = 0;
        let ck = checksum::rfc1071(&stray_reply);
        stray_reply[2..4].copy_from_slice(&ck.to_be_bytes());
        let net = Ipv4Builder::new(TARGET, LOCAL, IPPROTO_ICMP).build(&stray_reply);
        assert!(classifier
            .classify(&net, Some(ETHERTYPE_IPV4), None, now())
            .is_none());
    }

    /// Build an ICMP error quoting one of our probes.
    fn icmp_error(
        icmp_type: u8,
        router: Ipv4Addr,
        sport: u16,
        dport: u16,
        seq: u32,
    ) -> Vec<u8> {
        let probe_tcp = TcpBuilder::new(sport, dport, 0x02)
            .seq(seq)
            .build(LOCAL, TARGET, &[]);
        let probe_ip = Ipv4Builder::new(LOCAL, TARGET, IPPROTO_TCP).build(&probe_tcp);

        let mut msg = vec![0u8; 8];
        msg[0] = icmp_type;
        msg.extend_from_slice(&probe_ip[..28]);
        let ck = checksum::rfc1071(&msg);
        msg[2..4].copy_from_slice(&ck.to_be_bytes());
        Ipv4Builder::new(router, LOCAL, IPPROTO_ICMP).build(&msg)
    }

    #[test]
    fn test_unreachable_reports_with_trace_addr() {
        let router = Ipv4Addr::new(10, 0, 0, 1);
        let sport = 51000;
        let seq = syn_cookie(LOCAL, TARGET, sport, 443, KEY);
        let net = icmp_error(ICMP_DEST_UNREACH, router, sport, 443, seq);

        let mut classifier = Classifier::new(ctx());
        let event = classifier
            .classify(&net, Some(ETHERTYPE_IPV4), None, now())
            .unwrap();
        match event {
            ListenerEvent::Ip(report) => {
                assert_eq!(report.host_addr, TARGET);
                assert_eq!(report.trace_addr, router);
                assert_eq!(report.type_, ICMP_DEST_UNREACH as u16);
                assert_eq!(report.sport, 443);
            }
            other => panic!("wrong event: {:?}", other),
        }
    }

    #[test]
    fn test_forged_quote_dropped() {
        let router = Ipv4Addr::new(10, 0, 0, 1);
        // Quoted sequence number is not our cookie.
        let net = icmp_error(ICMP_DEST_UNREACH, router, 51000, 443, 0x41414141);
        let mut classifier = Classifier::new(ctx());
        assert!(classifier
            .classify(&net, Some(ETHERTYPE_IPV4), None, now())
            .is_none());
        assert_eq!(classifier.stats.cookie_mismatch, 1);
    }

    #[test]
    fn test_time_exceeded_records_trace_hop() {
        let table = Arc::new(Mutex::new(TraceTable::new()));
        {
            let mut t = table.lock();
            let session = t.session(TARGET, 443, 1, 5);
            session.record_send(3, now());
        }

        let router = Ipv4Addr::new(10, 0, 0, 1);
        let sport = encode_trace_port(3);
        let seq = syn_cookie(LOCAL, TARGET, sport, 443, KEY);
        let net = icmp_error(ICMP_TIME_EXCEEDED, router, sport, 443, seq);

        let mut classifier = Classifier::new(ctx()).with_trace_table(table.clone());
        let event = classifier
            .classify(&net, Some(ETHERTYPE_IPV4), None, now())
            .unwrap();
        assert_eq!(event, ListenerEvent::TraceHop);

        let mut t = table.lock();
        let report = t.get_mut(TARGET, 443).unwrap().take_path_report().unwrap();
        assert_eq!(report.hops.len(), 1);
        assert_eq!(report.hops[0].hop_number, 3);
        assert_eq!(report.hops[0].router_addr, router);
        assert_eq!(report.hops[0].flags, TRACE_HOP_RECV);
    }

    #[test]
    fn test_trace_syn_ack_completes_session() {
        let table = Arc::new(Mutex::new(TraceTable::new()));
        {
            let mut t = table.lock();
            t.session(TARGET, 443, 1, 5).record_send(4, now());
        }

        let ours = encode_trace_port(4);
        let net = syn_ack(ours, 443);
        let mut classifier = Classifier::new(ctx()).with_trace_table(table.clone());
        let event = classifier
            .classify(&net, Some(ETHERTYPE_IPV4), None, now())
            .unwrap();
        assert_eq!(event, ListenerEvent::TraceHop);

        let mut t = table.lock();
        let session = t.get_mut(TARGET, 443).unwrap();
        assert!(session.is_complete());
        let report = session.take_path_report().unwrap();
        assert_eq!(report.hops.last().unwrap().flags, TRACE_HOP_DEST);
    }

    #[test]
    fn test_default_bpf_filter_shapes() {
        let mut wu = RecvWorkunit {
            magic: TCP_RECV_MAGIC,
            id: 1,
            status: WorkunitStatus::Queued,
            recv_timeout: 7,
            ret_layers: 0,
            promisc: false,
            report_broken_net: false,
            report_broken_trans: false,
            do_connect: false,
            syn_key: KEY,
            pcap_filter: None,
            iface: "eth0".to_string(),
        };
        let filter = default_bpf_filter(&wu, LOCAL);
        assert!(filter.contains("arp"));
        assert!(filter.contains("192.168.77.1"));

        wu.magic = ARP_RECV_MAGIC;
        assert_eq!(default_bpf_filter(&wu, LOCAL), "arp");

        wu.pcap_filter = Some("tcp port 80".to_string());
        assert_eq!(default_bpf_filter(&wu, LOCAL), "tcp port 80");
    }

    #[test]
    fn test_listener_run_quiescence_exit() {
        // A capture that never yields frames: run() must exit once the
        // senders-done flag is up and the timeout elapses.
        struct EmptyCapture;
        impl PacketCapture for EmptyCapture {
            fn open(&mut self, _: &str, _: bool, _: i32) -> Result<()> {
                Ok(())
            }
            fn set_filter(&mut self, _: &str) -> Result<()> {
                Ok(())
            }
            fn send_frame(&mut self, _: &[u8]) -> Result<()> {
                Ok(())
            }
            fn next_frame(&mut self) -> Result<Option<unicornscan_net::CapturedFrame>> {
                std::thread::sleep(Duration::from_millis(1));
                Ok(None)
            }
            fn link_layer(&self) -> unicornscan_net::LinkLayer {
                unicornscan_net::LinkLayer::Ethernet
            }
        }

        let done = Arc::new(AtomicBool::new(true));
        let listener = Listener::new(Box::new(EmptyCapture), Classifier::new(ctx()));
        let start = Instant::now();
        let stats = listener
            .run(Duration::from_millis(50), done, |_| {})
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(stats.reports, 0);
    }
}
