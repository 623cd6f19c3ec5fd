//! Stateless probe emission
//!
//! The sender drains send-workunits: for each one it iterates
//! (target × port × repeat), with repeats of the same probe contiguous,
//! paced by the token bucket. Nothing is remembered per probe; the SYN
//! cookie in the sequence number and the encodings in the source port are
//! the only state, and they live in the packet itself.
//!
//! Trace workunits iterate TTL instead of repeating: one probe per TTL in
//! `[ttl_min, ttl_max]`, each stamped into the trace table so the listener
//! can compute RTTs.

use crate::pacer::{Pacer, TscClock};
use crate::trace::TraceTable;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, trace, warn};
use unicornscan_core::workunit::{
    ARP_SEND_MAGIC, ICMP_SEND_MAGIC, IP_SEND_MAGIC, TCP_SEND_MAGIC, UDP_SEND_MAGIC,
};
use unicornscan_core::{
    encode_payload_port, encode_trace_port, syn_cookie, Error, PayloadRegistry, PortEntry,
    PortList, Proto, Result, SendWorkunit, Target,
};
use unicornscan_net::{
    build_arp_request, build_ethernet, build_icmp_echo, build_udp, default_tcp_options,
    Ipv4Builder, PacketCapture, TcpBuilder, ETHERTYPE_ARP, ETHERTYPE_IPV4, IPPROTO_ICMP,
    IPPROTO_TCP, IPPROTO_UDP, MAC_BROADCAST,
};

/// Counters returned per drained workunit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendStats {
    pub sent: u64,
    pub failed: u64,
}

/// Pick the source port for one probe.
///
/// Trace TTL encoding wins, then payload-index encoding when the port's
/// chain has more than one variant, then the user's fixed port, then the
/// PRNG ephemeral range.
pub fn select_source_port(
    rng: &mut SmallRng,
    fixed_port: i32,
    payload_count: u16,
    payload_index: u16,
    trace_ttl: Option<u8>,
) -> u16 {
    if let Some(ttl) = trace_ttl {
        return encode_trace_port(ttl);
    }
    if payload_count > 1 {
        let base: u16 = rng.gen_range(49152..=65535);
        return encode_payload_port(base, payload_index);
    }
    if fixed_port >= 0 {
        return fixed_port as u16;
    }
    rng.gen_range(1024..=65535)
}

/// The sender half of a drone: consumes workunits, emits frames.
pub struct Sender {
    capture: Box<dyn PacketCapture>,
    rng: SmallRng,
    registry: PayloadRegistry,
    /// Calibrated once per sender; every workunit's pacer shares it.
    clock: TscClock,
    /// Next-hop MAC for IP probes (gateway or target on the local segment).
    /// Broadcast is the fallback when resolution has not happened yet.
    dst_mac: [u8; 6],
    /// Shuffle target/port iteration order.
    shuffle: bool,
    /// Shared trace state for tcptrace workunits.
    trace_table: Option<Arc<Mutex<TraceTable>>>,
}

impl Sender {
    pub fn new(capture: Box<dyn PacketCapture>, registry: PayloadRegistry) -> Self {
        Self {
            capture,
            rng: SmallRng::from_entropy(),
            registry,
            clock: TscClock::calibrate(),
            dst_mac: MAC_BROADCAST,
            shuffle: false,
            trace_table: None,
        }
    }

    /// Deterministic PRNG for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn with_dst_mac(mut self, mac: [u8; 6]) -> Self {
        self.dst_mac = mac;
        self
    }

    pub fn with_shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    pub fn with_trace_table(mut self, table: Arc<Mutex<TraceTable>>) -> Self {
        self.trace_table = Some(table);
        self
    }

    /// Drain one workunit: emit every probe it describes at its rate.
    pub fn run_workunit(&mut self, wu: &SendWorkunit) -> Result<SendStats> {
        let ports = PortList::parse(&wu.port_str)?;
        let target = Target::from_network(
            ipnetwork::Ipv4Network::new(wu.target, wu.prefix)
                .map_err(|e| Error::InvalidTarget(e.to_string()))?,
        );

        let mut pacer = Pacer::with_clock(wu.pps.max(1), self.clock.clone());
        let mut stats = SendStats::default();

        debug!(%wu, "sender: starting workunit");

        let seed: u64 = self.rng.gen();
        let hosts: Box<dyn Iterator<Item = Ipv4Addr>> = if self.shuffle {
            Box::new(target.hosts_shuffled(seed))
        } else {
            Box::new(target.hosts())
        };

        for host in hosts {
            let port_iter: Box<dyn Iterator<Item = PortEntry> + '_> = if self.shuffle {
                Box::new(ports.iter_shuffled(seed ^ u64::from(u32::from(host))))
            } else {
                Box::new(ports.iter())
            };

            for entry in port_iter {
                self.emit_probe_family(wu, host, entry, &mut pacer, &mut stats);
            }
        }

        debug!(
            wu_id = wu.id,
            sent = stats.sent,
            failed = stats.failed,
            "sender: workunit drained"
        );
        Ok(stats)
    }

    /// All probes for one (target, port): payload variants × repeats, or the
    /// TTL ladder for trace workunits.
    fn emit_probe_family(
        &mut self,
        wu: &SendWorkunit,
        host: Ipv4Addr,
        entry: PortEntry,
        pacer: &mut Pacer,
        stats: &mut SendStats,
    ) {
        if wu.is_trace() && wu.magic == TCP_SEND_MAGIC {
            for ttl in wu.ttl_min..=wu.ttl_max {
                let sport = select_source_port(&mut self.rng, wu.src_port, 1, 0, Some(ttl));
                if let Some(table) = &self.trace_table {
                    let mut table = table.lock();
                    table
                        .session(host, entry.port(), wu.ttl_min, wu.ttl_max)
                        .record_send(ttl, Utc::now());
                }
                self.send_one(wu, host, entry, sport, 0, ttl, pacer, stats);
            }
            return;
        }

        let variants = entry.payload_count().max(1);
        for index in 0..variants {
            let sport =
                select_source_port(&mut self.rng, wu.src_port, variants, index, None);
            // Blind retransmits are contiguous and identical.
            for _ in 0..wu.repeats.max(1) {
                self.send_one(wu, host, entry, sport, index, wu.ttl_min, pacer, stats);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn send_one(
        &mut self,
        wu: &SendWorkunit,
        host: Ipv4Addr,
        entry: PortEntry,
        sport: u16,
        payload_index: u16,
        ttl: u8,
        pacer: &mut Pacer,
        stats: &mut SendStats,
    ) {
        pacer.acquire();

        let frame = match self.build_frame(wu, host, entry, sport, payload_index, ttl) {
            Some(frame) => frame,
            None => {
                stats.failed += 1;
                return;
            }
        };

        match self.capture.send_frame(&frame) {
            Ok(()) => {
                stats.sent += 1;
                trace!(%host, port = entry.port(), sport, "probe sent");
            }
            Err(e) => {
                stats.failed += 1;
                warn!(%host, "send failed: {}", e);
            }
        }
    }

    fn build_frame(
        &mut self,
        wu: &SendWorkunit,
        host: Ipv4Addr,
        entry: PortEntry,
        sport: u16,
        payload_index: u16,
        ttl: u8,
    ) -> Option<Vec<u8>> {
        let src_ip = wu.iface.ipv4;

        match wu.magic {
            ARP_SEND_MAGIC => {
                let arp = build_arp_request(&wu.iface.mac, src_ip, host);
                Some(build_ethernet(
                    &MAC_BROADCAST,
                    &wu.iface.mac,
                    ETHERTYPE_ARP,
                    &arp,
                ))
            }
            TCP_SEND_MAGIC => {
                let isn = syn_cookie(src_ip, host, sport, entry.port(), wu.syn_key);
                let options = if wu.tcp_options.is_empty() {
                    default_tcp_options()
                } else {
                    wu.tcp_options.clone()
                };
                // TCP payloads ride the connect follow-up, never the SYN.
                let tcp = TcpBuilder::new(sport, entry.port(), wu.tcp_flags.bits())
                    .seq(isn)
                    .window(wu.window)
                    .options(options)
                    .build(src_ip, host, &[]);
                Some(self.wrap_ip(wu, host, IPPROTO_TCP, ttl, &tcp))
            }
            UDP_SEND_MAGIC => {
                let payload = self
                    .registry
                    .get_payload(payload_index, Proto::Udp, entry.port(), 0, &mut self.rng)
                    .map(|(bytes, _)| bytes)
                    .unwrap_or_default();
                let udp = build_udp(src_ip, host, sport, entry.port(), &payload);
                Some(self.wrap_ip(wu, host, IPPROTO_UDP, ttl, &udp))
            }
            ICMP_SEND_MAGIC => {
                // The cookie rides in the echo identifier/sequence pair.
                let cookie = syn_cookie(src_ip, host, 0, 0, wu.syn_key);
                let icmp =
                    build_icmp_echo((cookie >> 16) as u16, cookie as u16, b"unicornscan");
                Some(self.wrap_ip(wu, host, IPPROTO_ICMP, ttl, &icmp))
            }
            IP_SEND_MAGIC => {
                // Raw IP protocol sweep: the port list iterates protocols.
                let proto = (entry.port() & 0xff) as u8;
                Some(self.wrap_ip(wu, host, proto, ttl, &[]))
            }
            other => {
                warn!(magic = format!("{:08x}", other), "unknown send magic");
                None
            }
        }
    }

    fn wrap_ip(
        &mut self,
        wu: &SendWorkunit,
        host: Ipv4Addr,
        proto: u8,
        ttl: u8,
        payload: &[u8],
    ) -> Vec<u8> {
        let ip = Ipv4Builder::new(wu.iface.ipv4, host, proto)
            .ttl(ttl)
            .tos(wu.tos)
            .id(self.rng.gen())
            .frag_off(wu.frag_off)
            .options(wu.ip_options.clone())
            .build(payload);
        build_ethernet(&self.dst_mac, &wu.iface.mac, ETHERTYPE_IPV4, &ip)
    }
}
