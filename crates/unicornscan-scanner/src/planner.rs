//! Workunit planning
//!
//! Turns the settings plus the current phase into the send-workunit and
//! recv-workunit queues: one send-workunit per (target block × interface),
//! one recv-workunit per interface. For compound scans, a phase following an
//! ARP phase abandons the user's original target list and regenerates its
//! send-workunits from the phase filter's live hosts, aggregated into the
//! minimum set of aligned CIDR blocks.
//!
//! Workunit IDs come from a counter owned by the planner and never repeat
//! within a scan.

use crate::phase_filter::PhaseFilter;
use ipnetwork::Ipv4Network;
use std::net::Ipv4Addr;
use tracing::{debug, info};
use unicornscan_core::workunit::{
    ARP_RECV_MAGIC, ARP_SEND_MAGIC, ICMP_RECV_MAGIC, ICMP_SEND_MAGIC, IP_RECV_MAGIC, IP_SEND_MAGIC,
    TCP_RECV_MAGIC, TCP_SEND_MAGIC, UDP_RECV_MAGIC, UDP_SEND_MAGIC,
};
use unicornscan_core::{
    Error, InterfaceSnapshot, PhaseSpec, RecvWorkunit, Result, ScanMode, ScanSettings,
    SendWorkunit, Target, WorkunitStatus,
};

/// Longest aggregate emitted when covering live hosts; bigger blocks bring
/// no scanning benefit on a LAN and invite aggregation across subnets.
const AGGREGATE_MIN_PREFIX: u8 = 24;

/// Hands out workunits for successive phases of one scan.
#[derive(Debug)]
pub struct WorkunitPlanner {
    next_id: u32,
}

impl Default for WorkunitPlanner {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkunitPlanner {
    pub fn new() -> Self {
        Self { next_id: 1 }
    }

    fn take_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Plan one phase.
    ///
    /// `phase_filter` carries live hosts from a preceding ARP phase; when
    /// present and non-empty it replaces the settings' target list. An empty
    /// filter after an ARP phase yields no send-workunits; the caller skips
    /// the phase (that is informational, not an error).
    pub fn plan_phase(
        &mut self,
        settings: &ScanSettings,
        phase: &PhaseSpec,
        iface: &InterfaceSnapshot,
        phase_filter: Option<&mut PhaseFilter>,
    ) -> Result<(Vec<SendWorkunit>, Vec<RecvWorkunit>)> {
        let targets: Vec<Target> = match phase_filter {
            Some(filter) if phase.mode != ScanMode::Arp => {
                let live = filter.drain_sorted();
                if live.is_empty() {
                    info!("phase filter empty, nothing to plan for {}", phase.mode);
                    return Ok((Vec::new(), Vec::new()));
                }
                let blocks = aggregate_live_hosts(&live);
                debug!(
                    hosts = live.len(),
                    blocks = blocks.len(),
                    "regenerated targets from phase filter"
                );
                blocks.into_iter().map(Target::from_network).collect()
            }
            _ => settings.targets.clone(),
        };

        if targets.is_empty() {
            return Err(Error::InvalidTarget("no targets to plan".to_string()));
        }

        let (send_magic, recv_magic) = phase_magics(phase.mode);
        let pps = phase.effective_pps(settings.pps);
        let repeats = phase.effective_repeats(settings.repeats);
        let recv_timeout = phase.effective_recv_timeout(settings.recv_timeout);

        let send_wus = targets
            .iter()
            .map(|target| SendWorkunit {
                magic: send_magic,
                id: self.take_id(),
                status: WorkunitStatus::Queued,
                repeats,
                pps,
                iface: iface.clone(),
                target: target.base(),
                prefix: target.prefix(),
                tos: settings.tos,
                ttl_min: settings.ttl_min,
                ttl_max: settings.ttl_max,
                ip_options: Vec::new(),
                frag_off: 0,
                src_port: settings.src_port,
                tcp_flags: phase.tcp_flags,
                tcp_options: Vec::new(),
                window: 4096,
                syn_key: settings.syn_key,
                port_str: settings.ports.source().to_string(),
            })
            .collect();

        let recv_wu = RecvWorkunit {
            magic: recv_magic,
            id: self.take_id(),
            status: WorkunitStatus::Queued,
            recv_timeout,
            ret_layers: 0,
            promisc: settings.options.promisc,
            report_broken_net: settings.options.report_broken_net,
            report_broken_trans: settings.options.report_broken_trans,
            do_connect: settings.options.do_connect
                || phase.mode == ScanMode::TcpConnect,
            syn_key: settings.syn_key,
            pcap_filter: None,
            iface: iface.name.clone(),
        };

        Ok((send_wus, vec![recv_wu]))
    }
}

fn phase_magics(mode: ScanMode) -> (u32, u32) {
    match mode {
        ScanMode::Tcp | ScanMode::TcpConnect | ScanMode::TcpTrace => {
            (TCP_SEND_MAGIC, TCP_RECV_MAGIC)
        }
        ScanMode::Udp => (UDP_SEND_MAGIC, UDP_RECV_MAGIC),
        ScanMode::Arp => (ARP_SEND_MAGIC, ARP_RECV_MAGIC),
        ScanMode::Icmp => (ICMP_SEND_MAGIC, ICMP_RECV_MAGIC),
        ScanMode::IpRaw => (IP_SEND_MAGIC, IP_RECV_MAGIC),
    }
}

/// Cover a sorted set of live hosts with the minimum number of aligned CIDR
/// blocks, greedily and deterministically.
///
/// For each uncovered address the largest aligned block (prefix between
/// [`AGGREGATE_MIN_PREFIX`] and 32) whose every member is live is emitted,
/// and all covered addresses are skipped.
pub fn aggregate_live_hosts(sorted_live: &[Ipv4Addr]) -> Vec<Ipv4Network> {
    let mut blocks = Vec::new();
    let mut i = 0;

    while i < sorted_live.len() {
        let base = u32::from(sorted_live[i]);
        let mut chosen_prefix = 32u8;

        // Try the largest block first; alignment and full membership both
        // must hold. The slice is sorted and deduplicated by construction,
        // so membership is a contiguity check.
        for prefix in AGGREGATE_MIN_PREFIX..32 {
            let block_size = 1u32 << (32 - prefix);
            if base % block_size != 0 {
                continue;
            }
            let have = sorted_live[i..]
                .iter()
                .take(block_size as usize)
                .enumerate()
                .take_while(|(k, addr)| u32::from(**addr) == base + *k as u32)
                .count();
            if have == block_size as usize {
                chosen_prefix = prefix;
                break;
            }
        }

        let block_size = 1u32 << (32 - chosen_prefix);
        blocks.push(
            Ipv4Network::new(Ipv4Addr::from(base), chosen_prefix)
                .expect("prefix is within [24,32]"),
        );
        i += block_size as usize;
    }

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use unicornscan_core::{parse_mode_spec, PortList};

    fn addrs(lasts: &[u8]) -> Vec<Ipv4Addr> {
        lasts
            .iter()
            .map(|l| Ipv4Addr::new(192, 168, 77, *l))
            .collect()
    }

    fn net(s: &str) -> Ipv4Network {
        s.parse().unwrap()
    }

    #[test]
    fn test_aggregate_single_host() {
        assert_eq!(
            aggregate_live_hosts(&addrs(&[5])),
            vec![net("192.168.77.5/32")]
        );
    }

    #[test]
    fn test_aggregate_aligned_pair() {
        // .4 and .5 are a /31; .3 stands alone.
        assert_eq!(
            aggregate_live_hosts(&addrs(&[3, 4, 5])),
            vec![net("192.168.77.3/32"), net("192.168.77.4/31")]
        );
    }

    #[test]
    fn test_aggregate_compound_example() {
        // .3 .4 .5 .6: minimal aligned cover is /32 + /31 + /32
        // (a /30 at .4 would need .7 too).
        assert_eq!(
            aggregate_live_hosts(&addrs(&[3, 4, 5, 6])),
            vec![
                net("192.168.77.3/32"),
                net("192.168.77.4/31"),
                net("192.168.77.6/32"),
            ]
        );
    }

    #[test]
    fn test_aggregate_full_quad() {
        assert_eq!(
            aggregate_live_hosts(&addrs(&[4, 5, 6, 7])),
            vec![net("192.168.77.4/30")]
        );
    }

    #[test]
    fn test_aggregate_whole_slash24() {
        let all: Vec<Ipv4Addr> = (0u32..256)
            .map(|i| Ipv4Addr::from(0xc0a84d00 + i))
            .collect();
        assert_eq!(aggregate_live_hosts(&all), vec![net("192.168.77.0/24")]);
    }

    #[test]
    fn test_aggregate_never_exceeds_slash24() {
        // Two full adjacent /24s stay two blocks.
        let mut all: Vec<Ipv4Addr> = (0u32..512)
            .map(|i| Ipv4Addr::from(0x0a000000 + i))
            .collect();
        all.sort();
        let blocks = aggregate_live_hosts(&all);
        assert_eq!(blocks, vec![net("10.0.0.0/24"), net("10.0.1.0/24")]);
    }

    #[test]
    fn test_aggregate_union_equals_input() {
        let live = addrs(&[1, 2, 3, 8, 9, 10, 11, 200]);
        let blocks = aggregate_live_hosts(&live);
        let mut covered: Vec<Ipv4Addr> = blocks.iter().flat_map(|b| b.iter()).collect();
        covered.sort();
        assert_eq!(covered, live);
    }

    fn test_settings() -> ScanSettings {
        ScanSettings::new(
            parse_mode_spec("A+T").unwrap(),
            vec![Target::parse("192.168.77.0/28").unwrap()],
            PortList::parse("80").unwrap(),
        )
    }

    #[test]
    fn test_plan_simple_phase() {
        let settings = test_settings();
        let mut planner = WorkunitPlanner::new();
        let iface = InterfaceSnapshot::placeholder();
        let phase = settings.phases[0];

        let (send, recv) = planner
            .plan_phase(&settings, &phase, &iface, None)
            .unwrap();
        assert_eq!(send.len(), 1);
        assert_eq!(recv.len(), 1);
        assert_eq!(send[0].magic, ARP_SEND_MAGIC);
        assert_eq!(send[0].prefix, 28);
        assert_eq!(send[0].syn_key, recv[0].syn_key);
    }

    #[test]
    fn test_plan_ids_unique() {
        let settings = test_settings();
        let mut planner = WorkunitPlanner::new();
        let iface = InterfaceSnapshot::placeholder();

        let mut seen = std::collections::HashSet::new();
        for phase in settings.phases.clone() {
            let (send, recv) = planner
                .plan_phase(&settings, &phase, &iface, None)
                .unwrap();
            for wu in &send {
                assert!(seen.insert(wu.id), "duplicate workunit id {}", wu.id);
            }
            for wu in &recv {
                assert!(seen.insert(wu.id), "duplicate workunit id {}", wu.id);
            }
        }
    }

    #[test]
    fn test_plan_phase_two_uses_filter() {
        let settings = test_settings();
        let mut planner = WorkunitPlanner::new();
        let iface = InterfaceSnapshot::placeholder();
        let tcp_phase = settings.phases[1];

        let mut filter = PhaseFilter::new();
        for last in [3u8, 4, 5, 6] {
            filter.store(Ipv4Addr::new(192, 168, 77, last), [0; 6]);
        }

        let (send, _) = planner
            .plan_phase(&settings, &tcp_phase, &iface, Some(&mut filter))
            .unwrap();
        // Minimal cover of .3-.6, never the original /28.
        let planned: Vec<(Ipv4Addr, u8)> = send.iter().map(|wu| (wu.target, wu.prefix)).collect();
        assert_eq!(
            planned,
            vec![
                (Ipv4Addr::new(192, 168, 77, 3), 32),
                (Ipv4Addr::new(192, 168, 77, 4), 31),
                (Ipv4Addr::new(192, 168, 77, 6), 32),
            ]
        );
        // Every planned block member was in the filter (phase gating).
        assert!(filter.is_empty());
        assert_eq!(send[0].magic, TCP_SEND_MAGIC);
    }

    #[test]
    fn test_plan_phase_two_empty_filter_skips() {
        let settings = test_settings();
        let mut planner = WorkunitPlanner::new();
        let iface = InterfaceSnapshot::placeholder();
        let tcp_phase = settings.phases[1];

        let mut filter = PhaseFilter::new();
        let (send, recv) = planner
            .plan_phase(&settings, &tcp_phase, &iface, Some(&mut filter))
            .unwrap();
        assert!(send.is_empty());
        assert!(recv.is_empty());
    }

    #[test]
    fn test_per_phase_pps_beats_global() {
        let mut settings = test_settings();
        settings.phases = parse_mode_spec("A+T100").unwrap();
        let mut planner = WorkunitPlanner::new();
        let iface = InterfaceSnapshot::placeholder();

        let (send, _) = planner
            .plan_phase(&settings, &settings.phases[1].clone(), &iface, None)
            .unwrap();
        assert_eq!(send[0].pps, 100);

        let (send, _) = planner
            .plan_phase(&settings, &settings.phases[0].clone(), &iface, None)
            .unwrap();
        // ARP phase has no modifier, so the global applies.
        assert_eq!(send[0].pps, settings.pps);
    }
}
