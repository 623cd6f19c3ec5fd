//! Report aggregation: dedupe, enrich, emit
//!
//! Reports land here from the listener (over the bus) and sit in ordered
//! maps keyed by the 64-bit report keys until the scan completes. The key
//! layout puts the host address in the high bits, so walking the map in key
//! order is walking hosts in address order. Duplicates are dropped unless
//! dup-processing chains them. Immediate mode short-circuits the buffer and
//! emits on first sight (flush then skips re-emitting).
//!
//! At flush, registered post-processors run over every buffered report
//! (the binary banner parser is the stock one; OS matching and GeoIP attach
//! through the same hook), then sinks receive ARP reports first (sorted by
//! IP), then IP reports, then trace paths.

use crate::banner;
use crate::output::OutputSink;
use std::collections::BTreeMap;
use tracing::debug;
use unicornscan_core::{ArpReport, IpReport, OutputData, ScanSettings, TracePathReport};

/// Post-classification enrichment hook.
pub trait ReportEnricher: Send {
    /// Inspect and optionally annotate a report before emission.
    fn enrich(&self, report: &mut IpReport);
}

/// The stock enricher: protocol-sniff captured response payloads into a
/// one-line banner.
pub struct BannerEnricher;

impl ReportEnricher for BannerEnricher {
    fn enrich(&self, report: &mut IpReport) {
        let already_has_banner = report
            .output
            .iter()
            .any(|od| matches!(od, OutputData::Banner(_)));
        if already_has_banner {
            return;
        }
        if let Some(payload) = &report.packet {
            if !payload.is_empty() {
                let (_proto, summary) = banner::parse(payload);
                if !summary.is_empty() {
                    report.output.push(OutputData::Banner(summary));
                }
            }
        }
    }
}

struct IpEntry {
    report: IpReport,
    dups: Vec<IpReport>,
    emitted: bool,
}

struct ArpEntry {
    report: ArpReport,
    emitted: bool,
}

/// Buffering, deduplicating report collector.
pub struct ReportAggregator {
    ip_reports: BTreeMap<u64, IpEntry>,
    arp_reports: BTreeMap<u64, ArpEntry>,
    trace_reports: Vec<TracePathReport>,
    enrichers: Vec<Box<dyn ReportEnricher>>,
    sinks: Vec<Box<dyn OutputSink>>,
    immediate: bool,
    process_dups: bool,
    dropped_dups: u64,
}

impl ReportAggregator {
    /// Build from settings, taking ownership of the sinks.
    pub fn new(settings: &ScanSettings, mut sinks: Vec<Box<dyn OutputSink>>) -> Self {
        for sink in &mut sinks {
            sink.init(settings);
        }
        Self {
            ip_reports: BTreeMap::new(),
            arp_reports: BTreeMap::new(),
            trace_reports: Vec::new(),
            enrichers: vec![Box::new(BannerEnricher)],
            sinks,
            immediate: settings.options.immediate,
            process_dups: settings.options.process_dups,
            dropped_dups: 0,
        }
    }

    /// Register an additional post-processor (OS match, GeoIP).
    pub fn add_enricher(&mut self, enricher: Box<dyn ReportEnricher>) {
        self.enrichers.push(enricher);
    }

    /// Accept an IP report from the listener.
    pub fn add_ip_report(&mut self, report: IpReport) {
        let key = report.key();
        if let Some(entry) = self.ip_reports.get_mut(&key) {
            if self.process_dups {
                entry.dups.push(report);
            } else {
                self.dropped_dups += 1;
            }
            return;
        }

        let emitted = if self.immediate {
            let mut first = report.clone();
            self.emit_ip(&mut first);
            true
        } else {
            false
        };
        self.ip_reports.insert(
            key,
            IpEntry {
                report,
                dups: Vec::new(),
                emitted,
            },
        );
    }

    /// Accept an ARP report from the listener.
    pub fn add_arp_report(&mut self, report: ArpReport) {
        let key = report.key();
        if self.arp_reports.contains_key(&key) {
            self.dropped_dups += 1;
            return;
        }

        let emitted = if self.immediate {
            for sink in &mut self.sinks {
                sink.on_arp_report(&report);
            }
            true
        } else {
            false
        };
        self.arp_reports.insert(key, ArpEntry { report, emitted });
    }

    /// Accept a completed trace path (already emitted at most once upstream).
    pub fn add_trace_report(&mut self, report: TracePathReport) {
        self.trace_reports.push(report);
    }

    /// Attach enrichment output (a grabbed banner, an OS guess) to a
    /// buffered report by key. Unknown keys are ignored; the response the
    /// enrichment belongs to may have been a duplicate that was dropped.
    pub fn attach_output(&mut self, key: u64, od: OutputData) {
        if let Some(entry) = self.ip_reports.get_mut(&key) {
            entry.report.output.push(od);
        }
    }

    /// Unique IP-report count currently buffered.
    pub fn ip_count(&self) -> usize {
        self.ip_reports.len()
    }

    /// Unique ARP-report count currently buffered.
    pub fn arp_count(&self) -> usize {
        self.arp_reports.len()
    }

    /// Duplicates discarded so far.
    pub fn dropped_dups(&self) -> u64 {
        self.dropped_dups
    }

    fn emit_ip(&mut self, report: &mut IpReport) {
        for enricher in &self.enrichers {
            enricher.enrich(report);
        }
        for sink in &mut self.sinks {
            sink.on_report(report);
        }
    }

    /// Emit everything in key order and close the sinks. ARP reports go
    /// first (their keys sort by IP), then IP reports, then trace paths.
    pub fn flush(mut self) {
        debug!(
            ip = self.ip_reports.len(),
            arp = self.arp_reports.len(),
            dropped = self.dropped_dups,
            "flushing aggregator"
        );

        let arp_entries: Vec<ArpEntry> =
            std::mem::take(&mut self.arp_reports).into_values().collect();
        for entry in arp_entries {
            if !entry.emitted {
                for sink in &mut self.sinks {
                    sink.on_arp_report(&entry.report);
                }
            }
        }

        let ip_entries: Vec<IpEntry> =
            std::mem::take(&mut self.ip_reports).into_values().collect();
        for mut entry in ip_entries {
            if !entry.emitted {
                let mut report = entry.report;
                self.emit_ip(&mut report);
                // Chained duplicates follow their primary in arrival order.
                for mut dup in entry.dups.drain(..) {
                    self.emit_ip(&mut dup);
                }
            }
        }

        let traces = std::mem::take(&mut self.trace_reports);
        for report in traces {
            for sink in &mut self.sinks {
                sink.on_trace_report(&report);
            }
        }

        for sink in &mut self.sinks {
            sink.fini();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};
    use unicornscan_core::{parse_mode_spec, PortList, ScanSettings, Target};

    /// Sink recording the order of everything it sees.
    #[derive(Clone, Default)]
    struct RecordingSink {
        events: Arc<Mutex<Vec<String>>>,
    }

    impl OutputSink for RecordingSink {
        fn init(&mut self, _settings: &ScanSettings) {
            self.events.lock().unwrap().push("init".to_string());
        }
        fn on_report(&mut self, report: &IpReport) {
            self.events
                .lock()
                .unwrap()
                .push(format!("ip {}:{}", report.host_addr, report.sport));
        }
        fn on_arp_report(&mut self, report: &ArpReport) {
            self.events
                .lock()
                .unwrap()
                .push(format!("arp {}", report.ipaddr));
        }
        fn on_trace_report(&mut self, report: &TracePathReport) {
            self.events
                .lock()
                .unwrap()
                .push(format!("trace {}", report.target_addr));
        }
        fn fini(&mut self) {
            self.events.lock().unwrap().push("fini".to_string());
        }
    }

    fn settings(immediate: bool, process_dups: bool) -> ScanSettings {
        let mut s = ScanSettings::new(
            parse_mode_spec("T").unwrap(),
            vec![Target::parse("10.0.0.0/24").unwrap()],
            PortList::parse("80").unwrap(),
        );
        s.options.immediate = immediate;
        s.options.process_dups = process_dups;
        s
    }

    fn report(host: u8, sport: u16) -> IpReport {
        IpReport::new(
            Ipv4Addr::new(10, 0, 0, host),
            Ipv4Addr::new(10, 0, 0, 1),
            sport,
            51000,
            6,
        )
    }

    #[test]
    fn test_dedupe_drops_repeats() {
        let sink = RecordingSink::default();
        let events = sink.events.clone();
        let mut agg = ReportAggregator::new(&settings(false, false), vec![Box::new(sink)]);

        for _ in 0..5 {
            agg.add_ip_report(report(9, 22));
        }
        assert_eq!(agg.ip_count(), 1);
        assert_eq!(agg.dropped_dups(), 4);
        agg.flush();

        let seen = events.lock().unwrap();
        let ip_lines: Vec<_> = seen.iter().filter(|e| e.starts_with("ip ")).collect();
        assert_eq!(ip_lines.len(), 1);
    }

    #[test]
    fn test_dup_processing_chains() {
        let sink = RecordingSink::default();
        let events = sink.events.clone();
        let mut agg = ReportAggregator::new(&settings(false, true), vec![Box::new(sink)]);

        agg.add_ip_report(report(9, 22));
        agg.add_ip_report(report(9, 22));
        agg.add_ip_report(report(9, 22));
        agg.flush();

        let seen = events.lock().unwrap();
        let ip_lines: Vec<_> = seen.iter().filter(|e| e.starts_with("ip ")).collect();
        assert_eq!(ip_lines.len(), 3);
    }

    #[test]
    fn test_distinct_keys_kept() {
        let sink = RecordingSink::default();
        let mut agg = ReportAggregator::new(&settings(false, false), vec![Box::new(sink)]);

        agg.add_ip_report(report(9, 22));
        agg.add_ip_report(report(9, 80));
        agg.add_ip_report(report(10, 22));
        assert_eq!(agg.ip_count(), 3);
    }

    #[test]
    fn test_flush_order_arp_first_sorted() {
        let sink = RecordingSink::default();
        let events = sink.events.clone();
        let mut agg = ReportAggregator::new(&settings(false, false), vec![Box::new(sink)]);

        // Insert out of order; emission must be ARP (by IP), then IP.
        agg.add_ip_report(report(9, 22));
        agg.add_arp_report(ArpReport::new(Ipv4Addr::new(10, 0, 0, 7), [1; 6]));
        agg.add_arp_report(ArpReport::new(Ipv4Addr::new(10, 0, 0, 3), [2; 6]));
        agg.flush();

        let seen = events.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                "init",
                "arp 10.0.0.3",
                "arp 10.0.0.7",
                "ip 10.0.0.9:22",
                "fini"
            ]
        );
    }

    #[test]
    fn test_ip_flush_sorted_by_host() {
        let sink = RecordingSink::default();
        let events = sink.events.clone();
        let mut agg = ReportAggregator::new(&settings(false, false), vec![Box::new(sink)]);

        agg.add_ip_report(report(200, 80));
        agg.add_ip_report(report(3, 80));
        agg.add_ip_report(report(70, 80));
        agg.flush();

        let seen = events.lock().unwrap();
        let ip_lines: Vec<_> = seen.iter().filter(|e| e.starts_with("ip ")).cloned().collect();
        assert_eq!(
            ip_lines,
            vec!["ip 10.0.0.3:80", "ip 10.0.0.70:80", "ip 10.0.0.200:80"]
        );
    }

    #[test]
    fn test_immediate_mode_emits_once() {
        let sink = RecordingSink::default();
        let events = sink.events.clone();
        let mut agg = ReportAggregator::new(&settings(true, false), vec![Box::new(sink)]);

        agg.add_ip_report(report(9, 22));
        // Immediate mode emitted on arrival...
        assert_eq!(
            events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.starts_with("ip "))
                .count(),
            1
        );
        agg.add_ip_report(report(9, 22)); // dup, dropped
        agg.flush();

        // ...and flush does not re-emit.
        let seen = events.lock().unwrap();
        let ip_lines: Vec<_> = seen.iter().filter(|e| e.starts_with("ip ")).collect();
        assert_eq!(ip_lines.len(), 1);
    }

    #[test]
    fn test_banner_enricher_runs_at_flush() {
        let sink = RecordingSink::default();
        let mut agg = ReportAggregator::new(&settings(false, false), vec![Box::new(sink)]);

        let mut r = report(9, 53);
        // A DNS answer payload; the enricher should turn it into a banner.
        r.packet = Some(vec![
            0x00, 0x1d, 0x12, 0x34, 0x81, 0x80, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
            0x05, 0x6c, 0x6f, 0x63, 0x61, 0x6c, 0x00, 0x00, 0x01, 0x00, 0x01, 0xc0, 0x0c, 0x00,
            0x01, 0x00, 0x01,
        ]);
        let key = r.key();
        agg.add_ip_report(r);

        // Run the enrichment directly on the buffered entry to observe it.
        let entry = agg.ip_reports.get_mut(&key).unwrap();
        BannerEnricher.enrich(&mut entry.report);
        assert!(entry
            .report
            .output
            .iter()
            .any(|od| matches!(od, OutputData::Banner(s) if s.contains("NOERROR"))));
        agg.flush();
    }

    #[test]
    fn test_trace_reports_flow_through() {
        let sink = RecordingSink::default();
        let events = sink.events.clone();
        let mut agg = ReportAggregator::new(&settings(false, false), vec![Box::new(sink)]);
        agg.add_trace_report(TracePathReport {
            magic: unicornscan_core::TRACE_PATH_MAGIC,
            target_addr: Ipv4Addr::new(8, 8, 8, 8),
            target_port: 443,
            complete: true,
            hops: vec![],
        });
        agg.flush();
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e == "trace 8.8.8.8"));
    }
}
