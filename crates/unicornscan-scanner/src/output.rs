//! Output sinks
//!
//! A sink receives the aggregator's final (or immediate) stream of reports
//! through four callbacks: `init`, `on_report`, `on_arp_report`, `fini`,
//! plus a default-implemented `on_trace_report` for tcptrace paths. Sinks
//! are registered in-process; the master owns them, senders and listeners
//! never touch them.

use crate::format::{render, NameResolver, NoResolver};
use crate::names::{format_mac, oui_vendor, service_name};
use std::io::Write;
use tracing::warn;
use unicornscan_core::{ArpReport, IpReport, ScanSettings, TracePathReport, TRACE_HOP_DEST};

/// Receiver of finished reports.
pub trait OutputSink: Send {
    /// Called once before any report, with the scan's settings.
    fn init(&mut self, settings: &ScanSettings);

    /// One IP-level response report.
    fn on_report(&mut self, report: &IpReport);

    /// One ARP response report.
    fn on_arp_report(&mut self, report: &ArpReport);

    /// One completed traceroute path.
    fn on_trace_report(&mut self, _report: &TracePathReport) {}

    /// Called once after the last report.
    fn fini(&mut self);
}

/// Human-readable text sink (stdout unless redirected).
pub struct TextSink {
    out: Box<dyn Write + Send>,
    template: Option<String>,
    resolver: Box<dyn NameResolver>,
}

impl TextSink {
    /// Sink writing to stdout with the stock line format.
    pub fn stdout() -> Self {
        Self {
            out: Box::new(std::io::stdout()),
            template: None,
            resolver: Box::new(NoResolver),
        }
    }

    /// Sink writing into an arbitrary writer (tests use a Vec).
    pub fn to_writer(out: Box<dyn Write + Send>) -> Self {
        Self {
            out,
            template: None,
            resolver: Box::new(NoResolver),
        }
    }

    /// Use a user format template instead of the stock line.
    pub fn with_template(mut self, template: String) -> Self {
        self.template = Some(template);
        self
    }

    /// Install an rDNS/GeoIP resolver for `%hn`/`%C`.
    pub fn with_resolver(mut self, resolver: Box<dyn NameResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    fn stock_line(report: &IpReport) -> String {
        let service = service_name(report.sport).unwrap_or("unknown");
        let state = if report.is_open_tcp() {
            "open"
        } else if report.is_closed_tcp() {
            "closed"
        } else {
            "resp"
        };
        let proto = match report.proto {
            6 => "TCP",
            17 => "UDP",
            1 => "ICMP",
            _ => "IP",
        };
        format!(
            "{} {:>6} {:>12}[{:>5}]\tfrom {}  ttl {}",
            proto, state, service, report.sport, report.host_addr, report.ttl
        )
    }

    fn write_line(&mut self, line: &str) {
        if let Err(e) = writeln!(self.out, "{}", line) {
            warn!("output write failed: {}", e);
        }
    }
}

impl OutputSink for TextSink {
    fn init(&mut self, _settings: &ScanSettings) {}

    fn on_report(&mut self, report: &IpReport) {
        let line = match &self.template {
            Some(template) => render(template, report, self.resolver.as_ref()),
            None => Self::stock_line(report),
        };
        self.write_line(&line);

        // Banner lines ride underneath their report, like the classic output.
        if self.template.is_none() {
            for od in &report.output {
                match od {
                    unicornscan_core::OutputData::Banner(s) => {
                        self.write_line(&format!("\t{}", s));
                    }
                    unicornscan_core::OutputData::Os(s) => {
                        self.write_line(&format!("\tos: {}", s));
                    }
                }
            }
        }
    }

    fn on_arp_report(&mut self, report: &ArpReport) {
        let vendor = oui_vendor(&report.hwaddr)
            .map(|v| format!(" ({})", v))
            .unwrap_or_default();
        let line = format!(
            "ARP reply {} is {}{}",
            report.ipaddr,
            format_mac(&report.hwaddr),
            vendor
        );
        self.write_line(&line);
    }

    fn on_trace_report(&mut self, report: &TracePathReport) {
        self.write_line(&format!(
            "trace to {}:{} ({} hops{})",
            report.target_addr,
            report.target_port,
            report.hops.len(),
            if report.complete { "" } else { ", incomplete" },
        ));
        for hop in &report.hops {
            let marker = if hop.flags & TRACE_HOP_DEST != 0 {
                " <- target"
            } else {
                ""
            };
            self.write_line(&format!(
                "  {:>3}  {}  {:.3}ms{}",
                hop.hop_number,
                hop.router_addr,
                hop.rtt_us as f64 / 1000.0,
                marker
            ));
        }
    }

    fn fini(&mut self) {
        if let Err(e) = self.out.flush() {
            warn!("output flush failed: {}", e);
        }
    }
}

/// Machine-readable sink: one JSON object per line.
pub struct JsonSink {
    out: Box<dyn Write + Send>,
}

impl JsonSink {
    pub fn stdout() -> Self {
        Self {
            out: Box::new(std::io::stdout()),
        }
    }

    pub fn to_writer(out: Box<dyn Write + Send>) -> Self {
        Self { out }
    }

    fn emit<T: serde::Serialize>(&mut self, kind: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => {
                if let Err(e) = writeln!(self.out, "{{\"type\":\"{}\",\"data\":{}}}", kind, json) {
                    warn!("json output write failed: {}", e);
                }
            }
            Err(e) => warn!("json serialization failed: {}", e),
        }
    }
}

impl OutputSink for JsonSink {
    fn init(&mut self, _settings: &ScanSettings) {}

    fn on_report(&mut self, report: &IpReport) {
        self.emit("ip", report);
    }

    fn on_arp_report(&mut self, report: &ArpReport) {
        self.emit("arp", report);
    }

    fn on_trace_report(&mut self, report: &TracePathReport) {
        self.emit("trace", report);
    }

    fn fini(&mut self) {
        if let Err(e) = self.out.flush() {
            warn!("json output flush failed: {}", e);
        }
    }
}

/// Build the sinks requested by `-e`. Unknown names are an error so a typo
/// fails the scan at init instead of silently losing output.
pub fn build_sinks(names: &[String]) -> unicornscan_core::Result<Vec<Box<dyn OutputSink>>> {
    if names.is_empty() {
        return Ok(vec![Box::new(TextSink::stdout())]);
    }

    let mut sinks: Vec<Box<dyn OutputSink>> = Vec::new();
    for name in names {
        match name.as_str() {
            "text" => sinks.push(Box::new(TextSink::stdout())),
            "json" => sinks.push(Box::new(JsonSink::stdout())),
            other => {
                return Err(unicornscan_core::Error::Config(format!(
                    "unknown output module `{}` (available: text, json)",
                    other
                )))
            }
        }
    }
    Ok(sinks)
}
