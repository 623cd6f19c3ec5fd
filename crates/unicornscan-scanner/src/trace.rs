//! Traceroute session state
//!
//! One session per (target, port) tcptrace invocation. The sender records a
//! send timestamp per TTL; the listener resolves ICMP Time-Exceeded answers
//! back to their TTL via the encoded source port and fills in hops. A
//! SYN-ACK from the target completes the session, which then flattens into a
//! trace-path report emitted exactly once.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use tracing::debug;
use unicornscan_core::{
    TracePathHop, TracePathReport, TRACE_HOP_DEST, TRACE_HOP_NONE, TRACE_HOP_RECV,
    TRACE_PATH_MAGIC, TRACE_PATH_MAX_HOPS,
};

/// Per-TTL record inside a session.
#[derive(Debug, Clone, Copy)]
struct Hop {
    router_addr: Ipv4Addr,
    rtt_us: u32,
    flags: u8,
    send_time: Option<DateTime<Utc>>,
}

impl Hop {
    fn empty() -> Self {
        Self {
            router_addr: Ipv4Addr::UNSPECIFIED,
            rtt_us: 0,
            flags: TRACE_HOP_NONE,
            send_time: None,
        }
    }
}

/// State for one traceroute toward (target, port).
#[derive(Debug, Clone)]
pub struct TraceSession {
    target_addr: Ipv4Addr,
    target_port: u16,
    min_ttl: u8,
    max_ttl: u8,
    complete: bool,
    emitted: bool,
    hops: Vec<Hop>,
}

impl TraceSession {
    pub fn new(target_addr: Ipv4Addr, target_port: u16, min_ttl: u8, max_ttl: u8) -> Self {
        debug!(target = %target_addr, port = target_port, min_ttl, max_ttl, "trace session created");
        Self {
            target_addr,
            target_port,
            min_ttl: min_ttl.max(1),
            max_ttl,
            complete: false,
            emitted: false,
            hops: vec![Hop::empty(); 256],
        }
    }

    pub fn target(&self) -> (Ipv4Addr, u16) {
        (self.target_addr, self.target_port)
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// The sender stamps each probe as it leaves.
    pub fn record_send(&mut self, ttl: u8, when: DateTime<Utc>) {
        self.hops[ttl as usize].send_time = Some(when);
    }

    /// RTT in microseconds against the recorded send time, when known.
    fn rtt_us(&self, ttl: u8, when: DateTime<Utc>) -> u32 {
        match self.hops[ttl as usize].send_time {
            Some(sent) => (when - sent).num_microseconds().unwrap_or(0).max(0) as u32,
            None => 0,
        }
    }

    /// Record an intermediate hop (ICMP Time-Exceeded or Unreachable).
    pub fn record_hop(&mut self, ttl: u8, router_addr: Ipv4Addr, when: DateTime<Utc>, flags: u8) {
        if ttl == 0 {
            return;
        }
        let rtt_us = self.rtt_us(ttl, when);
        let hop = &mut self.hops[ttl as usize];
        hop.router_addr = router_addr;
        hop.rtt_us = rtt_us;
        hop.flags = flags;
        debug!(ttl, router = %router_addr, rtt_us, flags, "recorded trace hop");
    }

    /// The destination answered at `ttl`; the path is complete.
    pub fn record_destination(&mut self, ttl: u8, when: DateTime<Utc>) {
        if ttl == 0 {
            return;
        }
        let rtt_us = self.rtt_us(ttl, when);
        let hop = &mut self.hops[ttl as usize];
        hop.router_addr = self.target_addr;
        hop.rtt_us = rtt_us;
        hop.flags = TRACE_HOP_DEST;
        self.complete = true;
        debug!(ttl, "trace session complete");
    }

    /// Flatten into a path report: responding hops in send order, capped at
    /// the wire limit. Returns None after the first call, so the path is
    /// emitted exactly once.
    pub fn take_path_report(&mut self) -> Option<TracePathReport> {
        if self.emitted {
            return None;
        }
        self.emitted = true;

        let mut hops = Vec::new();
        for ttl in self.min_ttl..=self.max_ttl {
            let hop = &self.hops[ttl as usize];
            if hop.flags != TRACE_HOP_NONE {
                hops.push(TracePathHop {
                    router_addr: hop.router_addr,
                    hop_number: ttl,
                    rtt_us: hop.rtt_us,
                    flags: hop.flags,
                });
                if hops.len() >= TRACE_PATH_MAX_HOPS {
                    break;
                }
            }
            // The destination hop ends the path even below max_ttl.
            if hop.flags == TRACE_HOP_DEST {
                break;
            }
        }

        Some(TracePathReport {
            magic: TRACE_PATH_MAGIC,
            target_addr: self.target_addr,
            target_port: self.target_port,
            complete: self.complete,
            hops,
        })
    }
}

/// All live sessions of a tcptrace phase, keyed by (target, port).
#[derive(Debug, Default)]
pub struct TraceTable {
    sessions: HashMap<(Ipv4Addr, u16), TraceSession>,
}

impl TraceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session for (target, port), created on first touch.
    pub fn session(
        &mut self,
        target: Ipv4Addr,
        port: u16,
        min_ttl: u8,
        max_ttl: u8,
    ) -> &mut TraceSession {
        self.sessions
            .entry((target, port))
            .or_insert_with(|| TraceSession::new(target, port, min_ttl, max_ttl))
    }

    /// Existing session lookup, no creation.
    pub fn get_mut(&mut self, target: Ipv4Addr, port: u16) -> Option<&mut TraceSession> {
        self.sessions.get_mut(&(target, port))
    }

    /// Drain path reports for every session, complete or not.
    pub fn drain_reports(&mut self) -> Vec<TracePathReport> {
        let mut reports: Vec<TracePathReport> = self
            .sessions
            .values_mut()
            .filter_map(|s| s.take_path_report())
            .collect();
        reports.sort_by_key(|r| (u32::from(r.target_addr), r.target_port));
        self.sessions.clear();
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_three_hop_path() {
        // S4 shape: R1, R2, R3 answer TE; the target answers at TTL 4.
        let base = t0();
        let mut session = TraceSession::new(Ipv4Addr::new(8, 8, 8, 8), 443, 1, 5);
        for ttl in 1u8..=5 {
            session.record_send(ttl, base + Duration::microseconds(ttl as i64 * 10));
        }

        let routers = [
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 1, 1),
            Ipv4Addr::new(172, 16, 0, 1),
        ];
        for (i, router) in routers.iter().enumerate() {
            let ttl = (i + 1) as u8;
            session.record_hop(
                ttl,
                *router,
                base + Duration::microseconds(1000 * ttl as i64),
                TRACE_HOP_RECV,
            );
        }
        session.record_destination(4, base + Duration::microseconds(5000));
        assert!(session.is_complete());

        let report = session.take_path_report().unwrap();
        assert!(report.complete);
        assert_eq!(report.hops.len(), 4);
        for (i, hop) in report.hops[..3].iter().enumerate() {
            assert_eq!(hop.hop_number, (i + 1) as u8);
            assert_eq!(hop.flags, TRACE_HOP_RECV);
            assert_eq!(hop.router_addr, routers[i]);
            assert!(hop.rtt_us > 0);
        }
        assert_eq!(report.hops[3].flags, TRACE_HOP_DEST);
        assert_eq!(report.hops[3].router_addr, Ipv4Addr::new(8, 8, 8, 8));
    }

    #[test]
    fn test_out_of_order_hops_land_by_ttl() {
        let base = t0();
        let mut session = TraceSession::new(Ipv4Addr::new(1, 1, 1, 1), 80, 1, 3);
        for ttl in 1u8..=3 {
            session.record_send(ttl, base);
        }
        // TTL 3's answer arrives before TTL 1's.
        session.record_hop(3, Ipv4Addr::new(3, 3, 3, 3), base, TRACE_HOP_RECV);
        session.record_hop(1, Ipv4Addr::new(1, 0, 0, 1), base, TRACE_HOP_RECV);

        let report = session.take_path_report().unwrap();
        assert_eq!(report.hops.len(), 2);
        assert_eq!(report.hops[0].hop_number, 1);
        assert_eq!(report.hops[1].hop_number, 3);
        assert!(!report.complete);
    }

    #[test]
    fn test_report_emitted_once() {
        let mut session = TraceSession::new(Ipv4Addr::new(1, 1, 1, 1), 80, 1, 3);
        session.record_destination(1, t0());
        assert!(session.take_path_report().is_some());
        assert!(session.take_path_report().is_none());
    }

    #[test]
    fn test_table_drain_sorted() {
        let mut table = TraceTable::new();
        table
            .session(Ipv4Addr::new(9, 9, 9, 9), 443, 1, 4)
            .record_destination(2, t0());
        table
            .session(Ipv4Addr::new(1, 1, 1, 1), 80, 1, 4)
            .record_destination(3, t0());

        let reports = table.drain_reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].target_addr, Ipv4Addr::new(1, 1, 1, 1));
        assert_eq!(reports[1].target_addr, Ipv4Addr::new(9, 9, 9, 9));
        assert!(table.drain_reports().is_empty());
    }

    #[test]
    fn test_rtt_zero_without_send_stamp() {
        let mut session = TraceSession::new(Ipv4Addr::new(1, 1, 1, 1), 80, 1, 3);
        session.record_hop(2, Ipv4Addr::new(5, 5, 5, 5), t0(), TRACE_HOP_RECV);
        let report = session.take_path_report().unwrap();
        assert_eq!(report.hops[0].rtt_us, 0);
    }
}
