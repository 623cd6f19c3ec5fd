//! Scan settings, phases, and mode-string parsing
//!
//! The mode string grammar follows the classic surface:
//!
//! ```text
//! -m <phase>[+<phase>...]
//! <phase> := <mode-letter>[<tcp-flag-letters>][<pps>][:R<repeats>][:L<timeout>]
//! ```
//!
//! Mode letters: `T` (TCP), `U` (UDP), `A` (ARP), `I` (ICMP), `P` (raw IP).
//! `Tsf` selects TCP connect mode. TCP flag letters after `T` set (uppercase)
//! or clear (lowercase) individual flags: `FfSsRrPpAaUuEeCc`; with no letters
//! the default is a plain SYN. Per-phase values of 0 mean "use the global
//! setting"; a non-zero value on phase 1 seeds the globals.

use crate::error::{Error, Result};
use crate::portlist::PortList;
use crate::target::Target;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Default receive quiescence timeout in seconds.
pub const DEF_SCAN_TIMEOUT: u16 = 7;

/// Default global packet rate.
pub const DEF_PPS: u32 = 300;

/// TCP header flag bits as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);
    pub const ECE: TcpFlags = TcpFlags(0x40);
    pub const CWR: TcpFlags = TcpFlags(0x80);

    /// No flags set.
    pub const fn empty() -> Self {
        TcpFlags(0)
    }

    /// Union of two flag sets.
    pub const fn with(self, other: TcpFlags) -> Self {
        TcpFlags(self.0 | other.0)
    }

    /// Whether every bit of `flag` is set.
    pub const fn has(self, flag: TcpFlags) -> bool {
        (self.0 & flag.0) == flag.0
    }

    /// Raw byte value.
    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (TcpFlags::FIN, 'F'),
            (TcpFlags::SYN, 'S'),
            (TcpFlags::RST, 'R'),
            (TcpFlags::PSH, 'P'),
            (TcpFlags::ACK, 'A'),
            (TcpFlags::URG, 'U'),
            (TcpFlags::ECE, 'E'),
            (TcpFlags::CWR, 'C'),
        ];
        for (flag, c) in names {
            if self.has(flag) {
                write!(f, "{}", c)?;
            }
        }
        Ok(())
    }
}

/// Decode TCP flag letters: uppercase sets, lowercase clears.
pub fn decode_tcp_flags(letters: &str) -> Result<TcpFlags> {
    let mut bits = 0u8;
    for c in letters.chars() {
        match c {
            'F' => bits |= TcpFlags::FIN.0,
            'f' => bits &= !TcpFlags::FIN.0,
            'S' => bits |= TcpFlags::SYN.0,
            's' => bits &= !TcpFlags::SYN.0,
            'R' => bits |= TcpFlags::RST.0,
            'r' => bits &= !TcpFlags::RST.0,
            'P' => bits |= TcpFlags::PSH.0,
            'p' => bits &= !TcpFlags::PSH.0,
            'A' => bits |= TcpFlags::ACK.0,
            'a' => bits &= !TcpFlags::ACK.0,
            'U' => bits |= TcpFlags::URG.0,
            'u' => bits &= !TcpFlags::URG.0,
            'E' => bits |= TcpFlags::ECE.0,
            'e' => bits &= !TcpFlags::ECE.0,
            'C' => bits |= TcpFlags::CWR.0,
            'c' => bits &= !TcpFlags::CWR.0,
            _ => {
                return Err(Error::Config(format!(
                    "unknown TCP flag `{}` (FfSsRrPpAaUuEeCc are valid)",
                    c
                )))
            }
        }
    }
    Ok(TcpFlags(bits))
}

/// Scan mode for one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanMode {
    /// TCP probe scan (SYN by default).
    Tcp,
    /// TCP connect scan (full handshake via the OS stack).
    TcpConnect,
    /// UDP probe scan.
    Udp,
    /// ARP sweep (local segment only).
    Arp,
    /// ICMP echo sweep.
    Icmp,
    /// Raw IP protocol probes.
    IpRaw,
    /// TCP traceroute with TTL iteration.
    TcpTrace,
}

impl ScanMode {
    /// Whether responses carry TCP semantics (cookie in ISN).
    pub fn is_tcp(&self) -> bool {
        matches!(self, ScanMode::Tcp | ScanMode::TcpConnect | ScanMode::TcpTrace)
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Tcp => write!(f, "TCPscan"),
            ScanMode::TcpConnect => write!(f, "TCPconnect"),
            ScanMode::Udp => write!(f, "UDPscan"),
            ScanMode::Arp => write!(f, "ARPscan"),
            ScanMode::Icmp => write!(f, "ICMPscan"),
            ScanMode::IpRaw => write!(f, "IPscan"),
            ScanMode::TcpTrace => write!(f, "TCPtrace"),
        }
    }
}

/// One phase of a (possibly compound) scan.
///
/// `pps`, `repeats` and `recv_timeout` of 0 defer to the global settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub mode: ScanMode,
    pub tcp_flags: TcpFlags,
    pub pps: u32,
    pub repeats: u32,
    pub recv_timeout: u16,
}

impl PhaseSpec {
    /// Resolve the effective rate for this phase against the global setting.
    pub fn effective_pps(&self, global: u32) -> u32 {
        if self.pps > 0 {
            self.pps
        } else {
            global
        }
    }

    /// Resolve the effective repeat count.
    pub fn effective_repeats(&self, global: u32) -> u32 {
        if self.repeats > 0 {
            self.repeats
        } else {
            global.max(1)
        }
    }

    /// Resolve the effective receive timeout.
    pub fn effective_recv_timeout(&self, global: u16) -> u16 {
        if self.recv_timeout > 0 {
            self.recv_timeout
        } else {
            global
        }
    }
}

/// Parse a full mode expression, compound phases joined by `+`.
pub fn parse_mode_spec(spec: &str) -> Result<Vec<PhaseSpec>> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(Error::Config("empty mode string".to_string()));
    }

    spec.split('+').map(parse_phase).collect()
}

/// Parse one phase term: `<mode>[<flags>][<pps>][:R<n>][:L<n>]`.
fn parse_phase(term: &str) -> Result<PhaseSpec> {
    let term = term.trim();
    if term.is_empty() {
        return Err(Error::Config("empty phase in mode string".to_string()));
    }

    let first = term
        .chars()
        .next()
        .ok_or_else(|| Error::Config("empty phase".to_string()))?;

    let mut mode;
    let mut tcp_flags = TcpFlags::empty();
    let mut rest_start = 1;

    match first {
        'T' => {
            mode = ScanMode::Tcp;
            // Collect flag letters up to the first digit or ':'.
            let letters: String = term[1..]
                .chars()
                .take_while(|c| !c.is_ascii_digit() && *c != ':')
                .collect();
            rest_start = 1 + letters.len();
            if letters == "sf" {
                mode = ScanMode::TcpConnect;
                tcp_flags = TcpFlags::SYN;
            } else if letters.is_empty() {
                tcp_flags = TcpFlags::SYN;
            } else {
                tcp_flags = decode_tcp_flags(&letters)?;
            }
        }
        'U' => mode = ScanMode::Udp,
        'A' => mode = ScanMode::Arp,
        'I' => mode = ScanMode::Icmp,
        'P' => mode = ScanMode::IpRaw,
        // Bare `sf` is accepted as connect mode for compatibility.
        's' if term.starts_with("sf") => {
            mode = ScanMode::TcpConnect;
            tcp_flags = TcpFlags::SYN;
            rest_start = 2;
        }
        other => {
            return Err(Error::Config(format!("unknown scan mode `{}`", other)));
        }
    }

    let rest = &term[rest_start.min(term.len())..];

    // Optional inline PPS digits.
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    let pps: u32 = if digits.is_empty() {
        0
    } else {
        digits
            .parse()
            .map_err(|_| Error::Config(format!("bad pps `{}`", digits)))?
    };

    let mut repeats = 0u32;
    let mut recv_timeout = 0u16;

    // Phase modifiers: `:R<n>` and `:L<n>` in any order.
    let mut walk = &rest[digits.len()..];
    while !walk.is_empty() {
        let Some(stripped) = walk.strip_prefix(':') else {
            return Err(Error::Config(format!(
                "unexpected characters in mode string: `{}`",
                walk
            )));
        };
        let mut tail = stripped.chars();
        let which = tail.next().ok_or_else(|| {
            Error::Config("dangling `:` in mode string".to_string())
        })?;
        let value: String = tail.clone().take_while(|c| c.is_ascii_digit()).collect();
        if value.is_empty() {
            return Err(Error::Config(format!(
                "missing value after `:{}`",
                which
            )));
        }
        match which {
            'R' => {
                repeats = value
                    .parse()
                    .map_err(|_| Error::Config("bad repeats value after :R".to_string()))?;
            }
            'L' => {
                recv_timeout = value
                    .parse()
                    .map_err(|_| Error::Config("bad timeout value after :L".to_string()))?;
            }
            other => {
                return Err(Error::Config(format!(
                    "unknown phase modifier `:{}` (valid: :R<repeats> :L<timeout>)",
                    other
                )));
            }
        }
        walk = &stripped[1 + value.len()..];
    }

    Ok(PhaseSpec {
        mode,
        tcp_flags,
        pps,
        repeats,
        recv_timeout,
    })
}

/// Master-level option flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Emit each report as it is first seen instead of buffering.
    pub immediate: bool,
    /// Keep duplicate responses chained per key instead of discarding.
    pub process_dups: bool,
    /// Shuffle target/port iteration order.
    pub shuffle: bool,
    /// Report frames with bad network checksums (sets a report flag).
    pub report_broken_net: bool,
    /// Report frames with bad transport checksums.
    pub report_broken_trans: bool,
    /// Open the capture handle in promiscuous mode.
    pub promisc: bool,
    /// Complete a TCP handshake on SYN-ACK and grab a banner.
    pub do_connect: bool,
}

/// Everything the master needs to drive one scan, created at startup and
/// alive until process exit. All subsystems receive this (or slices of it)
/// explicitly; there is no process-global settings object.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    /// Global packets-per-second ceiling.
    pub pps: u32,
    /// Global per-probe repeat count.
    pub repeats: u32,
    /// Global receive quiescence timeout (seconds).
    pub recv_timeout: u16,
    /// Phases in execution order.
    pub phases: Vec<PhaseSpec>,
    /// Index of the currently executing phase.
    pub current_phase: usize,
    /// Scan iteration counter (for repeated whole-scan runs).
    pub current_iteration: u32,
    /// Number of sender drones.
    pub num_senders: u32,
    /// Number of listener drones.
    pub num_listeners: u32,
    /// Master option flags.
    pub options: ScanOptions,
    /// Parsed targets.
    pub targets: Vec<Target>,
    /// Parsed port list.
    pub ports: PortList,
    /// Spoofed source address, if any.
    pub src_addr: Option<Ipv4Addr>,
    /// Overridden source MAC, if any.
    pub src_mac: Option<[u8; 6]>,
    /// Capture/send interface names (empty = auto-detect).
    pub interfaces: Vec<String>,
    /// IP TTL range for probes; equal values mean a fixed TTL.
    pub ttl_min: u8,
    pub ttl_max: u8,
    /// IP ToS byte.
    pub tos: u8,
    /// Fixed source port, or -1 to randomize.
    pub src_port: i32,
    /// Per-scan SYN-cookie key, shared by every workunit.
    pub syn_key: u32,
    /// Unique scan identifier.
    pub scan_id: Uuid,
    /// Remote drone URIs.
    pub drones: Vec<String>,
    /// Output format template override.
    pub format: Option<String>,
}

impl ScanSettings {
    /// Build settings with defaults for everything not yet known.
    pub fn new(phases: Vec<PhaseSpec>, targets: Vec<Target>, ports: PortList) -> Self {
        let mut settings = Self {
            pps: DEF_PPS,
            repeats: 1,
            recv_timeout: DEF_SCAN_TIMEOUT,
            phases,
            current_phase: 0,
            current_iteration: 0,
            num_senders: 1,
            num_listeners: 1,
            options: ScanOptions::default(),
            targets,
            ports,
            src_addr: None,
            src_mac: None,
            interfaces: Vec::new(),
            ttl_min: 64,
            ttl_max: 64,
            tos: 0,
            src_port: -1,
            syn_key: rand::random(),
            scan_id: Uuid::new_v4(),
            drones: Vec::new(),
            format: None,
        };
        settings.seed_globals_from_first_phase();
        settings
    }

    /// Phase-1 non-zero per-phase values become the global defaults.
    fn seed_globals_from_first_phase(&mut self) {
        if let Some(first) = self.phases.first() {
            if first.pps > 0 {
                self.pps = first.pps;
            }
            if first.repeats > 0 {
                self.repeats = first.repeats;
            }
            if first.recv_timeout > 0 {
                self.recv_timeout = first.recv_timeout;
            }
        }
    }

    /// Whether this is a compound (multi-phase) scan.
    pub fn is_compound(&self) -> bool {
        self.phases.len() > 1
    }

    /// Whether TTL iteration turns the TCP phases into traceroutes.
    pub fn is_trace(&self) -> bool {
        self.ttl_max > self.ttl_min
    }

    /// Promote plain TCP phases to trace mode when a TTL range is set.
    /// A trace always probes with SYN so the destination answers.
    pub fn apply_trace_promotion(&mut self) {
        if !self.is_trace() {
            return;
        }
        for phase in &mut self.phases {
            if phase.mode == ScanMode::Tcp {
                phase.mode = ScanMode::TcpTrace;
                phase.tcp_flags = TcpFlags::SYN;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_flags_set_and_clear() {
        assert_eq!(decode_tcp_flags("S").unwrap(), TcpFlags::SYN);
        assert_eq!(
            decode_tcp_flags("SF").unwrap(),
            TcpFlags::SYN.with(TcpFlags::FIN)
        );
        // Lowercase clears previously set bits.
        assert_eq!(decode_tcp_flags("Ss").unwrap(), TcpFlags::empty());
        assert_eq!(
            decode_tcp_flags("SAf").unwrap(),
            TcpFlags::SYN.with(TcpFlags::ACK)
        );
        assert!(decode_tcp_flags("X").is_err());
    }

    #[test]
    fn test_parse_simple_tcp() {
        let phases = parse_mode_spec("T").unwrap();
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].mode, ScanMode::Tcp);
        assert_eq!(phases[0].tcp_flags, TcpFlags::SYN);
        assert_eq!(phases[0].pps, 0);
    }

    #[test]
    fn test_parse_tcp_with_flags() {
        let phases = parse_mode_spec("TSF").unwrap();
        assert_eq!(phases[0].tcp_flags, TcpFlags::SYN.with(TcpFlags::FIN));
    }

    #[test]
    fn test_parse_connect_mode() {
        let phases = parse_mode_spec("Tsf").unwrap();
        assert_eq!(phases[0].mode, ScanMode::TcpConnect);
        let phases = parse_mode_spec("sf").unwrap();
        assert_eq!(phases[0].mode, ScanMode::TcpConnect);
    }

    #[test]
    fn test_parse_inline_pps_and_modifiers() {
        let phases = parse_mode_spec("T100:R3:L15").unwrap();
        assert_eq!(phases[0].pps, 100);
        assert_eq!(phases[0].repeats, 3);
        assert_eq!(phases[0].recv_timeout, 15);
    }

    #[test]
    fn test_parse_compound() {
        let phases = parse_mode_spec("A+T").unwrap();
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[0].mode, ScanMode::Arp);
        assert_eq!(phases[1].mode, ScanMode::Tcp);
    }

    #[test]
    fn test_parse_compound_with_per_phase_options() {
        let phases = parse_mode_spec("A500:R2+T100:L10").unwrap();
        assert_eq!(phases[0].pps, 500);
        assert_eq!(phases[0].repeats, 2);
        assert_eq!(phases[1].pps, 100);
        assert_eq!(phases[1].recv_timeout, 10);
    }

    #[test]
    fn test_parse_other_modes() {
        assert_eq!(parse_mode_spec("U").unwrap()[0].mode, ScanMode::Udp);
        assert_eq!(parse_mode_spec("A").unwrap()[0].mode, ScanMode::Arp);
        assert_eq!(parse_mode_spec("I").unwrap()[0].mode, ScanMode::Icmp);
        assert_eq!(parse_mode_spec("P").unwrap()[0].mode, ScanMode::IpRaw);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_mode_spec("").is_err());
        assert!(parse_mode_spec("Z").is_err());
        assert!(parse_mode_spec("T:R").is_err());
        assert!(parse_mode_spec("T:X5").is_err());
        assert!(parse_mode_spec("T100junk").is_err());
    }

    #[test]
    fn test_phase_precedence() {
        let phase = PhaseSpec {
            mode: ScanMode::Tcp,
            tcp_flags: TcpFlags::SYN,
            pps: 0,
            repeats: 0,
            recv_timeout: 0,
        };
        assert_eq!(phase.effective_pps(300), 300);
        assert_eq!(phase.effective_repeats(2), 2);
        assert_eq!(phase.effective_recv_timeout(7), 7);

        let phase = PhaseSpec {
            pps: 100,
            repeats: 3,
            recv_timeout: 15,
            ..phase
        };
        // Non-zero per-phase values win over the globals.
        assert_eq!(phase.effective_pps(300), 100);
        assert_eq!(phase.effective_repeats(2), 3);
        assert_eq!(phase.effective_recv_timeout(7), 15);
    }

    #[test]
    fn test_globals_seeded_from_first_phase() {
        let phases = parse_mode_spec("T100:R3:L15").unwrap();
        let settings = ScanSettings::new(
            phases,
            vec![Target::parse("10.0.0.1").unwrap()],
            PortList::parse("80").unwrap(),
        );
        assert_eq!(settings.pps, 100);
        assert_eq!(settings.repeats, 3);
        assert_eq!(settings.recv_timeout, 15);
    }

    #[test]
    fn test_trace_promotion() {
        let phases = parse_mode_spec("T").unwrap();
        let mut settings = ScanSettings::new(
            phases,
            vec![Target::parse("8.8.8.8").unwrap()],
            PortList::parse("443").unwrap(),
        );
        settings.ttl_min = 1;
        settings.ttl_max = 5;
        settings.apply_trace_promotion();
        assert_eq!(settings.phases[0].mode, ScanMode::TcpTrace);
        assert_eq!(settings.phases[0].tcp_flags, TcpFlags::SYN);
    }

    #[test]
    fn test_mode_display() {
        assert_eq!(ScanMode::Tcp.to_string(), "TCPscan");
        assert_eq!(ScanMode::Arp.to_string(), "ARPscan");
        assert_eq!(ScanMode::TcpTrace.to_string(), "TCPtrace");
    }

    #[test]
    fn test_flags_display() {
        assert_eq!(TcpFlags::SYN.with(TcpFlags::ACK).to_string(), "SA");
    }
}
