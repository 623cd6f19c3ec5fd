//! Command-line argument definitions and settings assembly

use clap::Parser;
use unicornscan_core::{
    parse_mode_spec, parse_targets, Error, PortList, Result, ScanSettings,
};

/// Asynchronous stateless IPv4 network scanner.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "unicornscan",
    version,
    about = "Asynchronous stateless IPv4 network scanner",
    disable_help_subcommand = true
)]
pub struct Args {
    /// Scan mode: T (TCP SYN), Tsf (TCP connect), U, A, I, P. Compound
    /// phases join with `+` (A+T); per-phase options follow the letter
    /// (T100:R3:L15 = pps 100, 3 repeats, 15s recv timeout).
    #[arg(short = 'm', value_name = "mode", default_value = "T")]
    pub mode: String,

    /// Port list, e.g. 80,443,1000-2000:3 (`:N` selects N payloads/port).
    #[arg(short = 'p', value_name = "ports")]
    pub ports: Option<String>,

    /// Global packets-per-second ceiling.
    #[arg(short = 'r', value_name = "pps")]
    pub pps: Option<u32>,

    /// Blind repeats per probe.
    #[arg(short = 'R', value_name = "count")]
    pub repeats: Option<u32>,

    /// Seconds to keep listening after the last probe.
    #[arg(short = 'L', value_name = "seconds")]
    pub recv_timeout: Option<u16>,

    /// Spoof the probe source address.
    #[arg(short = 's', value_name = "addr")]
    pub src_addr: Option<String>,

    /// Override the source MAC (aa:bb:cc:dd:ee:ff).
    #[arg(short = 'H', value_name = "mac")]
    pub src_mac: Option<String>,

    /// Capture/send interface(s), comma-separated.
    #[arg(short = 'i', value_name = "iface")]
    pub interfaces: Option<String>,

    /// Probe TTL, fixed (`64`) or a range (`1-16`, enables tcptrace).
    #[arg(short = 't', value_name = "ttl")]
    pub ttl: Option<String>,

    /// IP ToS byte.
    #[arg(short = 'T', value_name = "tos")]
    pub tos: Option<u8>,

    /// Output module(s), comma-separated (text, json).
    #[arg(short = 'e', value_name = "modules")]
    pub output_modules: Option<String>,

    /// Report packets with bad network (N) and/or transport (T) checksums.
    #[arg(short = 'B', value_name = "NT")]
    pub broken: Option<String>,

    /// Drone URIs, comma-separated (host:port or unix:/path).
    #[arg(short = 'd', value_name = "drones")]
    pub drones: Option<String>,

    /// Keep and emit duplicate responses instead of deduplicating.
    #[arg(short = 'c')]
    pub process_dups: bool,

    /// Emit reports immediately instead of buffering until scan end.
    #[arg(short = 'I')]
    pub immediate: bool,

    /// Randomize target and port iteration order.
    #[arg(short = 'Z')]
    pub shuffle: bool,

    /// Custom report format template (%h host, %p port, %r response, ...).
    #[arg(short = 'E', long = "format", value_name = "template")]
    pub format: Option<String>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Target expressions: IPv4 addresses or CIDR blocks.
    #[arg(value_name = "targets", required = true)]
    pub targets: Vec<String>,
}

/// Parse `aa:bb:cc:dd:ee:ff`.
fn parse_mac(input: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = input.split(':').collect();
    if parts.len() != 6 {
        return Err(Error::Config(format!("bad MAC address `{}`", input)));
    }
    let mut mac = [0u8; 6];
    for (dst, part) in mac.iter_mut().zip(&parts) {
        *dst = u8::from_str_radix(part, 16)
            .map_err(|_| Error::Config(format!("bad MAC address `{}`", input)))?;
    }
    Ok(mac)
}

/// Parse `64` or `1-16`.
fn parse_ttl_range(input: &str) -> Result<(u8, u8)> {
    match input.split_once('-') {
        Some((lo, hi)) => {
            let lo: u8 = lo
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("bad TTL `{}`", input)))?;
            let hi: u8 = hi
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("bad TTL `{}`", input)))?;
            if lo == 0 || hi < lo {
                return Err(Error::Config(format!("bad TTL range `{}`", input)));
            }
            Ok((lo, hi))
        }
        None => {
            let ttl: u8 = input
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("bad TTL `{}`", input)))?;
            if ttl == 0 {
                return Err(Error::Config("TTL must be at least 1".to_string()));
            }
            Ok((ttl, ttl))
        }
    }
}

impl Args {
    /// Output module names requested via `-e`.
    pub fn sink_names(&self) -> Vec<String> {
        self.output_modules
            .as_deref()
            .map(|s| s.split(',').map(|m| m.trim().to_string()).collect())
            .unwrap_or_default()
    }

    /// Turn parsed flags into scan settings, validating everything.
    pub fn build_settings(&self) -> Result<ScanSettings> {
        let phases = parse_mode_spec(&self.mode)?;
        let targets = parse_targets(&self.targets)?;
        let ports = match &self.ports {
            Some(expr) => PortList::parse(expr)?,
            None => PortList::default_quick(),
        };

        let mut settings = ScanSettings::new(phases, targets, ports);

        // Explicit flags override the mode string's phase-1 seeding.
        if let Some(pps) = self.pps {
            if pps == 0 {
                return Err(Error::Config("pps must be at least 1".to_string()));
            }
            settings.pps = pps;
        }
        if let Some(repeats) = self.repeats {
            settings.repeats = repeats.max(1);
        }
        if let Some(timeout) = self.recv_timeout {
            settings.recv_timeout = timeout;
        }

        if let Some(addr) = &self.src_addr {
            settings.src_addr = Some(
                addr.parse()
                    .map_err(|_| Error::Config(format!("bad source address `{}`", addr)))?,
            );
        }
        if let Some(mac) = &self.src_mac {
            settings.src_mac = Some(parse_mac(mac)?);
        }
        if let Some(ifaces) = &self.interfaces {
            settings.interfaces = ifaces.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Some(ttl) = &self.ttl {
            let (lo, hi) = parse_ttl_range(ttl)?;
            settings.ttl_min = lo;
            settings.ttl_max = hi;
        }
        if let Some(tos) = self.tos {
            settings.tos = tos;
        }
        if let Some(broken) = &self.broken {
            for c in broken.chars() {
                match c {
                    'N' => settings.options.report_broken_net = true,
                    'T' => settings.options.report_broken_trans = true,
                    other => {
                        return Err(Error::Config(format!(
                            "bad -B flag `{}` (N and T are valid)",
                            other
                        )))
                    }
                }
            }
        }
        if let Some(drones) = &self.drones {
            settings.drones = drones.split(',').map(|s| s.trim().to_string()).collect();
        }

        settings.options.process_dups = self.process_dups;
        settings.options.immediate = self.immediate;
        settings.options.shuffle = self.shuffle;
        settings.format = self.format.clone();

        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use unicornscan_core::ScanMode;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_minimal_invocation() {
        let args = parse(&["unicornscan", "192.168.1.0/24"]);
        let settings = args.build_settings().unwrap();
        assert_eq!(settings.phases.len(), 1);
        assert_eq!(settings.phases[0].mode, ScanMode::Tcp);
        assert!(!settings.ports.is_empty());
    }

    #[test]
    fn test_classic_syn_scan() {
        let args = parse(&[
            "unicornscan",
            "-mT",
            "-p",
            "22",
            "-r",
            "100",
            "192.168.77.5",
        ]);
        let settings = args.build_settings().unwrap();
        assert_eq!(settings.pps, 100);
        assert_eq!(settings.ports.entries()[0].port(), 22);
    }

    #[test]
    fn test_compound_mode() {
        let args = parse(&["unicornscan", "-mA+T", "-p", "80", "192.168.77.0/28"]);
        let settings = args.build_settings().unwrap();
        assert_eq!(settings.phases.len(), 2);
        assert_eq!(settings.phases[0].mode, ScanMode::Arp);
        assert!(settings.is_compound());
    }

    #[test]
    fn test_ttl_range_enables_trace() {
        let args = parse(&["unicornscan", "-mTs", "-p", "443", "-t", "1-5", "8.8.8.8"]);
        let mut settings = args.build_settings().unwrap();
        assert_eq!(settings.ttl_min, 1);
        assert_eq!(settings.ttl_max, 5);
        settings.apply_trace_promotion();
        assert_eq!(settings.phases[0].mode, ScanMode::TcpTrace);
    }

    #[test]
    fn test_mac_and_source_overrides() {
        let args = parse(&[
            "unicornscan",
            "-s",
            "10.0.0.99",
            "-H",
            "de:ad:be:ef:00:01",
            "10.0.0.1",
        ]);
        let settings = args.build_settings().unwrap();
        assert_eq!(settings.src_addr, Some("10.0.0.99".parse().unwrap()));
        assert_eq!(settings.src_mac, Some([0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]));
    }

    #[test]
    fn test_broken_checksum_flags_compose() {
        let args = parse(&["unicornscan", "-B", "NT", "10.0.0.1"]);
        let settings = args.build_settings().unwrap();
        assert!(settings.options.report_broken_net);
        assert!(settings.options.report_broken_trans);

        let args = parse(&["unicornscan", "-B", "N", "10.0.0.1"]);
        let settings = args.build_settings().unwrap();
        assert!(settings.options.report_broken_net);
        assert!(!settings.options.report_broken_trans);
    }

    #[test]
    fn test_drone_list() {
        let args = parse(&[
            "unicornscan",
            "-d",
            "scanhost:475,unix:/tmp/u/send",
            "10.0.0.1",
        ]);
        let settings = args.build_settings().unwrap();
        assert_eq!(settings.drones.len(), 2);
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        assert!(parse(&["unicornscan", "-mQ", "10.0.0.1"])
            .build_settings()
            .is_err());
        assert!(parse(&["unicornscan", "-p", "99999", "10.0.0.1"])
            .build_settings()
            .is_err());
        assert!(parse(&["unicornscan", "-H", "nope", "10.0.0.1"])
            .build_settings()
            .is_err());
        assert!(parse(&["unicornscan", "-t", "9-1", "10.0.0.1"])
            .build_settings()
            .is_err());
        assert!(parse(&["unicornscan", "-B", "X", "10.0.0.1"])
            .build_settings()
            .is_err());
        assert!(parse(&["unicornscan", "not-an-ip"]).build_settings().is_err());
    }

    #[test]
    fn test_targets_required() {
        assert!(Args::try_parse_from(["unicornscan", "-mT"]).is_err());
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("00:0c:29:aa:bb:cc").unwrap(),
            [0x00, 0x0c, 0x29, 0xaa, 0xbb, 0xcc]
        );
        assert!(parse_mac("00:0c:29:aa:bb").is_err());
        assert!(parse_mac("zz:0c:29:aa:bb:cc").is_err());
    }

    #[test]
    fn test_parse_ttl_range() {
        assert_eq!(parse_ttl_range("64").unwrap(), (64, 64));
        assert_eq!(parse_ttl_range("1-16").unwrap(), (1, 16));
        assert!(parse_ttl_range("0").is_err());
        assert!(parse_ttl_range("5-2").is_err());
        assert!(parse_ttl_range("x").is_err());
    }
}
