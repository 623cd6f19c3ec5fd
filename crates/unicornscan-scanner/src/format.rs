//! Report format templates
//!
//! printf-like substitution over report fields. Two-letter specifiers are
//! matched before their one-letter prefixes (`%hn` before `%h`), and the
//! usual backslash escapes are honored.
//!
//! | Spec | Meaning |
//! |------|---------|
//! | `%h` | host address, `%hn` host with rDNS |
//! | `%p` | responding port, `%pn` with service name |
//! | `%L` | our local port, `%Ln` with service name |
//! | `%r` | protocol response string (banner summary) |
//! | `%t` | received TTL |
//! | `%s` | our send address |
//! | `%T` | trace hop address |
//! | `%S` | TCP remote sequence number |
//! | `%w` | TCP window |
//! | `%M` | responder MAC, `%o` its OUI vendor |
//! | `%C` | two-letter country code |
//!
//! Name lookups beyond the built-in tables (rDNS, GeoIP country) come from a
//! [`NameResolver`] hook so the enrichment stays an external concern.

use crate::names::{format_mac, oui_vendor, service_name};
use std::net::Ipv4Addr;
use unicornscan_core::{IpReport, OutputData};

/// External name enrichment hook (rDNS, GeoIP).
pub trait NameResolver: Send + Sync {
    /// Reverse-DNS name for an address.
    fn rdns(&self, _addr: Ipv4Addr) -> Option<String> {
        None
    }

    /// Two-letter country code for an address.
    fn country(&self, _addr: Ipv4Addr) -> Option<String> {
        None
    }
}

/// The default resolver: no external lookups.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoResolver;

impl NameResolver for NoResolver {}

/// Render `template` for one report.
pub fn render(template: &str, report: &IpReport, resolver: &dyn NameResolver) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '%' => {
                let Some(&spec) = chars.peek() else {
                    out.push('%');
                    break;
                };
                chars.next();
                // Two-letter specifiers first.
                let two = matches!(spec, 'h' | 'p' | 'L') && chars.peek() == Some(&'n');
                if two {
                    chars.next();
                }
                render_spec(&mut out, spec, two, report, resolver);
            }
            '\\' => {
                let Some(&esc) = chars.peek() else {
                    out.push('\\');
                    break;
                };
                chars.next();
                out.push(match esc {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    'a' => '\x07',
                    'b' => '\x08',
                    'f' => '\x0c',
                    'v' => '\x0b',
                    '\\' => '\\',
                    other => other,
                });
            }
            other => out.push(other),
        }
    }

    out
}

fn render_spec(
    out: &mut String,
    spec: char,
    with_name: bool,
    report: &IpReport,
    resolver: &dyn NameResolver,
) {
    match (spec, with_name) {
        ('h', false) => out.push_str(&report.host_addr.to_string()),
        ('h', true) => match resolver.rdns(report.host_addr) {
            Some(name) => out.push_str(&name),
            None => out.push_str(&report.host_addr.to_string()),
        },
        ('p', false) => out.push_str(&report.sport.to_string()),
        ('p', true) => out.push_str(service_name(report.sport).unwrap_or("unknown")),
        ('L', false) => out.push_str(&report.dport.to_string()),
        ('L', true) => out.push_str(service_name(report.dport).unwrap_or("unknown")),
        ('r', _) => {
            // The last attached banner wins; OS strings stay out of %r.
            let banner = report.output.iter().rev().find_map(|od| match od {
                OutputData::Banner(s) => Some(s.as_str()),
                _ => None,
            });
            out.push_str(banner.unwrap_or(""));
        }
        ('t', _) => out.push_str(&report.ttl.to_string()),
        ('s', _) => out.push_str(&report.send_addr.to_string()),
        ('T', _) => out.push_str(&report.trace_addr.to_string()),
        ('S', _) => out.push_str(&report.tseq.to_string()),
        ('w', _) => out.push_str(&report.window_size.to_string()),
        ('M', _) => match &report.eth_hwaddr {
            Some(mac) => out.push_str(&format_mac(mac)),
            None => out.push_str("-"),
        },
        ('o', _) => {
            let vendor = report.eth_hwaddr.as_ref().and_then(oui_vendor);
            out.push_str(vendor.unwrap_or("unknown"));
        }
        ('C', _) => match resolver.country(report.host_addr) {
            Some(cc) => out.push_str(&cc),
            None => out.push_str("--"),
        },
        ('%', _) => out.push('%'),
        (other, _) => {
            // Unknown specifier passes through literally.
            out.push('%');
            out.push(other);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_report() -> IpReport {
        let mut report = IpReport::new(
            Ipv4Addr::new(192, 168, 77, 5),
            Ipv4Addr::new(192, 168, 77, 1),
            22,
            51514,
            6,
        );
        report.ttl = 64;
        report.tseq = 12345;
        report.window_size = 5840;
        report.eth_hwaddr = Some([0x00, 0x0c, 0x29, 0xaa, 0xbb, 0xcc]);
        report
            .output
            .push(OutputData::Banner("SSH-2.0-OpenSSH_9.6".to_string()));
        report
    }

    struct FixedResolver;

    impl NameResolver for FixedResolver {
        fn rdns(&self, _addr: Ipv4Addr) -> Option<String> {
            Some("host.example".to_string())
        }
        fn country(&self, _addr: Ipv4Addr) -> Option<String> {
            Some("US".to_string())
        }
    }

    #[test]
    fn test_basic_substitutions() {
        let report = sample_report();
        assert_eq!(
            render("%h:%p ttl %t", &report, &NoResolver),
            "192.168.77.5:22 ttl 64"
        );
    }

    #[test]
    fn test_service_names() {
        let report = sample_report();
        assert_eq!(render("%pn", &report, &NoResolver), "ssh");
        // The local port is ephemeral, so it has no service name.
        assert_eq!(render("%Ln", &report, &NoResolver), "unknown");
        assert_eq!(render("%L", &report, &NoResolver), "51514");
    }

    #[test]
    fn test_two_letter_beats_one_letter() {
        let report = sample_report();
        // %hn consumes the n; a bare %h followed by literal n does not.
        assert_eq!(render("%hn", &report, &FixedResolver), "host.example");
        assert_eq!(render("%h n", &report, &FixedResolver), "192.168.77.5 n");
    }

    #[test]
    fn test_banner_and_tcp_fields() {
        let report = sample_report();
        assert_eq!(
            render("%r seq=%S win=%w", &report, &NoResolver),
            "SSH-2.0-OpenSSH_9.6 seq=12345 win=5840"
        );
    }

    #[test]
    fn test_mac_and_vendor() {
        let report = sample_report();
        assert_eq!(
            render("%M %o", &report, &NoResolver),
            "00:0c:29:aa:bb:cc VMware"
        );
    }

    #[test]
    fn test_country() {
        let report = sample_report();
        assert_eq!(render("%C", &report, &FixedResolver), "US");
        assert_eq!(render("%C", &report, &NoResolver), "--");
    }

    #[test]
    fn test_escapes() {
        let report = sample_report();
        assert_eq!(render("%h\\t%p\\n", &report, &NoResolver), "192.168.77.5\t22\n");
        assert_eq!(render("a\\\\b", &report, &NoResolver), "a\\b");
    }

    #[test]
    fn test_percent_literal_and_unknown() {
        let report = sample_report();
        assert_eq!(render("100%%", &report, &NoResolver), "100%");
        assert_eq!(render("%z", &report, &NoResolver), "%z");
    }

    #[test]
    fn test_send_addr_and_trace() {
        let mut report = sample_report();
        report.trace_addr = Ipv4Addr::new(10, 0, 0, 1);
        assert_eq!(
            render("%s -> %T", &report, &NoResolver),
            "192.168.77.1 -> 10.0.0.1"
        );
    }
}
