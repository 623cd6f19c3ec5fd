//! Service and vendor name tables
//!
//! Small built-in lookups backing the `%pn`/`%Ln` and `%o` format
//! substitutions. Deliberately tiny: the common scan ports and the OUIs that
//! show up on real LANs; everything else renders numerically.

/// Well-known service name for a TCP/UDP port.
pub fn service_name(port: u16) -> Option<&'static str> {
    match port {
        7 => Some("echo"),
        11 => Some("systat"),
        13 => Some("daytime"),
        21 => Some("ftp"),
        22 => Some("ssh"),
        23 => Some("telnet"),
        25 => Some("smtp"),
        53 => Some("domain"),
        67 => Some("bootps"),
        68 => Some("bootpc"),
        69 => Some("tftp"),
        79 => Some("finger"),
        80 => Some("http"),
        110 => Some("pop3"),
        111 => Some("sunrpc"),
        123 => Some("ntp"),
        135 => Some("epmap"),
        137 => Some("netbios-ns"),
        139 => Some("netbios-ssn"),
        143 => Some("imap"),
        161 => Some("snmp"),
        179 => Some("bgp"),
        389 => Some("ldap"),
        443 => Some("https"),
        445 => Some("microsoft-ds"),
        465 => Some("smtps"),
        514 => Some("syslog"),
        587 => Some("submission"),
        631 => Some("ipp"),
        993 => Some("imaps"),
        995 => Some("pop3s"),
        1433 => Some("ms-sql-s"),
        1900 => Some("ssdp"),
        3128 => Some("squid"),
        3306 => Some("mysql"),
        3389 => Some("ms-wbt-server"),
        5060 => Some("sip"),
        5353 => Some("mdns"),
        5432 => Some("postgresql"),
        5900 => Some("vnc"),
        6379 => Some("redis"),
        8080 => Some("http-alt"),
        8443 => Some("https-alt"),
        27017 => Some("mongodb"),
        _ => None,
    }
}

/// Vendor for the first three octets of a MAC address.
pub fn oui_vendor(mac: &[u8; 6]) -> Option<&'static str> {
    match (mac[0], mac[1], mac[2]) {
        (0x00, 0x0c, 0x29) | (0x00, 0x50, 0x56) => Some("VMware"),
        (0x08, 0x00, 0x27) => Some("VirtualBox"),
        (0x52, 0x54, 0x00) => Some("QEMU"),
        (0x00, 0x15, 0x5d) => Some("Hyper-V"),
        (0x00, 0x1b, 0x21) | (0x68, 0x05, 0xca) => Some("Intel"),
        (0xb8, 0x27, 0xeb) | (0xdc, 0xa6, 0x32) | (0xe4, 0x5f, 0x01) => Some("Raspberry Pi"),
        (0x00, 0x1a, 0xa0) | (0xf4, 0x8e, 0x38) => Some("Dell"),
        (0x3c, 0x22, 0xfb) | (0xa4, 0x83, 0xe7) => Some("Apple"),
        (0x00, 0x09, 0x0f) => Some("Fortinet"),
        (0x00, 0x1d, 0xa1) | (0x00, 0x40, 0x96) => Some("Cisco"),
        (0x30, 0xb5, 0xc2) | (0xc0, 0x4a, 0x00) => Some("TP-Link"),
        (0x00, 0x11, 0x32) => Some("Synology"),
        _ => None,
    }
}

/// Render a MAC address the conventional way.
pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_names() {
        assert_eq!(service_name(22), Some("ssh"));
        assert_eq!(service_name(443), Some("https"));
        assert_eq!(service_name(49999), None);
    }

    #[test]
    fn test_oui_vendor() {
        assert_eq!(oui_vendor(&[0x00, 0x0c, 0x29, 1, 2, 3]), Some("VMware"));
        assert_eq!(oui_vendor(&[0xb8, 0x27, 0xeb, 0, 0, 0]), Some("Raspberry Pi"));
        assert_eq!(oui_vendor(&[0xff, 0xff, 0xff, 0, 0, 0]), None);
    }

    #[test]
    fn test_format_mac() {
        assert_eq!(
            format_mac(&[0xde, 0xad, 0xbe, 0xef, 0x00, 0x01]),
            "de:ad:be:ef:00:01"
        );
    }
}
