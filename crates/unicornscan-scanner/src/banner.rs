//! Binary response protocol sniffing
//!
//! Given the first bytes of a response payload, pick one of DNS / TLS / RPC
//! and produce a one-line human-readable summary; anything unrecognized (or
//! any parse that dies on truncation) falls back to a hex dump of the first
//! 32 bytes. Detection is by signature:
//!
//! - DNS over TCP: two-byte length prefix, then the QR bit set in the flags.
//! - TLS: content type 0x16 (handshake) with record version major 0x03.
//! - Sun RPC: record mark with the last-fragment bit, message type REPLY.
//!
//! The TLS path walks records to the ServerHello for version and cipher and,
//! when a Certificate message is present, DER-parses the first certificate's
//! subject for its CN.

use std::fmt;

/// Detected protocol of a response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BannerProto {
    Unknown,
    Dns,
    Tls,
    Rpc,
    HexFallback,
}

impl fmt::Display for BannerProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BannerProto::Unknown => "UNKNOWN",
            BannerProto::Dns => "DNS",
            BannerProto::Tls => "TLS",
            BannerProto::Rpc => "RPC",
            BannerProto::HexFallback => "HEX",
        };
        write!(f, "{}", name)
    }
}

const TLS_CONTENT_HANDSHAKE: u8 = 0x16;
const TLS_VERSION_MAJOR: u8 = 0x03;
const DNS_QR_BIT: u8 = 0x80;
const RPC_RM_LAST_FRAG: u32 = 0x8000_0000;
const RPC_MSG_TYPE_REPLY: u32 = 1;

fn u16_at(buf: &[u8], off: usize) -> Option<u16> {
    let b = buf.get(off..off + 2)?;
    Some(u16::from_be_bytes([b[0], b[1]]))
}

fn u32_at(buf: &[u8], off: usize) -> Option<u32> {
    let b = buf.get(off..off + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Classify a payload by its binary signature.
pub fn detect(buf: &[u8]) -> BannerProto {
    if buf.len() < 4 {
        return BannerProto::Unknown;
    }

    // TLS handshake record.
    if buf.len() >= 5 && buf[0] == TLS_CONTENT_HANDSHAKE && buf[1] == TLS_VERSION_MAJOR && buf[2] <= 0x04
    {
        return BannerProto::Tls;
    }

    // Sun RPC reply: record mark plus message type at offset 8.
    if buf.len() >= 12 {
        let rm = u32_at(buf, 0).unwrap_or(0);
        let msg_type = u32_at(buf, 8).unwrap_or(u32::MAX);
        if rm & RPC_RM_LAST_FRAG != 0 && msg_type == RPC_MSG_TYPE_REPLY {
            return BannerProto::Rpc;
        }
    }

    // DNS over TCP: plausible length prefix and the QR bit.
    if buf.len() >= 6 {
        let dns_len = u16_at(buf, 0).unwrap_or(0) as usize;
        if dns_len > 0 && dns_len <= buf.len() - 2 && buf[4] & DNS_QR_BIT != 0 {
            return BannerProto::Dns;
        }
    }

    BannerProto::Unknown
}

/// Parse a payload into (protocol, summary line). Never fails: unknown or
/// truncated input produces the hex fallback.
pub fn parse(buf: &[u8]) -> (BannerProto, String) {
    if buf.is_empty() {
        return (BannerProto::Unknown, String::new());
    }

    let parsed = match detect(buf) {
        BannerProto::Dns => parse_dns(buf).map(|s| (BannerProto::Dns, s)),
        BannerProto::Tls => parse_tls(buf).map(|s| (BannerProto::Tls, s)),
        BannerProto::Rpc => parse_rpc(buf).map(|s| (BannerProto::Rpc, s)),
        _ => None,
    };

    parsed.unwrap_or_else(|| (BannerProto::HexFallback, hex_fallback(buf)))
}

const DNS_RCODES: [&str; 11] = [
    "NOERROR", "FORMERR", "SERVFAIL", "NXDOMAIN", "NOTIMP", "REFUSED", "YXDOMAIN", "YXRRSET",
    "NXRRSET", "NOTAUTH", "NOTZONE",
];

fn dns_type_name(qtype: u16) -> Option<&'static str> {
    match qtype {
        1 => Some("A"),
        2 => Some("NS"),
        5 => Some("CNAME"),
        6 => Some("SOA"),
        12 => Some("PTR"),
        15 => Some("MX"),
        16 => Some("TXT"),
        28 => Some("AAAA"),
        33 => Some("SRV"),
        255 => Some("ANY"),
        _ => None,
    }
}

/// Decode a DNS name at `offset`, following up to 16 compression jumps.
/// Returns the name and the bytes consumed at the original position.
fn parse_dns_name(pkt: &[u8], mut offset: usize) -> Option<(String, usize)> {
    let start = offset;
    let mut name = String::new();
    let mut jumps = 0usize;
    let mut consumed = 0usize;

    while offset < pkt.len() && jumps < 16 {
        let label_len = pkt[offset];

        if label_len == 0 {
            if consumed == 0 {
                consumed = offset - start + 1;
            }
            return Some((name, consumed));
        }

        if label_len & 0xc0 == 0xc0 {
            // Compression pointer.
            let next = pkt.get(offset + 1)?;
            if consumed == 0 {
                consumed = offset - start + 2;
            }
            offset = (((label_len & 0x3f) as usize) << 8) | *next as usize;
            jumps += 1;
            continue;
        }

        let label_len = label_len as usize;
        if label_len > 63 || offset + 1 + label_len > pkt.len() {
            return None;
        }

        if !name.is_empty() {
            name.push('.');
        }
        for &b in &pkt[offset + 1..offset + 1 + label_len] {
            name.push(if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            });
        }
        offset += 1 + label_len;
    }

    None
}

/// `DNS: RCODE q=name TYPE`, degrading to counts when the question is gone.
fn parse_dns(buf: &[u8]) -> Option<String> {
    if buf.len() < 14 {
        return None;
    }

    let tcp_len = u16_at(buf, 0)? as usize;
    if tcp_len < 12 || tcp_len > buf.len() - 2 {
        return None;
    }
    let dns = &buf[2..2 + tcp_len];

    let flags = u16_at(dns, 2)?;
    let rcode = (flags & 0x0f) as usize;
    let qdcount = u16_at(dns, 4)?;
    let ancount = u16_at(dns, 6)?;
    let rcode_name = DNS_RCODES.get(rcode).copied().unwrap_or("UNKNOWN");

    if qdcount > 0 && dns.len() > 12 {
        if let Some((qname, consumed)) = parse_dns_name(dns, 12) {
            if !qname.is_empty() {
                let qtype = u16_at(dns, 12 + consumed);
                if let Some(type_name) = qtype.and_then(dns_type_name) {
                    return Some(format!("DNS: {} q={} {}", rcode_name, qname, type_name));
                }
                return Some(format!("DNS: {} q={}", rcode_name, qname));
            }
        }
    }

    Some(format!(
        "DNS: {} qd={} an={}",
        rcode_name, qdcount, ancount
    ))
}

fn tls_version_name(version: u16) -> Option<&'static str> {
    match version {
        0x0300 => Some("SSL3.0"),
        0x0301 => Some("TLS1.0"),
        0x0302 => Some("TLS1.1"),
        0x0303 => Some("TLS1.2"),
        0x0304 => Some("TLS1.3"),
        _ => None,
    }
}

fn tls_cipher_name(cipher: u16) -> Option<&'static str> {
    match cipher {
        0x1301 => Some("AES_128_GCM_SHA256"),
        0x1302 => Some("AES_256_GCM_SHA384"),
        0x1303 => Some("CHACHA20_POLY1305_SHA256"),
        0xc02f => Some("ECDHE_RSA_AES128_GCM"),
        0xc030 => Some("ECDHE_RSA_AES256_GCM"),
        0xc02b => Some("ECDHE_ECDSA_AES128_GCM"),
        0xc02c => Some("ECDHE_ECDSA_AES256_GCM"),
        0x002f => Some("RSA_AES128_SHA"),
        0x0035 => Some("RSA_AES256_SHA"),
        _ => None,
    }
}

const TLS_HS_SERVER_HELLO: u8 = 0x02;
const TLS_HS_CERTIFICATE: u8 = 0x0b;

/// `TLS: version cipher CN=name`, with graceful fallbacks per missing piece.
fn parse_tls(buf: &[u8]) -> Option<String> {
    if buf.len() < 5 || buf[0] != TLS_CONTENT_HANDSHAKE {
        return None;
    }

    let record_len = u16_at(buf, 3)? as usize;
    if 5 + record_len > buf.len() || record_len < 4 {
        return None;
    }
    if buf[5] != TLS_HS_SERVER_HELLO {
        return None;
    }

    let hs_len = ((buf[6] as usize) << 16) | ((buf[7] as usize) << 8) | buf[8] as usize;
    if hs_len < 38 || 9 + hs_len > buf.len() {
        return None;
    }

    // ServerHello: version(2) random(32) session_id_len(1) session_id
    // cipher(2).
    let version = u16_at(buf, 9)?;
    let mut pos = 9 + 2 + 32;
    let session_id_len = *buf.get(pos)? as usize;
    pos += 1 + session_id_len;
    if pos + 2 > 9 + hs_len {
        return None;
    }
    let cipher = u16_at(buf, pos)?;

    let cn = tls_find_cert_cn(buf);

    let version_name = tls_version_name(version);
    let cipher_name = tls_cipher_name(cipher);

    Some(match (version_name, cipher_name, cn) {
        (Some(v), Some(c), Some(cn)) => format!("TLS: {} {} CN={}", v, c, cn),
        (Some(v), None, Some(cn)) => format!("TLS: {} cipher=0x{:04x} CN={}", v, cipher, cn),
        (Some(v), Some(c), None) => format!("TLS: {} {}", v, c),
        (Some(v), None, None) => format!("TLS: {} cipher=0x{:04x}", v, cipher),
        _ => format!("TLS: v=0x{:04x} cipher=0x{:04x}", version, cipher),
    })
}

// DER tags used by the certificate walk.
const ASN1_SEQUENCE: u8 = 0x30;
const ASN1_SET: u8 = 0x31;
const ASN1_OID: u8 = 0x06;
const ASN1_UTF8STRING: u8 = 0x0C;
const ASN1_PRINTSTRING: u8 = 0x13;
const ASN1_T61STRING: u8 = 0x14;
const ASN1_IA5STRING: u8 = 0x16;
const ASN1_CONTEXT_0: u8 = 0xA0;

/// OID 2.5.4.3 (commonName), DER-encoded.
const OID_CN: [u8; 3] = [0x55, 0x04, 0x03];

/// Read a DER length at `pos`, returning (length, new_pos).
fn asn1_read_length(buf: &[u8], pos: usize) -> Option<(usize, usize)> {
    let first = *buf.get(pos)?;
    if first < 0x80 {
        return Some((first as usize, pos + 1));
    }
    if first == 0x80 {
        // Indefinite length is not DER.
        return None;
    }
    let num_octets = (first & 0x7f) as usize;
    if num_octets > 4 || pos + 1 + num_octets > buf.len() {
        return None;
    }
    let mut length = 0usize;
    for &b in &buf[pos + 1..pos + 1 + num_octets] {
        length = (length << 8) | b as usize;
    }
    Some((length, pos + 1 + num_octets))
}

/// Read one DER element at `pos`: (tag, content range, position after).
fn asn1_read_element(buf: &[u8], pos: usize) -> Option<(u8, std::ops::Range<usize>, usize)> {
    let tag = *buf.get(pos)?;
    let (length, content_pos) = asn1_read_length(buf, pos + 1)?;
    if content_pos + length > buf.len() {
        return None;
    }
    Some((tag, content_pos..content_pos + length, content_pos + length))
}

fn asn1_extract_string(content: &[u8]) -> String {
    content
        .iter()
        .take(127)
        .map(|&c| {
            if (0x20..0x7f).contains(&c) {
                c as char
            } else {
                '?'
            }
        })
        .collect()
}

/// Find the CN attribute in an X.509 Name (SEQUENCE of RDN SETs).
fn asn1_find_cn(name_seq: &[u8]) -> Option<String> {
    let mut pos = 0;
    while pos < name_seq.len() {
        let (tag, set_range, next) = asn1_read_element(name_seq, pos)?;
        pos = next;
        if tag != ASN1_SET {
            continue;
        }

        // Each RDN SET holds AttributeTypeAndValue SEQUENCEs.
        let mut set_pos = set_range.start;
        while set_pos < set_range.end {
            let Some((tag, seq_range, seq_next)) = asn1_read_element(name_seq, set_pos) else {
                break;
            };
            set_pos = seq_next;
            if tag != ASN1_SEQUENCE {
                continue;
            }

            let Some((tag, oid_range, attr_next)) = asn1_read_element(name_seq, seq_range.start)
            else {
                continue;
            };
            if tag != ASN1_OID || name_seq[oid_range.clone()] != OID_CN {
                continue;
            }

            let Some((tag, val_range, _)) = asn1_read_element(name_seq, attr_next) else {
                continue;
            };
            if matches!(
                tag,
                ASN1_UTF8STRING | ASN1_PRINTSTRING | ASN1_IA5STRING | ASN1_T61STRING
            ) {
                return Some(asn1_extract_string(&name_seq[val_range]));
            }
        }
    }
    None
}

/// Walk TLS records to a Certificate message and pull the subject CN of the
/// first certificate.
fn tls_find_cert_cn(buf: &[u8]) -> Option<String> {
    let mut pos = 0;
    while pos + 5 < buf.len() {
        let content_type = buf[pos];
        let record_len = u16_at(buf, pos + 3)? as usize;
        let record_end = pos + 5 + record_len;
        if content_type != TLS_CONTENT_HANDSHAKE {
            pos = record_end;
            continue;
        }
        if record_end > buf.len() {
            return None;
        }

        let mut hs_pos = pos + 5;
        while hs_pos + 4 < record_end {
            let hs_type = buf[hs_pos];
            let hs_len = ((buf[hs_pos + 1] as usize) << 16)
                | ((buf[hs_pos + 2] as usize) << 8)
                | buf[hs_pos + 3] as usize;
            if hs_pos + 4 + hs_len > record_end {
                break;
            }

            if hs_type == TLS_HS_CERTIFICATE {
                if let Some(cn) = cert_message_cn(&buf[hs_pos + 4..hs_pos + 4 + hs_len]) {
                    return Some(cn);
                }
            }
            hs_pos += 4 + hs_len;
        }
        pos = record_end;
    }
    None
}

/// Certificate message: 3-byte list length, then 3-byte-length-prefixed
/// certificates; DER-parse the first for subject CN.
fn cert_message_cn(msg: &[u8]) -> Option<String> {
    if msg.len() < 6 {
        return None;
    }
    let certs_len = ((msg[0] as usize) << 16) | ((msg[1] as usize) << 8) | msg[2] as usize;
    if certs_len + 3 > msg.len() || certs_len < 3 {
        return None;
    }
    let first_len = ((msg[3] as usize) << 16) | ((msg[4] as usize) << 8) | msg[5] as usize;
    if first_len + 6 > msg.len() {
        return None;
    }
    let cert = &msg[6..6 + first_len];

    // Certificate ::= SEQUENCE { tbsCertificate, signatureAlgorithm, sig }
    let (tag, outer, _) = asn1_read_element(cert, 0)?;
    if tag != ASN1_SEQUENCE {
        return None;
    }
    let (tag, tbs, _) = asn1_read_element(cert, outer.start)?;
    if tag != ASN1_SEQUENCE {
        return None;
    }

    // tbsCertificate fields after the optional [0] version:
    // serialNumber, signature, issuer, validity, subject, ...
    let tbs_bytes = &cert[tbs.clone()];
    let mut pos = 0;
    let mut field_num = 0;
    while pos < tbs_bytes.len() && field_num < 6 {
        let (tag, content, next) = asn1_read_element(tbs_bytes, pos)?;
        pos = next;

        if tag == ASN1_CONTEXT_0 && field_num == 0 {
            continue;
        }
        if field_num == 4 {
            return asn1_find_cn(&tbs_bytes[content]);
        }
        field_num += 1;
    }
    None
}

const RPC_ACCEPT: [&str; 6] = [
    "SUCCESS",
    "PROG_UNAVAIL",
    "PROG_MISMATCH",
    "PROC_UNAVAIL",
    "GARBAGE_ARGS",
    "SYSTEM_ERR",
];
const RPC_REJECT: [&str; 2] = ["RPC_MISMATCH", "AUTH_ERROR"];
const RPC_AUTH: [&str; 4] = ["AUTH_NULL", "AUTH_UNIX", "AUTH_SHORT", "AUTH_DES"];

/// `RPC: STATUS [auth=FLAVOR]` or `RPC: DENIED reason`.
fn parse_rpc(buf: &[u8]) -> Option<String> {
    if buf.len() < 16 {
        return None;
    }

    let rm = u32_at(buf, 0)?;
    if rm & RPC_RM_LAST_FRAG == 0 {
        return None;
    }
    let frag_len = (rm & 0x7fff_ffff) as usize;
    if frag_len + 4 > buf.len() || frag_len < 12 {
        return None;
    }

    if u32_at(buf, 8)? != RPC_MSG_TYPE_REPLY {
        return None;
    }
    let reply_stat = u32_at(buf, 12)?;

    match reply_stat {
        0 => {
            // MSG_ACCEPTED: verifier, then accept status.
            let Some(verifier_flavor) = u32_at(buf, 16) else {
                return Some("RPC: ACCEPTED".to_string());
            };
            let verifier_len = u32_at(buf, 20)? as usize;
            let auth_name = RPC_AUTH
                .get(verifier_flavor as usize)
                .copied()
                .unwrap_or("AUTH_UNKNOWN");

            let accept_pos = 24 + verifier_len;
            let Some(accept_stat) = u32_at(buf, accept_pos) else {
                return Some(format!("RPC: ACCEPTED auth={}", auth_name));
            };

            Some(if verifier_flavor == 0 && accept_stat == 0 {
                "RPC: SUCCESS".to_string()
            } else if accept_stat == 0 {
                format!("RPC: SUCCESS auth={}", auth_name)
            } else {
                let status = RPC_ACCEPT
                    .get(accept_stat as usize)
                    .copied()
                    .unwrap_or("UNKNOWN");
                format!("RPC: {}", status)
            })
        }
        1 => {
            let Some(reject_stat) = u32_at(buf, 16) else {
                return Some("RPC: DENIED".to_string());
            };
            let status = RPC_REJECT
                .get(reject_stat as usize)
                .copied()
                .unwrap_or("UNKNOWN");
            Some(format!("RPC: DENIED {}", status))
        }
        other => Some(format!("RPC: reply_stat={}", other)),
    }
}

/// First 32 bytes as `HEX: xx xx ...`.
fn hex_fallback(buf: &[u8]) -> String {
    let shown = buf.len().min(32);
    let hex: Vec<String> = buf[..shown].iter().map(|b| format!("{:02x}", b)).collect();
    format!("HEX: {}", hex.join(" "))
}
