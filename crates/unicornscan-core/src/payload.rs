//! Payload registry
//!
//! Maps (protocol, port) to an ordered chain of payload builders. UDP probes
//! carry their payload on the wire; TCP payloads are held back and used by
//! the connect follow-up after a SYN-ACK, selected by the payload index the
//! source port carried. Up to 16 variants per port fit the 4-bit encoding.
//!
//! Builders are plain trait objects registered in-process; a payload may be a
//! static byte string or generated per probe (nonces, transaction IDs).

use crate::error::{Error, Result};
use rand::RngCore;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Transport protocol a payload applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
        }
    }
}

/// A payload source: bytes to put on the wire for one probe.
pub trait PayloadBuilder: Send + Sync {
    /// Produce the payload bytes. `rng` is available for nonces.
    fn build(&self, rng: &mut dyn RngCore) -> Vec<u8>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

/// A fixed byte-string payload.
pub struct StaticPayload {
    name: String,
    bytes: Vec<u8>,
}

impl StaticPayload {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }
}

impl PayloadBuilder for StaticPayload {
    fn build(&self, _rng: &mut dyn RngCore) -> Vec<u8> {
        self.bytes.clone()
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A payload generated by a closure (used for nonce-bearing probes).
pub struct FnPayload<F>
where
    F: Fn(&mut dyn RngCore) -> Vec<u8> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnPayload<F>
where
    F: Fn(&mut dyn RngCore) -> Vec<u8> + Send + Sync,
{
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> PayloadBuilder for FnPayload<F>
where
    F: Fn(&mut dyn RngCore) -> Vec<u8> + Send + Sync,
{
    fn build(&self, rng: &mut dyn RngCore) -> Vec<u8> {
        (self.func)(rng)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// One registered payload with its optional fixed local port.
#[derive(Clone)]
struct Entry {
    builder: Arc<dyn PayloadBuilder>,
    /// Fixed local source port demanded by the protocol, or -1 for any.
    local_port: i32,
}

/// Registry of payload chains keyed by (proto, port, group).
///
/// Group 0 is the default group. Port 0 registers a wildcard payload used
/// when no port-specific chain exists.
#[derive(Clone, Default)]
pub struct PayloadRegistry {
    chains: HashMap<(Proto, u16, u16), Vec<Entry>>,
}

impl PayloadRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the stock probe payloads.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register_defaults();
        reg
    }

    /// Register a payload at the end of a port's chain.
    pub fn add_payload(
        &mut self,
        proto: Proto,
        port: u16,
        local_port: i32,
        builder: Arc<dyn PayloadBuilder>,
        group: u16,
    ) -> Result<()> {
        let chain = self.chains.entry((proto, port, group)).or_default();
        if chain.len() >= 16 {
            return Err(Error::Config(format!(
                "payload chain for {}:{} full (16 max, 4-bit index)",
                proto, port
            )));
        }
        debug!(%proto, port, index = chain.len(), "payload registered");
        chain.push(Entry {
            builder,
            local_port,
        });
        Ok(())
    }

    /// Register a wildcard payload for a protocol (any port).
    pub fn add_default_payload(
        &mut self,
        proto: Proto,
        local_port: i32,
        builder: Arc<dyn PayloadBuilder>,
        group: u16,
    ) -> Result<()> {
        self.add_payload(proto, 0, local_port, builder, group)
    }

    /// Number of payloads chained for (proto, port) in `group`.
    /// Falls back to the wildcard chain when no port-specific chain exists.
    pub fn count_payloads(&self, proto: Proto, port: u16, group: u16) -> u16 {
        if let Some(chain) = self.chains.get(&(proto, port, group)) {
            return chain.len() as u16;
        }
        self.chains
            .get(&(proto, 0, group))
            .map(|c| c.len() as u16)
            .unwrap_or(0)
    }

    /// Fetch payload `index` for (proto, port), building its bytes.
    ///
    /// Returns `(bytes, local_port)` or None when the index is out of range.
    pub fn get_payload(
        &self,
        index: u16,
        proto: Proto,
        port: u16,
        group: u16,
        rng: &mut dyn RngCore,
    ) -> Option<(Vec<u8>, i32)> {
        let chain = self
            .chains
            .get(&(proto, port, group))
            .or_else(|| self.chains.get(&(proto, 0, group)))?;
        let entry = chain.get(index as usize)?;
        Some((entry.builder.build(rng), entry.local_port))
    }

    /// Stock payloads for the common UDP services.
    fn register_defaults(&mut self) {
        let defaults: [(u16, &str, Vec<u8>); 6] = [
            (111, "rpc-portmap-null", rpc_null_call()),
            (123, "ntp-client", ntp_request()),
            (137, "nbns-wildcard", netbios_name_query()),
            (161, "snmp-sysdescr", snmp_get_request()),
            (1900, "ssdp-msearch", ssdp_discover()),
            (5353, "mdns-services", mdns_query()),
        ];
        for (port, name, bytes) in defaults {
            let _ = self.add_payload(
                Proto::Udp,
                port,
                -1,
                Arc::new(StaticPayload::new(name, bytes)),
                0,
            );
        }

        // DNS wants a fresh transaction ID per probe.
        let _ = self.add_payload(
            Proto::Udp,
            53,
            -1,
            Arc::new(FnPayload::new("dns-query-a", |rng: &mut dyn RngCore| {
                let mut q = dns_query();
                let txid = (rng.next_u32() & 0xffff) as u16;
                q[0..2].copy_from_slice(&txid.to_be_bytes());
                q
            })),
            0,
        );
    }
}

impl fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadRegistry")
            .field("chains", &self.chains.len())
            .finish()
    }
}

/// DNS standard query for the root domain.
fn dns_query() -> Vec<u8> {
    vec![
        0x12, 0x34, // Transaction ID (rewritten per probe)
        0x01, 0x00, // Flags: standard query
        0x00, 0x01, // Questions: 1
        0x00, 0x00, // Answer RRs: 0
        0x00, 0x00, // Authority RRs: 0
        0x00, 0x00, // Additional RRs: 0
        0x00, // Name: root
        0x00, 0x01, // Type: A
        0x00, 0x01, // Class: IN
    ]
}

/// NTP version 3 client request.
fn ntp_request() -> Vec<u8> {
    let mut payload = vec![0x1B]; // LI=0, VN=3, Mode=3
    payload.resize(48, 0);
    payload
}

/// NetBIOS Name Service query for `*<00><00>`.
fn netbios_name_query() -> Vec<u8> {
    vec![
        0xAB, 0xCD, // Transaction ID
        0x01, 0x00, // Flags: query
        0x00, 0x01, // Questions: 1
        0x00, 0x00, // Answer RRs: 0
        0x00, 0x00, // Authority RRs: 0
        0x00, 0x00, // Additional RRs: 0
        0x20, // Encoded name length
        0x43, 0x4B, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41,
        0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41, 0x41,
        0x41, 0x41, 0x00, // Terminator
        0x00, 0x21, // Type: NBSTAT
        0x00, 0x01, // Class: IN
    ]
}

/// SNMP GetRequest for sysDescr.0 with community "public".
fn snmp_get_request() -> Vec<u8> {
    vec![
        0x30, 0x26, // SEQUENCE
        0x02, 0x01, 0x00, // version (SNMPv1)
        0x04, 0x06, 0x70, 0x75, 0x62, 0x6C, 0x69, 0x63, // "public"
        0xA0, 0x19, // GetRequest PDU
        0x02, 0x01, 0x00, // Request ID
        0x02, 0x01, 0x00, // Error status
        0x02, 0x01, 0x00, // Error index
        0x30, 0x0E, // Variable bindings
        0x30, 0x0C, // Variable binding
        0x06, 0x08, 0x2B, 0x06, 0x01, 0x02, 0x01, 0x01, 0x01, 0x00, // sysDescr.0
        0x05, 0x00, // NULL
    ]
}

/// Sun RPC NULL call (portmapper probe).
fn rpc_null_call() -> Vec<u8> {
    vec![
        0x00, 0x00, 0x00, 0x01, // XID
        0x00, 0x00, 0x00, 0x00, // Message type: Call
        0x00, 0x00, 0x00, 0x02, // RPC version: 2
        0x00, 0x00, 0x00, 0x64, // Program: portmapper
        0x00, 0x00, 0x00, 0x02, // Program version: 2
        0x00, 0x00, 0x00, 0x00, // Procedure: NULL
        0x00, 0x00, 0x00, 0x00, // Credentials: NULL
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // Verifier: NULL
        0x00, 0x00, 0x00, 0x00,
    ]
}

/// SSDP M-SEARCH discovery.
fn ssdp_discover() -> Vec<u8> {
    b"M-SEARCH * HTTP/1.1\r\n\
      HOST: 239.255.255.250:1900\r\n\
      MAN: \"ssdp:discover\"\r\n\
      MX: 3\r\n\
      ST: ssdp:all\r\n\
      \r\n"
        .to_vec()
}

/// mDNS query for `_services._dns-sd._udp.local`.
fn mdns_query() -> Vec<u8> {
    vec![
        0x00, 0x00, // Transaction ID
        0x00, 0x00, // Flags
        0x00, 0x01, // Questions: 1
        0x00, 0x00, // Answer RRs: 0
        0x00, 0x00, // Authority RRs: 0
        0x00, 0x00, // Additional RRs: 0
        0x09, 0x5F, 0x73, 0x65, 0x72, 0x76, 0x69, 0x63, 0x65, 0x73, // "_services"
        0x07, 0x5F, 0x64, 0x6E, 0x73, 0x2D, 0x73, 0x64, // "_dns-sd"
        0x04, 0x5F, 0x75, 0x64, 0x70, // "_udp"
        0x05, 0x6C, 0x6F, 0x63, 0x61, 0x6C, // "local"
        0x00, // Terminator
        0x00, 0x0C, // Type: PTR
        0x00, 0x01, // Class: IN
    ]
}
