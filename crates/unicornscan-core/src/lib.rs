//! Core library for unicornscan
//!
//! Everything the scan pipeline agrees on lives here: the settings and phase
//! model, the SYN-cookie and source-port encodings that stand in for per-probe
//! state, target and port expansion, the payload registry, report types with
//! their dedupe keys, the workunit model, and the IPC message codec. This
//! crate does no I/O; the net and scanner crates drive it.

pub mod config;
pub mod crypto;
pub mod error;
pub mod msg;
pub mod payload;
pub mod portenc;
pub mod portlist;
pub mod report;
pub mod target;
pub mod workunit;

pub use config::{
    decode_tcp_flags, parse_mode_spec, PhaseSpec, ScanMode, ScanOptions, ScanSettings, TcpFlags,
    DEF_PPS, DEF_SCAN_TIMEOUT,
};
pub use crypto::{syn_cookie, verify_cookie, BlackRock};
pub use error::{Error, Result};
pub use msg::{DroneRole, Message, BUS_VERSION};
pub use payload::{PayloadBuilder, PayloadRegistry, Proto, StaticPayload};
pub use portenc::{
    classify_source_port, decode_payload_index, decode_trace_ttl, encode_payload_port,
    encode_trace_port, is_payload_port, SourcePortClass, PAYLOAD_PORT_BASE, TRACE_PORT_BASE,
};
pub use portlist::{PortEntry, PortList};
pub use report::{
    arp_report_key, ip_report_key, ArpReport, IpReport, OutputData, TracePathHop, TracePathReport,
    ARP_REPORT_MAGIC, IP_REPORT_MAGIC, REPORT_BADNETWORK_CKSUM, REPORT_BADTRANSPORT_CKSUM,
    TRACE_HOP_DEST, TRACE_HOP_NONE, TRACE_HOP_RECV, TRACE_HOP_UNREACH, TRACE_PATH_MAGIC,
    TRACE_PATH_MAX_HOPS,
};
pub use target::{parse_targets, Target};
pub use workunit::{
    InterfaceSnapshot, RecvWorkunit, SendWorkunit, WorkunitStats, WorkunitStatus,
};
