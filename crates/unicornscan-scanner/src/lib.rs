//! Scan engine for unicornscan
//!
//! The moving parts of the pipeline: the TSC-paced sender and the passive
//! listener (fully decoupled, correlated only through the cookies and port
//! encodings in `unicornscan-core`), the workunit planner with its phase
//! filter for compound scans, traceroute sessions, the binary banner
//! parser, the deduplicating report aggregator with its format templates
//! and output sinks, the framed drone bus, and the master that sequences
//! phases over all of it.

pub mod aggregator;
pub mod banner;
pub mod bus;
pub mod format;
pub mod grab;
pub mod listener;
pub mod master;
pub mod names;
pub mod output;
pub mod pacer;
pub mod phase_filter;
pub mod planner;
pub mod sender;
pub mod sockpath;
pub mod trace;

pub use aggregator::{BannerEnricher, ReportAggregator, ReportEnricher};
pub use banner::{detect, parse as parse_banner, BannerProto};
pub use bus::{BusAcceptor, BusConn, BusReceiver, BusSender, DroneUri};
pub use format::{render, NameResolver, NoResolver};
pub use grab::grab_banner;
pub use listener::{
    default_bpf_filter, Classifier, ListenStats, Listener, ListenerContext, ListenerEvent,
};
pub use master::Master;
pub use output::{build_sinks, JsonSink, OutputSink, TextSink};
pub use pacer::{Pacer, TscClock};
pub use phase_filter::PhaseFilter;
pub use planner::{aggregate_live_hosts, WorkunitPlanner};
pub use sender::{select_source_port, SendStats, Sender};
pub use trace::{TraceSession, TraceTable};
