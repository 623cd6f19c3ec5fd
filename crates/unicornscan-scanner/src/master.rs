//! Master orchestration
//!
//! The master owns the settings, the planner, the phase filter, the
//! aggregator, and the output sinks. Phases run strictly in sequence: each
//! one is planned, its workunits are handed to the sender and listener
//! drones, and the phase ends only after the listener's quiescence timeout
//! drains. ARP reports seen during an ARP phase feed the phase filter, which
//! the planner consumes for the next phase.
//!
//! Drones are in-process tasks by default (sender and listener as blocking
//! tasks around their pcap handles, events over a channel). Remote drones
//! connect over the framed bus and take a role's workunits instead of the
//! local task; a drone that fails to connect or drops mid-scan is marked
//! dead and logged, and the scan continues with whoever is left.
//!
//! SIGINT/SIGTERM interrupts the phase loop; buffered reports are flushed
//! before exit, and the exit is clean.

use crate::aggregator::ReportAggregator;
use crate::bus::{pump_to_channel, BusConn, BusSender, DroneUri};
use crate::listener::{default_bpf_filter, Classifier, Listener, ListenerContext, ListenerEvent};
use crate::output::OutputSink;
use crate::phase_filter::PhaseFilter;
use crate::planner::WorkunitPlanner;
use crate::sender::Sender;
use crate::trace::TraceTable;
use parking_lot::Mutex;
use rand::SeedableRng;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use unicornscan_core::{
    DroneRole, Error, InterfaceSnapshot, Message, PayloadRegistry, PhaseSpec, RecvWorkunit,
    Result, ScanMode, ScanSettings, SendWorkunit,
};
use unicornscan_net::{find_by_name, find_for_target, PacketCapture, PcapCapture, OffloadGuard};

/// The send half of a connected remote drone; its receive half is pumped
/// into the master's drone-message channel for the life of the scan.
struct RemoteDrone {
    tx: BusSender,
    role: DroneRole,
}

/// Drives one whole scan.
pub struct Master {
    settings: ScanSettings,
    planner: WorkunitPlanner,
    phase_filter: PhaseFilter,
    aggregator: ReportAggregator,
    registry: PayloadRegistry,
    iface: InterfaceSnapshot,
    remote_senders: Vec<RemoteDrone>,
    remote_listeners: Vec<RemoteDrone>,
    /// Keeps the drone channel open even with zero drones, so the phase
    /// loop's receive arm pends instead of seeing a closed channel.
    drone_msg_tx: mpsc::Sender<Message>,
    drone_msg_rx: Option<mpsc::Receiver<Message>>,
    trace_table: Arc<Mutex<TraceTable>>,
    /// In-flight banner grabs, keyed by the report they belong to.
    grab_tasks: Vec<tokio::task::JoinHandle<(u64, Option<String>)>>,
}

impl Master {
    /// Resolve the interface and build the master. Fails fast on an
    /// unusable interface or an empty plan, per the fatal-error taxonomy.
    pub fn new(mut settings: ScanSettings, sinks: Vec<Box<dyn OutputSink>>) -> Result<Self> {
        settings.apply_trace_promotion();

        let iface = resolve_interface(&settings)?;
        info!(
            iface = %iface.name,
            addr = %iface.ipv4,
            "using interface"
        );

        if settings.targets.is_empty() {
            return Err(Error::InvalidTarget("no targets given".to_string()));
        }

        let aggregator = ReportAggregator::new(&settings, sinks);
        let (drone_msg_tx, drone_msg_rx) = mpsc::channel(1024);

        Ok(Self {
            settings,
            planner: WorkunitPlanner::new(),
            phase_filter: PhaseFilter::new(),
            aggregator,
            registry: PayloadRegistry::with_defaults(),
            iface,
            remote_senders: Vec::new(),
            remote_listeners: Vec::new(),
            drone_msg_tx,
            drone_msg_rx: Some(drone_msg_rx),
            trace_table: Arc::new(Mutex::new(TraceTable::new())),
            grab_tasks: Vec::new(),
        })
    }

    /// Run every phase, then flush. Interruption flushes too.
    pub async fn run(mut self) -> Result<()> {
        self.connect_drones().await;

        let phases = self.settings.phases.clone();
        let mut interrupted = false;

        for (index, phase) in phases.iter().enumerate() {
            self.settings.current_phase = index;
            info!(phase = index + 1, mode = %phase.mode, "phase starting");

            tokio::select! {
                result = self.run_phase(index, phase) => {
                    if let Err(e) = result {
                        // Per-workunit failures stay inside the phase; an
                        // error here means the phase could not run at all.
                        error!(phase = index + 1, "phase failed: {}", e);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt: terminating drones and flushing");
                    interrupted = true;
                }
            }

            if interrupted {
                break;
            }
        }

        self.shutdown_drones().await;
        self.finish_banner_grabs().await;
        self.aggregator.flush();
        Ok(())
    }

    /// Wait out every pending banner grab and attach the results.
    async fn finish_banner_grabs(&mut self) {
        for task in self.grab_tasks.drain(..) {
            match task.await {
                Ok((key, Some(banner))) => {
                    self.aggregator
                        .attach_output(key, unicornscan_core::OutputData::Banner(banner));
                }
                Ok((_, None)) => {}
                Err(e) => warn!("banner grab task panicked: {}", e),
            }
        }
    }

    /// Dial the configured drone URIs; failures mark the drone dead.
    async fn connect_drones(&mut self) {
        let uris = self.settings.drones.clone();
        for uri_str in uris {
            let uri = match DroneUri::parse(&uri_str) {
                Ok(uri) => uri,
                Err(e) => {
                    warn!(uri = uri_str, "drone DEAD: {}", e);
                    continue;
                }
            };
            match BusConn::connect(&uri).await {
                Ok(mut conn) => match conn.handshake(DroneRole::Master).await {
                    Ok(role @ (DroneRole::Sender | DroneRole::Listener)) => {
                        info!(%uri, ?role, "drone connected");
                        let (tx, rx) = conn.split();
                        // Reports (and stats) from the drone flow into the
                        // master's message channel for the whole scan.
                        tokio::spawn(pump_to_channel(rx, self.drone_msg_tx.clone()));
                        let drone = RemoteDrone { tx, role };
                        match role {
                            DroneRole::Sender => self.remote_senders.push(drone),
                            _ => self.remote_listeners.push(drone),
                        }
                    }
                    Ok(role) => warn!(%uri, ?role, "drone announced unusable role"),
                    Err(e) => warn!(%uri, "drone DEAD: {}", e),
                },
                Err(e) => warn!(%uri, "drone DEAD: {}", e),
            }
        }
    }

    async fn shutdown_drones(&mut self) {
        for drone in self
            .remote_senders
            .iter_mut()
            .chain(self.remote_listeners.iter_mut())
        {
            if let Err(e) = drone.tx.send(&Message::Terminate).await {
                debug!(peer = drone.tx.peer(), ?drone.role, "terminate not delivered: {}", e);
            }
        }
    }

    /// Run one phase to completion (send everything, then listen out the
    /// quiescence timeout).
    async fn run_phase(&mut self, index: usize, phase: &PhaseSpec) -> Result<()> {
        let filter = if index > 0 && self.settings.phases[index - 1].mode == ScanMode::Arp {
            Some(&mut self.phase_filter)
        } else {
            None
        };

        let (send_wus, recv_wus) =
            self.planner
                .plan_phase(&self.settings, phase, &self.iface, filter)?;

        if send_wus.is_empty() {
            info!(phase = index + 1, "no live targets for this phase, skipping");
            return Ok(());
        }
        let recv_wu = recv_wus
            .into_iter()
            .next()
            .ok_or_else(|| Error::Config("planner produced no recv workunit".to_string()))?;

        let is_arp_phase = phase.mode == ScanMode::Arp;
        let feed_filter = is_arp_phase && self.settings.is_compound();
        let do_connect = recv_wu.do_connect;
        let recv_timeout = Duration::from_secs(u64::from(recv_wu.recv_timeout));

        // Remote sender drones take the send workunits; otherwise a local
        // sender task drains them. Remote listeners get the recv plan in
        // parallel with the local listener.
        if !self.remote_senders.is_empty() {
            self.dispatch_remote_send(&send_wus).await;
        }
        self.dispatch_remote_recv(&recv_wu).await;

        let senders_done = Arc::new(AtomicBool::new(false));
        let (event_tx, mut event_rx) = mpsc::channel::<ListenerEvent>(1024);

        let listener_task = self.spawn_local_listener(
            &recv_wu,
            phase,
            recv_timeout,
            senders_done.clone(),
            event_tx,
        )?;

        let mut sender_task = if self.remote_senders.is_empty() {
            Some(self.spawn_local_sender(send_wus, phase)?)
        } else {
            // Remote senders got the workunits already; the quiescence
            // timer starts immediately (their completion is not tracked,
            // an acknowledged limitation of the drone protocol).
            senders_done.store(true, Ordering::Release);
            None
        };

        let mut drone_rx = self
            .drone_msg_rx
            .take()
            .ok_or_else(|| Error::Config("drone channel already taken".to_string()))?;

        // The master's phase loop: consume events while the drones work.
        loop {
            tokio::select! {
                event = event_rx.recv() => {
                    match event {
                        Some(event) => self.consume_event(event, feed_filter, do_connect),
                        None => break, // listener finished and closed the channel
                    }
                }
                msg = drone_rx.recv() => {
                    // The master keeps a sender clone, so this arm pends
                    // rather than closing when no drones are connected.
                    if let Some(msg) = msg {
                        self.consume_drone_message(msg, feed_filter, do_connect);
                    }
                }
                result = async {
                    match &mut sender_task {
                        Some(task) => task.await,
                        None => std::future::pending().await,
                    }
                }, if sender_task.is_some() => {
                    match result {
                        Ok(Ok(sent)) => debug!(sent, "local sender drained"),
                        Ok(Err(e)) => warn!("sender failed: {}", e),
                        Err(e) => warn!("sender task panicked: {}", e),
                    }
                    sender_task = None;
                    senders_done.store(true, Ordering::Release);
                }
            }
        }
        self.drone_msg_rx = Some(drone_rx);

        match listener_task.await {
            Ok(Ok(stats)) => {
                info!(
                    phase = index + 1,
                    frames = stats.frames,
                    reports = stats.reports,
                    spurious = stats.cookie_mismatch,
                    "phase complete"
                );
            }
            Ok(Err(e)) => warn!("listener failed: {}", e),
            Err(e) => warn!("listener task panicked: {}", e),
        }

        // Trace phases flatten their sessions once the phase is over.
        if phase.mode == ScanMode::TcpTrace {
            let reports = self.trace_table.lock().drain_reports();
            for report in reports {
                self.aggregator.add_trace_report(report);
            }
        }

        Ok(())
    }

    fn consume_event(&mut self, event: ListenerEvent, feed_filter: bool, do_connect: bool) {
        match event {
            ListenerEvent::Ip(report) => {
                if do_connect && report.is_open_tcp() {
                    self.spawn_banner_grab(&report);
                }
                self.aggregator.add_ip_report(report);
            }
            ListenerEvent::Arp(report) => {
                if feed_filter {
                    self.phase_filter.store(report.ipaddr, report.hwaddr);
                }
                self.aggregator.add_arp_report(report);
            }
            ListenerEvent::TraceHop => {}
        }
    }

    /// Complete a handshake against the confirmed-open port, sending the
    /// payload variant the probe's encoded source port selected.
    fn spawn_banner_grab(&mut self, report: &unicornscan_core::IpReport) {
        let key = report.key();
        let host = report.host_addr;
        let port = report.sport;
        let index = unicornscan_core::decode_payload_index(report.dport);
        let payload = {
            let mut rng = rand::rngs::SmallRng::from_entropy();
            self.registry
                .get_payload(index, unicornscan_core::Proto::Tcp, port, 0, &mut rng)
                .map(|(bytes, _)| bytes)
        };

        self.grab_tasks.push(tokio::spawn(async move {
            let banner =
                crate::grab::grab_banner(host, port, payload, Duration::from_secs(5)).await;
            (key, banner)
        }));
    }

    /// Reports arriving from remote listener drones look just like local
    /// listener events; stats are logged, the rest is ignored.
    fn consume_drone_message(&mut self, msg: Message, feed_filter: bool, do_connect: bool) {
        match msg {
            Message::IpReport(report) => {
                self.consume_event(ListenerEvent::Ip(report), feed_filter, do_connect)
            }
            Message::ArpReport(report) => {
                self.consume_event(ListenerEvent::Arp(report), feed_filter, do_connect)
            }
            Message::TracePathReport(report) => self.aggregator.add_trace_report(report),
            Message::WorkunitStats(stats) => {
                debug!(wu_id = stats.id, count = stats.count, done = stats.done, "drone stats");
            }
            other => debug!(?other, "ignoring drone message"),
        }
    }

    async fn dispatch_remote_send(&mut self, send_wus: &[SendWorkunit]) {
        let mut dead = Vec::new();
        for (slot, drone) in self.remote_senders.iter_mut().enumerate() {
            for wu in send_wus {
                if let Err(e) = drone.tx.send(&Message::SendWorkunit(wu.clone())).await {
                    warn!(peer = drone.tx.peer(), "sender drone DEAD mid-scan: {}", e);
                    dead.push(slot);
                    break;
                }
            }
        }
        // Dead drones' work is not redistributed; log and carry on.
        for slot in dead.into_iter().rev() {
            self.remote_senders.remove(slot);
        }
        if self.remote_senders.is_empty() {
            warn!("all sender drones dead; falling back to the local sender");
        }
    }

    async fn dispatch_remote_recv(&mut self, recv_wu: &RecvWorkunit) {
        let mut dead = Vec::new();
        for (slot, drone) in self.remote_listeners.iter_mut().enumerate() {
            if let Err(e) = drone.tx.send(&Message::RecvWorkunit(recv_wu.clone())).await {
                warn!(peer = drone.tx.peer(), "listener drone DEAD mid-scan: {}", e);
                dead.push(slot);
            }
        }
        for slot in dead.into_iter().rev() {
            self.remote_listeners.remove(slot);
        }
    }

    fn spawn_local_sender(
        &self,
        send_wus: Vec<SendWorkunit>,
        phase: &PhaseSpec,
    ) -> Result<tokio::task::JoinHandle<Result<u64>>> {
        let iface_name = self.iface.name.clone();
        let registry = self.registry.clone();
        let shuffle = self.settings.options.shuffle;
        let trace_table = self.trace_table.clone();
        let is_trace = phase.mode == ScanMode::TcpTrace;

        Ok(tokio::task::spawn_blocking(move || {
            let mut capture = PcapCapture::new();
            capture.open(&iface_name, false, 1)?;

            let mut sender = Sender::new(Box::new(capture), registry).with_shuffle(shuffle);
            if is_trace {
                sender = sender.with_trace_table(trace_table);
            }

            let mut total = 0u64;
            for wu in &send_wus {
                match sender.run_workunit(wu) {
                    Ok(stats) => total += stats.sent,
                    // A failed workunit is logged and the queue continues.
                    Err(e) => warn!(wu_id = wu.id, "workunit failed: {}", e),
                }
            }
            Ok(total)
        }))
    }

    fn spawn_local_listener(
        &self,
        recv_wu: &RecvWorkunit,
        phase: &PhaseSpec,
        recv_timeout: Duration,
        senders_done: Arc<AtomicBool>,
        event_tx: mpsc::Sender<ListenerEvent>,
    ) -> Result<tokio::task::JoinHandle<Result<crate::listener::ListenStats>>> {
        let iface_name = self.iface.name.clone();
        let local_ip = self.settings.src_addr.unwrap_or(self.iface.ipv4);
        let netmask = self.iface.netmask;
        let bpf = default_bpf_filter(recv_wu, local_ip);
        let promisc = recv_wu.promisc;
        let expected: HashSet<u16> = self.settings.ports.iter().map(|e| e.port()).collect();
        let ctx = ListenerContext::from_workunit(recv_wu, local_ip, netmask, expected);
        let trace_table = (phase.mode == ScanMode::TcpTrace).then(|| self.trace_table.clone());

        Ok(tokio::task::spawn_blocking(move || {
            // Coalesced receives break per-packet parsing; keep the guard
            // alive for the whole capture.
            let _offload = OffloadGuard::disable(&iface_name);

            let mut capture = PcapCapture::new();
            capture.open(&iface_name, promisc, 1)?;
            capture.set_filter(&bpf)?;

            let mut classifier = Classifier::new(ctx);
            if let Some(table) = trace_table {
                classifier = classifier.with_trace_table(table);
            }

            let listener = Listener::new(Box::new(capture), classifier);
            listener.run(recv_timeout, senders_done, move |event| {
                let _ = event_tx.blocking_send(event);
            })
        }))
    }
}

fn resolve_interface(settings: &ScanSettings) -> Result<InterfaceSnapshot> {
    let iface = if let Some(name) = settings.interfaces.first() {
        find_by_name(name).map_err(|e| Error::Network(e.to_string()))?
    } else {
        let first_target = settings
            .targets
            .first()
            .ok_or_else(|| Error::InvalidTarget("no targets given".to_string()))?;
        find_for_target(first_target.base()).map_err(|e| Error::Network(e.to_string()))?
    };

    let mut snapshot = iface
        .snapshot()
        .map_err(|e| Error::Network(e.to_string()))?;
    if let Some(spoofed) = settings.src_addr {
        snapshot.ipv4 = spoofed;
    }
    if let Some(mac) = settings.src_mac {
        snapshot.mac = mac;
    }
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use unicornscan_core::{parse_mode_spec, PortList, Target};

    #[test]
    fn test_resolve_interface_loopback_fallback() {
        // Whatever the environment, resolving for 127.0.0.1 must produce an
        // interface with an address.
        let settings = ScanSettings::new(
            parse_mode_spec("T").unwrap(),
            vec![Target::parse("127.0.0.1").unwrap()],
            PortList::parse("80").unwrap(),
        );
        let snapshot = resolve_interface(&settings).unwrap();
        assert!(!snapshot.name.is_empty());
    }

    #[test]
    fn test_resolve_interface_applies_overrides() {
        let mut settings = ScanSettings::new(
            parse_mode_spec("T").unwrap(),
            vec![Target::parse("127.0.0.1").unwrap()],
            PortList::parse("80").unwrap(),
        );
        settings.src_addr = Some("10.99.99.99".parse().unwrap());
        settings.src_mac = Some([9; 6]);
        let snapshot = resolve_interface(&settings).unwrap();
        assert_eq!(snapshot.ipv4, "10.99.99.99".parse::<std::net::Ipv4Addr>().unwrap());
        assert_eq!(snapshot.mac, [9; 6]);
    }

    #[test]
    fn test_resolve_interface_unknown_name_fails() {
        let mut settings = ScanSettings::new(
            parse_mode_spec("T").unwrap(),
            vec![Target::parse("127.0.0.1").unwrap()],
            PortList::parse("80").unwrap(),
        );
        settings.interfaces = vec!["no-such-iface-42".to_string()];
        assert!(resolve_interface(&settings).is_err());
    }
}
