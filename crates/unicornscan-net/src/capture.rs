//! Packet capture and L2 injection
//!
//! One abstraction serves both halves of the pipeline: the sender injects
//! raw frames through it, the listener pulls filtered captures out of it.
//! The contract is "L2 send" and "L2 receive with BPF"; the pcap backend
//! provides both. Capture reads use a short timeout so the listener's loop
//! can interleave IPC work without a dedicated wakeup channel.

use pcap::{Active, Capture};
use tracing::{debug, warn};
use unicornscan_core::{Error, Result};

/// Link-layer framing of a capture handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    /// Ethernet II, 14-byte header.
    Ethernet,
    /// Linux cooked capture (SLL), 16-byte header.
    Cooked,
    /// Raw IP, no link header.
    Raw,
    /// Radiotap, variable-length header with little-endian length field.
    Radiotap,
}

impl LinkLayer {
    fn from_linktype(lt: i32) -> Option<Self> {
        match lt {
            1 => Some(LinkLayer::Ethernet),
            12 | 101 => Some(LinkLayer::Raw),
            113 => Some(LinkLayer::Cooked),
            127 => Some(LinkLayer::Radiotap),
            _ => None,
        }
    }
}

/// A captured frame with its capture timestamp.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub data: Vec<u8>,
    /// Seconds and microseconds from the capture header.
    pub ts_sec: i64,
    pub ts_usec: i64,
}

/// L2 send plus filtered L2 receive.
pub trait PacketCapture: Send {
    /// Open the device. `timeout_ms` bounds each [`Self::next_frame`] wait.
    fn open(&mut self, iface: &str, promisc: bool, timeout_ms: i32) -> Result<()>;

    /// Install a BPF filter; replaces any previous filter.
    fn set_filter(&mut self, bpf: &str) -> Result<()>;

    /// Inject one raw frame.
    fn send_frame(&mut self, frame: &[u8]) -> Result<()>;

    /// Pull the next frame, or None when the read timeout expires.
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>>;

    /// Framing of captured bytes.
    fn link_layer(&self) -> LinkLayer;
}

/// pcap-backed implementation.
pub struct PcapCapture {
    handle: Option<Capture<Active>>,
    link: LinkLayer,
    iface: String,
}

impl PcapCapture {
    pub fn new() -> Self {
        Self {
            handle: None,
            link: LinkLayer::Ethernet,
            iface: String::new(),
        }
    }

    fn handle(&mut self) -> Result<&mut Capture<Active>> {
        self.handle
            .as_mut()
            .ok_or_else(|| Error::Network("capture not open".to_string()))
    }
}

impl Default for PcapCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketCapture for PcapCapture {
    fn open(&mut self, iface: &str, promisc: bool, timeout_ms: i32) -> Result<()> {
        let capture = Capture::from_device(iface)
            .map_err(|e| Error::Network(format!("no such device {}: {}", iface, e)))?
            .promisc(promisc)
            .snaplen(65535)
            .timeout(timeout_ms)
            .immediate_mode(true)
            .open()
            .map_err(|e| Error::Network(format!("cannot open {}: {}", iface, e)))?;

        let linktype = capture.get_datalink().0;
        self.link = LinkLayer::from_linktype(linktype).ok_or_else(|| {
            Error::Network(format!("unsupported link type {} on {}", linktype, iface))
        })?;

        debug!(iface, ?self.link, "capture opened");
        self.iface = iface.to_string();
        self.handle = Some(capture);
        Ok(())
    }

    fn set_filter(&mut self, bpf: &str) -> Result<()> {
        debug!(filter = bpf, "installing bpf filter");
        self.handle()?
            .filter(bpf, true)
            .map_err(|e| Error::Network(format!("bad bpf filter `{}`: {}", bpf, e)))
    }

    fn send_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.handle()?
            .sendpacket(frame)
            .map_err(|e| Error::Network(format!("send failed: {}", e)))
    }

    fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
        match self.handle()?.next_packet() {
            Ok(packet) => Ok(Some(CapturedFrame {
                data: packet.data.to_vec(),
                ts_sec: packet.header.ts.tv_sec as i64,
                ts_usec: packet.header.ts.tv_usec as i64,
            })),
            Err(pcap::Error::TimeoutExpired) => Ok(None),
            Err(e) => {
                warn!(iface = %self.iface, "capture read error: {}", e);
                Err(Error::Network(format!("capture read: {}", e)))
            }
        }
    }

    fn link_layer(&self) -> LinkLayer {
        self.link
    }
}

/// Strip the link header, returning the network-layer bytes, the EtherType
/// (when the framing carries one), and the source MAC (Ethernet only).
pub fn strip_link(
    link: LinkLayer,
    frame: &[u8],
) -> Option<(&[u8], Option<u16>, Option<[u8; 6]>)> {
    match link {
        LinkLayer::Ethernet => {
            if frame.len() < 14 {
                return None;
            }
            let mut src = [0u8; 6];
            src.copy_from_slice(&frame[6..12]);
            let ethertype = u16::from_be_bytes([frame[12], frame[13]]);
            Some((&frame[14..], Some(ethertype), Some(src)))
        }
        LinkLayer::Cooked => {
            if frame.len() < 16 {
                return None;
            }
            let ethertype = u16::from_be_bytes([frame[14], frame[15]]);
            Some((&frame[16..], Some(ethertype), None))
        }
        LinkLayer::Raw => Some((frame, None, None)),
        LinkLayer::Radiotap => {
            // it_len is little-endian at offset 2.
            if frame.len() < 4 {
                return None;
            }
            let hdr_len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
            if frame.len() < hdr_len {
                return None;
            }
            Some((&frame[hdr_len..], None, None))
        }
    }
}
