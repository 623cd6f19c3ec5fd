//! IPC message wire codec
//!
//! Every frame on the bus is `[header magic][message magic][length][payload]`,
//! all integers network byte order. The payload layout is fixed per message
//! type, with variable-length fields (option blobs, port strings, pcap
//! filters, packet bytes) length-prefixed in place. The same frames flow over
//! Unix-domain sockets to local drones, TCP to remote drones, and (decoded)
//! over in-process channels.
//!
//! Decoding is strict: a short buffer, unknown magic, or trailing garbage is
//! an `Error::Ipc` and the frame is dropped by the transport.

use crate::config::TcpFlags;
use crate::error::{Error, Result};
use crate::report::{
    ArpReport, IpReport, OutputData, TracePathHop, TracePathReport, ARP_REPORT_MAGIC,
    IP_REPORT_MAGIC, TRACE_PATH_MAGIC,
};
use crate::workunit::{
    InterfaceSnapshot, RecvWorkunit, SendWorkunit, WorkunitStats, WorkunitStatus,
};
use chrono::{DateTime, TimeZone, Utc};
use std::net::Ipv4Addr;

/// Bus-level magic present on every frame.
pub const HEADER_MAGIC: u32 = 0xeaebeced;

/// Message magic: a send-workunit wrapper.
pub const WORKUNIT_SEND_MAGIC: u32 = 0xcacbcccd;

/// Message magic: a recv-workunit wrapper.
pub const WORKUNIT_RECV_MAGIC: u32 = 0xcecfc0c1;

/// Message magic: per-workunit progress counters.
pub const WORKUNIT_STATS_MAGIC: u32 = 0xbabbbcbd;

/// Message magic: orderly shutdown broadcast.
pub const TERMINATE_MAGIC: u32 = 0xdadbdcdd;

/// Message magic: version handshake on drone connect.
pub const HELLO_MAGIC: u32 = 0xfafbfcfd;

/// Bus protocol version exchanged in the handshake.
pub const BUS_VERSION: u16 = 9;

/// Drone role announced in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DroneRole {
    Sender,
    Listener,
    Master,
}

impl DroneRole {
    fn as_u8(self) -> u8 {
        match self {
            DroneRole::Sender => 1,
            DroneRole::Listener => 2,
            DroneRole::Master => 3,
        }
    }

    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(DroneRole::Sender),
            2 => Ok(DroneRole::Listener),
            3 => Ok(DroneRole::Master),
            other => Err(Error::Ipc(format!("unknown drone role {}", other))),
        }
    }
}

/// A decoded bus message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello { version: u16, role: DroneRole },
    SendWorkunit(SendWorkunit),
    RecvWorkunit(RecvWorkunit),
    IpReport(IpReport),
    ArpReport(ArpReport),
    TracePathReport(TracePathReport),
    WorkunitStats(WorkunitStats),
    Terminate,
}

impl Message {
    /// The message magic that tags this variant on the wire.
    pub fn magic(&self) -> u32 {
        match self {
            Message::Hello { .. } => HELLO_MAGIC,
            Message::SendWorkunit(_) => WORKUNIT_SEND_MAGIC,
            Message::RecvWorkunit(_) => WORKUNIT_RECV_MAGIC,
            Message::IpReport(_) => IP_REPORT_MAGIC,
            Message::ArpReport(_) => ARP_REPORT_MAGIC,
            Message::TracePathReport(_) => TRACE_PATH_MAGIC,
            Message::WorkunitStats(_) => WORKUNIT_STATS_MAGIC,
            Message::Terminate => TERMINATE_MAGIC,
        }
    }

    /// Encode into a complete frame, header magic included.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Writer::new();
        match self {
            Message::Hello { version, role } => {
                body.put_u16(*version);
                body.put_u8(role.as_u8());
            }
            Message::SendWorkunit(wu) => encode_send_workunit(&mut body, wu),
            Message::RecvWorkunit(wu) => encode_recv_workunit(&mut body, wu),
            Message::IpReport(r) => encode_ip_report(&mut body, r),
            Message::ArpReport(r) => encode_arp_report(&mut body, r),
            Message::TracePathReport(r) => encode_trace_report(&mut body, r),
            Message::WorkunitStats(s) => {
                body.put_u32(s.id);
                body.put_u64(s.count);
                body.put_u8(s.done as u8);
            }
            Message::Terminate => {}
        }

        let body = body.into_bytes();
        let mut frame = Vec::with_capacity(12 + body.len());
        frame.extend_from_slice(&HEADER_MAGIC.to_be_bytes());
        frame.extend_from_slice(&self.magic().to_be_bytes());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    /// Decode a complete frame produced by [`Message::encode`].
    pub fn decode(frame: &[u8]) -> Result<Message> {
        let mut r = Reader::new(frame);
        let header = r.get_u32()?;
        if header != HEADER_MAGIC {
            return Err(Error::Ipc(format!("bad header magic {:08x}", header)));
        }
        let magic = r.get_u32()?;
        let len = r.get_u32()? as usize;
        let body = r.get_bytes(len)?;
        if r.remaining() != 0 {
            return Err(Error::Ipc(format!(
                "{} trailing bytes after frame",
                r.remaining()
            )));
        }
        Self::decode_body(magic, body)
    }

    /// Decode a message body given its magic (transport has framed already).
    pub fn decode_body(magic: u32, body: &[u8]) -> Result<Message> {
        let mut r = Reader::new(body);
        let msg = match magic {
            HELLO_MAGIC => {
                let version = r.get_u16()?;
                let role = DroneRole::from_u8(r.get_u8()?)?;
                Message::Hello { version, role }
            }
            WORKUNIT_SEND_MAGIC => Message::SendWorkunit(decode_send_workunit(&mut r)?),
            WORKUNIT_RECV_MAGIC => Message::RecvWorkunit(decode_recv_workunit(&mut r)?),
            IP_REPORT_MAGIC => Message::IpReport(decode_ip_report(&mut r)?),
            ARP_REPORT_MAGIC => Message::ArpReport(decode_arp_report(&mut r)?),
            TRACE_PATH_MAGIC => Message::TracePathReport(decode_trace_report(&mut r)?),
            WORKUNIT_STATS_MAGIC => Message::WorkunitStats(WorkunitStats {
                id: r.get_u32()?,
                count: r.get_u64()?,
                done: r.get_u8()? != 0,
            }),
            TERMINATE_MAGIC => Message::Terminate,
            other => return Err(Error::Ipc(format!("unknown message magic {:08x}", other))),
        };
        if r.remaining() != 0 {
            return Err(Error::Ipc(format!(
                "{} trailing bytes in message body",
                r.remaining()
            )));
        }
        Ok(msg)
    }
}

fn encode_send_workunit(w: &mut Writer, wu: &SendWorkunit) {
    w.put_u32(wu.magic);
    w.put_u32(wu.id);
    w.put_u8(wu.status.as_u8());
    w.put_u32(wu.repeats);
    w.put_u32(wu.pps);
    w.put_str(&wu.iface.name);
    w.put_ipv4(wu.iface.ipv4);
    w.put_ipv4(wu.iface.netmask);
    w.put_mac(&wu.iface.mac);
    w.put_u32(wu.iface.mtu);
    w.put_ipv4(wu.target);
    w.put_u8(wu.prefix);
    w.put_u8(wu.tos);
    w.put_u8(wu.ttl_min);
    w.put_u8(wu.ttl_max);
    w.put_blob(&wu.ip_options);
    w.put_u16(wu.frag_off);
    w.put_i32(wu.src_port);
    w.put_u8(wu.tcp_flags.bits());
    w.put_blob(&wu.tcp_options);
    w.put_u16(wu.window);
    w.put_u32(wu.syn_key);
    w.put_str(&wu.port_str);
}

fn decode_send_workunit(r: &mut Reader) -> Result<SendWorkunit> {
    Ok(SendWorkunit {
        magic: r.get_u32()?,
        id: r.get_u32()?,
        status: WorkunitStatus::from_u8(r.get_u8()?),
        repeats: r.get_u32()?,
        pps: r.get_u32()?,
        iface: InterfaceSnapshot {
            name: r.get_str()?,
            ipv4: r.get_ipv4()?,
            netmask: r.get_ipv4()?,
            mac: r.get_mac()?,
            mtu: r.get_u32()?,
        },
        target: r.get_ipv4()?,
        prefix: r.get_u8()?,
        tos: r.get_u8()?,
        ttl_min: r.get_u8()?,
        ttl_max: r.get_u8()?,
        ip_options: r.get_blob()?,
        frag_off: r.get_u16()?,
        src_port: r.get_i32()?,
        tcp_flags: TcpFlags(r.get_u8()?),
        tcp_options: r.get_blob()?,
        window: r.get_u16()?,
        syn_key: r.get_u32()?,
        port_str: r.get_str()?,
    })
}

fn encode_recv_workunit(w: &mut Writer, wu: &RecvWorkunit) {
    w.put_u32(wu.magic);
    w.put_u32(wu.id);
    w.put_u8(wu.status.as_u8());
    w.put_u16(wu.recv_timeout);
    w.put_u8(wu.ret_layers);
    let mut opts = 0u16;
    if wu.promisc {
        opts |= 0x0001;
    }
    if wu.report_broken_net {
        opts |= 0x0002;
    }
    if wu.report_broken_trans {
        opts |= 0x0004;
    }
    if wu.do_connect {
        opts |= 0x0008;
    }
    w.put_u16(opts);
    w.put_u32(wu.syn_key);
    match &wu.pcap_filter {
        Some(filter) => {
            w.put_u8(1);
            w.put_str(filter);
        }
        None => w.put_u8(0),
    }
    w.put_str(&wu.iface);
}

fn decode_recv_workunit(r: &mut Reader) -> Result<RecvWorkunit> {
    let magic = r.get_u32()?;
    let id = r.get_u32()?;
    let status = WorkunitStatus::from_u8(r.get_u8()?);
    let recv_timeout = r.get_u16()?;
    let ret_layers = r.get_u8()?;
    let opts = r.get_u16()?;
    let syn_key = r.get_u32()?;
    let pcap_filter = if r.get_u8()? != 0 {
        Some(r.get_str()?)
    } else {
        None
    };
    let iface = r.get_str()?;
    Ok(RecvWorkunit {
        magic,
        id,
        status,
        recv_timeout,
        ret_layers,
        promisc: opts & 0x0001 != 0,
        report_broken_net: opts & 0x0002 != 0,
        report_broken_trans: opts & 0x0004 != 0,
        do_connect: opts & 0x0008 != 0,
        syn_key,
        pcap_filter,
        iface,
    })
}

fn encode_ip_report(w: &mut Writer, report: &IpReport) {
    w.put_u16(report.sport);
    w.put_u16(report.dport);
    w.put_u8(report.proto);
    w.put_u16(report.type_);
    w.put_u16(report.subtype);
    w.put_ipv4(report.send_addr);
    w.put_ipv4(report.host_addr);
    w.put_ipv4(report.trace_addr);
    w.put_u8(report.ttl);
    w.put_time(report.recv_time);
    w.put_u16(report.flags);
    w.put_u32(report.mseq);
    w.put_u32(report.tseq);
    w.put_u16(report.window_size);
    match report.eth_hwaddr {
        Some(mac) => {
            w.put_u8(1);
            w.put_mac(&mac);
        }
        None => w.put_u8(0),
    }
    w.put_u16(report.output.len() as u16);
    for od in &report.output {
        match od {
            OutputData::Os(s) => {
                w.put_u8(1);
                w.put_str(s);
            }
            OutputData::Banner(s) => {
                w.put_u8(2);
                w.put_str(s);
            }
        }
    }
    match &report.packet {
        Some(bytes) => {
            w.put_u8(1);
            w.put_big_blob(bytes);
        }
        None => w.put_u8(0),
    }
}

fn decode_ip_report(r: &mut Reader) -> Result<IpReport> {
    let sport = r.get_u16()?;
    let dport = r.get_u16()?;
    let proto = r.get_u8()?;
    let type_ = r.get_u16()?;
    let subtype = r.get_u16()?;
    let send_addr = r.get_ipv4()?;
    let host_addr = r.get_ipv4()?;
    let trace_addr = r.get_ipv4()?;
    let ttl = r.get_u8()?;
    let recv_time = r.get_time()?;
    let flags = r.get_u16()?;
    let mseq = r.get_u32()?;
    let tseq = r.get_u32()?;
    let window_size = r.get_u16()?;
    let eth_hwaddr = if r.get_u8()? != 0 {
        Some(r.get_mac()?)
    } else {
        None
    };
    let od_count = r.get_u16()?;
    let mut output = Vec::with_capacity(od_count as usize);
    for _ in 0..od_count {
        let kind = r.get_u8()?;
        let s = r.get_str()?;
        output.push(match kind {
            1 => OutputData::Os(s),
            2 => OutputData::Banner(s),
            other => return Err(Error::Ipc(format!("unknown output-data type {}", other))),
        });
    }
    let packet = if r.get_u8()? != 0 {
        Some(r.get_big_blob()?)
    } else {
        None
    };
    Ok(IpReport {
        magic: IP_REPORT_MAGIC,
        sport,
        dport,
        proto,
        type_,
        subtype,
        send_addr,
        host_addr,
        trace_addr,
        ttl,
        recv_time,
        flags,
        mseq,
        tseq,
        window_size,
        eth_hwaddr,
        output,
        packet,
    })
}

fn encode_arp_report(w: &mut Writer, report: &ArpReport) {
    w.put_mac(&report.hwaddr);
    w.put_ipv4(report.ipaddr);
    w.put_time(report.recv_time);
    w.put_u16(report.flags);
    match &report.packet {
        Some(bytes) => {
            w.put_u8(1);
            w.put_big_blob(bytes);
        }
        None => w.put_u8(0),
    }
}

fn decode_arp_report(r: &mut Reader) -> Result<ArpReport> {
    let hwaddr = r.get_mac()?;
    let ipaddr = r.get_ipv4()?;
    let recv_time = r.get_time()?;
    let flags = r.get_u16()?;
    let packet = if r.get_u8()? != 0 {
        Some(r.get_big_blob()?)
    } else {
        None
    };
    Ok(ArpReport {
        magic: ARP_REPORT_MAGIC,
        hwaddr,
        ipaddr,
        recv_time,
        flags,
        packet,
    })
}

fn encode_trace_report(w: &mut Writer, report: &TracePathReport) {
    w.put_ipv4(report.target_addr);
    w.put_u16(report.target_port);
    w.put_u8(report.complete as u8);
    w.put_u8(report.hops.len() as u8);
    for hop in &report.hops {
        w.put_ipv4(hop.router_addr);
        w.put_u8(hop.hop_number);
        w.put_u32(hop.rtt_us);
        w.put_u8(hop.flags);
    }
}

fn decode_trace_report(r: &mut Reader) -> Result<TracePathReport> {
    let target_addr = r.get_ipv4()?;
    let target_port = r.get_u16()?;
    let complete = r.get_u8()? != 0;
    let hop_count = r.get_u8()? as usize;
    let mut hops = Vec::with_capacity(hop_count);
    for _ in 0..hop_count {
        hops.push(TracePathHop {
            router_addr: r.get_ipv4()?,
            hop_number: r.get_u8()?,
            rtt_us: r.get_u32()?,
            flags: r.get_u8()?,
        });
    }
    Ok(TracePathReport {
        magic: TRACE_PATH_MAGIC,
        target_addr,
        target_port,
        complete,
        hops,
    })
}

/// Big-endian byte writer.
struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new() -> Self {
        Self { buf: Vec::new() }
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn put_ipv4(&mut self, v: Ipv4Addr) {
        self.buf.extend_from_slice(&v.octets());
    }

    fn put_mac(&mut self, mac: &[u8; 6]) {
        self.buf.extend_from_slice(mac);
    }

    /// Length-prefixed (u16) byte blob.
    fn put_blob(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= u16::MAX as usize);
        self.put_u16(bytes.len() as u16);
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed (u32) byte blob, for captured packets.
    fn put_big_blob(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
    }

    /// Length-prefixed UTF-8 string.
    fn put_str(&mut self, s: &str) {
        self.put_blob(s.as_bytes());
    }

    /// Seconds + microseconds, like a wire timeval.
    fn put_time(&mut self, t: DateTime<Utc>) {
        self.put_u64(t.timestamp() as u64);
        self.put_u32(t.timestamp_subsec_micros());
    }
}

/// Big-endian byte reader over a borrowed frame.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn get_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(Error::Ipc(format!(
                "truncated frame: wanted {} bytes, have {}",
                n,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_bytes(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16> {
        let b = self.get_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn get_u32(&mut self) -> Result<u32> {
        let b = self.get_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_i32(&mut self) -> Result<i32> {
        let b = self.get_bytes(4)?;
        Ok(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_u64(&mut self) -> Result<u64> {
        let b = self.get_bytes(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn get_ipv4(&mut self) -> Result<Ipv4Addr> {
        let b = self.get_bytes(4)?;
        Ok(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
    }

    fn get_mac(&mut self) -> Result<[u8; 6]> {
        let b = self.get_bytes(6)?;
        Ok([b[0], b[1], b[2], b[3], b[4], b[5]])
    }

    fn get_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u16()? as usize;
        Ok(self.get_bytes(len)?.to_vec())
    }

    fn get_big_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.get_bytes(len)?.to_vec())
    }

    fn get_str(&mut self) -> Result<String> {
        let bytes = self.get_blob()?;
        String::from_utf8(bytes).map_err(|_| Error::Ipc("non-UTF-8 string field".to_string()))
    }

    fn get_time(&mut self) -> Result<DateTime<Utc>> {
        let secs = self.get_u64()? as i64;
        let micros = self.get_u32()?;
        Utc.timestamp_opt(secs, micros * 1000)
            .single()
            .ok_or_else(|| Error::Ipc("bad timestamp".to_string()))
    }
}
