//! Framed message bus transport
//!
//! Carries the wire codec from `unicornscan_core::msg` over sockets:
//! Unix-domain for local drones, TCP for remote ones. Frames are
//! `[header magic][message magic][length][payload]`; the transport reads
//! exactly one frame at a time and hands the body to the codec. A version
//! handshake opens every drone connection.
//!
//! A connection can be split into a send half (the master keeps it for
//! workunit dispatch and terminate) and a receive half (pumped into a
//! channel for the scan's duration). In-process drones skip the sockets
//! entirely and move decoded [`Message`] values over tokio channels; the
//! framing only exists where a socket does.

use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, warn};
use unicornscan_core::msg::HEADER_MAGIC;
use unicornscan_core::{DroneRole, Error, Message, Result, BUS_VERSION};

/// Upper bound on one frame body; anything bigger is a protocol error.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Parsed drone endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DroneUri {
    /// `host:port`
    Tcp(String),
    /// `unix:/absolute/path`
    Unix(PathBuf),
}

impl DroneUri {
    /// Parse `host:port` or `unix:/path`.
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::Drone("empty drone uri".to_string()));
        }

        if let Some(path) = input.strip_prefix("unix:") {
            if !path.starts_with('/') {
                return Err(Error::Drone(format!(
                    "unix drone path must be absolute: `{}`",
                    path
                )));
            }
            return Ok(DroneUri::Unix(PathBuf::from(path)));
        }

        match input.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                port.parse::<u16>()
                    .map_err(|_| Error::Drone(format!("bad drone port `{}`", port)))?;
                Ok(DroneUri::Tcp(input.to_string()))
            }
            _ => Err(Error::Drone(format!(
                "drone uri `{}` is neither host:port nor unix:/path",
                input
            ))),
        }
    }
}

impl std::fmt::Display for DroneUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DroneUri::Tcp(hostport) => write!(f, "{}", hostport),
            DroneUri::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Write one message as a frame.
async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, peer: &str, msg: &Message) -> Result<()> {
    let frame = msg.encode();
    w.write_all(&frame)
        .await
        .map_err(|e| Error::Drone(format!("send to {}: {}", peer, e)))
}

/// Read one frame and decode it. `Ok(None)` is a clean close between frames.
async fn read_frame<R: AsyncRead + Unpin>(r: &mut R, peer: &str) -> Result<Option<Message>> {
    let mut header = [0u8; 12];
    match r.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Drone(format!("recv from {}: {}", peer, e))),
    }

    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != HEADER_MAGIC {
        return Err(Error::Ipc(format!(
            "bad header magic {:08x} from {}",
            magic, peer
        )));
    }
    let msg_magic = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    let len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::Ipc(format!(
            "oversized frame ({} bytes) from {}",
            len, peer
        )));
    }

    let mut body = vec![0u8; len];
    r.read_exact(&mut body)
        .await
        .map_err(|e| Error::Drone(format!("recv body from {}: {}", peer, e)))?;

    Message::decode_body(msg_magic, &body).map(Some)
}

enum BusStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

/// One framed connection to a peer on the bus.
pub struct BusConn {
    stream: BusStream,
    peer: String,
}

impl BusConn {
    /// Connect out to a drone endpoint.
    pub async fn connect(uri: &DroneUri) -> Result<Self> {
        let stream = match uri {
            DroneUri::Tcp(hostport) => BusStream::Tcp(
                TcpStream::connect(hostport)
                    .await
                    .map_err(|e| Error::Drone(format!("connect {}: {}", hostport, e)))?,
            ),
            DroneUri::Unix(path) => BusStream::Unix(
                UnixStream::connect(path)
                    .await
                    .map_err(|e| Error::Drone(format!("connect {}: {}", path.display(), e)))?,
            ),
        };
        Ok(Self {
            stream,
            peer: uri.to_string(),
        })
    }

    pub fn from_tcp(stream: TcpStream, peer: String) -> Self {
        Self {
            stream: BusStream::Tcp(stream),
            peer,
        }
    }

    pub fn from_unix(stream: UnixStream, peer: String) -> Self {
        Self {
            stream: BusStream::Unix(stream),
            peer,
        }
    }

    /// The endpoint this connection talks to.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send one message.
    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        match &mut self.stream {
            BusStream::Tcp(s) => write_frame(s, &self.peer, msg).await,
            BusStream::Unix(s) => write_frame(s, &self.peer, msg).await,
        }
    }

    /// Receive one message; `Ok(None)` on clean close.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        match &mut self.stream {
            BusStream::Tcp(s) => read_frame(s, &self.peer).await,
            BusStream::Unix(s) => read_frame(s, &self.peer).await,
        }
    }

    /// Split into independently owned send and receive halves.
    pub fn split(self) -> (BusSender, BusReceiver) {
        let peer = self.peer;
        match self.stream {
            BusStream::Tcp(s) => {
                let (r, w) = tokio::io::split(s);
                (
                    BusSender {
                        half: WriterHalf::Tcp(w),
                        peer: peer.clone(),
                    },
                    BusReceiver {
                        half: ReaderHalf::Tcp(r),
                        peer,
                    },
                )
            }
            BusStream::Unix(s) => {
                let (r, w) = tokio::io::split(s);
                (
                    BusSender {
                        half: WriterHalf::Unix(w),
                        peer: peer.clone(),
                    },
                    BusReceiver {
                        half: ReaderHalf::Unix(r),
                        peer,
                    },
                )
            }
        }
    }

    /// Client side of the version handshake: announce ourselves, expect a
    /// compatible hello back.
    pub async fn handshake(&mut self, role: DroneRole) -> Result<DroneRole> {
        self.send(&Message::Hello {
            version: BUS_VERSION,
            role,
        })
        .await?;
        match self.recv().await? {
            Some(Message::Hello { version, role }) if version == BUS_VERSION => {
                debug!(peer = %self.peer, ?role, "bus handshake complete");
                Ok(role)
            }
            Some(Message::Hello { version, .. }) => Err(Error::Drone(format!(
                "version mismatch with {}: ours {}, theirs {}",
                self.peer, BUS_VERSION, version
            ))),
            other => Err(Error::Drone(format!(
                "expected hello from {}, got {:?}",
                self.peer, other
            ))),
        }
    }

    /// Server side of the handshake: expect a hello, answer with ours.
    pub async fn accept_handshake(&mut self, our_role: DroneRole) -> Result<DroneRole> {
        let peer_role = match self.recv().await? {
            Some(Message::Hello { version, role }) if version == BUS_VERSION => role,
            Some(Message::Hello { version, .. }) => {
                return Err(Error::Drone(format!(
                    "version mismatch with {}: ours {}, theirs {}",
                    self.peer, BUS_VERSION, version
                )))
            }
            other => {
                return Err(Error::Drone(format!(
                    "expected hello from {}, got {:?}",
                    self.peer, other
                )))
            }
        };
        self.send(&Message::Hello {
            version: BUS_VERSION,
            role: our_role,
        })
        .await?;
        Ok(peer_role)
    }
}

enum WriterHalf {
    Tcp(WriteHalf<TcpStream>),
    Unix(WriteHalf<UnixStream>),
}

enum ReaderHalf {
    Tcp(ReadHalf<TcpStream>),
    Unix(ReadHalf<UnixStream>),
}

/// Send half of a split connection.
pub struct BusSender {
    half: WriterHalf,
    peer: String,
}

impl BusSender {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&mut self, msg: &Message) -> Result<()> {
        match &mut self.half {
            WriterHalf::Tcp(w) => write_frame(w, &self.peer, msg).await,
            WriterHalf::Unix(w) => write_frame(w, &self.peer, msg).await,
        }
    }
}

/// Receive half of a split connection.
pub struct BusReceiver {
    half: ReaderHalf,
    peer: String,
}

impl BusReceiver {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn recv(&mut self) -> Result<Option<Message>> {
        match &mut self.half {
            ReaderHalf::Tcp(r) => read_frame(r, &self.peer).await,
            ReaderHalf::Unix(r) => read_frame(r, &self.peer).await,
        }
    }
}

/// Listening side of the bus for incoming drone connections.
pub enum BusAcceptor {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl BusAcceptor {
    /// Bind on a drone endpoint.
    pub async fn bind(uri: &DroneUri) -> Result<Self> {
        match uri {
            DroneUri::Tcp(hostport) => TcpListener::bind(hostport)
                .await
                .map(BusAcceptor::Tcp)
                .map_err(|e| Error::Drone(format!("bind {}: {}", hostport, e))),
            DroneUri::Unix(path) => {
                // Stale socket files prevent rebinding.
                let _ = std::fs::remove_file(path);
                UnixListener::bind(path)
                    .map(BusAcceptor::Unix)
                    .map_err(|e| Error::Drone(format!("bind {}: {}", path.display(), e)))
            }
        }
    }

    /// Accept one connection.
    pub async fn accept(&self) -> Result<BusConn> {
        match self {
            BusAcceptor::Tcp(listener) => {
                let (stream, addr) = listener
                    .accept()
                    .await
                    .map_err(|e| Error::Drone(format!("accept: {}", e)))?;
                Ok(BusConn::from_tcp(stream, addr.to_string()))
            }
            BusAcceptor::Unix(listener) => {
                let (stream, _) = listener
                    .accept()
                    .await
                    .map_err(|e| Error::Drone(format!("accept: {}", e)))?;
                Ok(BusConn::from_unix(stream, "unix-peer".to_string()))
            }
        }
    }
}

/// Forward every message from `rx` into a channel until EOF or error.
/// Decode errors drop the connection (the peer is marked dead upstream).
pub async fn pump_to_channel(
    mut rx: BusReceiver,
    tx: tokio::sync::mpsc::Sender<Message>,
) -> Result<()> {
    loop {
        match rx.recv().await {
            Ok(Some(msg)) => {
                if tx.send(msg).await.is_err() {
                    return Ok(());
                }
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                warn!(peer = rx.peer(), "bus connection dropped: {}", e);
                return Err(e);
            }
        }
    }
}
