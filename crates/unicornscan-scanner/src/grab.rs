//! TCP connect follow-up for banner grabbing
//!
//! The stateless pipeline never completes handshakes; when the user asks for
//! banners, an open-port report triggers this helper instead. It connects
//! through the OS stack, writes the payload variant the probe's encoded
//! source port selected, reads whatever comes back, and runs it through the
//! binary banner parser. Plain-text services that talk first (SSH, SMTP)
//! come through as-is.

use crate::banner;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Cap on the bytes read for one banner.
const BANNER_READ_MAX: usize = 4096;

/// Connect, optionally send a payload, read a banner, summarize it.
///
/// Returns None when the connection or first read fails; the open-port
/// report stands on its own in that case.
pub async fn grab_banner(
    host: Ipv4Addr,
    port: u16,
    payload: Option<Vec<u8>>,
    timeout: Duration,
) -> Option<String> {
    let addr = SocketAddr::from((host, port));

    let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .ok()?
        .ok()?;

    if let Some(payload) = payload {
        if !payload.is_empty() {
            tokio::time::timeout(timeout, stream.write_all(&payload))
                .await
                .ok()?
                .ok()?;
        }
    }

    let mut buf = vec![0u8; BANNER_READ_MAX];
    let n = tokio::time::timeout(timeout, stream.read(&mut buf))
        .await
        .ok()?
        .ok()?;
    if n == 0 {
        return None;
    }
    buf.truncate(n);

    debug!(%host, port, bytes = n, "banner read");
    Some(summarize(&buf))
}

/// Printable text passes through trimmed; binary goes to the protocol
/// sniffer.
fn summarize(data: &[u8]) -> String {
    let printable = data
        .iter()
        .take(128)
        .all(|&b| b == b'\r' || b == b'\n' || b == b'\t' || (0x20..0x7f).contains(&b));
    if printable {
        let text = String::from_utf8_lossy(data);
        let line = text.lines().next().unwrap_or("").trim();
        if !line.is_empty() {
            return line.to_string();
        }
    }
    let (_proto, summary) = banner::parse(data);
    summary
}
