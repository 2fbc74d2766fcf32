//! CONNECT tunnels with handshake fragmentation.
//!
//! A tunnel session goes through these phases:
//!
//! 1. dial the resolved upstream (before the client sees `200`),
//! 2. for classified hostnames, read the client's first bytes in chunks and
//!    split the chunk carrying the plaintext hostname into two writes, one
//!    byte into the hostname so neither write holds it whole,
//! 3. relay both directions until either side finishes.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::relay::{RelaySummary, relay};

/// Size of each client read while looking for the hostname.
pub const HANDSHAKE_CHUNK_SIZE: usize = 1024;

/// How the handshake was forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fragmentation {
    /// The chunk carrying the hostname was written as `[0, at)` and
    /// `[at, end)`, where `at` is one byte past the hostname's start.
    Split { at: usize },
    /// The hostname straddled two chunks and was forwarded unsplit.
    Spanning,
}

/// Dials upstreams and drives tunnel sessions.
#[derive(Debug, Clone)]
pub struct Tunnel {
    dial_timeout: Duration,
    read_timeout: Duration,
}

impl Tunnel {
    pub fn new(dial_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            dial_timeout,
            read_timeout,
        }
    }

    /// Connects to the upstream with Nagle disabled, so that separate writes
    /// leave as separate segments.
    pub async fn connect_upstream(&self, addr: SocketAddr) -> Result<TcpStream, TunnelError> {
        debug!("connecting to upstream {}", addr);

        let stream = timeout(self.dial_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TunnelError::ConnectTimeout(addr))?
            .map_err(TunnelError::Connect)?;
        stream.set_nodelay(true).map_err(TunnelError::Connect)?;

        Ok(stream)
    }

    /// Forwards client bytes to upstream until the hostname has been seen.
    ///
    /// Each read is bounded by the read timeout; there is no other limit on
    /// how long the hostname may take to show up. EOF before the hostname is
    /// an error.
    pub async fn fragment_handshake<C, U>(
        &self,
        client: &mut C,
        upstream: &mut U,
        hostname: &str,
    ) -> Result<Fragmentation, TunnelError>
    where
        C: AsyncRead + Unpin,
        U: AsyncWrite + Unpin,
    {
        let marker = hostname.as_bytes();
        let mut buf = vec![0u8; HANDSHAKE_CHUNK_SIZE];
        // Trailing bytes of earlier chunks, enough to spot a hostname that
        // straddles a chunk boundary.
        let mut carried: Vec<u8> = Vec::new();

        loop {
            let n = timeout(self.read_timeout, client.read(&mut buf))
                .await
                .map_err(|_| TunnelError::HandshakeTimeout)?
                .map_err(TunnelError::Io)?;
            if n == 0 {
                return Err(TunnelError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
            let chunk = &buf[..n];

            if let Some(offset) = find(chunk, marker) {
                let at = offset + 1;
                write_segment(upstream, &chunk[..at]).await?;
                write_segment(upstream, &chunk[at..]).await?;
                return Ok(Fragmentation::Split { at });
            }

            write_segment(upstream, chunk).await?;

            carried.extend_from_slice(chunk);
            if find(&carried, marker).is_some() {
                return Ok(Fragmentation::Spanning);
            }
            let keep = marker.len().saturating_sub(1);
            if carried.len() > keep {
                carried.drain(..carried.len() - keep);
            }
        }
    }

    /// Runs a session over an established upstream connection.
    ///
    /// Both connections are closed when this returns, whatever the outcome.
    pub async fn run<C, U>(
        &self,
        mut client: C,
        mut upstream: U,
        hostname: &str,
        fragment: bool,
    ) -> Result<RelaySummary, TunnelError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        U: AsyncRead + AsyncWrite + Unpin,
    {
        if fragment {
            let fragmentation = self
                .fragment_handshake(&mut client, &mut upstream, hostname)
                .await?;
            debug!("handshake for {} forwarded: {:?}", hostname, fragmentation);
        }

        Ok(relay(client, upstream).await)
    }
}

/// Writes one segment and flushes it. Empty segments are skipped.
async fn write_segment<U>(upstream: &mut U, bytes: &[u8]) -> Result<(), TunnelError>
where
    U: AsyncWrite + Unpin,
{
    if bytes.is_empty() {
        return Ok(());
    }
    upstream.write_all(bytes).await.map_err(TunnelError::Io)?;
    upstream.flush().await.map_err(TunnelError::Io)
}

/// Offset of the first occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("failed to connect to upstream: {0}")]
    Connect(#[source] std::io::Error),
    #[error("connecting to upstream {0} timed out")]
    ConnectTimeout(SocketAddr),
    #[error("client upgrade failed: {0}")]
    Upgrade(#[source] hyper::Error),
    #[error("timed out waiting for the client handshake")]
    HandshakeTimeout,
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}
