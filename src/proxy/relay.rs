//! Bidirectional byte relay between two connections.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

/// Upper bound for shutting down each write half once the relay ends.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Which copy direction finished first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

/// Outcome of a relay, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub finished: Direction,
    /// Bytes copied by the finishing direction before it stopped.
    pub bytes: u64,
    /// Whether the finishing direction stopped on an I/O error rather than EOF.
    pub failed: bool,
}

/// Copies bytes both ways until either direction reaches EOF or fails.
///
/// The first direction to stop ends the relay: both write halves are shut
/// down and both connections are dropped before returning. Errors are only
/// logged.
pub async fn relay<C, U>(client: C, upstream: U) -> RelaySummary
where
    C: AsyncRead + AsyncWrite,
    U: AsyncRead + AsyncWrite,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);

    let (finished, result) = tokio::select! {
        r = tokio::io::copy(&mut client_read, &mut upstream_write) => (Direction::ClientToUpstream, r),
        r = tokio::io::copy(&mut upstream_read, &mut client_write) => (Direction::UpstreamToClient, r),
    };

    let summary = match result {
        Ok(bytes) => RelaySummary {
            finished,
            bytes,
            failed: false,
        },
        Err(e) => {
            debug!("relay {:?} failed: {}", finished, e);
            RelaySummary {
                finished,
                bytes: 0,
                failed: true,
            }
        }
    };

    let _ = timeout(SHUTDOWN_GRACE, client_write.shutdown()).await;
    let _ = timeout(SHUTDOWN_GRACE, upstream_write.shutdown()).await;

    debug!(
        "relay closed: {:?} finished after {} bytes",
        summary.finished, summary.bytes
    );
    summary
}
