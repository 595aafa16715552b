//! TCP relay between overlay connections and local services
//!
//! Every inbound overlay connection that no explicit listener claims is
//! relayed to `localhost:<destination port>`. Bytes are copied in both
//! directions by two tasks; as soon as either direction ends, both streams
//! are torn down.

use crate::connection::{RelayInfo, RelayTracker};
use futures::FutureExt;
use overlink_overlay::{FallbackTcpHandler, OverlayStream, Routing};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Host every relayed connection is dialed on
pub const DEFAULT_TARGET_HOST: &str = "localhost";

/// Errors that can occur while relaying
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Failed to connect to local address {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },
}

/// Bytes moved by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Overlay peer -> local service
    pub to_local: u64,
    /// Local service -> overlay peer
    pub to_remote: u64,
}

/// Fallback handler relaying unclaimed overlay connections to local ports
#[derive(Clone)]
pub struct RelayHandler {
    target_host: Arc<str>,
    tracker: RelayTracker,
}

impl RelayHandler {
    pub fn new(tracker: RelayTracker) -> Self {
        Self::with_target_host(DEFAULT_TARGET_HOST, tracker)
    }

    /// Relay to a host other than `localhost`
    pub fn with_target_host(host: impl Into<String>, tracker: RelayTracker) -> Self {
        Self {
            target_host: Arc::from(host.into()),
            tracker,
        }
    }

    pub fn tracker(&self) -> &RelayTracker {
        &self.tracker
    }

    fn local_target(&self, dst: SocketAddr) -> String {
        format!("{}:{}", self.target_host, dst.port())
    }
}

impl FallbackTcpHandler for RelayHandler {
    fn route(&self, src: SocketAddr, dst: SocketAddr) -> Routing {
        let target = self.local_target(dst);
        let tracker = self.tracker.clone();

        Routing::Intercept(Box::new(move |stream: OverlayStream| {
            handle_connection(stream, src, dst, target, tracker).boxed()
        }))
    }
}

async fn handle_connection(
    stream: OverlayStream,
    src: SocketAddr,
    dst: SocketAddr,
    target: String,
    tracker: RelayTracker,
) {
    tracing::debug!(source = %src, destination = %dst, target = %target, "Relaying connection");

    let local = match connect(&target).await {
        Ok(local) => local,
        Err(e) => {
            // Dropping the overlay stream closes it
            tracing::error!(source = %src, error = %e, "Failed to dial local service");
            return;
        }
    };

    let relay_id = tracker
        .register(RelayInfo {
            source: src,
            destination: dst,
            local_target: target.clone(),
            established_at: Instant::now(),
        })
        .await;

    let stats = pipe(stream, local).await;
    tracker.unregister(relay_id).await;

    tracing::debug!(
        source = %src,
        target = %target,
        bytes_to_local = stats.to_local,
        bytes_to_remote = stats.to_remote,
        "Relay completed"
    );
}

async fn connect(address: &str) -> Result<TcpStream, RelayError> {
    TcpStream::connect(address)
        .await
        .map_err(|e| RelayError::ConnectionFailed {
            address: address.to_string(),
            source: e,
        })
}

/// Dial `address` and relay `inbound` to it until either side finishes
///
/// On dial failure `inbound` is dropped, closing it.
pub async fn relay<S>(inbound: S, address: &str) -> Result<RelayStats, RelayError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let local = connect(address).await?;
    Ok(pipe(inbound, local).await)
}

/// Copy bytes both ways between two streams
///
/// Returns once both copy tasks have finished; the first direction to end
/// cancels the other.
pub async fn pipe<A, B>(inbound: A, local: B) -> RelayStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (inbound_read, inbound_write) = tokio::io::split(inbound);
    let (local_read, local_write) = tokio::io::split(local);
    let done = CancellationToken::new();

    let to_local = tokio::spawn(copy_until_done(inbound_read, local_write, done.clone()));
    let to_remote = tokio::spawn(copy_until_done(local_read, inbound_write, done));

    let (to_local, to_remote) = tokio::join!(to_local, to_remote);

    RelayStats {
        to_local: bytes_copied("to_local", to_local),
        to_remote: bytes_copied("to_remote", to_remote),
    }
}

fn bytes_copied(
    direction: &'static str,
    result: Result<(u64, Option<std::io::Error>), tokio::task::JoinError>,
) -> u64 {
    match result {
        Ok((bytes, None)) => bytes,
        Ok((bytes, Some(e))) => {
            tracing::debug!(direction, bytes, error = %e, "Relay direction ended with error");
            bytes
        }
        Err(e) => {
            tracing::error!(direction, error = %e, "Relay task failed");
            0
        }
    }
}

/// Copy until EOF, an I/O error or cancellation
///
/// Returns the bytes written before the copy stopped, along with the error
/// that stopped it, if any.
async fn copy_until_done<R, W>(
    mut reader: R,
    mut writer: W,
    done: CancellationToken,
) -> (u64, Option<std::io::Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total_bytes = 0u64;

    let error = loop {
        let n = tokio::select! {
            read = reader.read(&mut buffer) => match read {
                Ok(0) => break None,
                Ok(n) => n,
                Err(e) => break Some(e),
            },
            _ = done.cancelled() => break None,
        };

        tokio::select! {
            written = writer.write_all(&buffer[..n]) => {
                if let Err(e) = written {
                    break Some(e);
                }
            }
            _ = done.cancelled() => break None,
        }
        total_bytes += n as u64;
    };

    done.cancel();
    let _ = writer.shutdown().await;
    (total_bytes, error)
}
