//! Overlay network abstraction for the overlink agent
//!
//! This crate defines the seam between the agent and the overlay-network
//! client library. The agent never touches virtual interfaces, key exchange
//! or peer routing itself; it only drives a session through the operations
//! declared here.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    overlink-agent                        │
//! │        (supervisor, session factory, TCP relay)          │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Uses traits
//!                           ↓
//! ┌─────────────────────────────────────────────────────────┐
//! │            overlink-overlay (this crate)                 │
//! │  - OverlayNetwork       - OverlaySession                 │
//! │  - OverlayListener      - LocalClient                    │
//! │  - FallbackTcpHandler                                    │
//! └─────────────────────────────────────────────────────────┘
//!                           │
//!                           │ Implemented by
//!                           ↓
//! ┌──────────────┬──────────────┬─────────────────────────────┐
//! │ direct       │ mock         │  real overlay client        │
//! │ (local bind) │ (test-util)  │  bindings                   │
//! └──────────────┴──────────────┴─────────────────────────────┘
//! ```

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt::{self, Debug};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub mod direct;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
mod status;

pub use direct::{DirectConfig, DirectNetwork, DirectSession, PortForward};
pub use status::{NetworkInfo, Status};

/// Overlay-level errors
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("Failed to start overlay session: {0}")]
    Start(String),

    #[error("Failed to listen on overlay port {port}: {reason}")]
    Listen { port: u16, reason: String },

    #[error("Overlay session closed")]
    Closed,

    #[error("Local client unavailable: {0}")]
    LocalClient(String),

    #[error("Status query failed: {0}")]
    Status(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for overlay operations
pub type OverlayResult<T> = Result<T, OverlayError>;

/// Pause after a failed accept before accepting again
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Byte stream carried over the overlay
pub trait OverlayIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> OverlayIo for T {}

/// An inbound overlay connection
pub type OverlayStream = Box<dyn OverlayIo>;

/// Per-connection handler produced by a [`FallbackTcpHandler`]
pub type TcpHandlerFn = Box<dyn FnOnce(OverlayStream) -> BoxFuture<'static, ()> + Send>;

/// Decision returned for an inbound connection with no explicit listener
pub enum Routing {
    /// Take the connection and service it with the given handler
    Intercept(TcpHandlerFn),
    /// Leave the connection to the overlay client (it gets dropped)
    Pass,
}

impl Routing {
    pub fn is_intercept(&self) -> bool {
        matches!(self, Routing::Intercept(_))
    }
}

impl Debug for Routing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Routing::Intercept(_) => f.write_str("Intercept(..)"),
            Routing::Pass => f.write_str("Pass"),
        }
    }
}

/// Handler consulted for inbound TCP connections that match no explicit listener
///
/// Called with the source address of the peer and the destination address the
/// traffic was aimed at inside the overlay.
pub trait FallbackTcpHandler: Send + Sync {
    fn route(&self, src: SocketAddr, dst: SocketAddr) -> Routing;
}

/// Options used to bring up a new overlay session
///
/// Not `Clone`: the auth key is a single-use join credential and moves into
/// exactly one session.
pub struct SessionOptions {
    /// Node name announced to the network
    pub hostname: String,

    /// Control server coordinating the overlay
    pub control_url: String,

    /// Deregister the node when the session closes
    pub ephemeral: bool,

    /// Directory holding the client's local state
    pub state_dir: PathBuf,

    /// One-time network join credential
    pub auth_key: String,
}

impl Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("hostname", &self.hostname)
            .field("control_url", &self.control_url)
            .field("ephemeral", &self.ephemeral)
            .field("state_dir", &self.state_dir)
            .field("auth_key", &"<redacted>")
            .finish()
    }
}

/// Explicit TCP listener on the overlay interface
#[async_trait]
pub trait OverlayListener: Send + Sync + Debug {
    /// Accept the next inbound connection
    ///
    /// Returns [`OverlayError::Closed`] once the owning session is closed.
    async fn accept(&self) -> OverlayResult<(OverlayStream, SocketAddr)>;

    /// Overlay port this listener is bound to
    fn local_port(&self) -> u16;
}

/// Local health-check client of a running session
#[async_trait]
pub trait LocalClient: Send + Sync {
    /// Query the current session status
    async fn status(&self) -> OverlayResult<Status>;
}

/// A live overlay-network client session
#[async_trait]
pub trait OverlaySession: Send + Sync + Debug + 'static {
    /// Listener type returned by [`OverlaySession::listen`]
    type Listener: OverlayListener + 'static;

    /// Health-check client type
    type LocalClient: LocalClient;

    /// Hostname this session joined with
    fn hostname(&self) -> &str;

    /// Open an explicit TCP listener on the given overlay port
    async fn listen(&self, port: u16) -> OverlayResult<Self::Listener>;

    /// Install the handler for inbound connections with no explicit listener
    fn register_fallback_tcp_handler(&self, handler: Arc<dyn FallbackTcpHandler>);

    /// Obtain the local health-check client
    fn local_client(&self) -> OverlayResult<Self::LocalClient>;

    /// Close the session and leave the network
    async fn close(&self) -> OverlayResult<()>;
}

/// Entry point of an overlay client library: brings sessions up
#[async_trait]
pub trait OverlayNetwork: Send + Sync + Debug {
    /// The session type created by this network
    type Session: OverlaySession;

    /// Configure and start a new session
    async fn start(&self, options: SessionOptions) -> OverlayResult<Self::Session>;
}
