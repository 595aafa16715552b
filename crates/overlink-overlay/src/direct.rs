//! Direct overlay backend
//!
//! Exposes the overlay interface as plain TCP sockets on a local bind address.
//! Used for development and on hosts whose routing is already handled by an
//! external interface (WireGuard, VPN), where the agent only needs the
//! session lifecycle and the relay.
//!
//! Explicit listeners bind `bind_host:port`. Every [`PortForward`] in
//! [`DirectConfig::forward_ports`] binds `bind_host:listen_port` at session
//! start; its connections are dispatched to the registered fallback handler
//! as if they had been aimed at `overlay_port`.

use crate::{
    FallbackTcpHandler, LocalClient, NetworkInfo, OverlayError, OverlayListener, OverlayNetwork,
    OverlayResult, OverlaySession, OverlayStream, Routing, SessionOptions, Status,
    ACCEPT_RETRY_DELAY,
};
use async_trait::async_trait;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::net::TcpListener;
use tokio::sync::watch;

/// Configuration of the direct backend
#[derive(Debug, Clone)]
pub struct DirectConfig {
    /// Address standing in for the overlay interface
    pub bind_host: IpAddr,

    /// Ports routed to the fallback handler
    pub forward_ports: Vec<PortForward>,
}

/// A locally bound port standing in for an overlay port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortForward {
    /// Port bound on `bind_host`
    pub listen_port: u16,
    /// Destination port reported to the fallback handler
    pub overlay_port: u16,
}

impl FromStr for PortForward {
    type Err = String;

    /// Parses `LISTEN:OVERLAY`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (listen, overlay) = s
            .split_once(':')
            .ok_or_else(|| format!("expected LISTEN:OVERLAY, got '{}'", s))?;
        let parse = |port: &str| {
            port.trim()
                .parse::<u16>()
                .map_err(|e| format!("invalid port '{}': {}", port, e))
        };
        Ok(Self {
            listen_port: parse(listen)?,
            overlay_port: parse(overlay)?,
        })
    }
}

impl Default for DirectConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            forward_ports: Vec::new(),
        }
    }
}

/// Overlay network backed by local sockets
#[derive(Debug, Clone, Default)]
pub struct DirectNetwork {
    config: DirectConfig,
}

impl DirectNetwork {
    pub fn new(config: DirectConfig) -> Self {
        Self { config }
    }
}

struct Shared {
    hostname: String,
    control_url: String,
    bind_host: IpAddr,
    fallback: RwLock<Option<Arc<dyn FallbackTcpHandler>>>,
    closed: watch::Sender<bool>,
}

impl Shared {
    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn dispatch(&self, stream: OverlayStream, src: SocketAddr, dst: SocketAddr) {
        let handler = self
            .fallback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        match handler.map(|h| h.route(src, dst)) {
            Some(Routing::Intercept(handle)) => {
                tokio::spawn(handle(stream));
            }
            Some(Routing::Pass) => {
                tracing::debug!(src = %src, dst = %dst, "Fallback handler passed on connection");
            }
            None => {
                tracing::debug!(
                    src = %src,
                    dst = %dst,
                    "No fallback handler registered, dropping connection"
                );
            }
        }
    }
}

#[async_trait]
impl OverlayNetwork for DirectNetwork {
    type Session = DirectSession;

    async fn start(&self, options: SessionOptions) -> OverlayResult<DirectSession> {
        if options.auth_key.is_empty() {
            return Err(OverlayError::Start("auth key is empty".to_string()));
        }

        tokio::fs::create_dir_all(&options.state_dir)
            .await
            .map_err(|e| {
                OverlayError::Start(format!(
                    "failed to create state directory {}: {}",
                    options.state_dir.display(),
                    e
                ))
            })?;

        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            hostname: options.hostname,
            control_url: options.control_url,
            bind_host: self.config.bind_host,
            fallback: RwLock::new(None),
            closed,
        });

        for forward in &self.config.forward_ports {
            let listener =
                match TcpListener::bind((self.config.bind_host, forward.listen_port)).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        // Stop the forward loops spawned so far
                        shared.closed.send_replace(true);
                        return Err(OverlayError::Listen {
                            port: forward.listen_port,
                            reason: e.to_string(),
                        });
                    }
                };
            let overlay_addr = SocketAddr::new(self.config.bind_host, forward.overlay_port);
            tokio::spawn(forward_loop(shared.clone(), listener, overlay_addr));
        }

        tracing::info!(
            hostname = %shared.hostname,
            control_url = %shared.control_url,
            ephemeral = options.ephemeral,
            bind_host = %self.config.bind_host,
            forward_ports = ?self.config.forward_ports,
            "Direct overlay session started"
        );

        Ok(DirectSession { shared })
    }
}

/// Source of forwarded connections
#[async_trait]
trait ForwardAccept: Send + Sync + 'static {
    async fn accept_stream(&self) -> std::io::Result<(OverlayStream, SocketAddr)>;
    fn local_addr(&self) -> std::io::Result<SocketAddr>;
}

#[async_trait]
impl ForwardAccept for TcpListener {
    async fn accept_stream(&self) -> std::io::Result<(OverlayStream, SocketAddr)> {
        let (stream, peer_addr) = self.accept().await?;
        Ok((Box::new(stream), peer_addr))
    }

    fn local_addr(&self) -> std::io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

async fn forward_loop<A: ForwardAccept>(
    shared: Arc<Shared>,
    listener: A,
    overlay_addr: SocketAddr,
) {
    let local_addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!(error = %e, "Failed to read forward listener address");
            return;
        }
    };
    let mut closed = shared.closed.subscribe();

    loop {
        tokio::select! {
            result = listener.accept_stream() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        shared.dispatch(stream, peer_addr, overlay_addr);
                    }
                    Err(e) => {
                        tracing::warn!(
                            local_addr = %local_addr,
                            error = %e,
                            "Forward listener accept error"
                        );
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
            _ = async { let _ = closed.wait_for(|closed| *closed).await; } => {
                break;
            }
        }
    }

    tracing::debug!(local_addr = %local_addr, "Forward listener stopped");
}

/// Session of the direct backend
#[derive(Clone)]
pub struct DirectSession {
    shared: Arc<Shared>,
}

impl fmt::Debug for DirectSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectSession")
            .field("hostname", &self.shared.hostname)
            .field("bind_host", &self.shared.bind_host)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

#[async_trait]
impl OverlaySession for DirectSession {
    type Listener = DirectListener;
    type LocalClient = DirectLocalClient;

    fn hostname(&self) -> &str {
        &self.shared.hostname
    }

    async fn listen(&self, port: u16) -> OverlayResult<DirectListener> {
        if self.shared.is_closed() {
            return Err(OverlayError::Closed);
        }

        let listener = TcpListener::bind((self.shared.bind_host, port))
            .await
            .map_err(|e| OverlayError::Listen {
                port,
                reason: e.to_string(),
            })?;
        let port = listener.local_addr()?.port();

        Ok(DirectListener {
            listener,
            port,
            closed: self.shared.closed.subscribe(),
        })
    }

    fn register_fallback_tcp_handler(&self, handler: Arc<dyn FallbackTcpHandler>) {
        *self
            .shared
            .fallback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn local_client(&self) -> OverlayResult<DirectLocalClient> {
        if self.shared.is_closed() {
            return Err(OverlayError::LocalClient("session closed".to_string()));
        }
        Ok(DirectLocalClient {
            shared: self.shared.clone(),
        })
    }

    async fn close(&self) -> OverlayResult<()> {
        if self.shared.closed.send_replace(true) {
            return Err(OverlayError::Closed);
        }

        tracing::info!(hostname = %self.shared.hostname, "Direct overlay session closed");
        Ok(())
    }
}

/// Explicit listener of a [`DirectSession`]
#[derive(Debug)]
pub struct DirectListener {
    listener: TcpListener,
    port: u16,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl OverlayListener for DirectListener {
    async fn accept(&self) -> OverlayResult<(OverlayStream, SocketAddr)> {
        let mut closed = self.closed.clone();
        if *closed.borrow() {
            return Err(OverlayError::Closed);
        }

        tokio::select! {
            result = self.listener.accept() => {
                let (stream, peer_addr) = result?;
                Ok((Box::new(stream) as OverlayStream, peer_addr))
            }
            _ = closed.wait_for(|closed| *closed) => Err(OverlayError::Closed),
        }
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

/// Health-check client of a [`DirectSession`]
pub struct DirectLocalClient {
    shared: Arc<Shared>,
}

#[async_trait]
impl LocalClient for DirectLocalClient {
    async fn status(&self) -> OverlayResult<Status> {
        if self.shared.is_closed() {
            return Ok(Status::detached("Stopped"));
        }

        Ok(Status::joined(
            NetworkInfo {
                name: self.shared.control_url.clone(),
                magic_dns_suffix: String::new(),
            },
            vec![self.shared.bind_host],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn options(state_dir: PathBuf) -> SessionOptions {
        SessionOptions {
            hostname: "direct-test".to_string(),
            control_url: "https://control.example.com".to_string(),
            ephemeral: true,
            state_dir,
            auth_key: "key-1".to_string(),
        }
    }

    fn temp_state_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("overlink-direct-{}-{}", name, std::process::id()))
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    struct ForwardTo(mpsc::UnboundedSender<(SocketAddr, SocketAddr)>);

    impl FallbackTcpHandler for ForwardTo {
        fn route(&self, src: SocketAddr, dst: SocketAddr) -> Routing {
            let _ = self.0.send((src, dst));
            Routing::Intercept(Box::new(|mut stream: OverlayStream| {
                async move {
                    let _ = stream.write_all(b"hello").await;
                }
                .boxed()
            }))
        }
    }

    #[tokio::test]
    async fn test_rejects_empty_auth_key() {
        let network = DirectNetwork::default();
        let mut opts = options(temp_state_dir("empty-key"));
        opts.auth_key.clear();

        let result = network.start(opts).await;
        assert!(matches!(result, Err(OverlayError::Start(_))));
    }

    #[tokio::test]
    async fn test_status_and_close() {
        let network = DirectNetwork::default();
        let session = network.start(options(temp_state_dir("status"))).await.unwrap();

        assert_eq!(session.hostname(), "direct-test");
        let status = session.local_client().unwrap().status().await.unwrap();
        assert!(status.is_member());

        let client = session.local_client().unwrap();
        session.close().await.unwrap();

        // A client obtained before close reports no membership
        assert!(!client.status().await.unwrap().is_member());
        assert!(session.local_client().is_err());
        assert!(matches!(session.close().await, Err(OverlayError::Closed)));
    }

    #[tokio::test]
    async fn test_explicit_listener_accepts_and_stops_on_close() {
        let network = DirectNetwork::default();
        let session = network.start(options(temp_state_dir("listen"))).await.unwrap();
        let listener = session.listen(0).await.unwrap();
        let port = listener.local_port();
        assert_ne!(port, 0);

        let client = tokio::spawn(async move { TcpStream::connect(("127.0.0.1", port)).await });
        let (_stream, peer) = listener.accept().await.unwrap();
        assert!(peer.ip().is_loopback());
        client.await.unwrap().unwrap();

        session.close().await.unwrap();
        assert!(matches!(listener.accept().await, Err(OverlayError::Closed)));
        assert!(matches!(session.listen(0).await, Err(OverlayError::Closed)));
    }

    #[test]
    fn test_port_forward_parse() {
        assert_eq!(
            "8443:443".parse::<PortForward>().unwrap(),
            PortForward {
                listen_port: 8443,
                overlay_port: 443
            }
        );
        assert!("443".parse::<PortForward>().is_err());
        assert!("x:443".parse::<PortForward>().is_err());
        assert!("8443:70000".parse::<PortForward>().is_err());
    }

    #[tokio::test]
    async fn test_forward_port_dispatches_to_fallback() {
        let port = free_port().await;
        let network = DirectNetwork::new(DirectConfig {
            forward_ports: vec![PortForward {
                listen_port: port,
                overlay_port: 5432,
            }],
            ..Default::default()
        });
        let session = network.start(options(temp_state_dir("forward"))).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.register_fallback_tcp_handler(Arc::new(ForwardTo(tx)));

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        let (src, dst) = rx.recv().await.unwrap();
        assert!(src.ip().is_loopback());
        assert_eq!(dst.port(), 5432);

        session.close().await.unwrap();
    }

    struct FailingAccept {
        attempts: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ForwardAccept for FailingAccept {
        async fn accept_stream(&self) -> io::Result<(OverlayStream, SocketAddr)> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::Other, "too many open files"))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 15432)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_forward_accept_errors_back_off() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            hostname: "direct-test".to_string(),
            control_url: "https://control.example.com".to_string(),
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            fallback: RwLock::new(None),
            closed,
        });

        let task = tokio::spawn(forward_loop(
            shared.clone(),
            FailingAccept {
                attempts: attempts.clone(),
            },
            SocketAddr::from(([127, 0, 0, 1], 5432)),
        ));

        tokio::time::sleep(Duration::from_secs(1)).await;
        let count = attempts.load(Ordering::SeqCst);
        assert!((5..=11).contains(&count), "accept attempts: {}", count);

        shared.closed.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
