//! In-memory overlay backend for tests
//!
//! Sessions are recorded in creation order so tests can inspect which
//! credential each one received and whether it was closed. Health outcomes
//! are scripted through a queue shared by all sessions; once the queue is
//! empty every health check reports membership.

use crate::{
    FallbackTcpHandler, LocalClient, NetworkInfo, OverlayError, OverlayListener, OverlayNetwork,
    OverlayResult, OverlaySession, OverlayStream, Routing, SessionOptions, Status,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

const DUPLEX_BUFFER: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted result of one health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    /// Status reports an active membership
    Member,
    /// Status succeeds but carries no membership
    NotMember,
    /// Obtaining the local client fails
    LocalClientError,
    /// The status call fails
    StatusError,
}

#[derive(Default)]
struct NetworkState {
    sessions: Mutex<Vec<MockSession>>,
    health: Mutex<VecDeque<HealthOutcome>>,
    start_failures: AtomicUsize,
    fail_listen: AtomicBool,
    health_checks: AtomicUsize,
}

/// Overlay network that keeps everything in memory
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<NetworkState>,
}

impl fmt::Debug for MockNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockNetwork")
            .field("sessions", &lock(&self.state.sessions).len())
            .finish()
    }
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue health outcomes, consumed one per health check
    pub fn script_health(&self, outcomes: impl IntoIterator<Item = HealthOutcome>) {
        lock(&self.state.health).extend(outcomes);
    }

    /// Make the next `count` calls to `start` fail
    pub fn fail_next_starts(&self, count: usize) {
        self.state.start_failures.store(count, Ordering::SeqCst);
    }

    /// Make `listen` fail on every session
    pub fn fail_listen(&self, fail: bool) {
        self.state.fail_listen.store(fail, Ordering::SeqCst);
    }

    /// All sessions started so far, oldest first
    pub fn sessions(&self) -> Vec<MockSession> {
        lock(&self.state.sessions).clone()
    }

    /// Number of sessions started so far
    pub fn session_count(&self) -> usize {
        lock(&self.state.sessions).len()
    }

    /// Sessions that have not been closed
    pub fn open_sessions(&self) -> usize {
        lock(&self.state.sessions)
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }

    /// Number of status queries answered
    pub fn health_checks(&self) -> usize {
        self.state.health_checks.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> HealthOutcome {
        lock(&self.state.health)
            .pop_front()
            .unwrap_or(HealthOutcome::Member)
    }

    fn peek_outcome(&self) -> Option<HealthOutcome> {
        lock(&self.state.health).front().copied()
    }
}

#[async_trait]
impl OverlayNetwork for MockNetwork {
    type Session = MockSession;

    async fn start(&self, options: SessionOptions) -> OverlayResult<MockSession> {
        let failures = self.state.start_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.state
                .start_failures
                .store(failures - 1, Ordering::SeqCst);
            return Err(OverlayError::Start("mock start failure".to_string()));
        }

        let mut sessions = lock(&self.state.sessions);
        let session = MockSession {
            inner: Arc::new(SessionInner {
                id: sessions.len() + 1,
                options,
                network: self.clone(),
                closed: AtomicBool::new(false),
                fallback: Mutex::new(None),
                listeners: Mutex::new(HashMap::new()),
            }),
        };
        sessions.push(session.clone());
        Ok(session)
    }
}

struct SessionInner {
    id: usize,
    options: SessionOptions,
    network: MockNetwork,
    closed: AtomicBool,
    fallback: Mutex<Option<Arc<dyn FallbackTcpHandler>>>,
    listeners: Mutex<HashMap<u16, mpsc::UnboundedSender<(OverlayStream, SocketAddr)>>>,
}

/// Session handle of a [`MockNetwork`]; clones share state
#[derive(Clone)]
pub struct MockSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for MockSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockSession")
            .field("id", &self.inner.id)
            .field("hostname", &self.inner.options.hostname)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl MockSession {
    /// 1-based creation index
    pub fn id(&self) -> usize {
        self.inner.id
    }

    /// Options the session was started with
    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn has_fallback_handler(&self) -> bool {
        lock(&self.inner.fallback).is_some()
    }

    pub fn is_listening(&self, port: u16) -> bool {
        lock(&self.inner.listeners).contains_key(&port)
    }

    /// Simulate an inbound overlay connection from `src` to `dst`
    ///
    /// Explicit listeners take precedence; otherwise the fallback handler is
    /// consulted. Returns the peer side of the connection, or `None` when
    /// nothing accepted it.
    pub fn dial(&self, src: SocketAddr, dst: SocketAddr) -> Option<DuplexStream> {
        if self.is_closed() {
            return None;
        }

        let (peer, local) = tokio::io::duplex(DUPLEX_BUFFER);

        if let Some(tx) = lock(&self.inner.listeners).get(&dst.port()) {
            return tx.send((Box::new(local), src)).ok().map(|_| peer);
        }

        let handler = lock(&self.inner.fallback).clone()?;
        match handler.route(src, dst) {
            Routing::Intercept(handle) => {
                tokio::spawn(handle(Box::new(local)));
                Some(peer)
            }
            Routing::Pass => None,
        }
    }
}

#[async_trait]
impl OverlaySession for MockSession {
    type Listener = MockListener;
    type LocalClient = MockLocalClient;

    fn hostname(&self) -> &str {
        &self.inner.options.hostname
    }

    async fn listen(&self, port: u16) -> OverlayResult<MockListener> {
        if self.is_closed() {
            return Err(OverlayError::Closed);
        }
        if self.inner.network.state.fail_listen.load(Ordering::SeqCst) {
            return Err(OverlayError::Listen {
                port,
                reason: "mock listen failure".to_string(),
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner.listeners).insert(port, tx);
        Ok(MockListener {
            port,
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    fn register_fallback_tcp_handler(&self, handler: Arc<dyn FallbackTcpHandler>) {
        *lock(&self.inner.fallback) = Some(handler);
    }

    fn local_client(&self) -> OverlayResult<MockLocalClient> {
        if self.inner.network.peek_outcome() == Some(HealthOutcome::LocalClientError) {
            self.inner.network.next_outcome();
            return Err(OverlayError::LocalClient("mock local client failure".to_string()));
        }
        Ok(MockLocalClient {
            session: self.clone(),
        })
    }

    async fn close(&self) -> OverlayResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(OverlayError::Closed);
        }
        // Dropping the senders ends every pending accept
        lock(&self.inner.listeners).clear();
        Ok(())
    }
}

/// Explicit listener of a [`MockSession`]
pub struct MockListener {
    port: u16,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(OverlayStream, SocketAddr)>>,
}

impl fmt::Debug for MockListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockListener").field("port", &self.port).finish()
    }
}

#[async_trait]
impl OverlayListener for MockListener {
    async fn accept(&self) -> OverlayResult<(OverlayStream, SocketAddr)> {
        self.rx.lock().await.recv().await.ok_or(OverlayError::Closed)
    }

    fn local_port(&self) -> u16 {
        self.port
    }
}

/// Health-check client of a [`MockSession`]
pub struct MockLocalClient {
    session: MockSession,
}

#[async_trait]
impl LocalClient for MockLocalClient {
    async fn status(&self) -> OverlayResult<Status> {
        let network = &self.session.inner.network;
        network.state.health_checks.fetch_add(1, Ordering::SeqCst);

        if self.session.is_closed() {
            return Ok(Status::detached("Stopped"));
        }

        match network.next_outcome() {
            HealthOutcome::Member => Ok(Status::joined(
                NetworkInfo {
                    name: "mock.net".to_string(),
                    magic_dns_suffix: "mock.ts.net".to_string(),
                },
                Vec::new(),
            )),
            HealthOutcome::NotMember => Ok(Status::detached("NeedsLogin")),
            HealthOutcome::StatusError | HealthOutcome::LocalClientError => {
                Err(OverlayError::Status("mock status failure".to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn options(key: &str) -> SessionOptions {
        SessionOptions {
            hostname: "mock-node".to_string(),
            control_url: "https://control.example.com".to_string(),
            ephemeral: true,
            state_dir: PathBuf::from("/nonexistent"),
            auth_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn test_scripted_health() {
        let network = MockNetwork::new();
        network.script_health([
            HealthOutcome::NotMember,
            HealthOutcome::LocalClientError,
            HealthOutcome::StatusError,
        ]);
        let session = network.start(options("k1")).await.unwrap();

        let client = session.local_client().unwrap();
        assert!(!client.status().await.unwrap().is_member());
        assert!(session.local_client().is_err());
        assert!(client.status().await.is_err());
        assert!(client.status().await.unwrap().is_member());
        assert_eq!(network.health_checks(), 3);
    }

    #[tokio::test]
    async fn test_sessions_recorded_and_closed() {
        let network = MockNetwork::new();
        network.fail_next_starts(1);
        assert!(network.start(options("k0")).await.is_err());

        let first = network.start(options("k1")).await.unwrap();
        let second = network.start(options("k2")).await.unwrap();
        assert_eq!(network.session_count(), 2);
        assert_eq!(first.id(), 1);
        assert_eq!(second.options().auth_key, "k2");

        first.close().await.unwrap();
        assert!(first.close().await.is_err());
        assert_eq!(network.open_sessions(), 1);
    }

    #[tokio::test]
    async fn test_dial_explicit_listener() {
        let network = MockNetwork::new();
        let session = network.start(options("k1")).await.unwrap();
        let listener = session.listen(80).await.unwrap();

        let src: SocketAddr = "100.64.0.2:40000".parse().unwrap();
        let dst: SocketAddr = "100.64.0.1:80".parse().unwrap();
        let mut peer = session.dial(src, dst).unwrap();

        let (mut stream, from) = listener.accept().await.unwrap();
        assert_eq!(from, src);

        peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        session.close().await.unwrap();
        assert!(matches!(listener.accept().await, Err(OverlayError::Closed)));
    }

    #[tokio::test]
    async fn test_dial_without_handler_is_refused() {
        let network = MockNetwork::new();
        let session = network.start(options("k1")).await.unwrap();
        let src: SocketAddr = "100.64.0.2:40000".parse().unwrap();
        let dst: SocketAddr = "100.64.0.1:8080".parse().unwrap();
        assert!(session.dial(src, dst).is_none());
    }
}
