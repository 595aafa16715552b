//! Connection supervision
//!
//! A single supervisor task owns the current session. It polls the session's
//! health on a fixed interval and, whenever the node lost its network
//! membership (or the health probe itself fails), closes the session and
//! builds a replacement with a fresh credential.
//!
//! Other tasks observe the current session through a [`watch`] slot: they
//! never hold a session the supervisor has already withdrawn.

use crate::agent::AgentError;
use crate::factory::SessionFactory;
use overlink_overlay::{LocalClient, OverlayError, OverlaySession, Status};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Default delay between health checks
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Connection state observed from outside the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session has been built yet
    Disconnected,
    /// A session is being built
    Connecting,
    /// The current session passed its last health check (or was just built)
    Connected,
    /// The last health check failed or the last rebuild failed
    Unhealthy,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Unhealthy => "unhealthy",
        };
        f.write_str(name)
    }
}

/// Supervisor tuning
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub health_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_interval: DEFAULT_HEALTH_INTERVAL,
        }
    }
}

/// The session currently in service, tagged with its generation
pub struct CurrentSession<S> {
    /// 1 for the first session, incremented on every successful rebuild
    pub generation: u64,
    pub session: Arc<S>,
}

impl<S> Clone for CurrentSession<S> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            session: self.session.clone(),
        }
    }
}

#[derive(Debug, Error)]
enum HealthError {
    #[error("no active session")]
    NoSession,

    #[error("failed to get local client: {0}")]
    LocalClient(OverlayError),

    #[error("failed to get local client status: {0}")]
    Status(OverlayError),

    #[error("node is not a network member (backend state {0})")]
    NotMember(String),
}

/// Owns the current session and replaces it when it goes unhealthy
pub struct Supervisor<F: SessionFactory> {
    factory: F,
    config: SupervisorConfig,
    current: Option<Arc<F::Session>>,
    generation: Arc<AtomicU64>,
    state_tx: watch::Sender<ConnectionState>,
    session_tx: watch::Sender<Option<CurrentSession<F::Session>>>,
    reconnect_rx: mpsc::Receiver<()>,
}

impl<F: SessionFactory> Supervisor<F> {
    /// Build the first session and start supervising it
    ///
    /// Fails if the first session cannot be built; later build failures are
    /// retried on the next health tick instead.
    pub async fn start(
        factory: F,
        config: SupervisorConfig,
    ) -> Result<SupervisorHandle<F::Session>, AgentError> {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (session_tx, session_rx) = watch::channel(None);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let generation = Arc::new(AtomicU64::new(0));

        state_tx.send_replace(ConnectionState::Connecting);
        let session = match factory.build().await {
            Ok(session) => session,
            Err(e) => {
                state_tx.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let mut supervisor = Supervisor {
            factory,
            config,
            current: None,
            generation: generation.clone(),
            state_tx,
            session_tx,
            reconnect_rx,
        };
        supervisor.install(session);

        tracing::info!(
            health_interval_secs = supervisor.config.health_interval.as_secs_f64(),
            "Supervising overlay session"
        );

        let task = tokio::spawn(supervisor.run());

        Ok(SupervisorHandle {
            state_rx,
            session_rx,
            generation,
            reconnect_tx,
            task,
        })
    }

    async fn run(mut self) {
        let period = self.config.health_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.check_health().await {
                        Ok(status) => {
                            tracing::trace!(
                                backend_state = %status.backend_state,
                                generation = self.generation(),
                                "Health check passed"
                            );
                            self.state_tx.send_replace(ConnectionState::Connected);
                        }
                        Err(e) => {
                            tracing::error!(
                                error = %e,
                                generation = self.generation(),
                                "Health check failed"
                            );
                            self.reconnect().await;
                            // A rebuilt session gets a full interval before its first check
                            ticker.reset();
                        }
                    }
                }
                Some(()) = self.reconnect_rx.recv() => {
                    tracing::info!(generation = self.generation(), "Reconnect requested");
                    self.reconnect().await;
                    ticker.reset();
                }
            }
        }
    }

    async fn check_health(&self) -> Result<Status, HealthError> {
        let session = self.current.as_ref().ok_or(HealthError::NoSession)?;
        let client = session.local_client().map_err(HealthError::LocalClient)?;
        let status = client.status().await.map_err(HealthError::Status)?;

        if !status.is_member() {
            return Err(HealthError::NotMember(status.backend_state));
        }
        Ok(status)
    }

    async fn reconnect(&mut self) {
        self.state_tx.send_replace(ConnectionState::Unhealthy);

        if let Some(old) = self.current.take() {
            self.session_tx.send_replace(None);
            if let Err(e) = old.close().await {
                tracing::error!(error = %e, "Failed to close overlay session");
            }
        }

        self.state_tx.send_replace(ConnectionState::Connecting);
        match self.factory.build().await {
            Ok(session) => {
                self.install(session);
                tracing::info!(generation = self.generation(), "Reconnected to overlay network");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to rebuild overlay session");
                self.state_tx.send_replace(ConnectionState::Unhealthy);
            }
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn install(&mut self, session: Arc<F::Session>) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.current = Some(session.clone());
        self.session_tx.send_replace(Some(CurrentSession {
            generation,
            session,
        }));
        self.state_tx.send_replace(ConnectionState::Connected);
    }
}

/// Handle to a running [`Supervisor`]
pub struct SupervisorHandle<S> {
    state_rx: watch::Receiver<ConnectionState>,
    session_rx: watch::Receiver<Option<CurrentSession<S>>>,
    generation: Arc<AtomicU64>,
    reconnect_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl<S: OverlaySession> SupervisorHandle<S> {
    /// The session currently in service, if any
    pub fn current_session(&self) -> Option<Arc<S>> {
        self.session_rx
            .borrow()
            .as_ref()
            .map(|current| current.session.clone())
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Number of sessions built so far; survives a failed rebuild
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn subscribe_session(&self) -> watch::Receiver<Option<CurrentSession<S>>> {
        self.session_rx.clone()
    }

    /// Ask the supervisor to replace the current session
    ///
    /// Coalesces with a request that is already pending.
    pub fn request_reconnect(&self) {
        if self.reconnect_tx.try_send(()).is_err() {
            tracing::debug!("Reconnect already pending");
        }
    }

    /// Wait for the supervisor task; it only ends by panicking or abort
    pub async fn wait(&mut self) -> Result<(), tokio::task::JoinError> {
        (&mut self.task).await
    }

    /// Stop supervising and close the current session
    pub async fn shutdown(self) {
        self.task.abort();
        let _ = self.task.await;

        let current = self.session_rx.borrow().clone();
        if let Some(current) = current {
            if let Err(e) = current.session.close().await {
                tracing::warn!(error = %e, "Failed to close overlay session on shutdown");
            }
        }
    }
}
