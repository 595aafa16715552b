//! Session factory: turns a fresh credential into a fully wired session

use crate::agent::AgentError;
use crate::liveness;
use crate::relay::RelayHandler;
use async_trait::async_trait;
use overlink_control::{CredentialProvisioner, CredentialSource};
use overlink_overlay::{OverlayNetwork, OverlaySession, SessionOptions};
use std::path::PathBuf;
use std::sync::Arc;

/// Builds ready-to-use overlay sessions
#[async_trait]
pub trait SessionFactory: Send + Sync + 'static {
    type Session: OverlaySession;

    /// Build a new session with a fresh credential
    ///
    /// Blocks for as long as the control plane refuses to issue a key.
    async fn build(&self) -> Result<Arc<Self::Session>, AgentError>;
}

/// Fixed inputs of every session the factory builds
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub hostname: String,
    pub control_url: String,
    pub state_dir: PathBuf,
    pub liveness_port: u16,
}

/// [`SessionFactory`] over an overlay client and a credential source
pub struct OverlaySessionFactory<N, S> {
    network: N,
    provisioner: CredentialProvisioner<S>,
    settings: SessionSettings,
    relay: Arc<RelayHandler>,
}

impl<N, S> OverlaySessionFactory<N, S>
where
    N: OverlayNetwork,
    S: CredentialSource,
{
    pub fn new(
        network: N,
        provisioner: CredentialProvisioner<S>,
        settings: SessionSettings,
        relay: RelayHandler,
    ) -> Self {
        Self {
            network,
            provisioner,
            settings,
            relay: Arc::new(relay),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }
}

#[async_trait]
impl<N, S> SessionFactory for OverlaySessionFactory<N, S>
where
    N: OverlayNetwork + 'static,
    S: CredentialSource + 'static,
{
    type Session = N::Session;

    async fn build(&self) -> Result<Arc<N::Session>, AgentError> {
        let key = self.provisioner.obtain().await;

        let options = SessionOptions {
            hostname: self.settings.hostname.clone(),
            control_url: self.settings.control_url.clone(),
            ephemeral: true,
            state_dir: self.settings.state_dir.clone(),
            auth_key: key.into_inner(),
        };

        let session = self
            .network
            .start(options)
            .await
            .map_err(AgentError::SessionStart)?;

        session.register_fallback_tcp_handler(self.relay.clone());

        let listener = match session.listen(self.settings.liveness_port).await {
            Ok(listener) => listener,
            Err(e) => {
                if let Err(close_err) = session.close().await {
                    tracing::warn!(error = %close_err, "Failed to close half-built session");
                }
                return Err(AgentError::Liveness(e));
            }
        };

        tokio::spawn(async move {
            if let Err(e) = liveness::serve(listener).await {
                tracing::trace!(error = %e, "Liveness endpoint stopped");
            }
        });

        tracing::info!(
            hostname = %session.hostname(),
            liveness_port = self.settings.liveness_port,
            "Overlay session established"
        );

        Ok(Arc::new(session))
    }
}
