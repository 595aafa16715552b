use crate::connection::RelayTracker;
use crate::factory::{OverlaySessionFactory, SessionSettings};
use crate::liveness::DEFAULT_LIVENESS_PORT;
use crate::relay::RelayHandler;
use crate::supervisor::{Supervisor, SupervisorConfig, SupervisorHandle, DEFAULT_HEALTH_INTERVAL};
use overlink_control::{CredentialProvisioner, CredentialSource, DEFAULT_RETRY_INTERVAL};
use overlink_overlay::{OverlayError, OverlayNetwork};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Failed to start overlay session: {0}")]
    SessionStart(OverlayError),

    #[error("Failed to open liveness listener: {0}")]
    Liveness(OverlayError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for the agent
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Node name announced to the overlay network
    pub hostname: String,

    /// Control server coordinating the overlay
    pub control_url: String,

    /// Directory for the overlay client's local state
    pub state_dir: PathBuf,

    /// Overlay port of the liveness endpoint
    pub liveness_port: u16,

    /// Delay between health checks of the current session
    pub health_interval: Duration,

    /// Delay between failed attempts to obtain a network key
    pub credential_retry: Duration,

    /// Host relayed connections are dialed on
    pub relay_target_host: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            control_url: String::new(),
            state_dir: PathBuf::from("overlay"),
            liveness_port: DEFAULT_LIVENESS_PORT,
            health_interval: DEFAULT_HEALTH_INTERVAL,
            credential_retry: DEFAULT_RETRY_INTERVAL,
            relay_target_host: crate::relay::DEFAULT_TARGET_HOST.to_string(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.hostname.trim().is_empty() {
            return Err(AgentError::InvalidConfig("hostname is empty".to_string()));
        }
        if self.control_url.trim().is_empty() {
            return Err(AgentError::InvalidConfig("control_url is empty".to_string()));
        }
        if self.health_interval.is_zero() {
            return Err(AgentError::InvalidConfig(
                "health_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            hostname: self.hostname.clone(),
            control_url: self.control_url.clone(),
            state_dir: self.state_dir.clone(),
            liveness_port: self.liveness_port,
        }
    }
}

/// The overlink agent: keeps this node joined to the overlay and relays
/// inbound overlay connections to local services
pub struct Agent<N, S> {
    config: AgentConfig,
    network: N,
    source: S,
    relays: RelayTracker,
}

impl<N, S> Agent<N, S>
where
    N: OverlayNetwork + 'static,
    S: CredentialSource + 'static,
{
    /// Create a new agent
    ///
    /// # Arguments
    /// * `config` - Agent configuration
    /// * `network` - Overlay client sessions are started with
    /// * `source` - Issuer of network keys
    pub fn new(config: AgentConfig, network: N, source: S) -> Result<Self, AgentError> {
        config.validate()?;
        Ok(Self {
            config,
            network,
            source,
            relays: RelayTracker::new(),
        })
    }

    /// Tracker of relays served by this agent, shared across sessions
    pub fn relays(&self) -> RelayTracker {
        self.relays.clone()
    }

    /// Bring the first session up and start supervising it
    pub async fn start(self) -> Result<SupervisorHandle<N::Session>, AgentError> {
        tracing::info!(
            hostname = %self.config.hostname,
            control_url = %self.config.control_url,
            state_dir = %self.config.state_dir.display(),
            "Starting agent"
        );

        let provisioner = CredentialProvisioner::new(self.source)
            .with_retry_interval(self.config.credential_retry);
        let relay =
            RelayHandler::with_target_host(self.config.relay_target_host.clone(), self.relays);
        let factory = OverlaySessionFactory::new(
            self.network,
            provisioner,
            self.config.session_settings(),
            relay,
        );

        Supervisor::start(
            factory,
            SupervisorConfig {
                health_interval: self.config.health_interval,
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentConfig {
        AgentConfig {
            hostname: "node-a".to_string(),
            control_url: "https://control.example.com".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.liveness_port, 80);
        assert_eq!(config.health_interval, Duration::from_secs(5));
        assert_eq!(config.credential_retry, Duration::from_secs(5));
        assert_eq!(config.relay_target_host, "localhost");
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());

        let mut bad = config();
        bad.hostname = " ".to_string();
        assert!(matches!(bad.validate(), Err(AgentError::InvalidConfig(_))));

        let mut bad = config();
        bad.control_url = String::new();
        assert!(matches!(bad.validate(), Err(AgentError::InvalidConfig(_))));

        let mut bad = config();
        bad.health_interval = Duration::ZERO;
        assert!(matches!(bad.validate(), Err(AgentError::InvalidConfig(_))));
    }
}
