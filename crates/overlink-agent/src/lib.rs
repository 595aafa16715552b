//! Overlink agent
//!
//! Keeps this node joined to an overlay network and exposes local services
//! through it:
//!
//! - a [`Supervisor`] owns the current overlay session, health-checks it and
//!   rebuilds it with a fresh credential when membership is lost
//! - every inbound overlay connection that no explicit listener claims is
//!   relayed to `localhost:<destination port>` by [`RelayHandler`]
//! - a liveness endpoint answers `Ok` on overlay port 80
//!
//! # Example Usage
//!
//! ```no_run
//! use overlink_agent::{Agent, AgentConfig};
//! use overlink_control::{ControlPlaneClient, ControlPlaneConfig};
//! use overlink_overlay::{DirectConfig, DirectNetwork};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = ControlPlaneClient::new(&ControlPlaneConfig {
//!         api_url: "https://api.example.com".to_string(),
//!         api_key: "agent-api-key".to_string(),
//!         client_id: "agent-1".to_string(),
//!         telemetry_enabled: false,
//!         request_timeout: None,
//!     })?;
//!
//!     let config = AgentConfig {
//!         hostname: "node-a".to_string(),
//!         control_url: "https://control.example.com".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let agent = Agent::new(config, DirectNetwork::new(DirectConfig::default()), client)?;
//!     let mut handle = agent.start().await?;
//!     handle.wait().await?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod connection;
pub mod factory;
pub mod liveness;
pub mod relay;
pub mod supervisor;

pub use agent::{Agent, AgentConfig, AgentError};
pub use connection::{RelayInfo, RelayTracker};
pub use factory::{OverlaySessionFactory, SessionFactory, SessionSettings};
pub use liveness::{DEFAULT_LIVENESS_PORT, LIVENESS_BODY};
pub use relay::{pipe, relay, RelayError, RelayHandler, RelayStats};
pub use supervisor::{
    ConnectionState, CurrentSession, Supervisor, SupervisorConfig, SupervisorHandle,
    DEFAULT_HEALTH_INTERVAL,
};
