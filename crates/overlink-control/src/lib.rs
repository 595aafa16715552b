//! Control-plane access for the overlink agent
//!
//! The agent needs exactly one thing from the control plane: a short-lived,
//! single-use key that lets a new overlay session join the network. This
//! crate provides:
//!
//! - [`ControlPlaneClient`]: the HTTP call issuing that key
//! - [`NetworkKey`]: the credential itself, consumed on use
//! - [`CredentialProvisioner`]: retries the call until it succeeds
//!
//! # Example Usage
//!
//! ```no_run
//! use overlink_control::{ControlPlaneClient, ControlPlaneConfig, CredentialProvisioner};
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
//!     // Blocks until the control plane hands out a key
//!     let key = CredentialProvisioner::new(client).obtain().await;
//!     println!("got key ({} bytes)", key.expose().len());
//!     Ok(())
//! }
//! ```

mod client;
mod credential;
mod provisioner;

pub use client::{ControlPlaneClient, ControlPlaneConfig, NETWORK_KEY_PATH};
pub use credential::{ControlError, CredentialSource, NetworkKey};
pub use provisioner::{CredentialProvisioner, DEFAULT_RETRY_INTERVAL};
