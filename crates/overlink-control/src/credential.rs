use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

/// Control-plane errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Control plane API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Single-use key authorizing one overlay session to join the network
///
/// Not `Clone`: handing the key to a session consumes it.
pub struct NetworkKey(String);

impl NetworkKey {
    /// Wrap a key returned by the control plane
    pub fn new(key: impl Into<String>) -> Result<Self, ControlError> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(ControlError::InvalidResponse(
                "network key is empty".to_string(),
            ));
        }
        Ok(Self(key))
    }

    /// Borrow the raw key
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Consume the key, yielding the raw string
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for NetworkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NetworkKey(<redacted>)")
    }
}

/// Anything able to issue network keys
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Make one attempt at obtaining a fresh network key
    async fn generate_network_key(&self) -> Result<NetworkKey, ControlError>;
}
