//! Control-plane REST client
//!
//! Only the network-key issuance endpoint is implemented.

use crate::credential::{ControlError, CredentialSource, NetworkKey};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use serde::Deserialize;
use std::time::Duration;

/// Path of the key issuance endpoint, relative to the API URL
pub const NETWORK_KEY_PATH: &str = "/server/network-key";

const CLIENT_ID_HEADER: &str = "x-client-id";
const TELEMETRY_HEADER: &str = "x-telemetry-enabled";

/// Configuration for reaching the control-plane API
#[derive(Debug, Clone)]
pub struct ControlPlaneConfig {
    /// Base URL of the API (e.g., "https://api.example.com")
    pub api_url: String,

    /// API key presented as a bearer token
    pub api_key: String,

    /// Identifier of this agent, sent with every request
    pub client_id: String,

    /// Whether the agent reports telemetry
    pub telemetry_enabled: bool,

    /// Per-request timeout; `None` waits indefinitely
    pub request_timeout: Option<Duration>,
}

#[derive(Debug, Deserialize)]
struct NetworkKeyResponse {
    key: String,
}

/// HTTP client for the control-plane API
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    http: reqwest::Client,
    api_url: String,
}

impl ControlPlaneClient {
    /// Create a new control-plane client
    pub fn new(config: &ControlPlaneConfig) -> Result<Self, ControlError> {
        if config.api_url.trim().is_empty() {
            return Err(ControlError::Config("api_url is empty".to_string()));
        }
        if config.api_key.is_empty() {
            return Err(ControlError::Config("api_key is empty".to_string()));
        }

        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|_| ControlError::Config("Invalid API key format".to_string()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        headers.insert(
            HeaderName::from_static(CLIENT_ID_HEADER),
            HeaderValue::from_str(&config.client_id)
                .map_err(|_| ControlError::Config("Invalid client id format".to_string()))?,
        );
        headers.insert(
            HeaderName::from_static(TELEMETRY_HEADER),
            HeaderValue::from_static(if config.telemetry_enabled {
                "true"
            } else {
                "false"
            }),
        );

        let mut builder = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("overlink/", env!("CARGO_PKG_VERSION")));
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build()?;

        let api_url = config.api_url.trim_end_matches('/').to_string();
        Ok(Self { http, api_url })
    }

    /// Build the full URL for an API path
    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ControlError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            status.canonical_reason().unwrap_or("Unknown").to_string()
        } else {
            body.trim().to_string()
        };
        Err(ControlError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl CredentialSource for ControlPlaneClient {
    async fn generate_network_key(&self) -> Result<NetworkKey, ControlError> {
        let resp = self
            .http
            .post(self.api_url(NETWORK_KEY_PATH))
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;

        let body: NetworkKeyResponse = resp
            .json()
            .await
            .map_err(|e| ControlError::InvalidResponse(e.to_string()))?;

        NetworkKey::new(body.key)
    }
}
