//! Configuration file loading and CLI merge

use crate::Args;
use anyhow::{Context, Result};
use overlink_agent::AgentConfig;
use overlink_control::ControlPlaneConfig;
use overlink_overlay::{DirectConfig, PortForward};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Configuration file format
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    /// Node name on the overlay
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Overlay control server URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_url: Option<String>,

    /// Control-plane API
    pub api: ApiConfigFile,

    /// Overlay client state directory
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_interval_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_retry_secs: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub liveness_port: Option<u16>,

    /// Direct overlay backend
    pub direct: DirectConfigFile,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfigFile {
    /// API base URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Environment variable name holding the API key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_env: Option<String>,

    /// Direct API key (prefer using key_env)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub telemetry: Option<bool>,

    /// Request timeout; unset waits indefinitely
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_host: Option<IpAddr>,

    /// Entries in LISTEN:OVERLAY form
    pub forward_ports: Vec<String>,
}

/// Everything the binary needs to run the agent
#[derive(Debug)]
pub struct Settings {
    pub agent: AgentConfig,
    pub control: ControlPlaneConfig,
    pub direct: DirectConfig,
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConfigFile = serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Merge CLI args with config file, giving precedence to CLI args
pub fn build_settings(args: Args) -> Result<Settings> {
    let file = match &args.config {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            load_config_file(path)?
        }
        None => ConfigFile::default(),
    };

    let file_api_key = match (&file.api.key_env, file.api.key) {
        (Some(env_var), _) => Some(
            std::env::var(env_var)
                .with_context(|| format!("Environment variable {} not set", env_var))?,
        ),
        (None, key) => key,
    };

    let hostname = args
        .hostname
        .or(file.hostname)
        .unwrap_or_else(default_hostname);
    let control_url = args.control_url.or(file.control_url).ok_or_else(|| {
        anyhow::anyhow!("Control URL is required (use --control-url or config file)")
    })?;
    let api_url = args
        .api_url
        .or(file.api.url)
        .ok_or_else(|| anyhow::anyhow!("API URL is required (use --api-url or config file)"))?;
    let api_key = args.api_key.or(file_api_key).unwrap_or_default();
    let client_id = args
        .client_id
        .or(file.api.client_id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let state_dir = args
        .state_dir
        .or(file.state_dir)
        .unwrap_or_else(default_state_dir);

    if hostname.trim().is_empty() {
        anyhow::bail!("Hostname cannot be empty");
    }
    if api_key.is_empty() {
        anyhow::bail!("API key is required (use --api-key, environment variable, or config file)");
    }
    validate_url(&control_url, "control")?;
    validate_url(&api_url, "API")?;

    let health_interval = args
        .health_interval
        .or(file.health_interval_secs)
        .map(Duration::from_secs)
        .unwrap_or(overlink_agent::DEFAULT_HEALTH_INTERVAL);
    if health_interval.is_zero() {
        anyhow::bail!("Health interval must be at least 1 second");
    }
    let credential_retry = args
        .credential_retry
        .or(file.credential_retry_secs)
        .map(Duration::from_secs)
        .unwrap_or(overlink_control::DEFAULT_RETRY_INTERVAL);

    let forward_ports = if args.forward_ports.is_empty() {
        file.direct
            .forward_ports
            .iter()
            .map(|entry| {
                entry
                    .parse::<PortForward>()
                    .map_err(|e| anyhow::anyhow!("Invalid forward port '{}': {}", entry, e))
            })
            .collect::<Result<Vec<_>>>()?
    } else {
        args.forward_ports
    };

    let mut direct = DirectConfig {
        forward_ports,
        ..Default::default()
    };
    if let Some(bind_host) = args.bind_host.or(file.direct.bind_host) {
        direct.bind_host = bind_host;
    }

    let agent = AgentConfig {
        hostname,
        control_url,
        state_dir,
        liveness_port: args
            .liveness_port
            .or(file.liveness_port)
            .unwrap_or(overlink_agent::DEFAULT_LIVENESS_PORT),
        health_interval,
        credential_retry,
        ..Default::default()
    };

    let control = ControlPlaneConfig {
        api_url,
        api_key,
        client_id,
        telemetry_enabled: args.telemetry || file.api.telemetry.unwrap_or(false),
        request_timeout: args
            .api_timeout
            .or(file.api.timeout_secs)
            .map(Duration::from_secs),
    };

    Ok(Settings {
        agent,
        control,
        direct,
    })
}

fn default_hostname() -> String {
    let id = Uuid::new_v4().simple().to_string();
    let hostname = format!("overlink-{}", &id[..8]);
    info!("Auto-generated hostname: {}", hostname);
    hostname
}

fn default_state_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("overlink").join("overlay"))
        .unwrap_or_else(|| PathBuf::from(".overlink").join("overlay"))
}

/// Validate that a URL parses and uses http(s)
fn validate_url(value: &str, kind: &str) -> Result<()> {
    let url = url::Url::parse(value)
        .with_context(|| format!("Invalid {} URL: '{}'", kind, value))?;

    match url.scheme() {
        "http" | "https" => {}
        scheme => anyhow::bail!(
            "Invalid {} URL: '{}' (unsupported scheme '{}')",
            kind,
            value,
            scheme
        ),
    }
    if url.host_str().is_none() {
        anyhow::bail!("Invalid {} URL: '{}' (missing host)", kind, value);
    }

    Ok(())
}
