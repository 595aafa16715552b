//! Overlink - keeps this node on the overlay network and relays inbound
//! overlay traffic to local services.

use anyhow::{Context, Result};
use clap::Parser;
use overlink_agent::Agent;
use overlink_control::ControlPlaneClient;
use overlink_overlay::{DirectNetwork, PortForward};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

/// Overlink agent - joins the overlay and relays inbound traffic to local ports
#[derive(Parser, Debug)]
#[command(name = "overlink")]
#[command(about = "Overlink agent - joins the overlay and relays inbound traffic to local ports")]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
#[command(long_about = r#"
Overlink joins this node to an overlay network with a single-use key issued
by the control-plane API, keeps the membership healthy, and relays every
inbound overlay connection to the same port on localhost.

EXAMPLES:
  # Join with CLI arguments
  overlink --control-url https://control.example.com \
    --api-url https://api.example.com \
    --api-key $OVERLINK_API_KEY

  # Join using a config file, overriding the log level
  overlink --config overlink.yaml --log-level debug

  # Expose local port 5432 through the direct backend on 15432
  overlink --config overlink.yaml --forward-port 15432:5432

ENVIRONMENT VARIABLES:
  OVERLINK_HOSTNAME     Node name on the overlay
  OVERLINK_CONTROL_URL  Overlay control server URL
  OVERLINK_API_URL      Control-plane API URL
  OVERLINK_API_KEY      Control-plane API key
  OVERLINK_CLIENT_ID    Client identifier sent to the API
  OVERLINK_TELEMETRY    Report telemetry (true/false)
  OVERLINK_STATE_DIR    Overlay client state directory
"#)]
pub struct Args {
    /// Node name on the overlay (default: overlink-<random>)
    #[arg(long, env = "OVERLINK_HOSTNAME")]
    pub hostname: Option<String>,

    /// Overlay control server URL
    #[arg(long, env = "OVERLINK_CONTROL_URL")]
    pub control_url: Option<String>,

    /// Control-plane API URL issuing network keys
    #[arg(long, env = "OVERLINK_API_URL")]
    pub api_url: Option<String>,

    /// Control-plane API key
    #[arg(long, env = "OVERLINK_API_KEY")]
    pub api_key: Option<String>,

    /// Client identifier sent to the API (default: random UUID)
    #[arg(long, env = "OVERLINK_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Report telemetry to the control plane
    #[arg(long, env = "OVERLINK_TELEMETRY")]
    pub telemetry: bool,

    /// Overlay client state directory
    #[arg(long, env = "OVERLINK_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Seconds between health checks
    #[arg(long)]
    pub health_interval: Option<u64>,

    /// Seconds between failed network key requests
    #[arg(long)]
    pub credential_retry: Option<u64>,

    /// Timeout in seconds for control-plane API requests (default: none)
    #[arg(long)]
    pub api_timeout: Option<u64>,

    /// Overlay port of the liveness endpoint
    #[arg(long)]
    pub liveness_port: Option<u16>,

    /// Address the direct backend binds its sockets on
    #[arg(long)]
    pub bind_host: Option<IpAddr>,

    /// Local port relayed as an overlay port, LISTEN:OVERLAY (repeatable)
    #[arg(long = "forward-port", value_name = "LISTEN:OVERLAY")]
    pub forward_ports: Vec<PortForward>,

    /// Configuration file (YAML)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Setup logging with the specified log level
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .with_context(|| format!("Invalid log level: {}", log_level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level)?;

    info!("Overlink {} ({}) starting...", env!("GIT_TAG"), env!("GIT_HASH"));

    let settings = config::build_settings(args).context("Failed to build configuration")?;

    // Never log the API key
    info!("Hostname: {}", settings.agent.hostname);
    info!("Control URL: {}", settings.agent.control_url);
    info!("API URL: {}", settings.control.api_url);
    info!("State directory: {}", settings.agent.state_dir.display());

    let client = ControlPlaneClient::new(&settings.control)
        .context("Failed to create control-plane client")?;
    let network = DirectNetwork::new(settings.direct);
    let agent = Agent::new(settings.agent, network, client).context("Failed to create agent")?;
    let relays = agent.relays();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut handle = tokio::select! {
        result = agent.start() => {
            result.context("Failed to establish the first overlay session")?
        }
        _ = &mut ctrl_c => {
            info!("Received Ctrl+C before the first session came up");
            return Ok(());
        }
    };

    info!("Agent running");

    tokio::select! {
        _ = &mut ctrl_c => {
            let active = relays.list().await;
            info!(active_relays = active.len(), "Received Ctrl+C, shutting down...");
            for relay in &active {
                info!(
                    source = %relay.source,
                    local_target = %relay.local_target,
                    duration_ms = relay.established_at.elapsed().as_millis() as u64,
                    "Dropping active relay"
                );
            }
        }
        result = handle.wait() => {
            if let Err(e) = result {
                error!("Supervisor task failed: {}", e);
                return Err(e.into());
            }
        }
    }

    handle.shutdown().await;
    info!("Agent stopped");
    Ok(())
}
