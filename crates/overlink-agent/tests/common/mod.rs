//! Shared fixtures for agent integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use overlink_agent::{OverlaySessionFactory, RelayHandler, RelayTracker, SessionSettings};
use overlink_control::{ControlError, CredentialProvisioner, CredentialSource, NetworkKey};
use overlink_overlay::mock::MockNetwork;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Issues `key-1`, `key-2`, ... and fails the calls listed in `failing`
#[derive(Clone, Default)]
pub struct ScriptedKeys {
    calls: Arc<AtomicUsize>,
    failing: Arc<HashSet<usize>>,
}

impl ScriptedKeys {
    pub fn failing_calls(calls: impl IntoIterator<Item = usize>) -> Self {
        Self {
            calls: Arc::default(),
            failing: Arc::new(calls.into_iter().collect()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for ScriptedKeys {
    async fn generate_network_key(&self) -> Result<NetworkKey, ControlError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.contains(&call) {
            return Err(ControlError::Api {
                status: 503,
                message: "control plane unavailable".to_string(),
            });
        }
        NetworkKey::new(format!("key-{}", call))
    }
}

pub fn settings() -> SessionSettings {
    SessionSettings {
        hostname: "node-under-test".to_string(),
        control_url: "https://control.example.com".to_string(),
        state_dir: PathBuf::from("/var/lib/overlink/test"),
        liveness_port: 80,
    }
}

pub fn mock_factory(
    network: &MockNetwork,
    keys: &ScriptedKeys,
    retry: Duration,
) -> OverlaySessionFactory<MockNetwork, ScriptedKeys> {
    OverlaySessionFactory::new(
        network.clone(),
        CredentialProvisioner::new(keys.clone()).with_retry_interval(retry),
        settings(),
        RelayHandler::with_target_host("127.0.0.1", RelayTracker::new()),
    )
}
