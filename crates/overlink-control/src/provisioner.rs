//! Credential provisioning with indefinite retry

use crate::credential::{CredentialSource, NetworkKey};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, trace};

/// Fixed delay between failed attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Obtains network keys, retrying forever on failure
///
/// No attempt cap, no circuit breaker, fixed delay between attempts.
pub struct CredentialProvisioner<S> {
    source: S,
    retry_interval: Duration,
}

impl<S: CredentialSource> CredentialProvisioner<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }

    /// Override the delay between failed attempts
    pub fn with_retry_interval(mut self, retry_interval: Duration) -> Self {
        self.retry_interval = retry_interval;
        self
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Obtain a fresh network key
    ///
    /// Only returns once the control plane issued a key.
    pub async fn obtain(&self) -> NetworkKey {
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;

            match self.source.generate_network_key().await {
                Ok(key) => {
                    if attempt > 1 {
                        debug!(attempts = attempt, "Obtained network key after retrying");
                    }
                    return key;
                }
                Err(e) => {
                    trace!(
                        attempt = attempt,
                        error = %e,
                        retry_in_secs = self.retry_interval.as_secs_f64(),
                        "Failed to get network key"
                    );
                    sleep(self.retry_interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{ControlError, MockCredentialSource};
    use mockall::Sequence;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn unavailable() -> ControlError {
        ControlError::Api {
            status: 503,
            message: "Service Unavailable".to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_attempt_succeeds_without_waiting() {
        let mut source = MockCredentialSource::new();
        source
            .expect_generate_network_key()
            .times(1)
            .returning(|| NetworkKey::new("key-1"));

        let provisioner = CredentialProvisioner::new(source);
        let start = Instant::now();
        let key = provisioner.obtain().await;

        assert_eq!(key.expose(), "key-1");
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_twice_then_succeeds() {
        let mut seq = Sequence::new();
        let mut source = MockCredentialSource::new();
        source
            .expect_generate_network_key()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(unavailable()));
        source
            .expect_generate_network_key()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(unavailable()));
        source
            .expect_generate_network_key()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| NetworkKey::new("key-3"));

        let provisioner = CredentialProvisioner::new(source);
        let start = Instant::now();
        let key = provisioner.obtain().await;

        assert_eq!(key.expose(), "key-3");
        assert!(start.elapsed() >= DEFAULT_RETRY_INTERVAL * 2);
        assert!(start.elapsed() < DEFAULT_RETRY_INTERVAL * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_retrying_while_control_plane_is_down() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let mut source = MockCredentialSource::new();
        source.expect_generate_network_key().returning(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(unavailable())
        });

        let provisioner =
            CredentialProvisioner::new(source).with_retry_interval(Duration::from_secs(1));
        let result =
            tokio::time::timeout(Duration::from_millis(10_500), provisioner.obtain()).await;

        assert!(result.is_err(), "provisioner must not give up");
        // Attempts at t = 0, 1, ..., 10
        assert_eq!(attempts.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_retry_interval_override() {
        let provisioner = CredentialProvisioner::new(MockCredentialSource::new())
            .with_retry_interval(Duration::from_millis(250));
        assert_eq!(provisioner.retry_interval(), Duration::from_millis(250));
    }
}
