use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Information about an active relay
#[derive(Debug, Clone)]
pub struct RelayInfo {
    /// Peer that opened the overlay connection
    pub source: SocketAddr,
    /// Overlay address the peer was aiming at
    pub destination: SocketAddr,
    /// Local address the traffic is relayed to
    pub local_target: String,
    /// Timestamp when the relay was established
    pub established_at: Instant,
}

/// Keeps track of relays that are currently moving bytes
#[derive(Clone, Default)]
pub struct RelayTracker {
    /// Map of relay id -> RelayInfo
    relays: Arc<RwLock<HashMap<u64, RelayInfo>>>,
    next_id: Arc<AtomicU64>,
}

impl RelayTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new relay, returning its id
    pub async fn register(&self, info: RelayInfo) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        tracing::debug!(
            relay_id = id,
            source = %info.source,
            local_target = %info.local_target,
            "Registering relay"
        );

        let mut relays = self.relays.write().await;
        relays.insert(id, info);

        tracing::debug!(active_relays = relays.len(), "Relay registered");
        id
    }

    /// Unregister a relay once both directions are done
    pub async fn unregister(&self, id: u64) {
        let mut relays = self.relays.write().await;

        if let Some(info) = relays.remove(&id) {
            tracing::debug!(
                relay_id = id,
                source = %info.source,
                local_target = %info.local_target,
                duration_ms = info.established_at.elapsed().as_millis() as u64,
                active_relays = relays.len(),
                "Relay unregistered"
            );
        } else {
            tracing::warn!(relay_id = id, "Attempted to unregister unknown relay");
        }
    }

    /// Number of active relays
    pub async fn count(&self) -> usize {
        self.relays.read().await.len()
    }

    /// All active relays
    pub async fn list(&self) -> Vec<RelayInfo> {
        self.relays.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(port: u16) -> RelayInfo {
        RelayInfo {
            source: "100.64.0.2:41000".parse().unwrap(),
            destination: format!("100.64.0.1:{}", port).parse().unwrap(),
            local_target: format!("localhost:{}", port),
            established_at: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_relay_tracker_register_unregister() {
        let tracker = RelayTracker::new();

        let id = tracker.register(info(8080)).await;
        assert_eq!(tracker.count().await, 1);

        let active = tracker.list().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].local_target, "localhost:8080");

        tracker.unregister(id).await;
        assert_eq!(tracker.count().await, 0);
        assert!(tracker.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_relay_ids_are_unique_across_clones() {
        let tracker = RelayTracker::new();
        let clone = tracker.clone();

        let a = tracker.register(info(3000)).await;
        let b = clone.register(info(3001)).await;
        assert_ne!(a, b);

        let list = tracker.list().await;
        assert_eq!(list.len(), 2);
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_harmless() {
        let tracker = RelayTracker::new();
        tracker.register(info(22)).await;
        tracker.unregister(999).await;
        assert_eq!(tracker.count().await, 1);
    }
}
