//! Session health snapshot

use std::net::IpAddr;

/// Network the node is currently a member of
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Display name of the network
    pub name: String,
    /// DNS suffix assigned to members
    pub magic_dns_suffix: String,
}

/// Status reported by a session's local client
///
/// Only the presence of [`Status::current_network`] is meaningful to the
/// supervisor; everything else is carried for logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Status {
    /// Backend state as reported by the client (e.g. "Running", "NeedsLogin")
    pub backend_state: String,
    /// Network membership, `None` when the node is not joined
    pub current_network: Option<NetworkInfo>,
    /// Addresses assigned to this node on the overlay
    pub self_addrs: Vec<IpAddr>,
}

impl Status {
    /// Status of a node joined to `network`
    pub fn joined(network: NetworkInfo, self_addrs: Vec<IpAddr>) -> Self {
        Self {
            backend_state: "Running".to_string(),
            current_network: Some(network),
            self_addrs,
        }
    }

    /// Status of a node with no network membership
    pub fn detached(backend_state: impl Into<String>) -> Self {
        Self {
            backend_state: backend_state.into(),
            current_network: None,
            self_addrs: Vec::new(),
        }
    }

    /// Whether the node currently has an active network membership
    pub fn is_member(&self) -> bool {
        self.current_network.is_some()
    }
}
