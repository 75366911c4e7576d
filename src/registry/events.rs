//! Registry Events
//!
//! Events emitted by the node registry for external consumers to react to
//! node lifecycle changes.

use serde::{Deserialize, Serialize};

/// Events emitted by the node registry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegistryEvent {
    /// A new node was registered
    NodeRegistered { node_id: String, name: String },

    /// A node was removed by an operator
    NodeRemoved { node_id: String },

    /// A node went offline (stale heartbeat, or self-reported)
    NodeWentOffline { node_id: String },

    /// A node came back online
    NodeCameOnline { node_id: String },
}

impl RegistryEvent {
    /// Get the node ID associated with this event
    pub fn node_id(&self) -> &str {
        match self {
            RegistryEvent::NodeRegistered { node_id, .. } => node_id,
            RegistryEvent::NodeRemoved { node_id } => node_id,
            RegistryEvent::NodeWentOffline { node_id } => node_id,
            RegistryEvent::NodeCameOnline { node_id } => node_id,
        }
    }

    /// Check if this event is a liveness transition
    pub fn is_liveness_transition(&self) -> bool {
        matches!(
            self,
            RegistryEvent::NodeWentOffline { .. } | RegistryEvent::NodeCameOnline { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_node_id() {
        let event = RegistryEvent::NodeRegistered {
            node_id: "node-001".to_string(),
            name: "fra-1".to_string(),
        };
        assert_eq!(event.node_id(), "node-001");
        assert!(!event.is_liveness_transition());
    }

    #[test]
    fn test_liveness_transition() {
        let event = RegistryEvent::NodeWentOffline {
            node_id: "node-001".to_string(),
        };
        assert_eq!(event.node_id(), "node-001");
        assert!(event.is_liveness_transition());
    }
}
