//! Staleness Sweeper
//!
//! Background task that periodically flips nodes with stale heartbeats to
//! `offline`. Runs independently of heartbeat arrival, so a node that
//! stops reporting entirely still transitions.

use super::NodeRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Periodic staleness sweep over the node registry.
///
/// The threshold defaults to three reporting periods: one missed report is
/// routine, three in a row is a dead or partitioned node.
pub struct StalenessSweeper {
    registry: Arc<NodeRegistry>,
    interval: Duration,
    threshold: chrono::Duration,
}

impl StalenessSweeper {
    pub fn new(registry: Arc<NodeRegistry>, interval: Duration, threshold: Duration) -> Self {
        let threshold = chrono::Duration::from_std(threshold)
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1_000));
        Self {
            registry,
            interval,
            threshold,
        }
    }

    /// Runs the sweep loop until a shutdown signal is received.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            "Staleness sweeper started (every {}s, threshold {}s)",
            self.interval.as_secs(),
            self.threshold.num_seconds()
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Staleness sweeper stopping");
                    break;
                }
                _ = interval.tick() => {
                    let flipped = self.registry.mark_stale_offline(self.threshold);
                    if flipped.is_empty() {
                        debug!("Sweep: no stale nodes");
                    } else {
                        for node_id in &flipped {
                            warn!("Node {} marked offline: heartbeat stale", node_id);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GeoInfo, NodeDescriptor, NodeStatus};

    fn descriptor() -> NodeDescriptor {
        NodeDescriptor {
            name: "fra-1".into(),
            ip: "203.0.113.10".into(),
            geo: GeoInfo::default(),
            protocol: None,
        }
    }

    #[tokio::test]
    async fn test_sweeper_marks_stale_node_offline() {
        let registry = NodeRegistry::new();
        let id = registry.register(descriptor());
        registry
            .heartbeat(id.clone(), NodeStatus::Online, None)
            .unwrap();

        let sweeper = StalenessSweeper::new(
            registry.clone(),
            Duration::from_millis(10),
            Duration::from_millis(20),
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(sweeper.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(80)).await;
        let _ = shutdown_tx.send(());
        handle.await.unwrap();

        assert_eq!(registry.get(id).unwrap().status, NodeStatus::Offline);
        assert_eq!(registry.stats().stale_transitions, 1);
    }

    #[tokio::test]
    async fn test_sweeper_leaves_fresh_node_online() {
        let registry = NodeRegistry::new();
        let id = registry.register(descriptor());
        registry
            .heartbeat(id.clone(), NodeStatus::Online, None)
            .unwrap();

        let sweeper = StalenessSweeper::new(
            registry.clone(),
            Duration::from_millis(10),
            Duration::from_secs(3600),
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(sweeper.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown_tx.send(());
        handle.await.unwrap();

        assert_eq!(registry.get(id).unwrap().status, NodeStatus::Online);
    }
}
