//! Agent Loop
//!
//! Single-flight periodic scheduler for the node agent. One cycle pulls
//! the assignment and reconciles, reports traffic, then heartbeats with
//! the freshest self-reported status. The whole cycle runs inline on the
//! timer task, so a slow cycle delays the next tick instead of overlapping
//! it; there is never a second cycle touching the enforcement config or
//! the counters concurrently.

use super::client::ControlPlaneClient;
use super::enforcement::{CounterSource, ProcessController};
use super::reconcile::{ReconcileOutcome, Reconciler};
use super::state::StateFile;
use super::telemetry;
use super::traffic::TrafficReporter;
use crate::domain::{HeartbeatRequest, NodeDescriptor, NodeStatus};
use crate::error::Result;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Long-lived agent loop driving one node
pub struct AgentLoop<P: ProcessController, S: CounterSource> {
    client: ControlPlaneClient,
    state: StateFile,
    descriptor: NodeDescriptor,
    reconciler: Reconciler<P>,
    traffic: TrafficReporter<S>,
    interval: Duration,
    /// Cached node id once known
    node_id: Option<String>,
    /// Last reconcile left the enforcement process down
    degraded: bool,
}

impl<P: ProcessController, S: CounterSource> AgentLoop<P, S> {
    pub fn new(
        client: ControlPlaneClient,
        state: StateFile,
        descriptor: NodeDescriptor,
        reconciler: Reconciler<P>,
        traffic: TrafficReporter<S>,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            state,
            descriptor,
            reconciler,
            traffic,
            interval,
            node_id: None,
            degraded: false,
        }
    }

    /// Run cycles until a shutdown signal is received
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        info!("Agent loop started ({}s period)", self.interval.as_secs());
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Agent loop stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.cycle().await;
                }
            }
        }
    }

    /// One full cycle. Every failure is local: log, classify, continue;
    /// nothing here blocks the loop or retries outside its natural period.
    pub async fn cycle(&mut self) {
        let node_id = match self.ensure_registered().await {
            Ok(node_id) => node_id,
            Err(e) => {
                warn!("Registration not possible this cycle: {}", e);
                return;
            }
        };

        self.reconcile_step(&node_id).await;
        self.traffic_step(&node_id).await;
        self.heartbeat_step(&node_id).await;
    }

    /// Load the persisted node id, registering once if none exists.
    /// The id is persisted before it is ever used, so a crash between
    /// register and store is the only path to a duplicate logical node.
    async fn ensure_registered(&mut self) -> Result<String> {
        if let Some(node_id) = &self.node_id {
            return Ok(node_id.clone());
        }

        if let Some(node_id) = self.state.load()? {
            self.node_id = Some(node_id.clone());
            return Ok(node_id);
        }

        let node_id = self.client.register(&self.descriptor).await?;
        self.state.store(&node_id)?;
        info!("Registered with control plane as node {}", node_id);
        self.node_id = Some(node_id.clone());
        Ok(node_id)
    }

    async fn reconcile_step(&mut self, node_id: &str) {
        let desired = match self.client.fetch_assignment(node_id).await {
            Ok(desired) => desired,
            Err(e) => {
                // Keep the current configuration, no restart, next cycle
                warn!("Assignment fetch failed, keeping current config: {}", e);
                return;
            }
        };

        match self.reconciler.reconcile(&desired).await {
            Ok(ReconcileOutcome::Unchanged) => {
                debug!("Enforcement set unchanged ({} clients)", desired.len());
                self.degraded = false;
            }
            Ok(ReconcileOutcome::Applied) => {
                info!("Enforcement set applied ({} clients)", desired.len());
                self.degraded = false;
            }
            Ok(ReconcileOutcome::Degraded { reason }) => {
                error!("Enforcement degraded: {}", reason);
                self.degraded = true;
            }
            Err(e) => {
                // Fail closed: last-known-good config stays in place
                warn!("Reconcile skipped: {}", e);
            }
        }
    }

    async fn traffic_step(&mut self, node_id: &str) {
        if let Err(e) = self.traffic.collect_and_report(&self.client, node_id).await {
            warn!("Traffic report failed, deltas carried over: {}", e);
        }
    }

    async fn heartbeat_step(&mut self, node_id: &str) {
        let status = if self.degraded {
            NodeStatus::Offline
        } else {
            NodeStatus::Online
        };

        let request = HeartbeatRequest {
            status,
            metrics: Some(telemetry::sample()),
        };

        if let Err(e) = self.client.heartbeat(node_id, &request).await {
            warn!("Heartbeat failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::enforcement::ConfigStore;
    use crate::api::RestRouter;
    use crate::directory::ClientDirectory;
    use crate::domain::{GeoInfo, TrafficDelta};
    use crate::error::Error;
    use crate::registry::NodeRegistry;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct StubController {
        running: AtomicBool,
        restarts: AtomicU32,
    }

    #[async_trait]
    impl ProcessController for Arc<StubController> {
        async fn stop(&self) -> Result<()> {
            self.running.store(false, Ordering::SeqCst);
            Ok(())
        }
        async fn start(&self) -> Result<()> {
            self.running.store(true, Ordering::SeqCst);
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn is_running(&self) -> Result<bool> {
            Ok(self.running.load(Ordering::SeqCst))
        }
    }

    struct StubCounters;

    #[async_trait]
    impl CounterSource for StubCounters {
        async fn drain(&self) -> Result<HashMap<String, TrafficDelta>> {
            let mut drained = HashMap::new();
            drained.insert("u1@fleet".to_string(), TrafficDelta::new(100, 200));
            Ok(drained)
        }
    }

    async fn control_plane() -> (String, Arc<NodeRegistry>, Arc<ClientDirectory>) {
        let registry = NodeRegistry::new();
        let directory = ClientDirectory::new();
        let app = RestRouter::new(registry.clone(), directory.clone(), "k").build();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), registry, directory)
    }

    fn agent_loop(
        base: &str,
        dir: &TempDir,
        controller: Arc<StubController>,
    ) -> AgentLoop<Arc<StubController>, StubCounters> {
        let config_path = dir.path().join("config.json");
        std::fs::write(
            &config_path,
            serde_json::json!({"clients": []}).to_string(),
        )
        .unwrap();

        AgentLoop::new(
            ControlPlaneClient::new(base, "k", Duration::from_secs(2)).unwrap(),
            StateFile::new(dir.path().join("agent.json")),
            NodeDescriptor {
                name: "fra-1".into(),
                ip: "203.0.113.10".into(),
                geo: GeoInfo::default(),
                protocol: None,
            },
            Reconciler::new(ConfigStore::new(&config_path), controller),
            TrafficReporter::new(StubCounters),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_full_cycle_registers_reconciles_reports() {
        let (base, registry, directory) = control_plane().await;
        let dir = TempDir::new().unwrap();
        let controller = Arc::new(StubController {
            running: AtomicBool::new(true),
            restarts: AtomicU32::new(0),
        });

        let mut agent = agent_loop(&base, &dir, controller.clone());

        // First cycle: registers, empty assignment, traffic dropped as
        // unknown (no clients yet), heartbeat online
        agent.cycle().await;
        let node_id = agent.node_id.clone().unwrap();
        assert!(registry.contains(node_id.as_str()));
        assert_eq!(
            registry.get(node_id.as_str()).unwrap().status,
            NodeStatus::Online
        );
        assert_eq!(controller.restarts.load(Ordering::SeqCst), 0);

        // Operator assigns a client; next cycle applies it with one restart
        directory.register_client("c1", "u1@fleet").unwrap();
        directory.assign("c1", &node_id).unwrap();
        agent.cycle().await;
        assert_eq!(controller.restarts.load(Ordering::SeqCst), 1);

        // Traffic from the stub counters landed on the ledger
        let info = directory.get("c1").unwrap();
        assert!(info.usage.uplink_bytes >= 100);

        // Another cycle with no directory change: zero further restarts
        agent.cycle().await;
        assert_eq!(controller.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_persisted_id_survives_agent_restart() {
        let (base, registry, _) = control_plane().await;
        let dir = TempDir::new().unwrap();
        let controller = Arc::new(StubController {
            running: AtomicBool::new(true),
            restarts: AtomicU32::new(0),
        });

        let mut agent = agent_loop(&base, &dir, controller.clone());
        agent.cycle().await;
        let first_id = agent.node_id.clone().unwrap();

        // New loop instance over the same state dir: same logical node
        let mut agent = agent_loop(&base, &dir, controller);
        agent.cycle().await;
        assert_eq!(agent.node_id.unwrap(), first_id);
        assert_eq!(registry.stats().total_nodes, 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_config_and_heartbeats() {
        // Control plane that disappears after registration
        let (base, registry, _) = control_plane().await;
        let dir = TempDir::new().unwrap();
        let controller = Arc::new(StubController {
            running: AtomicBool::new(true),
            restarts: AtomicU32::new(0),
        });

        let mut agent = agent_loop(&base, &dir, controller.clone());
        agent.cycle().await;
        let node_id = agent.node_id.clone().unwrap();

        // Simulate operator removal: fetch/heartbeat start returning 404.
        // The cycle logs and moves on; config untouched, no restart.
        registry.remove(node_id.as_str()).unwrap();
        agent.cycle().await;
        assert_eq!(controller.restarts.load(Ordering::SeqCst), 0);
    }

    struct FailingController;

    #[async_trait]
    impl ProcessController for FailingController {
        async fn stop(&self) -> Result<()> {
            Ok(())
        }
        async fn start(&self) -> Result<()> {
            Err(Error::EnforcementRestart {
                reason: "unit refuses to start".into(),
            })
        }
        async fn is_running(&self) -> Result<bool> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_degraded_reconcile_reports_offline() {
        let (base, registry, directory) = control_plane().await;
        let dir = TempDir::new().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, serde_json::json!({"clients": []}).to_string()).unwrap();

        let mut agent = AgentLoop::new(
            ControlPlaneClient::new(&base, "k", Duration::from_secs(2)).unwrap(),
            StateFile::new(dir.path().join("agent.json")),
            NodeDescriptor {
                name: "fra-1".into(),
                ip: "203.0.113.10".into(),
                geo: GeoInfo::default(),
                protocol: None,
            },
            Reconciler::new(ConfigStore::new(&config_path), FailingController),
            TrafficReporter::new(StubCounters),
            Duration::from_secs(60),
        );

        agent.cycle().await;
        let node_id = agent.node_id.clone().unwrap();

        directory.register_client("c1", "u1@fleet").unwrap();
        directory.assign("c1", &node_id).unwrap();

        // Apply fails -> degraded -> heartbeat carries offline
        agent.cycle().await;
        assert_eq!(
            registry.get(node_id.as_str()).unwrap().status,
            NodeStatus::Offline
        );
    }
}
