//! Node Agent
//!
//! Everything that runs on an edge node: the control-plane client, the
//! persisted node identity, the enforcement seams (config file, process
//! controller, counter source), the reconciliation engine, the traffic
//! reporter, and the single-flight loop that drives them.

pub mod client;
pub mod enforcement;
pub mod reconcile;
pub mod scheduler;
pub mod state;
pub mod telemetry;
pub mod traffic;

pub use client::ControlPlaneClient;
pub use enforcement::{
    ConfigStore, CounterSource, EnforcementConfig, ProcessController, StatsCommandCounters,
    SystemdController,
};
pub use reconcile::{ReconcileOutcome, Reconciler};
pub use scheduler::AgentLoop;
pub use state::StateFile;
pub use traffic::TrafficReporter;
