//! Fleet Operator - Edge Fleet Control Plane
//!
//! A control plane keeping a fleet of independently-installed edge proxy
//! nodes in sync with a central source of truth: node registry with
//! heartbeat liveness, client directory with per-node assignments,
//! node-side reconciliation with minimal-disruption restarts, and
//! per-client traffic accounting.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                          Control Plane (fleet-operator)                      │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌──────────────────────┐  ┌────────────────────────┐  │
//! │  │    REST API     │  │    Node Registry     │  │    Client Directory    │  │
//! │  │  (bearer auth)  │  │  (256-way sharded,   │  │  (assignments, usage   │  │
//! │  │                 │  │   staleness sweep)   │  │   ledger, eligibility) │  │
//! │  └────────┬────────┘  └──────────┬───────────┘  └───────────┬────────────┘  │
//! │           └──────────────────────┴──────────────────────────┘               │
//! └──────────────────────────────────────▲──────────────────────────────────────┘
//!                                        │ register / heartbeat
//!                                        │ pull assignment / push traffic
//! ┌──────────────────────────────────────┴──────────────────────────────────────┐
//! │                            Node Agent (fleet-agent)                          │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────┐  ┌──────────────────────┐  ┌────────────────────────┐  │
//! │  │  Single-flight  │  │   Reconciliation     │  │   Traffic Reporter     │  │
//! │  │  periodic loop  │  │   Engine (compare,   │  │   (atomic drain,       │  │
//! │  │                 │  │   replace, restart)  │  │    carry-over)         │  │
//! │  └─────────────────┘  └──────────┬───────────┘  └───────────┬────────────┘  │
//! │                       ┌──────────┴──────────────────────────┴────────────┐  │
//! │                       │   Enforcement runtime (external: config file,    │  │
//! │                       │   service unit, stats counters)                  │  │
//! │                       └──────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`registry`]: node identity, liveness, staleness sweep
//! - [`directory`]: client credentials, assignments, usage ledger
//! - [`api`]: REST surface for agents and operators
//! - [`agent`]: everything that runs on an edge node
//! - [`domain`]: wire types shared by both sides
//! - [`error`]: error types and handling

pub mod agent;
pub mod api;
pub mod directory;
pub mod domain;
pub mod error;
pub mod registry;

// Re-export commonly used types
pub use agent::{
    AgentLoop, ConfigStore, ControlPlaneClient, CounterSource, EnforcementConfig,
    ProcessController, ReconcileOutcome, Reconciler, StateFile, StatsCommandCounters,
    SystemdController, TrafficReporter,
};

pub use api::{ApiServer, ApiServerConfig, RestRouter};

pub use directory::{
    ClientDirectory, ClientInfo, ClientStatus, UsageLedger, UsageSnapshot,
};

pub use domain::{
    Ack, ClientDescriptor, GeoInfo, HeartbeatRequest, NodeDescriptor, NodeMetrics, NodeStatus,
    RegisterNodeResponse, TrafficApplied, TrafficDelta, TrafficReport,
};

pub use error::{Error, ErrorClass, Result};

pub use registry::{
    GlobalStatsSnapshot, NodeEntry, NodeId, NodeRegistry, RegistryEvent, StalenessSweeper,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
