//! Wire Protocol Types
//!
//! Request/response bodies exchanged between node agents and the control
//! plane, plus the validation applied before anything touches registry or
//! directory state. Both binaries serialize these with serde; there is no
//! separate schema.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Node Identity & Metadata
// =============================================================================

/// Geographic metadata reported by a node at registration.
///
/// Advisory only: displayed to operators and never used for correctness
/// decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoInfo {
    #[serde(default = "GeoInfo::default_country_code")]
    pub country_code: String,
    #[serde(default = "GeoInfo::default_country_name")]
    pub country_name: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub isp: String,
}

impl GeoInfo {
    fn default_country_code() -> String {
        "XX".to_string()
    }

    fn default_country_name() -> String {
        "Unknown".to_string()
    }

    /// Coerce out-of-shape country codes to the unknown marker
    pub fn normalize(mut self) -> Self {
        if self.country_code.len() != 2 || !self.country_code.chars().all(|c| c.is_ascii_alphabetic())
        {
            self.country_code = Self::default_country_code();
        } else {
            self.country_code = self.country_code.to_ascii_uppercase();
        }
        self
    }
}

impl Default for GeoInfo {
    fn default() -> Self {
        Self {
            country_code: Self::default_country_code(),
            country_name: Self::default_country_name(),
            city: String::new(),
            isp: String::new(),
        }
    }
}

/// Node descriptor submitted at registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Display name
    pub name: String,
    /// Public address of the node
    pub ip: String,
    #[serde(flatten)]
    pub geo: GeoInfo,
    /// Free-form protocol metadata (enforcement runtime flavour/version)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

impl NodeDescriptor {
    /// Validate the descriptor before it is admitted into the registry
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::ApiValidation("node name must not be empty".into()));
        }
        if self.ip.trim().is_empty() {
            return Err(Error::ApiValidation("node ip must not be empty".into()));
        }
        Ok(())
    }
}

/// Response to a successful registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeResponse {
    pub node_id: String,
}

// =============================================================================
// Node Status & Metrics
// =============================================================================

/// Liveness state of a node as held by the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Offline,
    Unknown,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Offline => write!(f, "offline"),
            NodeStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Advisory telemetry samples carried on a heartbeat. No invariants.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ram_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_mbps: Option<u32>,
}

/// Heartbeat body pushed by a node each cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Self-reported health: `online`, or `offline` when the enforcement
    /// process is down on the node.
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<NodeMetrics>,
}

impl HeartbeatRequest {
    /// A node cannot self-report `unknown`; that state is reserved for
    /// registered-but-never-heartbeated entries.
    pub fn validate(&self) -> Result<()> {
        if self.status == NodeStatus::Unknown {
            return Err(Error::ApiValidation(
                "heartbeat status must be online or offline".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Assignment & Traffic
// =============================================================================

/// Client entry as served to a node: enough to build one enforcement
/// config entry, nothing more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDescriptor {
    /// Opaque credential identifier (UUID-shaped)
    pub id: String,
    /// Human label; also the key under which the node reports traffic
    pub email: String,
}

/// Uplink/downlink byte deltas since the node's last successful report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficDelta {
    #[serde(default)]
    pub uplink: u64,
    #[serde(default)]
    pub downlink: u64,
}

impl TrafficDelta {
    pub fn new(uplink: u64, downlink: u64) -> Self {
        Self { uplink, downlink }
    }

    pub fn total(&self) -> u64 {
        self.uplink.saturating_add(self.downlink)
    }

    /// Merge another delta into this one (carry-over across failed sends)
    pub fn merge(&mut self, other: TrafficDelta) {
        self.uplink = self.uplink.saturating_add(other.uplink);
        self.downlink = self.downlink.saturating_add(other.downlink);
    }
}

/// Traffic report body: email -> byte deltas
pub type TrafficReport = BTreeMap<String, TrafficDelta>;

/// Ack for a traffic report, with visibility into what was dropped
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficApplied {
    /// Entries added to the ledger
    pub applied: u32,
    /// Entries skipped: unknown email or zero total
    pub skipped: u32,
}

/// Generic ack body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub status: String,
}

impl Ack {
    pub fn ok() -> Self {
        Self {
            status: "ok".into(),
        }
    }
}

// =============================================================================
// Id Minting
// =============================================================================

/// Generate a fresh opaque UUID v4-shaped identifier.
///
/// Derived from the wall clock plus a process-wide counter so that two ids
/// minted in the same instant still differ.
pub fn fresh_id() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static SEQ: AtomicU64 = AtomicU64::new(0);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = SEQ.fetch_add(1, Ordering::Relaxed) as u128;
    let mixed = now ^ (seq << 64) ^ seq;

    format!(
        "{:08x}-{:04x}-4{:03x}-{:04x}-{:012x}",
        (mixed >> 96) as u32,
        (mixed >> 80) as u16,
        (mixed >> 68) as u16 & 0x0FFF,
        ((mixed >> 52) as u16 & 0x3FFF) | 0x8000,
        mixed as u64 & 0xFFFF_FFFF_FFFF
    )
}
