//! Sharded Node Registry
//!
//! A 256-way sharded registry tracking edge nodes: identity, geo metadata,
//! liveness state and last advisory telemetry. Per-node mutations serialize
//! on their shard lock; cross-node operations never contend on a global
//! lock.

use crate::domain::{fresh_id, NodeDescriptor, NodeMetrics, NodeStatus};
use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

// =============================================================================
// Constants
// =============================================================================

/// Number of shards in the registry (256 for good distribution)
pub const REGISTRY_SHARD_COUNT: usize = 256;

// =============================================================================
// Node ID
// =============================================================================

/// Unique identifier for a node, assigned by the registry at registration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the shard index for this node ID
    #[inline]
    pub fn shard_index(&self) -> usize {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.0.hash(&mut hasher);
        (hasher.finish() as usize) % REGISTRY_SHARD_COUNT
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<&String> for NodeId {
    fn from(s: &String) -> Self {
        Self(s.clone())
    }
}

// =============================================================================
// Node Entry
// =============================================================================

/// Entry for a single node in the registry
#[derive(Debug, Clone)]
pub struct NodeEntry {
    /// Node ID
    pub node_id: NodeId,
    /// Descriptor submitted at registration (name, ip, geo, protocol)
    pub descriptor: NodeDescriptor,
    /// Liveness state
    pub status: NodeStatus,
    /// Registration timestamp
    pub registered_at: DateTime<Utc>,
    /// Last heartbeat timestamp; `None` until the first heartbeat arrives
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Last advisory telemetry sample
    pub last_metrics: Option<NodeMetrics>,
}

impl NodeEntry {
    /// Create a new entry. A node is `unknown` until it heartbeats.
    pub fn new(node_id: NodeId, descriptor: NodeDescriptor) -> Self {
        Self {
            node_id,
            descriptor,
            status: NodeStatus::Unknown,
            registered_at: Utc::now(),
            last_heartbeat_at: None,
            last_metrics: None,
        }
    }

    /// Apply a heartbeat: unconditional last-writer-wins overwrite of
    /// status, timestamp and metrics. Returns the previous status.
    pub fn apply_heartbeat(
        &mut self,
        status: NodeStatus,
        metrics: Option<NodeMetrics>,
    ) -> NodeStatus {
        let previous = self.status;
        self.status = status;
        self.last_heartbeat_at = Some(Utc::now());
        if metrics.is_some() {
            self.last_metrics = metrics;
        }
        previous
    }

    /// Mark node as offline (staleness sweep)
    pub fn mark_offline(&mut self) {
        self.status = NodeStatus::Offline;
    }

    /// Heartbeat age, if any heartbeat was ever received
    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_heartbeat_at
            .map(|at| now.signed_duration_since(at))
    }
}

// =============================================================================
// Registry Shard
// =============================================================================

/// Statistics for a single shard
#[derive(Debug, Default)]
struct ShardStats {
    node_count: AtomicU64,
    update_count: AtomicU64,
}

/// A single shard of the registry
struct RegistryShard {
    nodes: RwLock<HashMap<NodeId, NodeEntry>>,
    stats: ShardStats,
}

impl RegistryShard {
    fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            stats: ShardStats::default(),
        }
    }

    fn insert(&self, node_id: NodeId, entry: NodeEntry) {
        let mut nodes = self.nodes.write();
        nodes.insert(node_id, entry);
        self.stats.node_count.fetch_add(1, Ordering::Relaxed);
        self.stats.update_count.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self, node_id: &NodeId) -> Option<NodeEntry> {
        self.nodes.read().get(node_id).cloned()
    }

    /// Apply a heartbeat under the shard write lock.
    /// Returns (previous, new) status on success.
    fn heartbeat(
        &self,
        node_id: &NodeId,
        status: NodeStatus,
        metrics: Option<NodeMetrics>,
    ) -> Result<(NodeStatus, NodeStatus)> {
        let mut nodes = self.nodes.write();
        if let Some(entry) = nodes.get_mut(node_id) {
            let previous = entry.apply_heartbeat(status, metrics);
            self.stats.update_count.fetch_add(1, Ordering::Relaxed);
            Ok((previous, status))
        } else {
            Err(Error::NodeNotFound {
                node_id: node_id.to_string(),
            })
        }
    }

    fn remove(&self, node_id: &NodeId) -> Option<NodeEntry> {
        let mut nodes = self.nodes.write();
        let result = nodes.remove(node_id);
        if result.is_some() {
            self.stats.node_count.fetch_sub(1, Ordering::Relaxed);
        }
        result
    }

    fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.read().keys().cloned().collect()
    }

    fn entries(&self) -> Vec<NodeEntry> {
        self.nodes.read().values().cloned().collect()
    }

    /// Flip stale `online` entries to `offline`, returning flipped ids.
    /// Entries that never heartbeated stay `unknown`.
    fn mark_stale_offline(&self, threshold: Duration, now: DateTime<Utc>) -> Vec<NodeId> {
        let mut nodes = self.nodes.write();
        let mut flipped = Vec::new();

        for entry in nodes.values_mut() {
            if entry.status != NodeStatus::Online {
                continue;
            }
            if let Some(age) = entry.heartbeat_age(now) {
                if age > threshold {
                    entry.mark_offline();
                    flipped.push(entry.node_id.clone());
                }
            }
        }

        flipped
    }
}

impl std::fmt::Debug for RegistryShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryShard")
            .field("node_count", &self.stats.node_count.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Global Statistics
// =============================================================================

/// Global statistics across all shards
#[derive(Debug, Default)]
pub struct GlobalStats {
    /// Total nodes across all shards
    pub total_nodes: AtomicU64,
    /// Nodes currently `online`
    pub online_nodes: AtomicU64,
    /// Registration events
    pub registrations: AtomicU64,
    /// Operator removals
    pub removals: AtomicU64,
    /// Heartbeats received
    pub heartbeats: AtomicU64,
    /// Online -> offline transitions made by the staleness sweep
    pub stale_transitions: AtomicU64,
}

impl GlobalStats {
    /// Create a snapshot of current stats
    pub fn snapshot(&self) -> GlobalStatsSnapshot {
        GlobalStatsSnapshot {
            total_nodes: self.total_nodes.load(Ordering::Relaxed),
            online_nodes: self.online_nodes.load(Ordering::Relaxed),
            registrations: self.registrations.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            stale_transitions: self.stale_transitions.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of global statistics
#[derive(Debug, Clone)]
pub struct GlobalStatsSnapshot {
    pub total_nodes: u64,
    pub online_nodes: u64,
    pub registrations: u64,
    pub removals: u64,
    pub heartbeats: u64,
    pub stale_transitions: u64,
}

// =============================================================================
// Node Registry
// =============================================================================

/// High-performance node registry with 256-way sharding
pub struct NodeRegistry {
    /// Shards for node storage
    shards: Box<[RegistryShard; REGISTRY_SHARD_COUNT]>,
    /// Global statistics
    global_stats: GlobalStats,
    /// Event broadcaster
    event_sender: broadcast::Sender<super::RegistryEvent>,
}

impl NodeRegistry {
    /// Create a new node registry
    pub fn new() -> Arc<Self> {
        let shards: Vec<RegistryShard> = (0..REGISTRY_SHARD_COUNT)
            .map(|_| RegistryShard::new())
            .collect();

        let shards: Box<[RegistryShard; REGISTRY_SHARD_COUNT]> = shards
            .into_boxed_slice()
            .try_into()
            .unwrap_or_else(|_| unreachable!("shard vec has fixed length"));

        let (event_sender, _) = broadcast::channel(1024);

        Arc::new(Self {
            shards,
            global_stats: GlobalStats::default(),
            event_sender,
        })
    }

    /// Get an event receiver
    pub fn subscribe(&self) -> broadcast::Receiver<super::RegistryEvent> {
        self.event_sender.subscribe()
    }

    /// Register a node, minting a fresh id.
    ///
    /// Every call creates a new logical node; the registry never dedups by
    /// address. Idempotency is the caller's responsibility (agents persist
    /// their assigned id and register once).
    pub fn register(&self, descriptor: NodeDescriptor) -> NodeId {
        let node_id = NodeId::new(fresh_id());
        let descriptor = NodeDescriptor {
            geo: descriptor.geo.normalize(),
            ..descriptor
        };
        let name = descriptor.name.clone();
        let entry = NodeEntry::new(node_id.clone(), descriptor);

        let shard_idx = node_id.shard_index();
        self.shards[shard_idx].insert(node_id.clone(), entry);

        self.global_stats.total_nodes.fetch_add(1, Ordering::Relaxed);
        self.global_stats.registrations.fetch_add(1, Ordering::Relaxed);

        let _ = self.event_sender.send(super::RegistryEvent::NodeRegistered {
            node_id: node_id.to_string(),
            name,
        });

        node_id
    }

    /// Record a heartbeat: last-writer-wins overwrite of status, last-seen
    /// timestamp and advisory metrics. Fails with `NodeNotFound` for an
    /// unknown id. A re-appearing node flips straight back to `online`
    /// with no hysteresis.
    pub fn heartbeat(
        &self,
        node_id: impl Into<NodeId>,
        status: NodeStatus,
        metrics: Option<NodeMetrics>,
    ) -> Result<()> {
        let node_id = node_id.into();
        let shard_idx = node_id.shard_index();

        let (previous, new) = self.shards[shard_idx].heartbeat(&node_id, status, metrics)?;
        self.global_stats.heartbeats.fetch_add(1, Ordering::Relaxed);

        match (previous, new) {
            (NodeStatus::Online, NodeStatus::Online) => {}
            (_, NodeStatus::Online) => {
                self.global_stats.online_nodes.fetch_add(1, Ordering::Relaxed);
                let _ = self.event_sender.send(super::RegistryEvent::NodeCameOnline {
                    node_id: node_id.to_string(),
                });
            }
            (NodeStatus::Online, _) => {
                self.global_stats.online_nodes.fetch_sub(1, Ordering::Relaxed);
                let _ = self.event_sender.send(super::RegistryEvent::NodeWentOffline {
                    node_id: node_id.to_string(),
                });
            }
            _ => {}
        }

        Ok(())
    }

    /// Remove a node. Operator action only; nothing in the control loop
    /// calls this.
    pub fn remove(&self, node_id: impl Into<NodeId>) -> Result<NodeEntry> {
        let node_id = node_id.into();
        let shard_idx = node_id.shard_index();

        if let Some(entry) = self.shards[shard_idx].remove(&node_id) {
            self.global_stats.total_nodes.fetch_sub(1, Ordering::Relaxed);
            if entry.status == NodeStatus::Online {
                self.global_stats.online_nodes.fetch_sub(1, Ordering::Relaxed);
            }
            self.global_stats.removals.fetch_add(1, Ordering::Relaxed);

            let _ = self.event_sender.send(super::RegistryEvent::NodeRemoved {
                node_id: node_id.to_string(),
            });

            Ok(entry)
        } else {
            Err(Error::NodeNotFound {
                node_id: node_id.to_string(),
            })
        }
    }

    /// Get a node by ID
    pub fn get(&self, node_id: impl Into<NodeId>) -> Option<NodeEntry> {
        let node_id = node_id.into();
        let shard_idx = node_id.shard_index();
        self.shards[shard_idx].get(&node_id)
    }

    /// Check if a node exists
    pub fn contains(&self, node_id: impl Into<NodeId>) -> bool {
        self.get(node_id).is_some()
    }

    /// Get all node IDs
    pub fn all_node_ids(&self) -> Vec<NodeId> {
        let mut ids = Vec::new();
        for shard in self.shards.iter() {
            ids.extend(shard.node_ids());
        }
        ids
    }

    /// Snapshot every entry (operator listing)
    pub fn list(&self) -> Vec<NodeEntry> {
        let mut entries = Vec::new();
        for shard in self.shards.iter() {
            entries.extend(shard.entries());
        }
        entries
    }

    /// Flip nodes whose last heartbeat is older than `threshold` from
    /// `online` to `offline`. Runs from the sweeper, independently of any
    /// heartbeat arrival, so a node that stops reporting entirely still
    /// transitions. Returns the flipped ids.
    pub fn mark_stale_offline(&self, threshold: Duration) -> Vec<NodeId> {
        let now = Utc::now();
        let mut flipped = Vec::new();

        for shard in self.shards.iter() {
            flipped.extend(shard.mark_stale_offline(threshold, now));
        }

        if !flipped.is_empty() {
            self.global_stats
                .online_nodes
                .fetch_sub(flipped.len() as u64, Ordering::Relaxed);
            self.global_stats
                .stale_transitions
                .fetch_add(flipped.len() as u64, Ordering::Relaxed);

            for node_id in &flipped {
                let _ = self.event_sender.send(super::RegistryEvent::NodeWentOffline {
                    node_id: node_id.to_string(),
                });
            }
        }

        flipped
    }

    /// Get global statistics
    pub fn stats(&self) -> GlobalStatsSnapshot {
        self.global_stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::GeoInfo;

    fn descriptor(name: &str) -> NodeDescriptor {
        NodeDescriptor {
            name: name.into(),
            ip: "203.0.113.10".into(),
            geo: GeoInfo {
                country_code: "de".into(),
                country_name: "Germany".into(),
                city: "Falkenstein".into(),
                isp: "Example".into(),
            },
            protocol: Some("vless-ws-tls".into()),
        }
    }

    #[test]
    fn test_node_id_sharding() {
        let id1 = NodeId::new("node-001");
        let id3 = NodeId::new("node-001");

        // Same ID always hashes to the same shard
        assert_eq!(id1.shard_index(), id3.shard_index());
        assert!(id1.shard_index() < REGISTRY_SHARD_COUNT);
    }

    #[test]
    fn test_register_always_mints_fresh_id() {
        let registry = NodeRegistry::new();

        let a = registry.register(descriptor("fra-1"));
        let b = registry.register(descriptor("fra-1"));

        // Same descriptor twice: two logical nodes, no dedup by ip
        assert_ne!(a, b);
        assert_eq!(registry.stats().total_nodes, 2);

        let entry = registry.get(a.clone()).unwrap();
        assert_eq!(entry.status, NodeStatus::Unknown);
        assert!(entry.last_heartbeat_at.is_none());
        assert_eq!(entry.descriptor.geo.country_code, "DE");
    }

    #[test]
    fn test_heartbeat_unknown_node() {
        let registry = NodeRegistry::new();
        let result = registry.heartbeat("no-such-node", NodeStatus::Online, None);
        assert!(matches!(result, Err(Error::NodeNotFound { .. })));
    }

    #[test]
    fn test_heartbeat_overwrites_last_writer_wins() {
        let registry = NodeRegistry::new();
        let id = registry.register(descriptor("fra-1"));

        let metrics = NodeMetrics {
            cpu_percent: Some(12.5),
            ..Default::default()
        };
        registry
            .heartbeat(id.clone(), NodeStatus::Online, Some(metrics))
            .unwrap();

        let entry = registry.get(id.clone()).unwrap();
        assert_eq!(entry.status, NodeStatus::Online);
        assert!(entry.last_heartbeat_at.is_some());
        assert_eq!(entry.last_metrics.as_ref().unwrap().cpu_percent, Some(12.5));
        assert_eq!(registry.stats().online_nodes, 1);

        // Self-reported offline (enforcement process down) is stored as-is
        registry
            .heartbeat(id.clone(), NodeStatus::Offline, None)
            .unwrap();
        let entry = registry.get(id.clone()).unwrap();
        assert_eq!(entry.status, NodeStatus::Offline);
        // Metrics from the previous heartbeat are kept when none are sent
        assert!(entry.last_metrics.is_some());
        assert_eq!(registry.stats().online_nodes, 0);
    }

    #[test]
    fn test_stale_sweep_flips_only_online() {
        let registry = NodeRegistry::new();
        let online = registry.register(descriptor("fra-1"));
        let never = registry.register(descriptor("fra-2"));

        registry
            .heartbeat(online.clone(), NodeStatus::Online, None)
            .unwrap();

        // Nothing is stale yet
        assert!(registry.mark_stale_offline(Duration::seconds(60)).is_empty());

        // A zero threshold makes the just-heartbeated node stale
        let flipped = registry.mark_stale_offline(Duration::seconds(-1));
        assert_eq!(flipped, vec![online.clone()]);
        assert_eq!(registry.get(online.clone()).unwrap().status, NodeStatus::Offline);

        // Never-heartbeated node stays unknown, not offline
        assert_eq!(registry.get(never).unwrap().status, NodeStatus::Unknown);

        // Re-appearance flips straight back to online, no hysteresis
        registry
            .heartbeat(online.clone(), NodeStatus::Online, None)
            .unwrap();
        assert_eq!(registry.get(online).unwrap().status, NodeStatus::Online);
        assert_eq!(registry.stats().online_nodes, 1);
        assert_eq!(registry.stats().stale_transitions, 1);
    }

    #[test]
    fn test_remove() {
        let registry = NodeRegistry::new();
        let id = registry.register(descriptor("fra-1"));
        registry.heartbeat(id.clone(), NodeStatus::Online, None).unwrap();

        assert!(registry.contains(id.clone()));
        registry.remove(id.clone()).unwrap();
        assert!(!registry.contains(id.clone()));

        let stats = registry.stats();
        assert_eq!(stats.total_nodes, 0);
        assert_eq!(stats.online_nodes, 0);
        assert_eq!(stats.removals, 1);

        assert!(matches!(
            registry.remove(id),
            Err(Error::NodeNotFound { .. })
        ));
    }

    #[test]
    fn test_events_on_transitions() {
        let registry = NodeRegistry::new();
        let mut rx = registry.subscribe();

        let id = registry.register(descriptor("fra-1"));
        registry.heartbeat(id.clone(), NodeStatus::Online, None).unwrap();
        registry.mark_stale_offline(Duration::seconds(-1));

        match rx.try_recv().unwrap() {
            super::super::RegistryEvent::NodeRegistered { node_id, name } => {
                assert_eq!(node_id, id.to_string());
                assert_eq!(name, "fra-1");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            super::super::RegistryEvent::NodeCameOnline { .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            super::super::RegistryEvent::NodeWentOffline { .. }
        ));
    }
}
