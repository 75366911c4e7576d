//! Client Directory
//!
//! Authoritative store of client credentials and their node assignments
//! (many-to-many), and the source of the assignment snapshots nodes pull.
//! All reads and writes go through one `RwLock`, so a snapshot can never
//! observe a half-applied edit.

use super::usage::{UsageLedger, UsageSnapshot};
use crate::domain::{ClientDescriptor, TrafficReport};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

// =============================================================================
// Client Records
// =============================================================================

/// Administrative state of a client credential
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Active,
    Blocked,
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientStatus::Active => write!(f, "active"),
            ClientStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// One client credential and its assignment set
#[derive(Debug, Clone)]
struct ClientRecord {
    id: String,
    email: String,
    status: ClientStatus,
    expires_at: Option<DateTime<Utc>>,
    daily_limit_bytes: Option<u64>,
    nodes: HashSet<String>,
    created_at: DateTime<Utc>,
}

impl ClientRecord {
    fn new(id: String, email: String) -> Self {
        Self {
            id,
            email,
            status: ClientStatus::Active,
            expires_at: None,
            daily_limit_bytes: None,
            nodes: HashSet::new(),
            created_at: Utc::now(),
        }
    }

    /// Eligibility before the daily-limit gate: active and unexpired
    fn is_enabled(&self, now: DateTime<Utc>) -> bool {
        if self.status != ClientStatus::Active {
            return false;
        }
        match self.expires_at {
            Some(expires) => expires > now,
            None => true,
        }
    }
}

/// Client view for the administrative API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: String,
    pub email: String,
    pub status: ClientStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_limit_bytes: Option<u64>,
    pub assigned_nodes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub usage: UsageSnapshot,
}

/// Directory counts for the stats endpoint
#[derive(Debug, Clone)]
pub struct DirectoryStatsSnapshot {
    pub total_clients: u64,
    pub active_clients: u64,
    pub blocked_clients: u64,
}

// =============================================================================
// Client Directory
// =============================================================================

#[derive(Default)]
struct DirectoryInner {
    clients: HashMap<String, ClientRecord>,
    by_email: HashMap<String, String>,
}

/// Authoritative client store plus the usage ledger it gates on
pub struct ClientDirectory {
    inner: RwLock<DirectoryInner>,
    ledger: Arc<UsageLedger>,
}

impl ClientDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(DirectoryInner::default()),
            ledger: Arc::new(UsageLedger::new()),
        })
    }

    /// The usage ledger backing this directory
    pub fn ledger(&self) -> Arc<UsageLedger> {
        self.ledger.clone()
    }

    /// Store a new credential. The opaque id is minted on the caller's
    /// side of this boundary; the directory only stores and authorizes it.
    pub fn register_client(&self, id: impl Into<String>, email: impl Into<String>) -> Result<()> {
        let id = id.into();
        let email = email.into();

        if email.trim().is_empty() {
            return Err(Error::ApiValidation("client email must not be empty".into()));
        }
        if id.trim().is_empty() {
            return Err(Error::ApiValidation("client id must not be empty".into()));
        }

        let mut inner = self.inner.write();
        if inner.by_email.contains_key(&email) {
            return Err(Error::ClientExists { email });
        }
        if inner.clients.contains_key(&id) {
            return Err(Error::ApiValidation(format!(
                "client id already in use: {}",
                id
            )));
        }

        inner.by_email.insert(email.clone(), id.clone());
        inner.clients.insert(id.clone(), ClientRecord::new(id, email));
        Ok(())
    }

    /// Remove a credential and its usage
    pub fn remove_client(&self, client_id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .clients
            .remove(client_id)
            .ok_or_else(|| Error::ClientNotFound {
                client_id: client_id.to_string(),
            })?;
        inner.by_email.remove(&record.email);
        drop(inner);

        self.ledger.remove(client_id);
        Ok(())
    }

    /// Add a client↔node edge. Idempotent: repeating the call is a no-op.
    pub fn assign(&self, client_id: &str, node_id: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let record = inner
            .clients
            .get_mut(client_id)
            .ok_or_else(|| Error::ClientNotFound {
                client_id: client_id.to_string(),
            })?;
        Ok(record.nodes.insert(node_id.to_string()))
    }

    /// Remove a client↔node edge. Idempotent.
    pub fn unassign(&self, client_id: &str, node_id: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let record = inner
            .clients
            .get_mut(client_id)
            .ok_or_else(|| Error::ClientNotFound {
                client_id: client_id.to_string(),
            })?;
        Ok(record.nodes.remove(node_id))
    }

    /// Point-in-time assignment snapshot for one node.
    ///
    /// Taken under a single read lock: the result is always the set some
    /// prefix of directory edits implies, never a partial list straddling
    /// two concurrent edits. Blocked, expired, and over-daily-limit
    /// clients are filtered out without touching their assignment edges.
    pub fn get_assignment(&self, node_id: &str) -> Vec<ClientDescriptor> {
        let now = Utc::now();
        let inner = self.inner.read();

        let mut snapshot: Vec<ClientDescriptor> = inner
            .clients
            .values()
            .filter(|record| record.nodes.contains(node_id))
            .filter(|record| record.is_enabled(now))
            .filter(|record| match record.daily_limit_bytes {
                Some(limit) => self.ledger.today_bytes(&record.id, now) < limit,
                None => true,
            })
            .map(|record| ClientDescriptor {
                id: record.id.clone(),
                email: record.email.clone(),
            })
            .collect();

        snapshot.sort_by(|a, b| a.email.cmp(&b.email));
        snapshot
    }

    /// Block or unblock a credential
    pub fn set_status(&self, client_id: &str, status: ClientStatus) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .clients
            .get_mut(client_id)
            .ok_or_else(|| Error::ClientNotFound {
                client_id: client_id.to_string(),
            })?;
        record.status = status;
        Ok(())
    }

    /// Set or clear the expiry timestamp
    pub fn set_expiry(&self, client_id: &str, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .clients
            .get_mut(client_id)
            .ok_or_else(|| Error::ClientNotFound {
                client_id: client_id.to_string(),
            })?;
        record.expires_at = expires_at;
        Ok(())
    }

    /// Set or clear the daily traffic limit
    pub fn set_daily_limit(&self, client_id: &str, limit_bytes: Option<u64>) -> Result<()> {
        let mut inner = self.inner.write();
        let record = inner
            .clients
            .get_mut(client_id)
            .ok_or_else(|| Error::ClientNotFound {
                client_id: client_id.to_string(),
            })?;
        record.daily_limit_bytes = limit_bytes;
        Ok(())
    }

    /// Apply a traffic report: resolve each email, add the delta.
    ///
    /// Unknown emails and zero-total entries are skipped and counted, the
    /// rest of the report still applies. Skips are logged rather than
    /// silently dropped.
    pub fn record_traffic(&self, node_id: &str, report: &TrafficReport) -> (u32, u32) {
        let now = Utc::now();
        let mut applied = 0u32;
        let mut skipped = 0u32;

        for (email, delta) in report {
            if delta.total() == 0 {
                skipped += 1;
                continue;
            }

            let client_id = {
                let inner = self.inner.read();
                inner.by_email.get(email).cloned()
            };

            match client_id {
                Some(client_id) => {
                    self.ledger.add(&client_id, *delta, now);
                    applied += 1;
                }
                None => {
                    warn!(
                        "Traffic from node {} for unknown client {}: {} bytes dropped",
                        node_id,
                        email,
                        delta.total()
                    );
                    skipped += 1;
                }
            }
        }

        debug!(
            "Traffic report from node {}: {} applied, {} skipped",
            node_id, applied, skipped
        );
        (applied, skipped)
    }

    /// Explicit administrative reset of a client's usage totals
    pub fn reset_usage(&self, client_id: &str) -> Result<()> {
        let inner = self.inner.read();
        if !inner.clients.contains_key(client_id) {
            return Err(Error::ClientNotFound {
                client_id: client_id.to_string(),
            });
        }
        drop(inner);

        self.ledger.reset(client_id);
        Ok(())
    }

    /// Get one client's administrative view
    pub fn get(&self, client_id: &str) -> Option<ClientInfo> {
        let now = Utc::now();
        let inner = self.inner.read();
        inner.clients.get(client_id).map(|r| self.info(r, now))
    }

    /// List all clients with usage, sorted by email
    pub fn list(&self) -> Vec<ClientInfo> {
        let now = Utc::now();
        let inner = self.inner.read();
        let mut clients: Vec<ClientInfo> =
            inner.clients.values().map(|r| self.info(r, now)).collect();
        clients.sort_by(|a, b| a.email.cmp(&b.email));
        clients
    }

    /// Directory counts for the stats endpoint
    pub fn stats(&self) -> DirectoryStatsSnapshot {
        let inner = self.inner.read();
        let total = inner.clients.len() as u64;
        let blocked = inner
            .clients
            .values()
            .filter(|r| r.status == ClientStatus::Blocked)
            .count() as u64;
        DirectoryStatsSnapshot {
            total_clients: total,
            active_clients: total - blocked,
            blocked_clients: blocked,
        }
    }

    fn info(&self, record: &ClientRecord, now: DateTime<Utc>) -> ClientInfo {
        let mut assigned_nodes: Vec<String> = record.nodes.iter().cloned().collect();
        assigned_nodes.sort();
        ClientInfo {
            id: record.id.clone(),
            email: record.email.clone(),
            status: record.status,
            expires_at: record.expires_at,
            daily_limit_bytes: record.daily_limit_bytes,
            assigned_nodes,
            created_at: record.created_at,
            usage: self.ledger.snapshot(&record.id, now),
        }
    }
}
