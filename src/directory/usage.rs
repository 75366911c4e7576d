//! Usage Ledger
//!
//! Cumulative per-client traffic accounting plus the per-day rollup used
//! for daily-limit gating. Nodes report deltas since their last successful
//! report; the ledger only ever adds them on, so totals are monotonically
//! non-decreasing except for explicit administrative resets.
//!
//! Delivery is at-least-once: a retried report applies twice. There is no
//! dedup key on the wire, so the ledger does not pretend to dedup either.

use crate::domain::TrafficDelta;
use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

// =============================================================================
// Per-Client Usage
// =============================================================================

/// Usage state for one client
#[derive(Debug, Clone, Default)]
struct ClientUsage {
    uplink_bytes: u64,
    downlink_bytes: u64,
    /// UTC day the `day_bytes` slot belongs to; rolls lazily on first
    /// touch after midnight
    day: Option<NaiveDate>,
    day_bytes: u64,
}

impl ClientUsage {
    fn roll_day(&mut self, today: NaiveDate) {
        if self.day != Some(today) {
            self.day = Some(today);
            self.day_bytes = 0;
        }
    }

    fn add(&mut self, delta: TrafficDelta, today: NaiveDate) {
        self.roll_day(today);
        self.uplink_bytes = self.uplink_bytes.saturating_add(delta.uplink);
        self.downlink_bytes = self.downlink_bytes.saturating_add(delta.downlink);
        self.day_bytes = self.day_bytes.saturating_add(delta.total());
    }
}

/// Point-in-time usage view for API responses
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub uplink_bytes: u64,
    pub downlink_bytes: u64,
    pub today_bytes: u64,
}

// =============================================================================
// Usage Ledger
// =============================================================================

/// Concurrent usage ledger keyed by client id.
///
/// Mutations for one client serialize on the map's shard lock; reports
/// from different nodes for different clients proceed independently.
pub struct UsageLedger {
    usage: DashMap<String, ClientUsage>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self {
            usage: DashMap::new(),
        }
    }

    /// Add a delta onto a client's cumulative totals and today's rollup
    pub fn add(&self, client_id: &str, delta: TrafficDelta, now: DateTime<Utc>) {
        let today = now.date_naive();
        self.usage
            .entry(client_id.to_string())
            .or_default()
            .add(delta, today);
    }

    /// Bytes accumulated today (UTC). Zero if the slot belongs to an
    /// earlier day or the client never reported.
    pub fn today_bytes(&self, client_id: &str, now: DateTime<Utc>) -> u64 {
        let today = now.date_naive();
        self.usage
            .get(client_id)
            .filter(|u| u.day == Some(today))
            .map(|u| u.day_bytes)
            .unwrap_or(0)
    }

    /// Usage snapshot for one client
    pub fn snapshot(&self, client_id: &str, now: DateTime<Utc>) -> UsageSnapshot {
        let today = now.date_naive();
        self.usage
            .get(client_id)
            .map(|u| UsageSnapshot {
                uplink_bytes: u.uplink_bytes,
                downlink_bytes: u.downlink_bytes,
                today_bytes: if u.day == Some(today) { u.day_bytes } else { 0 },
            })
            .unwrap_or_default()
    }

    /// Explicit administrative reset of one client's totals
    pub fn reset(&self, client_id: &str) {
        if let Some(mut u) = self.usage.get_mut(client_id) {
            *u = ClientUsage::default();
        }
    }

    /// Drop a client's usage entirely (client removal)
    pub fn remove(&self, client_id: &str) {
        self.usage.remove(client_id);
    }

    /// Fleet-wide cumulative totals (uplink, downlink)
    pub fn totals(&self) -> (u64, u64) {
        let mut up = 0u64;
        let mut down = 0u64;
        for entry in self.usage.iter() {
            up = up.saturating_add(entry.uplink_bytes);
            down = down.saturating_add(entry.downlink_bytes);
        }
        (up, down)
    }
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new()
    }
}
