//! Reconciliation Engine
//!
//! Makes the node's live enforcement configuration match the control
//! plane's assignment view: no-op when already matching, one atomic apply
//! otherwise. The restart is the expensive, disruptive step, so set
//! equality is checked first and an unrelated cycle never restarts
//! anything.

use super::enforcement::{ConfigStore, ProcessController};
use crate::domain::ClientDescriptor;
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, info, warn};

/// Result of one reconcile pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Enforced set already equals the desired set; nothing was touched
    Unchanged,
    /// Config replaced (or a pending restart retried) and the process
    /// restarted successfully
    Applied,
    /// Config is in the desired state on disk but the restart failed;
    /// reported via the next heartbeat and retried next cycle
    Degraded { reason: String },
}

/// Node-side reconciliation engine
pub struct Reconciler<P: ProcessController> {
    store: ConfigStore,
    process: P,
    /// Set when a restart failed after the config was already replaced;
    /// forces a restart retry even though the sets now compare equal.
    restart_pending: AtomicBool,
}

impl<P: ProcessController> Reconciler<P> {
    pub fn new(store: ConfigStore, process: P) -> Self {
        Self {
            store,
            process,
            restart_pending: AtomicBool::new(false),
        }
    }

    /// One reconcile pass against the given desired set.
    ///
    /// Errors mean the cycle was abandoned without mutating anything:
    /// a malformed/unreadable config fails closed, a failed config write
    /// leaves the previous file in place (write-replace is atomic).
    pub async fn reconcile(&self, desired: &[ClientDescriptor]) -> Result<ReconcileOutcome> {
        let config = self.store.load()?;

        let current_ids: HashSet<&str> = config.client_ids().into_iter().collect();
        let desired_ids: HashSet<&str> = desired.iter().map(|c| c.id.as_str()).collect();

        if current_ids == desired_ids {
            if !self.restart_pending.load(Ordering::Acquire) {
                return Ok(ReconcileOutcome::Unchanged);
            }
            // Config already holds the desired set from a previous pass
            // whose restart failed; retry just the restart.
            warn!("Retrying enforcement restart from previous cycle");
            return Ok(self.restart().await);
        }

        let current_count = current_ids.len();
        let desired_count = desired_ids.len();

        // Wholesale replacement, never a diff-and-patch
        let mut next = config;
        next.clients = desired.to_vec();
        self.store.store(&next)?;

        info!(
            "Enforcement set changed: {} -> {} clients, restarting",
            current_count,
            desired_count
        );
        Ok(self.restart().await)
    }

    /// Exactly one crash-safe restart: stop, verify stopped, start,
    /// verify running. Never a blind kill.
    async fn restart(&self) -> ReconcileOutcome {
        let result: Result<()> = async {
            self.process.stop().await?;
            if self.process.is_running().await? {
                return Err(Error::EnforcementRestart {
                    reason: "process still running after stop".into(),
                });
            }
            self.process.start().await?;
            if !self.process.is_running().await? {
                return Err(Error::EnforcementRestart {
                    reason: "process not running after start".into(),
                });
            }
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                self.restart_pending.store(false, Ordering::Release);
                ReconcileOutcome::Applied
            }
            Err(e) => {
                self.restart_pending.store(true, Ordering::Release);
                error!("Enforcement restart failed: {}", e);
                ReconcileOutcome::Degraded {
                    reason: e.to_string(),
                }
            }
        }
    }
}
