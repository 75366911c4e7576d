//! Agent Identity State
//!
//! The node's server-assigned id, persisted across restarts. Losing this
//! file and re-registering creates a second logical node on the control
//! plane, so the write is atomic and happens before the id is ever used.

use super::enforcement::atomic_write;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    node_id: String,
}

/// Load/store of the agent's persisted node id
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the stored node id. A missing file means "never registered";
    /// an unreadable one is an error the operator has to look at, not a
    /// license to mint a duplicate node.
    pub fn load(&self) -> Result<Option<String>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        let state: PersistedState = serde_json::from_str(&raw)?;
        Ok(Some(state.node_id))
    }

    /// Persist the node id atomically
    pub fn store(&self, node_id: &str) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let bytes = serde_json::to_vec_pretty(&PersistedState {
            node_id: node_id.to_string(),
        })?;
        atomic_write(&self.path, &bytes)?;
        Ok(())
    }
}
