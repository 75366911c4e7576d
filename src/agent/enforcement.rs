//! Enforcement Runtime Interfaces
//!
//! The node's enforcement process (the proxy runtime) is an external
//! collaborator. This module owns the three seams the agent touches:
//!
//! - the enforcement configuration file (the client list lives here; every
//!   other field belongs to provisioning and round-trips untouched),
//! - the process controller that restarts the runtime,
//! - the counter source that drains per-client traffic counters.
//!
//! The config file is only ever replaced wholesale: write to a temp path,
//! fsync, rename. The runtime picks changes up on a full restart; there is
//! no hot-reload path.

use crate::domain::{ClientDescriptor, TrafficDelta};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

// =============================================================================
// Enforcement Config Store
// =============================================================================

/// The slice of the enforcement config this crate owns. Unknown fields
/// (transport, encryption, listeners) are captured verbatim and written
/// back unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnforcementConfig {
    #[serde(default)]
    pub clients: Vec<ClientDescriptor>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

impl EnforcementConfig {
    /// Ids of the currently enforced clients
    pub fn client_ids(&self) -> Vec<&str> {
        self.clients.iter().map(|c| c.id.as_str()).collect()
    }
}

/// Reads and atomically replaces the enforcement config file
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the config. Any failure (missing, unreadable, unparsable) is
    /// a `Malformed`-class error: the caller must fail closed and leave
    /// the previously-working config in place.
    pub fn load(&self) -> Result<EnforcementConfig> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| Error::EnforcementConfig {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_str(&raw).map_err(|e| Error::EnforcementConfig {
            path: self.path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Replace the config atomically: temp file in the same directory,
    /// fsync, rename. Never an in-place partial edit.
    pub fn store(&self, config: &EnforcementConfig) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(config)?;
        atomic_write(&self.path, &bytes)?;
        debug!(
            "Wrote enforcement config: {} clients -> {}",
            config.clients.len(),
            self.path.display()
        );
        Ok(())
    }
}

/// Write-replace: temp path alongside the target, fsync, rename.
pub(crate) fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;

    // Persist the rename itself
    if let Some(dir) = path.parent() {
        if let Ok(dir_file) = std::fs::File::open(dir) {
            let _ = dir_file.sync_all();
        }
    }
    Ok(())
}

// =============================================================================
// Process Controller
// =============================================================================

/// Controls the enforcement process. Restart is the expensive, disruptive
/// operation in this whole system; implementations must make stop and
/// start individually verifiable so the caller can do
/// stop -> verify -> start -> verify instead of a blind kill.
#[async_trait]
pub trait ProcessController: Send + Sync {
    async fn stop(&self) -> Result<()>;
    async fn start(&self) -> Result<()>;
    async fn is_running(&self) -> Result<bool>;
}

/// Drives the enforcement process through its service manager unit
pub struct SystemdController {
    unit: String,
}

impl SystemdController {
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }

    async fn systemctl(&self, verb: &str) -> Result<std::process::Output> {
        Command::new("systemctl")
            .arg(verb)
            .arg(&self.unit)
            .output()
            .await
            .map_err(|e| Error::EnforcementRestart {
                reason: format!("systemctl {} {}: {}", verb, self.unit, e),
            })
    }
}

#[async_trait]
impl ProcessController for SystemdController {
    async fn stop(&self) -> Result<()> {
        let output = self.systemctl("stop").await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::EnforcementRestart {
                reason: format!(
                    "systemctl stop {} failed: {}",
                    self.unit,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }

    async fn start(&self) -> Result<()> {
        let output = self.systemctl("start").await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(Error::EnforcementRestart {
                reason: format!(
                    "systemctl start {} failed: {}",
                    self.unit,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            })
        }
    }

    async fn is_running(&self) -> Result<bool> {
        let output = self.systemctl("is-active").await?;
        Ok(output.status.success())
    }
}

// =============================================================================
// Counter Source
// =============================================================================

/// Drains per-client traffic counters from the enforcement runtime.
///
/// `drain` must be an atomic query-and-reset on the runtime side: the
/// counter is zeroed by the same operation that reads it. Reset-then-read
/// split across two calls would double count or drop bytes if the agent
/// crashed in between.
#[async_trait]
pub trait CounterSource: Send + Sync {
    async fn drain(&self) -> Result<HashMap<String, TrafficDelta>>;
}

/// Invokes the runtime's stats command with its reset flag and parses the
/// JSON it prints (stat names like `user>>>u1@fleet>>>traffic>>>uplink`).
pub struct StatsCommandCounters {
    program: String,
    args: Vec<String>,
}

impl StatsCommandCounters {
    /// `command` is the full argv, e.g.
    /// `["xray", "api", "statsquery", "--server=127.0.0.1:10085", "-reset"]`
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::Configuration("stats command must not be empty".into()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl CounterSource for StatsCommandCounters {
    async fn drain(&self) -> Result<HashMap<String, TrafficDelta>> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|e| Error::CounterDrain {
                reason: format!("{}: {}", self.program, e),
            })?;

        if !output.status.success() {
            return Err(Error::CounterDrain {
                reason: format!(
                    "{} exited with {}: {}",
                    self.program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        parse_stats_output(&output.stdout)
    }
}

#[derive(Debug, Deserialize)]
struct StatsOutput {
    #[serde(default)]
    stat: Vec<StatEntry>,
}

#[derive(Debug, Deserialize)]
struct StatEntry {
    name: String,
    /// Some runtime versions emit numbers, others strings
    #[serde(default)]
    value: serde_json::Value,
}

impl StatEntry {
    fn value_u64(&self) -> u64 {
        match &self.value {
            serde_json::Value::Number(n) => n.as_u64().unwrap_or(0),
            serde_json::Value::String(s) => s.parse().unwrap_or(0),
            _ => 0,
        }
    }
}

/// Parse `user>>>EMAIL>>>traffic>>>DIRECTION` stat entries into per-email
/// deltas. Entries in any other shape are ignored.
fn parse_stats_output(raw: &[u8]) -> Result<HashMap<String, TrafficDelta>> {
    let parsed: StatsOutput = serde_json::from_slice(raw)?;
    let mut deltas: HashMap<String, TrafficDelta> = HashMap::new();

    for entry in &parsed.stat {
        let parts: Vec<&str> = entry.name.split(">>>").collect();
        if parts.len() != 4 || parts[0] != "user" || parts[2] != "traffic" {
            continue;
        }
        let delta = deltas.entry(parts[1].to_string()).or_default();
        match parts[3] {
            "uplink" => delta.uplink = delta.uplink.saturating_add(entry.value_u64()),
            "downlink" => delta.downlink = delta.downlink.saturating_add(entry.value_u64()),
            _ => {}
        }
    }

    Ok(deltas)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::tempdir;

    #[test]
    fn test_config_roundtrip_preserves_unknown_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "listen": "0.0.0.0:443",
                "transport": {"type": "ws", "path": "/ws"},
                "clients": [{"id": "c1", "email": "u1@fleet"}]
            })
            .to_string(),
        )
        .unwrap();

        let store = ConfigStore::new(&path);
        let mut config = store.load().unwrap();
        assert_eq!(config.client_ids(), vec!["c1"]);

        config.clients = vec![
            ClientDescriptor {
                id: "c2".into(),
                email: "u2@fleet".into(),
            },
            ClientDescriptor {
                id: "c3".into(),
                email: "u3@fleet".into(),
            },
        ];
        store.store(&config).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        // Provisioning-owned fields survived the rewrite
        assert_eq!(raw["listen"], "0.0.0.0:443");
        assert_eq!(raw["transport"]["path"], "/ws");
        assert_eq!(raw["clients"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_missing_or_malformed_config_fails_closed() {
        let dir = tempdir().unwrap();
        let store = ConfigStore::new(dir.path().join("missing.json"));
        assert_matches!(store.load(), Err(Error::EnforcementConfig { .. }));

        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{not json").unwrap();
        let store = ConfigStore::new(&path);
        let err = store.load().unwrap_err();
        assert_matches!(err, Error::EnforcementConfig { .. });
        // The broken file is left exactly as it was
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{not json");
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        atomic_write(&path, b"{}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_parse_stats_output() {
        let raw = serde_json::json!({
            "stat": [
                {"name": "user>>>u1@fleet>>>traffic>>>uplink", "value": 1000},
                {"name": "user>>>u1@fleet>>>traffic>>>downlink", "value": "2000"},
                {"name": "user>>>u2@fleet>>>traffic>>>uplink", "value": 5},
                {"name": "inbound>>>api>>>traffic>>>uplink", "value": 99},
                {"name": "garbage"}
            ]
        })
        .to_string();

        let deltas = parse_stats_output(raw.as_bytes()).unwrap();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas["u1@fleet"], TrafficDelta::new(1000, 2000));
        assert_eq!(deltas["u2@fleet"], TrafficDelta::new(5, 0));
    }

    #[test]
    fn test_parse_stats_output_rejects_garbage() {
        assert!(parse_stats_output(b"not json at all").is_err());
        // An empty stat list is a valid quiet period
        let deltas = parse_stats_output(br#"{"stat": []}"#).unwrap();
        assert!(deltas.is_empty());
    }

    #[test]
    fn test_stats_command_requires_argv() {
        assert!(StatsCommandCounters::new(&[]).is_err());
        assert!(StatsCommandCounters::new(&["xray".to_string()]).is_ok());
    }
}
