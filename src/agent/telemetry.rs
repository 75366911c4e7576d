//! Host Telemetry
//!
//! Best-effort sampling of host metrics for heartbeats. Advisory only:
//! every field is optional and a failed read simply leaves it out.

use crate::domain::NodeMetrics;

/// Sample whatever the host exposes. Never fails; missing data is `None`.
pub fn sample() -> NodeMetrics {
    NodeMetrics {
        cpu_percent: cpu_percent(),
        ram_percent: ram_percent(),
        disk_percent: None,
        ping_ms: None,
        bandwidth_mbps: None,
    }
}

/// One-minute load average scaled by core count
fn cpu_percent() -> Option<f32> {
    #[cfg(target_os = "linux")]
    {
        let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
        let load: f32 = loadavg.split_whitespace().next()?.parse().ok()?;
        let cpus = std::thread::available_parallelism()
            .map(|p| p.get())
            .unwrap_or(1);
        Some((load * 100.0 / cpus as f32).min(100.0))
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}

/// Used memory as a fraction of total, from /proc/meminfo
fn ram_percent() -> Option<f32> {
    #[cfg(target_os = "linux")]
    {
        let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
        let mut total = 0u64;
        let mut available = 0u64;
        for line in meminfo.lines() {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("MemTotal:") => total = parts.next()?.parse().ok()?,
                Some("MemAvailable:") => available = parts.next()?.parse().ok()?,
                _ => {}
            }
        }
        if total == 0 {
            return None;
        }
        let used = total.saturating_sub(available);
        Some((used as f32 / total as f32) * 100.0)
    }
    #[cfg(not(target_os = "linux"))]
    {
        None
    }
}
