//! Fleet Agent - Node-Side Binary
//!
//! Long-lived agent running on each edge node. On a fixed period it pulls
//! its assignment from the control plane, reconciles the local enforcement
//! configuration (restarting the enforcement process only on real change),
//! pushes drained traffic counters, and heartbeats with its self-reported
//! status.

use clap::Parser;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleet_operator::{
    AgentLoop, ConfigStore, ControlPlaneClient, GeoInfo, NodeDescriptor, Reconciler, StateFile,
    StatsCommandCounters, SystemdController, TrafficReporter,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Fleet Agent - keeps one edge node in sync with the control plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Control plane base URL
    #[arg(long, env = "PANEL_URL")]
    panel_url: String,

    /// Bearer key for the control plane API
    #[arg(long, env = "API_KEY")]
    api_key: String,

    /// Display name reported at registration
    #[arg(long, env = "NODE_NAME")]
    node_name: String,

    /// Public address reported at registration
    #[arg(long, env = "NODE_IP")]
    node_ip: String,

    /// Two-letter country code (advisory)
    #[arg(long, env = "COUNTRY_CODE", default_value = "XX")]
    country_code: String,

    /// Country name (advisory)
    #[arg(long, env = "COUNTRY_NAME", default_value = "Unknown")]
    country_name: String,

    /// City (advisory)
    #[arg(long, env = "CITY", default_value = "")]
    city: String,

    /// ISP (advisory)
    #[arg(long, env = "ISP", default_value = "")]
    isp: String,

    /// Protocol metadata reported at registration
    #[arg(long, env = "NODE_PROTOCOL")]
    protocol: Option<String>,

    /// Enforcement config file the reconciler owns the client list of
    #[arg(
        long,
        env = "ENFORCEMENT_CONFIG",
        default_value = "/usr/local/etc/xray/config.json"
    )]
    config_path: String,

    /// File the server-assigned node id persists in
    #[arg(
        long,
        env = "AGENT_STATE",
        default_value = "/var/lib/fleet-agent/state.json"
    )]
    state_path: String,

    /// Service unit of the enforcement process
    #[arg(long, env = "SERVICE_UNIT", default_value = "xray")]
    service_unit: String,

    /// Command that atomically queries and resets per-client counters
    #[arg(
        long,
        env = "STATS_COMMAND",
        default_value = "xray api statsquery --server=127.0.0.1:10085 -reset"
    )]
    stats_command: String,

    /// Cycle period in seconds
    #[arg(long, env = "REPORT_PERIOD", default_value = "60")]
    interval_secs: u64,

    /// Per-request timeout in seconds for control plane calls
    #[arg(long, env = "REQUEST_TIMEOUT", default_value = "10")]
    timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level, args.log_json);

    info!("Starting Fleet Agent");
    info!("  Version: {}", fleet_operator::VERSION);
    info!("  Control plane: {}", args.panel_url);
    info!("  Period: {}s", args.interval_secs);

    let descriptor = NodeDescriptor {
        name: args.node_name.clone(),
        ip: args.node_ip.clone(),
        geo: GeoInfo {
            country_code: args.country_code.clone(),
            country_name: args.country_name.clone(),
            city: args.city.clone(),
            isp: args.isp.clone(),
        }
        .normalize(),
        protocol: args.protocol.clone(),
    };
    descriptor.validate()?;

    let client = ControlPlaneClient::new(
        &args.panel_url,
        &args.api_key,
        Duration::from_secs(args.timeout_secs),
    )?;

    let stats_argv: Vec<String> = args
        .stats_command
        .split_whitespace()
        .map(String::from)
        .collect();
    let counters = StatsCommandCounters::new(&stats_argv)?;

    let agent = AgentLoop::new(
        client,
        StateFile::new(&args.state_path),
        descriptor,
        Reconciler::new(
            ConfigStore::new(&args.config_path),
            SystemdController::new(&args.service_unit),
        ),
        TrafficReporter::new(counters),
        Duration::from_secs(args.interval_secs),
    );

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
        }
    });

    agent.run(shutdown_rx).await;

    info!("Agent shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(log_level: &str, log_json: bool) {
    let level = match log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().expect("static directive"))
        .add_directive("reqwest=warn".parse().expect("static directive"));

    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
