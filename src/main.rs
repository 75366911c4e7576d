//! Fleet Operator - Control Plane Binary
//!
//! Runs the central side of the fleet: node registry with staleness
//! sweeping, client directory with the usage ledger, and the REST API the
//! node agents and operators talk to. Health and metrics servers run on
//! their own listeners.

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fleet_operator::{
    ApiServer, ApiServerConfig, ClientDirectory, Error, NodeRegistry, Result, StalenessSweeper,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Fleet Operator - control plane for edge proxy nodes
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Shared bearer key nodes authenticate with
    #[arg(long, env = "API_KEY")]
    api_key: String,

    /// Expected node reporting period in seconds
    #[arg(long, env = "REPORT_PERIOD", default_value = "60")]
    report_period_secs: u64,

    /// Heartbeat staleness threshold in seconds (default: 3x the
    /// reporting period)
    #[arg(long, env = "STALENESS_THRESHOLD")]
    staleness_threshold_secs: Option<u64>,

    /// Staleness sweep interval in seconds (default: the reporting period)
    #[arg(long, env = "SWEEP_INTERVAL")]
    sweep_interval_secs: Option<u64>,

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

    let staleness_threshold = args
        .staleness_threshold_secs
        .unwrap_or(args.report_period_secs * 3);
    let sweep_interval = args.sweep_interval_secs.unwrap_or(args.report_period_secs);

    info!("Starting Fleet Operator control plane");
    info!("  Version: {}", fleet_operator::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Staleness threshold: {}s", staleness_threshold);

    let registry = NodeRegistry::new();
    let directory = ClientDirectory::new();
    info!("Node registry initialized (256-way sharded)");

    let (shutdown_tx, _) = broadcast::channel(1);

    // Staleness sweep runs independently of heartbeat arrival
    let sweeper = StalenessSweeper::new(
        registry.clone(),
        Duration::from_secs(sweep_interval),
        Duration::from_secs(staleness_threshold),
    );
    tokio::spawn(sweeper.run(shutdown_tx.subscribe()));

    // Health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Metrics server
    let metrics_addr = args.metrics_addr.clone();
    let metrics_registry = registry.clone();
    let metrics_directory = directory.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, metrics_registry, metrics_directory).await
        {
            error!("Metrics server error: {}", e);
        }
    });

    // REST API server
    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid REST API address: {}", e)))?,
        api_key: args.api_key.clone(),
    };
    let api_server = Arc::new(ApiServer::new(api_config, registry.clone(), directory.clone()));

    // Ctrl-C triggers graceful shutdown everywhere
    {
        let api_server = api_server.clone();
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                let _ = shutdown_tx.send(());
                api_server.shutdown();
            }
        });
    }

    info!("Starting API server");
    api_server.run().await?;

    info!("Operator shutdown complete");
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
        .add_directive("tower=warn".parse().expect("static directive"))
        .add_directive("axum=info".parse().expect("static directive"));

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

// =============================================================================
// Health Server
// =============================================================================

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .expect("static response"),
                "/readyz" => Response::builder()
                    .status(StatusCode::OK)
                    .body(Body::from("ok"))
                    .expect("static response"),
                _ => Response::builder()
                    .status(StatusCode::NOT_FOUND)
                    .body(Body::from("not found"))
                    .expect("static response"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: &str,
    registry: Arc<NodeRegistry>,
    directory: Arc<ClientDirectory>,
) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let nodes_total = prometheus::register_int_gauge!(
        "fleet_nodes_total",
        "Total number of registered nodes"
    )
    .map_err(|e| Error::Internal(format!("metric registration: {}", e)))?;
    let nodes_online =
        prometheus::register_int_gauge!("fleet_nodes_online", "Number of online nodes")
            .map_err(|e| Error::Internal(format!("metric registration: {}", e)))?;
    let heartbeats_total = prometheus::register_int_gauge!(
        "fleet_heartbeats_total",
        "Heartbeats received since start"
    )
    .map_err(|e| Error::Internal(format!("metric registration: {}", e)))?;
    let clients_total =
        prometheus::register_int_gauge!("fleet_clients_total", "Total number of clients")
            .map_err(|e| Error::Internal(format!("metric registration: {}", e)))?;
    let uplink_bytes = prometheus::register_int_gauge!(
        "fleet_uplink_bytes_total",
        "Cumulative uplink bytes across all clients"
    )
    .map_err(|e| Error::Internal(format!("metric registration: {}", e)))?;
    let downlink_bytes = prometheus::register_int_gauge!(
        "fleet_downlink_bytes_total",
        "Cumulative downlink bytes across all clients"
    )
    .map_err(|e| Error::Internal(format!("metric registration: {}", e)))?;

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        let directory = directory.clone();
        let nodes_total = nodes_total.clone();
        let nodes_online = nodes_online.clone();
        let heartbeats_total = heartbeats_total.clone();
        let clients_total = clients_total.clone();
        let uplink_bytes = uplink_bytes.clone();
        let downlink_bytes = downlink_bytes.clone();

        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                let directory = directory.clone();
                let nodes_total = nodes_total.clone();
                let nodes_online = nodes_online.clone();
                let heartbeats_total = heartbeats_total.clone();
                let clients_total = clients_total.clone();
                let uplink_bytes = uplink_bytes.clone();
                let downlink_bytes = downlink_bytes.clone();

                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            // Refresh gauges on each scrape
                            let stats = registry.stats();
                            nodes_total.set(stats.total_nodes as i64);
                            nodes_online.set(stats.online_nodes as i64);
                            heartbeats_total.set(stats.heartbeats as i64);
                            clients_total.set(directory.stats().total_clients as i64);
                            let (up, down) = directory.ledger().totals();
                            uplink_bytes.set(up as i64);
                            downlink_bytes.set(down as i64);

                            let encoder = TextEncoder::new();
                            let metric_families = prometheus::gather();
                            let mut buffer = Vec::new();
                            if encoder.encode(&metric_families, &mut buffer).is_err() {
                                buffer.clear();
                            }

                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", encoder.format_type())
                                .body(Body::from(buffer))
                                .expect("static response")
                        }
                        _ => Response::builder()
                            .status(StatusCode::NOT_FOUND)
                            .body(Body::from("not found"))
                            .expect("static response"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
