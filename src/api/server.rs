//! API Server
//!
//! Lifecycle wrapper around the REST router: bind, serve, graceful
//! shutdown via a broadcast channel.

use crate::error::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

use super::rest::RestRouter;
use crate::directory::ClientDirectory;
use crate::registry::NodeRegistry;

// =============================================================================
// Server Configuration
// =============================================================================

/// Configuration for the API server
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    /// REST API bind address
    pub rest_addr: SocketAddr,
    /// Shared bearer key required on every `/api` route
    pub api_key: String,
}

impl Default for ApiServerConfig {
    fn default() -> Self {
        Self {
            rest_addr: "0.0.0.0:8090".parse().expect("static address"),
            api_key: String::new(),
        }
    }
}

// =============================================================================
// API Server
// =============================================================================

/// REST API server for the control plane
pub struct ApiServer {
    config: ApiServerConfig,
    registry: Arc<NodeRegistry>,
    directory: Arc<ClientDirectory>,
    shutdown_tx: broadcast::Sender<()>,
}

impl ApiServer {
    /// Create a new API server
    pub fn new(
        config: ApiServerConfig,
        registry: Arc<NodeRegistry>,
        directory: Arc<ClientDirectory>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            registry,
            directory,
            shutdown_tx,
        }
    }

    /// Run the API server
    pub async fn run(&self) -> Result<()> {
        info!("Starting API server");
        info!("  REST API: {}", self.config.rest_addr);

        let rest_handle = self.spawn_rest_server();

        tokio::select! {
            result = rest_handle => {
                if let Err(e) = result {
                    error!("REST server error: {:?}", e);
                }
            }
        }

        Ok(())
    }

    /// Spawn the REST server
    fn spawn_rest_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let addr = self.config.rest_addr;
        let api_key = self.config.api_key.clone();
        let registry = self.registry.clone();
        let directory = self.directory.clone();
        let shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(
            async move { run_rest_server(addr, registry, directory, api_key, shutdown_rx).await },
        )
    }

    /// Trigger graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

/// Run the REST API server
async fn run_rest_server(
    addr: SocketAddr,
    registry: Arc<NodeRegistry>,
    directory: Arc<ClientDirectory>,
    api_key: String,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<()> {
    let router = RestRouter::new(registry, directory, api_key);
    let app = router.build();

    info!("REST API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Internal(format!("Failed to bind REST server: {}", e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("REST server shutting down");
        })
        .await
        .map_err(|e| Error::Internal(format!("REST server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ApiServerConfig::default();
        assert_eq!(config.rest_addr.port(), 8090);
        assert!(config.api_key.is_empty());
    }
}
