//! REST API Handlers
//!
//! Implements the HTTP/JSON API the node agents speak (register,
//! heartbeat, assignment pull, traffic push) and the administrative
//! surface (node listing/removal, client lifecycle, assignment edits,
//! usage resets, fleet stats). Everything under `/api` requires the
//! shared bearer key.

use crate::directory::{ClientDirectory, ClientInfo, ClientStatus};
use crate::domain::{
    Ack, ClientDescriptor, HeartbeatRequest, NodeDescriptor, NodeMetrics, NodeStatus,
    RegisterNodeResponse, TrafficApplied, TrafficReport, fresh_id,
};
use crate::error::Error;
use crate::registry::{NodeEntry, NodeRegistry};
use axum::{
    extract::{Json, Path, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

// =============================================================================
// Request/Response Types
// =============================================================================

/// Node info response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfoResponse {
    pub node_id: String,
    pub name: String,
    pub ip: String,
    pub country_code: String,
    pub country_name: String,
    pub city: String,
    pub isp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub status: NodeStatus,
    pub registered_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<NodeMetrics>,
}

impl From<NodeEntry> for NodeInfoResponse {
    fn from(entry: NodeEntry) -> Self {
        Self {
            node_id: entry.node_id.to_string(),
            name: entry.descriptor.name,
            ip: entry.descriptor.ip,
            country_code: entry.descriptor.geo.country_code,
            country_name: entry.descriptor.geo.country_name,
            city: entry.descriptor.geo.city,
            isp: entry.descriptor.geo.isp,
            protocol: entry.descriptor.protocol,
            status: entry.status,
            registered_at: entry.registered_at,
            last_heartbeat_at: entry.last_heartbeat_at,
            metrics: entry.last_metrics,
        }
    }
}

/// Client creation request. The id is minted by the caller side of the
/// directory boundary; when omitted, the handler mints one in the same
/// format the enforcement runtime uses for credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateClientRequest {
    pub email: String,
    #[serde(default)]
    pub id: Option<String>,
}

/// Partial client update. Clear flags distinguish "leave as is" from
/// "remove the value".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateClientRequest {
    #[serde(default)]
    pub status: Option<ClientStatus>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub clear_expiry: bool,
    #[serde(default)]
    pub daily_limit_bytes: Option<u64>,
    #[serde(default)]
    pub clear_daily_limit: bool,
}

/// Fleet-wide counts for dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub nodes_total: u64,
    pub nodes_online: u64,
    pub registrations_total: u64,
    pub heartbeats_total: u64,
    pub clients_total: u64,
    pub clients_active: u64,
    pub clients_blocked: u64,
    pub uplink_bytes_total: u64,
    pub downlink_bytes_total: u64,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

fn error_response(status: StatusCode, error: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(ApiErrorResponse {
            error: error.into(),
            message: message.into(),
            details: None,
        }),
    )
        .into_response()
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    registry: Arc<NodeRegistry>,
    directory: Arc<ClientDirectory>,
    api_key: String,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(
        registry: Arc<NodeRegistry>,
        directory: Arc<ClientDirectory>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            registry,
            directory,
            api_key: api_key.into(),
        }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            registry: self.registry,
            directory: self.directory,
            api_key: Arc::new(self.api_key),
        };

        let api = Router::new()
            // Node protocol (spoken by agents)
            .route("/api/nodes/register", post(register_node))
            .route("/api/nodes/:node_id/heartbeat", post(heartbeat))
            .route("/api/nodes/:node_id/clients", get(node_clients))
            .route("/api/nodes/:node_id/traffic", post(node_traffic))
            // Node administration
            .route("/api/nodes", get(list_nodes))
            .route("/api/nodes/:node_id", delete(remove_node))
            // Client administration
            .route("/api/clients", post(create_client).get(list_clients))
            .route(
                "/api/clients/:client_id",
                post(update_client).delete(remove_client),
            )
            .route(
                "/api/clients/:client_id/nodes/:node_id",
                put(assign_client).delete(unassign_client),
            )
            .route("/api/clients/:client_id/usage/reset", post(reset_usage))
            // Fleet stats
            .route("/api/stats", get(stats))
            .route_layer(middleware::from_fn_with_state(
                state.clone(),
                require_api_key,
            ));

        Router::new()
            .merge(api)
            // Health endpoints stay unauthenticated
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    registry: Arc<NodeRegistry>,
    directory: Arc<ClientDirectory>,
    api_key: Arc<String>,
}

/// Bearer-token check applied to every `/api` route
async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token == state.api_key.as_str())
        .unwrap_or(false);

    if !authorized {
        return error_response(StatusCode::UNAUTHORIZED, "unauthorized", "invalid API key");
    }

    next.run(request).await
}

// =============================================================================
// Node Protocol Handlers
// =============================================================================

/// Register a node. Always mints a fresh id; agents persist it and call
/// this once.
async fn register_node(
    State(state): State<AppState>,
    Json(descriptor): Json<NodeDescriptor>,
) -> impl IntoResponse {
    if let Err(e) = descriptor.validate() {
        return error_response(StatusCode::BAD_REQUEST, "invalid_descriptor", e.to_string());
    }

    let name = descriptor.name.clone();
    let node_id = state.registry.register(descriptor);
    info!("Registered node {} ({})", node_id, name);

    (
        StatusCode::CREATED,
        Json(RegisterNodeResponse {
            node_id: node_id.to_string(),
        }),
    )
        .into_response()
}

/// Heartbeat: liveness plus self-reported enforcement health
async fn heartbeat(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> impl IntoResponse {
    if let Err(e) = request.validate() {
        return error_response(StatusCode::BAD_REQUEST, "invalid_heartbeat", e.to_string());
    }

    match state
        .registry
        .heartbeat(&node_id, request.status, request.metrics)
    {
        Ok(()) => (StatusCode::OK, Json(Ack::ok())).into_response(),
        Err(Error::NodeNotFound { node_id }) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Node {} not found", node_id),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()),
    }
}

/// Assignment snapshot for one node
async fn node_clients(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    if !state.registry.contains(&node_id) {
        return error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Node {} not found", node_id),
        );
    }

    let snapshot: Vec<ClientDescriptor> = state.directory.get_assignment(&node_id);
    (StatusCode::OK, Json(snapshot)).into_response()
}

/// Traffic deltas from one node
async fn node_traffic(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(report): Json<TrafficReport>,
) -> impl IntoResponse {
    if !state.registry.contains(&node_id) {
        return error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Node {} not found", node_id),
        );
    }

    let (applied, skipped) = state.directory.record_traffic(&node_id, &report);
    (StatusCode::OK, Json(TrafficApplied { applied, skipped })).into_response()
}

// =============================================================================
// Node Administration Handlers
// =============================================================================

/// List all nodes
async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    let mut nodes: Vec<NodeInfoResponse> = state
        .registry
        .list()
        .into_iter()
        .map(NodeInfoResponse::from)
        .collect();
    nodes.sort_by(|a, b| {
        a.country_code
            .cmp(&b.country_code)
            .then_with(|| a.name.cmp(&b.name))
    });

    (StatusCode::OK, Json(nodes))
}

/// Operator removal of a node. Nothing removes nodes automatically.
async fn remove_node(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.remove(&node_id) {
        Ok(entry) => {
            warn!("Node {} ({}) removed by operator", node_id, entry.descriptor.name);
            (StatusCode::OK, Json(Ack::ok())).into_response()
        }
        Err(Error::NodeNotFound { node_id }) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Node {} not found", node_id),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()),
    }
}

// =============================================================================
// Client Administration Handlers
// =============================================================================

/// Create a client credential
async fn create_client(
    State(state): State<AppState>,
    Json(request): Json<CreateClientRequest>,
) -> impl IntoResponse {
    let id = request.id.unwrap_or_else(fresh_id);

    match state.directory.register_client(&id, &request.email) {
        Ok(()) => {
            info!("Registered client {} ({})", id, request.email);
            (
                StatusCode::CREATED,
                Json(ClientDescriptor {
                    id,
                    email: request.email,
                }),
            )
                .into_response()
        }
        Err(e @ Error::ClientExists { .. }) => {
            error_response(StatusCode::CONFLICT, "client_exists", e.to_string())
        }
        Err(e @ Error::ApiValidation(_)) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_client", e.to_string())
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()),
    }
}

/// List all clients with usage
async fn list_clients(State(state): State<AppState>) -> impl IntoResponse {
    let clients: Vec<ClientInfo> = state.directory.list();
    (StatusCode::OK, Json(clients))
}

/// Partial update of status / expiry / daily limit
async fn update_client(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(request): Json<UpdateClientRequest>,
) -> impl IntoResponse {
    let result = (|| {
        if let Some(status) = request.status {
            state.directory.set_status(&client_id, status)?;
        }
        if request.clear_expiry {
            state.directory.set_expiry(&client_id, None)?;
        } else if let Some(expires_at) = request.expires_at {
            state.directory.set_expiry(&client_id, Some(expires_at))?;
        }
        if request.clear_daily_limit {
            state.directory.set_daily_limit(&client_id, None)?;
        } else if let Some(limit) = request.daily_limit_bytes {
            state.directory.set_daily_limit(&client_id, Some(limit))?;
        }
        Ok::<(), Error>(())
    })();

    match result {
        Ok(()) => match state.directory.get(&client_id) {
            Some(info) => (StatusCode::OK, Json(info)).into_response(),
            None => error_response(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Client {} not found", client_id),
            ),
        },
        Err(Error::ClientNotFound { client_id }) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Client {} not found", client_id),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()),
    }
}

/// Remove a client credential
async fn remove_client(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> impl IntoResponse {
    match state.directory.remove_client(&client_id) {
        Ok(()) => (StatusCode::OK, Json(Ack::ok())).into_response(),
        Err(Error::ClientNotFound { client_id }) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Client {} not found", client_id),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()),
    }
}

/// Assign a client to a node (idempotent)
async fn assign_client(
    State(state): State<AppState>,
    Path((client_id, node_id)): Path<(String, String)>,
) -> impl IntoResponse {
    if !state.registry.contains(&node_id) {
        return error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Node {} not found", node_id),
        );
    }

    match state.directory.assign(&client_id, &node_id) {
        Ok(changed) => {
            if changed {
                info!("Assigned client {} to node {}", client_id, node_id);
            }
            (StatusCode::OK, Json(Ack::ok())).into_response()
        }
        Err(Error::ClientNotFound { client_id }) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Client {} not found", client_id),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()),
    }
}

/// Unassign a client from a node (idempotent; works even after the node
/// itself was removed, so stale edges can be cleaned up)
async fn unassign_client(
    State(state): State<AppState>,
    Path((client_id, node_id)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.directory.unassign(&client_id, &node_id) {
        Ok(changed) => {
            if changed {
                info!("Unassigned client {} from node {}", client_id, node_id);
            }
            (StatusCode::OK, Json(Ack::ok())).into_response()
        }
        Err(Error::ClientNotFound { client_id }) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Client {} not found", client_id),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()),
    }
}

/// Explicit administrative reset of a client's usage totals
async fn reset_usage(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
) -> impl IntoResponse {
    match state.directory.reset_usage(&client_id) {
        Ok(()) => {
            info!("Usage reset for client {}", client_id);
            (StatusCode::OK, Json(Ack::ok())).into_response()
        }
        Err(Error::ClientNotFound { client_id }) => error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Client {} not found", client_id),
        ),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string()),
    }
}

// =============================================================================
// Stats & Health Handlers
// =============================================================================

/// Fleet-wide counts
async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let registry_stats = state.registry.stats();
    let directory_stats = state.directory.stats();
    let (uplink, downlink) = state.directory.ledger().totals();

    (
        StatusCode::OK,
        Json(StatsResponse {
            nodes_total: registry_stats.total_nodes,
            nodes_online: registry_stats.online_nodes,
            registrations_total: registry_stats.registrations,
            heartbeats_total: registry_stats.heartbeats,
            clients_total: directory_stats.total_clients,
            clients_active: directory_stats.active_clients,
            clients_blocked: directory_stats.blocked_clients,
            uplink_bytes_total: uplink,
            downlink_bytes_total: downlink,
        }),
    )
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // Ready once serving; an empty fleet is a valid state for a fresh panel
    let _ = state.registry.stats();
    (StatusCode::OK, "ready")
}
