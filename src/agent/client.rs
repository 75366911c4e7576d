//! Control Plane Client
//!
//! HTTP client the node agent uses to talk to the control plane. Every
//! call is a single bounded request/response: one timeout, no streaming,
//! no out-of-band retry queue. A failed call surfaces as a typed error
//! and the agent simply tries again on its next natural cycle.

use crate::domain::{
    Ack, ClientDescriptor, HeartbeatRequest, NodeDescriptor, RegisterNodeResponse, TrafficApplied,
    TrafficReport,
};
use crate::error::{Error, Result};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Client for the control plane's node protocol
pub struct ControlPlaneClient {
    base_url: String,
    api_key: String,
    http: Client,
}

impl ControlPlaneClient {
    /// Create a new client. `timeout` bounds every request end-to-end.
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        let base_url = base_url.into();
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            http,
        })
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.api_key)
    }

    /// Map a non-success status onto the error taxonomy; pass the
    /// response through otherwise.
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let body = body.chars().take(256).collect();
        Err(Error::ControlPlaneStatus {
            status: status.as_u16(),
            body,
        })
    }

    /// Register this node, returning the server-assigned id.
    ///
    /// Every call mints a new logical node on the control plane; the
    /// caller persists the returned id and never calls this again.
    pub async fn register(&self, descriptor: &NodeDescriptor) -> Result<String> {
        let url = format!("{}/api/nodes/register", self.base_url);
        let response = self
            .authed(self.http.post(&url))
            .json(descriptor)
            .send()
            .await?;
        let response = Self::check(response).await?;
        let body: RegisterNodeResponse = response.json().await?;
        debug!("Registered as node {}", body.node_id);
        Ok(body.node_id)
    }

    /// Push a heartbeat
    pub async fn heartbeat(&self, node_id: &str, request: &HeartbeatRequest) -> Result<()> {
        let url = format!("{}/api/nodes/{}/heartbeat", self.base_url, node_id);
        let response = self
            .authed(self.http.post(&url))
            .json(request)
            .send()
            .await?;
        let response = Self::check(response).await?;
        let _: Ack = response.json().await?;
        Ok(())
    }

    /// Pull this node's assignment snapshot
    pub async fn fetch_assignment(&self, node_id: &str) -> Result<Vec<ClientDescriptor>> {
        let url = format!("{}/api/nodes/{}/clients", self.base_url, node_id);
        let response = self.authed(self.http.get(&url)).send().await?;
        let response = Self::check(response).await?;
        let snapshot: Vec<ClientDescriptor> = response.json().await?;
        Ok(snapshot)
    }

    /// Push traffic deltas accumulated since the last successful report
    pub async fn report_traffic(
        &self,
        node_id: &str,
        report: &TrafficReport,
    ) -> Result<TrafficApplied> {
        let url = format!("{}/api/nodes/{}/traffic", self.base_url, node_id);
        let response = self
            .authed(self.http.post(&url))
            .json(report)
            .send()
            .await?;
        let response = Self::check(response).await?;
        let applied: TrafficApplied = response.json().await?;
        Ok(applied)
    }

    /// Whether an error is the control plane saying "no such node"
    pub fn is_not_found(err: &Error) -> bool {
        matches!(
            err,
            Error::ControlPlaneStatus {
                status, ..
            } if *status == StatusCode::NOT_FOUND.as_u16()
        )
    }
}

impl std::fmt::Debug for ControlPlaneClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlaneClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RestRouter;
    use crate::directory::ClientDirectory;
    use crate::domain::{GeoInfo, NodeStatus, TrafficDelta};
    use crate::error::ErrorClass;
    use crate::registry::NodeRegistry;
    use std::sync::Arc;

    const KEY: &str = "itest-key";

    async fn serve() -> (String, Arc<NodeRegistry>, Arc<ClientDirectory>) {
        let registry = NodeRegistry::new();
        let directory = ClientDirectory::new();
        let app = RestRouter::new(registry.clone(), directory.clone(), KEY).build();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), registry, directory)
    }

    fn descriptor() -> NodeDescriptor {
        NodeDescriptor {
            name: "fra-1".into(),
            ip: "203.0.113.10".into(),
            geo: GeoInfo::default(),
            protocol: None,
        }
    }

    #[tokio::test]
    async fn test_register_heartbeat_roundtrip() {
        let (base, registry, _) = serve().await;
        let client = ControlPlaneClient::new(&base, KEY, Duration::from_secs(2)).unwrap();

        let node_id = client.register(&descriptor()).await.unwrap();
        assert!(registry.contains(node_id.as_str()));

        client
            .heartbeat(
                &node_id,
                &HeartbeatRequest {
                    status: NodeStatus::Online,
                    metrics: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(
            registry.get(node_id.as_str()).unwrap().status,
            NodeStatus::Online
        );
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_node_maps_to_not_found() {
        let (base, _, _) = serve().await;
        let client = ControlPlaneClient::new(&base, KEY, Duration::from_secs(2)).unwrap();

        let err = client
            .heartbeat(
                "ghost",
                &HeartbeatRequest {
                    status: NodeStatus::Online,
                    metrics: None,
                },
            )
            .await
            .unwrap_err();
        assert!(ControlPlaneClient::is_not_found(&err));
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[tokio::test]
    async fn test_assignment_and_traffic_roundtrip() {
        let (base, _, directory) = serve().await;
        let client = ControlPlaneClient::new(&base, KEY, Duration::from_secs(2)).unwrap();

        let node_id = client.register(&descriptor()).await.unwrap();
        directory.register_client("c1", "u1@fleet").unwrap();
        directory.assign("c1", &node_id).unwrap();

        let snapshot = client.fetch_assignment(&node_id).await.unwrap();
        assert_eq!(
            snapshot,
            vec![ClientDescriptor {
                id: "c1".into(),
                email: "u1@fleet".into()
            }]
        );

        let mut report = TrafficReport::new();
        report.insert("u1@fleet".into(), TrafficDelta::new(100, 200));
        let applied = client.report_traffic(&node_id, &report).await.unwrap();
        assert_eq!(applied.applied, 1);
        assert_eq!(applied.skipped, 0);

        let info = directory.get("c1").unwrap();
        assert_eq!(info.usage.uplink_bytes, 100);
    }

    #[tokio::test]
    async fn test_bad_key_is_invalid_input() {
        let (base, _, _) = serve().await;
        let client = ControlPlaneClient::new(&base, "wrong", Duration::from_secs(2)).unwrap();

        let err = client.register(&descriptor()).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::InvalidInput);
    }

    #[tokio::test]
    async fn test_unreachable_control_plane_is_transient() {
        // Reserved port with nothing listening
        let client =
            ControlPlaneClient::new("http://127.0.0.1:9", KEY, Duration::from_millis(300)).unwrap();
        let err = client.register(&descriptor()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
