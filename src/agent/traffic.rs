//! Traffic Reporter
//!
//! Drains per-client counters from the enforcement runtime and pushes the
//! deltas to the control plane. The drain is an atomic query-and-reset on
//! the runtime side, so drained bytes exist nowhere but here until a
//! report succeeds: failed sends keep them in the pending map and the next
//! cycle's report carries them along. A duplicated delivery of the same
//! report can double count on the control plane; that is the documented
//! at-least-once contract.

use super::client::ControlPlaneClient;
use super::enforcement::CounterSource;
use crate::domain::{TrafficDelta, TrafficReport};
use crate::error::Result;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Accumulates drained counters until a report goes through
pub struct TrafficReporter<S: CounterSource> {
    counters: S,
    pending: TrafficReport,
}

impl<S: CounterSource> TrafficReporter<S> {
    pub fn new(counters: S) -> Self {
        Self {
            counters,
            pending: TrafficReport::new(),
        }
    }

    /// Merge freshly drained deltas into the pending report
    pub fn absorb(&mut self, drained: HashMap<String, TrafficDelta>) {
        for (email, delta) in drained {
            if delta.total() == 0 {
                continue;
            }
            self.pending.entry(email).or_default().merge(delta);
        }
    }

    /// Deltas waiting for a successful send
    pub fn pending(&self) -> &TrafficReport {
        &self.pending
    }

    /// One cycle: drain, merge, report, clear on success.
    ///
    /// A drain failure skips the cycle but keeps earlier pending deltas; a
    /// send failure keeps everything for the next cycle. Neither blocks or
    /// queues an out-of-band retry.
    pub async fn collect_and_report(
        &mut self,
        client: &ControlPlaneClient,
        node_id: &str,
    ) -> Result<()> {
        match self.counters.drain().await {
            Ok(drained) => self.absorb(drained),
            Err(e) => {
                warn!("Counter drain failed, reporting what is pending: {}", e);
            }
        }

        if self.pending.is_empty() {
            debug!("No traffic to report");
            return Ok(());
        }

        let applied = client.report_traffic(node_id, &self.pending).await?;
        debug!(
            "Traffic report accepted: {} applied, {} skipped",
            applied.applied, applied.skipped
        );
        self.pending.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Counter stub fed from a queue of drain results
    struct StubCounters {
        results: Mutex<Vec<Result<HashMap<String, TrafficDelta>>>>,
    }

    impl StubCounters {
        fn new(results: Vec<Result<HashMap<String, TrafficDelta>>>) -> Self {
            Self {
                results: Mutex::new(results),
            }
        }
    }

    #[async_trait]
    impl CounterSource for StubCounters {
        async fn drain(&self) -> Result<HashMap<String, TrafficDelta>> {
            self.results
                .lock()
                .pop()
                .unwrap_or_else(|| Ok(HashMap::new()))
        }
    }

    fn drained(entries: &[(&str, u64, u64)]) -> HashMap<String, TrafficDelta> {
        entries
            .iter()
            .map(|(email, up, down)| (email.to_string(), TrafficDelta::new(*up, *down)))
            .collect()
    }

    #[test]
    fn test_absorb_merges_and_drops_zeroes() {
        let mut reporter = TrafficReporter::new(StubCounters::new(vec![]));

        reporter.absorb(drained(&[("u1@fleet", 100, 50), ("idle@fleet", 0, 0)]));
        reporter.absorb(drained(&[("u1@fleet", 10, 20), ("u2@fleet", 1, 2)]));

        assert_eq!(reporter.pending().len(), 2);
        assert_eq!(
            reporter.pending()["u1@fleet"],
            TrafficDelta::new(110, 70)
        );
        assert_eq!(reporter.pending()["u2@fleet"], TrafficDelta::new(1, 2));
        assert!(!reporter.pending().contains_key("idle@fleet"));
    }

    #[tokio::test]
    async fn test_failed_send_carries_deltas_to_next_cycle() {
        use crate::api::RestRouter;
        use crate::directory::ClientDirectory;
        use crate::domain::{GeoInfo, NodeDescriptor};
        use crate::registry::NodeRegistry;
        use std::time::Duration;

        let registry = NodeRegistry::new();
        let directory = ClientDirectory::new();
        let app = RestRouter::new(registry.clone(), directory.clone(), "k").build();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let client =
            ControlPlaneClient::new(format!("http://{}", addr), "k", Duration::from_secs(2))
                .unwrap();
        let node_id = client
            .register(&NodeDescriptor {
                name: "fra-1".into(),
                ip: "203.0.113.10".into(),
                geo: GeoInfo::default(),
                protocol: None,
            })
            .await
            .unwrap();
        directory.register_client("c1", "u1@fleet").unwrap();

        // Cycle 1 drains 100/50 but reports to a dead endpoint
        let dead = ControlPlaneClient::new("http://127.0.0.1:9", "k", Duration::from_millis(200))
            .unwrap();
        let mut reporter = TrafficReporter::new(StubCounters::new(vec![
            Ok(drained(&[("u1@fleet", 10, 5)])),
            Ok(drained(&[("u1@fleet", 100, 50)])),
        ]));
        assert!(reporter
            .collect_and_report(&dead, &node_id)
            .await
            .is_err());
        assert_eq!(reporter.pending()["u1@fleet"], TrafficDelta::new(100, 50));

        // Cycle 2 drains 10/5 more and reports the merged 110/55
        reporter
            .collect_and_report(&client, &node_id)
            .await
            .unwrap();
        assert!(reporter.pending().is_empty());

        let info = directory.get("c1").unwrap();
        assert_eq!(info.usage.uplink_bytes, 110);
        assert_eq!(info.usage.downlink_bytes, 55);
    }

    #[tokio::test]
    async fn test_drain_failure_keeps_earlier_pending() {
        let mut reporter = TrafficReporter::new(StubCounters::new(vec![Err(
            Error::CounterDrain {
                reason: "stats socket down".into(),
            },
        )]));
        reporter.absorb(drained(&[("u1@fleet", 7, 7)]));

        // Dead control plane too: the call fails but pending survives
        let dead = ControlPlaneClient::new(
            "http://127.0.0.1:9",
            "k",
            std::time::Duration::from_millis(200),
        )
        .unwrap();
        assert!(reporter.collect_and_report(&dead, "n1").await.is_err());
        assert_eq!(reporter.pending()["u1@fleet"], TrafficDelta::new(7, 7));
    }
}
