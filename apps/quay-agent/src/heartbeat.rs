use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::{Duration, Instant};

use quay_proto::{HostFacts, NodeVitals};
use tokio::sync::watch;
use topic_bus::Bus;
use tracing::{debug, warn};

use crate::agent::NodeIdentity;
use crate::config::NodeConfig;

/// Periodic node-vitals publisher. Follows the identity watch channel so a
/// rotation switches the reported node id mid-flight. Host facts are sent
/// only on the first successful push after process start; a restart resets
/// that.
pub struct Heartbeat<B: Bus> {
    bus: Arc<B>,
    topic: String,
    period: Duration,
    name: String,
    labels: HashMap<String, String>,
    identity: watch::Receiver<NodeIdentity>,
}

impl<B: Bus> Heartbeat<B> {
    pub fn new(bus: Arc<B>, config: &NodeConfig, identity: watch::Receiver<NodeIdentity>) -> Self {
        Self {
            bus,
            topic: config.status_topic.clone(),
            period: Duration::from_secs(config.heartbeat_period_secs),
            name: config.name.clone(),
            labels: config.labels.clone(),
            identity,
        }
    }

    pub async fn run(self) {
        let started = Instant::now();
        let mut ticker = tokio::time::interval(self.period);
        // The immediate first tick is skipped so vitals describe a node
        // that has actually been up for one period.
        ticker.tick().await;
        let mut host_sent = false;
        loop {
            ticker.tick().await;
            let node_id = self.identity.borrow().node_id.clone();
            let vitals = NodeVitals {
                node_id,
                name: self.name.clone(),
                labels: self.labels.clone(),
                uptime_secs: started.elapsed().as_secs(),
                sent_at_unix: chrono::Utc::now().timestamp(),
                host: if host_sent { None } else { Some(host_facts()) },
            };
            let bytes = match quay_proto::encode(&vitals) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!(target: "quay.heartbeat", error = %err, "failed to encode node vitals");
                    continue;
                }
            };
            match self.bus.publish(&self.topic, bytes.into()).await {
                Ok(()) => {
                    host_sent = true;
                    debug!(target: "quay.heartbeat", node = %vitals.node_id, "vitals pushed");
                }
                Err(err) => {
                    warn!(
                        target: "quay.heartbeat",
                        error = %err,
                        topic = %self.topic,
                        "failed to publish node vitals"
                    );
                }
            }
        }
    }
}

fn host_facts() -> HostFacts {
    HostFacts {
        hostname: env::var("HOSTNAME").ok(),
        os: env::consts::OS.to_string(),
        arch: env::consts::ARCH.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;
    use topic_bus::LocalBus;

    fn config_with_period(period_secs: u64) -> NodeConfig {
        NodeConfig {
            version: "1".to_string(),
            node_id: "node-1".to_string(),
            sync_topic: "node-1.>".to_string(),
            update_topic: "upstream.updates".to_string(),
            status_topic: "upstream.status".to_string(),
            ops_topic: "app_operation.node-1".to_string(),
            name: "worker-a".to_string(),
            bus_url: "redis://localhost:6379".to_string(),
            heartbeat_period_secs: period_secs,
            labels: HashMap::from([("zone".to_string(), "b2".to_string())]),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sends_host_facts_only_on_the_first_push() {
        let bus = Arc::new(LocalBus::new());
        let mut status = bus.subscribe("upstream.status").await.expect("subscribe");
        let (_identity_tx, identity_rx) = watch::channel(NodeIdentity::new("node-1"));
        let heartbeat = Heartbeat::new(bus.clone(), &config_with_period(5), identity_rx);
        let _task = tokio::spawn(heartbeat.run());

        let first: NodeVitals = quay_proto::decode(
            &timeout(Duration::from_secs(30), status.recv())
                .await
                .expect("first vitals timeout")
                .expect("first vitals")
                .payload,
        )
        .expect("decode vitals");
        assert!(first.host.is_some());
        assert_eq!(first.node_id, "node-1");
        assert_eq!(first.labels.get("zone").map(String::as_str), Some("b2"));

        let second: NodeVitals = quay_proto::decode(
            &timeout(Duration::from_secs(30), status.recv())
                .await
                .expect("second vitals timeout")
                .expect("second vitals")
                .payload,
        )
        .expect("decode vitals");
        assert!(second.host.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn reports_the_rotated_identity() {
        let bus = Arc::new(LocalBus::new());
        let mut status = bus.subscribe("upstream.status").await.expect("subscribe");
        let (identity_tx, identity_rx) = watch::channel(NodeIdentity::new("node-1"));
        let heartbeat = Heartbeat::new(bus.clone(), &config_with_period(5), identity_rx);
        let _task = tokio::spawn(heartbeat.run());

        identity_tx
            .send(NodeIdentity::new("node-42"))
            .expect("identity update");

        let vitals: NodeVitals = quay_proto::decode(
            &timeout(Duration::from_secs(30), status.recv())
                .await
                .expect("vitals timeout")
                .expect("vitals")
                .payload,
        )
        .expect("decode vitals");
        assert_eq!(vitals.node_id, "node-42");
    }
}
