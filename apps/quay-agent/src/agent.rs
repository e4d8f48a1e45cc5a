use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use quay_proto::Event;
use tokio::sync::{mpsc, watch};
use topic_bus::{Bus, BusMessage, Subscription};
use tracing::{debug, error, info, warn};

use crate::config::NodeConfig;
use crate::router::ActorRegistry;

/// Current node identity. Mutated exclusively by the rotation protocol and
/// published to readers through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: String,
    pub sync_topic: String,
}

impl NodeIdentity {
    pub fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            sync_topic: quay_proto::sync_topic(node_id),
        }
    }
}

/// Rotation request delivered to the agent mailbox.
#[derive(Debug)]
pub struct RotateRequest {
    pub new_id: String,
}

enum Wake {
    Rotate(RotateRequest),
    Message(BusMessage),
    Closed,
}

/// Owns the node identity and the single inbound subscription. Rotation
/// requests and event delivery share one mailbox, so identity changes are
/// strictly ordered with dispatch and no reader ever observes a torn
/// id/topic pair.
pub struct SyncAgent<B: Bus> {
    bus: Arc<B>,
    registry: ActorRegistry,
    config: NodeConfig,
    config_path: PathBuf,
    identity_tx: watch::Sender<NodeIdentity>,
    rotations: mpsc::Receiver<RotateRequest>,
}

impl<B: Bus> SyncAgent<B> {
    pub fn new(
        bus: Arc<B>,
        registry: ActorRegistry,
        config: NodeConfig,
        config_path: PathBuf,
        identity_tx: watch::Sender<NodeIdentity>,
        rotations: mpsc::Receiver<RotateRequest>,
    ) -> Self {
        Self {
            bus,
            registry,
            config,
            config_path,
            identity_tx,
            rotations,
        }
    }

    /// Runs the dispatch loop until the bus goes away. The initial
    /// subscribe is fatal; from then on exactly one subscription is active
    /// at any instant, except for the brief unsubscribed window inside
    /// [`SyncAgent::rotate`].
    pub async fn run(mut self) -> Result<()> {
        let mut sub = self
            .bus
            .subscribe(&self.config.sync_topic)
            .await
            .context("failed to subscribe to the inbound topic")?;
        info!(
            target: "quay.agent",
            node = %self.config.node_id,
            topic = %self.config.sync_topic,
            "inbound subscription active"
        );

        loop {
            let wake = tokio::select! {
                maybe = self.rotations.recv() => match maybe {
                    Some(request) => Wake::Rotate(request),
                    None => Wake::Closed,
                },
                msg = sub.recv() => match msg {
                    Some(msg) => Wake::Message(msg),
                    None => Wake::Closed,
                },
            };
            match wake {
                Wake::Rotate(request) => {
                    sub = self.rotate(sub, &request.new_id).await?;
                }
                Wake::Message(msg) => self.deliver(msg).await,
                Wake::Closed => {
                    warn!(target: "quay.agent", "mailbox closed; stopping dispatch loop");
                    return Ok(());
                }
            }
        }
    }

    /// Rotation protocol: unsubscribe, mutate the identity, notify
    /// watchers, persist, resubscribe. The unsubscribe completes before
    /// the new subscription exists; events published in that window are
    /// lost, not queued. A persistence failure is logged and does not roll
    /// back the in-memory identity.
    async fn rotate(&mut self, sub: Subscription, new_id: &str) -> Result<Subscription> {
        info!(
            target: "quay.agent",
            old_id = %self.config.node_id,
            %new_id,
            "rotating node identity"
        );
        sub.unsubscribe();

        let new_topic = quay_proto::sync_topic(new_id);
        self.config.update_id(new_id);
        self.config.update_sync_topic(&new_topic);
        let _ = self.identity_tx.send(NodeIdentity {
            node_id: self.config.node_id.clone(),
            sync_topic: self.config.sync_topic.clone(),
        });
        if let Err(err) = self.config.save(&self.config_path) {
            error!(
                target: "quay.agent",
                error = %err,
                path = %self.config_path.display(),
                "failed to persist rotated identity; continuing with in-memory state"
            );
        }

        let sub = self
            .bus
            .subscribe(&self.config.sync_topic)
            .await
            .context("failed to resubscribe after identity rotation")?;
        info!(
            target: "quay.agent",
            node = %self.config.node_id,
            topic = %self.config.sync_topic,
            "inbound subscription active"
        );
        Ok(sub)
    }

    async fn deliver(&self, msg: BusMessage) {
        let event: Event = match quay_proto::decode(&msg.payload) {
            Ok(event) => event,
            Err(err) => {
                debug!(
                    target: "quay.agent",
                    error = %err,
                    topic = %msg.topic,
                    "discarding undecodable event"
                );
                return;
            }
        };
        self.registry.dispatch(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::{BusUploader, TopologyActor};
    use crate::router::Actor;
    use async_trait::async_trait;
    use quay_proto::{SpanContext, Update};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};
    use topic_bus::LocalBus;

    fn sample_config() -> NodeConfig {
        NodeConfig {
            version: "1".to_string(),
            node_id: "node-1".to_string(),
            sync_topic: "node-1.>".to_string(),
            update_topic: "upstream.updates".to_string(),
            status_topic: "upstream.status".to_string(),
            ops_topic: "app_operation.node-1".to_string(),
            name: "worker-a".to_string(),
            bus_url: "redis://localhost:6379".to_string(),
            heartbeat_period_secs: 30,
            labels: HashMap::new(),
        }
    }

    fn event(kind: &str, task_key: &str, payload: Vec<HashMap<String, String>>) -> Event {
        Event {
            kind: kind.to_string(),
            task_key: task_key.to_string(),
            span_context: SpanContext::default(),
            payload,
        }
    }

    struct Recording {
        tx: mpsc::Sender<String>,
    }

    #[async_trait]
    impl Actor for Recording {
        async fn handle(&self, event: Event) {
            let _ = self.tx.send(event.task_key).await;
        }
    }

    #[tokio::test]
    async fn rotation_is_idempotent_and_moves_the_subscription() {
        let bus = Arc::new(LocalBus::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("quay.toml");
        let config = sample_config();
        config.save(&path).expect("seed config");

        let (seen_tx, mut seen_rx) = mpsc::channel(16);
        let mut registry = ActorRegistry::new();
        registry.register("configs", Arc::new(Recording { tx: seen_tx }));

        let (identity_tx, mut identity_rx) = watch::channel(NodeIdentity::new("node-1"));
        let (rotate_tx, rotate_rx) = mpsc::channel(4);
        let agent = SyncAgent::new(bus.clone(), registry, config, path.clone(), identity_tx, rotate_rx);
        let _loop = tokio::spawn(agent.run());

        for _ in 0..2 {
            rotate_tx
                .send(RotateRequest {
                    new_id: "node-42".to_string(),
                })
                .await
                .expect("send rotation");
        }

        timeout(Duration::from_secs(2), identity_rx.changed())
            .await
            .expect("identity change timeout")
            .expect("identity watch alive");
        {
            let identity = identity_rx.borrow();
            assert_eq!(identity.node_id, "node-42");
            assert_eq!(identity.sync_topic, "node-42.>");
        }

        // Persisted configuration reflects the rotated identity.
        let reloaded = timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(loaded) = NodeConfig::load(&path) {
                    if loaded.node_id == "node-42" {
                        break loaded;
                    }
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("persisted config timeout");
        assert_eq!(reloaded.sync_topic, "node-42.>");

        // Events on the old topic are lost; the new topic is live. Poll the
        // new topic until the resubscribe lands, then check ordering.
        let received = timeout(Duration::from_secs(2), async {
            loop {
                bus.publish(
                    "node-1.sync",
                    quay_proto::encode(&event("configs", "old", Vec::new()))
                        .expect("encode")
                        .into(),
                )
                .await
                .expect("publish old");
                bus.publish(
                    "node-42.sync",
                    quay_proto::encode(&event("configs", "new", Vec::new()))
                        .expect("encode")
                        .into(),
                )
                .await
                .expect("publish new");
                if let Ok(Some(task_key)) =
                    timeout(Duration::from_millis(50), seen_rx.recv()).await
                {
                    break task_key;
                }
            }
        })
        .await
        .expect("delivery timeout");
        assert_eq!(received, "new");
    }

    #[tokio::test]
    async fn topology_event_rotates_identity_end_to_end() {
        let bus = Arc::new(LocalBus::new());
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("quay.toml");
        let config = sample_config();
        config.save(&path).expect("seed config");

        let (identity_tx, identity_rx) = watch::channel(NodeIdentity::new("node-1"));
        let (rotate_tx, rotate_rx) = mpsc::channel(4);
        let uploader = Arc::new(BusUploader::new(
            bus.clone(),
            "upstream.updates".to_string(),
            identity_rx.clone(),
        ));
        let mut registry = ActorRegistry::new();
        registry.register("topology", Arc::new(TopologyActor::new(uploader, rotate_tx)));

        let mut updates = bus
            .subscribe("upstream.updates")
            .await
            .expect("subscribe updates");

        let agent = SyncAgent::new(bus.clone(), registry, config, path.clone(), identity_tx, rotate_rx);
        let _loop = tokio::spawn(agent.run());

        let topology = event(
            "topology",
            "task-7",
            vec![HashMap::from([
                ("ID".to_string(), "node-1".to_string()),
                ("NEW_ID".to_string(), "node-42".to_string()),
            ])],
        );
        let bytes = quay_proto::encode(&topology).expect("encode");

        timeout(Duration::from_secs(2), async {
            loop {
                bus.publish("node-1.sync", bytes.clone().into())
                    .await
                    .expect("publish topology");
                if identity_rx.borrow().node_id == "node-42" {
                    break;
                }
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("rotation timeout");

        assert_eq!(identity_rx.borrow().sync_topic, "node-42.>");
        let reloaded = NodeConfig::load(&path).expect("reload config");
        assert_eq!(reloaded.node_id, "node-42");
        assert_eq!(reloaded.sync_topic, "node-42.>");

        // The forwarded acknowledgement went upstream before the rotation
        // was triggered, stamped with the identity current at that moment.
        let msg = timeout(Duration::from_secs(2), updates.recv())
            .await
            .expect("update timeout")
            .expect("update message");
        let update: Update = quay_proto::decode(&msg.payload).expect("decode update");
        assert_eq!(update.task_key, "task-7");
        assert_eq!(update.kind, "topology");
        assert_eq!(update.node, "node-1");
    }
}
