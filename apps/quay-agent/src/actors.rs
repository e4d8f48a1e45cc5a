use std::sync::Arc;

use async_trait::async_trait;
use quay_proto::{Event, Update};
use tokio::sync::{mpsc, watch};
use topic_bus::Bus;
use tracing::{debug, warn};

use crate::agent::{NodeIdentity, RotateRequest};
use crate::router::Actor;
use crate::span::TraceSpan;

/// Upstream sink for forwarded acknowledgements. Fire-and-forget: failures
/// are logged by the implementation, never retried and never surfaced back
/// to the bus.
#[async_trait]
pub trait Uploader: Send + Sync {
    fn node_id(&self) -> String;
    async fn upload(&self, update: Update);
}

/// Publishes acknowledgements to the configured update topic. Reads the
/// node id through the identity watch channel so rotations are picked up
/// without a torn read.
pub struct BusUploader<B: Bus> {
    bus: Arc<B>,
    topic: String,
    identity: watch::Receiver<NodeIdentity>,
}

impl<B: Bus> BusUploader<B> {
    pub fn new(bus: Arc<B>, topic: String, identity: watch::Receiver<NodeIdentity>) -> Self {
        Self {
            bus,
            topic,
            identity,
        }
    }
}

#[async_trait]
impl<B: Bus> Uploader for BusUploader<B> {
    fn node_id(&self) -> String {
        self.identity.borrow().node_id.clone()
    }

    async fn upload(&self, update: Update) {
        let bytes = match quay_proto::encode(&update) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(target: "quay.sync", error = %err, "failed to encode update");
                return;
            }
        };
        if let Err(err) = self.bus.publish(&self.topic, bytes.into()).await {
            warn!(
                target: "quay.sync",
                error = %err,
                topic = %self.topic,
                task_key = %update.task_key,
                "failed to forward update"
            );
        }
    }
}

/// Derives and closes a child span for the event, then forwards a fresh
/// acknowledgement upstream.
async fn forward<U: Uploader + ?Sized>(uploader: &U, event: &Event, operation: &str) {
    let context = TraceSpan::from_remote(&event.span_context, operation).finish();
    uploader
        .upload(Update {
            task_key: event.task_key.clone(),
            kind: event.kind.clone(),
            node: uploader.node_id(),
            span_context: context,
        })
        .await;
}

pub struct ConfigsActor<U> {
    uploader: Arc<U>,
}

impl<U> ConfigsActor<U> {
    pub fn new(uploader: Arc<U>) -> Self {
        Self { uploader }
    }
}

#[async_trait]
impl<U: Uploader> Actor for ConfigsActor<U> {
    async fn handle(&self, event: Event) {
        debug!(target: "quay.actors", task_key = %event.task_key, "received configs event");
        forward(self.uploader.as_ref(), &event, "actor.configs").await;
    }
}

pub struct ActionsActor<U> {
    uploader: Arc<U>,
}

impl<U> ActionsActor<U> {
    pub fn new(uploader: Arc<U>) -> Self {
        Self { uploader }
    }
}

#[async_trait]
impl<U: Uploader> Actor for ActionsActor<U> {
    async fn handle(&self, event: Event) {
        debug!(target: "quay.actors", task_key = %event.task_key, "received actions event");
        forward(self.uploader.as_ref(), &event, "actor.actions").await;
    }
}

pub struct SecretsActor<U> {
    uploader: Arc<U>,
}

impl<U> SecretsActor<U> {
    pub fn new(uploader: Arc<U>) -> Self {
        Self { uploader }
    }
}

#[async_trait]
impl<U: Uploader> Actor for SecretsActor<U> {
    async fn handle(&self, event: Event) {
        debug!(target: "quay.actors", task_key = %event.task_key, "received secrets event");
        forward(self.uploader.as_ref(), &event, "actor.secrets").await;
    }
}

/// Forwards topology updates like the other actors, then scans the payload
/// for an entry renaming this node and asks the agent mailbox to rotate.
pub struct TopologyActor<U> {
    uploader: Arc<U>,
    rotations: mpsc::Sender<RotateRequest>,
}

impl<U> TopologyActor<U> {
    pub fn new(uploader: Arc<U>, rotations: mpsc::Sender<RotateRequest>) -> Self {
        Self {
            uploader,
            rotations,
        }
    }
}

#[async_trait]
impl<U: Uploader> Actor for TopologyActor<U> {
    async fn handle(&self, event: Event) {
        debug!(target: "quay.actors", task_key = %event.task_key, "received topology event");
        forward(self.uploader.as_ref(), &event, "actor.topology").await;

        let node_id = self.uploader.node_id();
        for entry in &event.payload {
            if entry.get("ID").map(String::as_str) != Some(node_id.as_str()) {
                continue;
            }
            let Some(new_id) = entry.get("NEW_ID") else {
                continue;
            };
            if let Err(err) = self
                .rotations
                .send(RotateRequest {
                    new_id: new_id.clone(),
                })
                .await
            {
                warn!(target: "quay.actors", error = %err, "agent mailbox unavailable for rotation");
            }
        }
    }
}
