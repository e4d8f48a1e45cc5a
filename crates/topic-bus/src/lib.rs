use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus transport error: {0}")]
    Transport(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Publish/subscribe by dot-delimited topic. A trailing `>` segment in a
/// subscription topic matches the whole subtree under the preceding
/// segments.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> BusResult<Subscription>;
    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}

/// Handle for one active subscription. Dropping it (or calling
/// [`Subscription::unsubscribe`]) detaches from the bus; `unsubscribe`
/// completes before it returns, so callers can sequence a resubscribe
/// after it.
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<BusMessage>,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(
        topic: impl Into<String>,
        rx: mpsc::Receiver<BusMessage>,
        cancel: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            topic: topic.into(),
            rx,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Receives the next message, or `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish()
    }
}

/// Returns true when `topic` matches `pattern`. Patterns are compared
/// segment by segment; a final `>` segment matches one or more remaining
/// topic segments.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_segments = pattern.split('.');
    let mut topic_segments = topic.split('.');
    loop {
        match (pattern_segments.next(), topic_segments.next()) {
            (Some(">"), Some(_)) => return true,
            (Some(expected), Some(actual)) => {
                if expected != actual {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}

const SUBSCRIPTION_BUFFER: usize = 64;

/// Simple in-memory bus for tests and non-transport contexts. Delivery is
/// fire-and-forget: a subscriber that stops draining its buffer loses
/// messages instead of backpressuring publishers.
#[derive(Default)]
pub struct LocalBus {
    inner: Arc<LocalState>,
}

#[derive(Default)]
struct LocalState {
    next_id: AtomicU64,
    subs: parking_lot::RwLock<Vec<LocalSub>>,
}

struct LocalSub {
    id: u64,
    pattern: String,
    tx: mpsc::Sender<BusMessage>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn subscribe(&self, topic: &str) -> BusResult<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subs.write().push(LocalSub {
            id,
            pattern: topic.to_string(),
            tx,
        });
        let inner = Arc::clone(&self.inner);
        Ok(Subscription::new(topic, rx, move || {
            inner.subs.write().retain(|sub| sub.id != id);
        }))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let subs = self.inner.subs.read();
        for sub in subs.iter() {
            if topic_matches(&sub.pattern, topic) {
                let _ = sub.tx.try_send(BusMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Bus transport over redis pub/sub. Subscriptions always go through
/// `PSUBSCRIBE`; a trailing `>` is rewritten to a glob so the pattern
/// covers the topic subtree.
pub struct RedisBus {
    client: redis::Client,
    publish_conn: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(url: &str) -> BusResult<Self> {
        let client = redis::Client::open(url).map_err(transport)?;
        let publish_conn = ConnectionManager::new(client.clone())
            .await
            .map_err(transport)?;
        Ok(Self {
            client,
            publish_conn,
        })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn subscribe(&self, topic: &str) -> BusResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(transport)?;
        pubsub
            .psubscribe(subtree_pattern(topic))
            .await
            .map_err(transport)?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        // The forwarding task owns the pubsub connection; aborting it drops
        // the connection, which ends the server-side subscription.
        let worker = tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let message = BusMessage {
                    topic: msg.get_channel_name().to_string(),
                    payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
        });
        Ok(Subscription::new(topic, rx, move || worker.abort()))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let mut conn = self.publish_conn.clone();
        conn.publish::<_, _, ()>(topic, payload.as_ref())
            .await
            .map_err(transport)
    }
}

fn subtree_pattern(topic: &str) -> String {
    match topic.strip_suffix('>') {
        Some(prefix) => format!("{}*", prefix),
        None => topic.to_string(),
    }
}

fn transport(err: redis::RedisError) -> BusError {
    BusError::Transport(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_exact_topics() {
        assert!(topic_matches("node-1.sync", "node-1.sync"));
        assert!(!topic_matches("node-1.sync", "node-1.other"));
        assert!(!topic_matches("node-1.sync", "node-1.sync.extra"));
    }

    #[test]
    fn trailing_wildcard_matches_subtree() {
        assert!(topic_matches("node-1.>", "node-1.sync"));
        assert!(topic_matches("node-1.>", "node-1.app_operation.start_app.web-1"));
        assert!(!topic_matches("node-1.>", "node-1"));
        assert!(!topic_matches("node-1.>", "node-2.sync"));
    }

    #[test]
    fn rewrites_wildcard_for_redis_patterns() {
        assert_eq!(subtree_pattern("node-1.>"), "node-1.*");
        assert_eq!(subtree_pattern("node-1.sync"), "node-1.sync");
    }

    #[tokio::test]
    async fn local_bus_round_trip() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("node-1.>").await.expect("subscribe ok");
        bus.publish("node-1.sync", Bytes::from_static(b"ping"))
            .await
            .expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.topic, "node-1.sync");
        assert_eq!(msg.payload, Bytes::from_static(b"ping"));
    }

    #[tokio::test]
    async fn local_bus_skips_non_matching_subscribers() {
        let bus = LocalBus::new();
        let mut sub = bus.subscribe("node-1.>").await.expect("subscribe ok");
        bus.publish("node-2.sync", Bytes::from_static(b"other"))
            .await
            .expect("publish ok");
        bus.publish("node-1.sync", Bytes::from_static(b"mine"))
            .await
            .expect("publish ok");
        let msg = sub.recv().await.expect("receive ok");
        assert_eq!(msg.payload, Bytes::from_static(b"mine"));
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = LocalBus::new();
        let sub = bus.subscribe("node-1.>").await.expect("subscribe ok");
        sub.unsubscribe();
        // Publishing into a topic with no subscribers still succeeds.
        bus.publish("node-1.sync", Bytes::from_static(b"lost"))
            .await
            .expect("publish ok");
        assert!(bus.inner.subs.read().is_empty());
    }
}
