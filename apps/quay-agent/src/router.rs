use std::sync::Arc;

use async_trait::async_trait;
use quay_proto::Event;
use tracing::{debug, warn};

/// A named, single-purpose processor for routed control events. Handlers
/// run inside the delivery context; a slow handler blocks further delivery
/// on that subscription.
#[async_trait]
pub trait Actor: Send + Sync {
    async fn handle(&self, event: Event);
}

/// Ordered handler registry. Built once at startup and immutable
/// thereafter; registration order is the tie-break when several handler
/// names match a routing key.
#[derive(Default)]
pub struct ActorRegistry {
    actors: Vec<(String, Arc<dyn Actor>)>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, actor: Arc<dyn Actor>) {
        self.actors.push((name.into(), actor));
    }

    /// Routing rule: the final `:`-separated segment of the event kind
    /// selects the first registered handler whose name contains it as a
    /// substring. Deliberately loose; do not tighten without a settled
    /// event-kind taxonomy.
    fn resolve(&self, kind: &str) -> Option<&(String, Arc<dyn Actor>)> {
        let key = kind.rsplit(':').next().unwrap_or(kind);
        self.actors.iter().find(|(name, _)| name.contains(key))
    }

    /// Dispatches to exactly one handler, or drops the event when none
    /// matches. No dead-letter queue, no retry.
    pub async fn dispatch(&self, event: Event) {
        match self.resolve(&event.kind) {
            Some((name, actor)) => {
                debug!(target: "quay.router", kind = %event.kind, handler = %name, "routing event");
                actor.handle(event).await;
            }
            None => {
                warn!(target: "quay.router", kind = %event.kind, "no handler for event kind; dropping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quay_proto::SpanContext;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Actor for Recorder {
        async fn handle(&self, _event: Event) {
            self.seen.lock().unwrap().push(self.label);
        }
    }

    fn event(kind: &str) -> Event {
        Event {
            kind: kind.to_string(),
            task_key: "task-1".to_string(),
            span_context: SpanContext::default(),
            payload: Vec::new(),
        }
    }

    fn registry_with(
        names: &[(&'static str, &'static str)],
    ) -> (ActorRegistry, Arc<Mutex<Vec<&'static str>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = ActorRegistry::new();
        for (name, label) in names {
            registry.register(
                *name,
                Arc::new(Recorder {
                    label,
                    seen: seen.clone(),
                }),
            );
        }
        (registry, seen)
    }

    #[tokio::test]
    async fn routes_on_final_colon_segment() {
        let (registry, seen) = registry_with(&[("configs", "configs"), ("actions", "actions")]);
        registry.dispatch(event("mutate:actions")).await;
        assert_eq!(seen.lock().unwrap().as_slice(), ["actions"]);
    }

    #[tokio::test]
    async fn substring_match_selects_a_handler() {
        let (registry, seen) = registry_with(&[("topology", "topology")]);
        registry.dispatch(event("topo")).await;
        assert_eq!(seen.lock().unwrap().as_slice(), ["topology"]);
    }

    #[tokio::test]
    async fn registration_order_breaks_ambiguity() {
        // Both names contain "s"; the first registered handler wins.
        let (registry, seen) = registry_with(&[("configs", "configs"), ("secrets", "secrets")]);
        registry.dispatch(event("s")).await;
        registry.dispatch(event("s")).await;
        assert_eq!(seen.lock().unwrap().as_slice(), ["configs", "configs"]);
    }

    #[tokio::test]
    async fn drops_events_with_no_matching_handler() {
        let (registry, seen) = registry_with(&[("configs", "configs")]);
        registry.dispatch(event("unknown:zzz")).await;
        assert!(seen.lock().unwrap().is_empty());
    }
}
