use quay_proto::SpanContext;
use rand::RngCore;
use tracing::debug;

/// Child span derived from a remote parent context. Span creation here is
/// identifier bookkeeping only; the tracing backend proper lives upstream
/// and correlates on the forwarded ids.
pub struct TraceSpan {
    operation: String,
    context: SpanContext,
}

impl TraceSpan {
    pub fn from_remote(parent: &SpanContext, operation: &str) -> Self {
        let trace_id = if parent.trace_id.is_empty() {
            new_id()
        } else {
            parent.trace_id.clone()
        };
        Self {
            operation: operation.to_string(),
            context: SpanContext {
                trace_id,
                span_id: new_id(),
                parent_span_id: parent.span_id.clone(),
                baggage: parent.baggage.clone(),
            },
        }
    }

    /// Closes the span and hands back its serialized identifiers.
    pub fn finish(self) -> SpanContext {
        debug!(
            target: "quay.span",
            operation = %self.operation,
            trace_id = %self.context.trace_id,
            span_id = %self.context.span_id,
            parent_span_id = %self.context.parent_span_id,
            "span closed"
        );
        self.context
    }
}

fn new_id() -> String {
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_span_chains_onto_parent() {
        let parent = SpanContext {
            trace_id: "trace-7".to_string(),
            span_id: "span-3".to_string(),
            parent_span_id: "span-1".to_string(),
            baggage: std::collections::HashMap::from([(
                "tenant".to_string(),
                "acme".to_string(),
            )]),
        };
        let ctx = TraceSpan::from_remote(&parent, "actor.configs").finish();
        assert_eq!(ctx.trace_id, "trace-7");
        assert_eq!(ctx.parent_span_id, "span-3");
        assert_ne!(ctx.span_id, parent.span_id);
        assert_eq!(ctx.baggage.get("tenant").map(String::as_str), Some("acme"));
    }

    #[test]
    fn starts_a_trace_when_parent_has_none() {
        let ctx = TraceSpan::from_remote(&SpanContext::default(), "actor.actions").finish();
        assert!(!ctx.trace_id.is_empty());
        assert!(!ctx.span_id.is_empty());
        assert!(ctx.parent_span_id.is_empty());
    }
}
