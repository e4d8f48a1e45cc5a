//! Shared protocol definitions for controller ↔ node-agent traffic.
//! Keeping this in a dedicated crate lets the control plane and the agent
//! evolve independently without pulling in runtime code.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Distributed-tracing correlation record carried on every control event
/// and acknowledgement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: String,
    pub baggage: HashMap<String, String>,
}

/// Control event addressed to a node. The payload is an ordered list of
/// string-keyed maps whose interpretation belongs to the matched handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: String,
    pub task_key: String,
    pub span_context: SpanContext,
    pub payload: Vec<HashMap<String, String>>,
}

/// Compact acknowledgement forwarded upstream for a routed event. Built
/// fresh per event, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    pub task_key: String,
    pub kind: String,
    pub node: String,
    pub span_context: SpanContext,
}

/// Workload operation requested over the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub org_id: String,
    pub namespace: String,
    pub name: String,
    pub operation: String,
    pub selector_labels: HashMap<String, String>,
    pub min_ready_seconds: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub name: String,
    pub selector_labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartAppResponse {
    pub success: bool,
    pub error_messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopAppResponse {
    pub success: bool,
    pub error_messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAppResponse {
    pub success: bool,
    pub error_messages: Vec<String>,
    pub apps: Vec<App>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthcheckAppResponse {
    pub success: bool,
    pub error_messages: Vec<String>,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityCheckAppResponse {
    pub success: bool,
    pub error_messages: Vec<String>,
    pub available: bool,
}

/// Combined query result: `ready` is the running subset of `total`, and
/// `available` is the readiness-window subset of `ready`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAllAppResponse {
    pub success: bool,
    pub error_messages: Vec<String>,
    pub total: Vec<App>,
    pub ready: Vec<App>,
    pub available: Vec<App>,
}

/// Periodic node heartbeat. Host facts ride along only on the first push
/// after process start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeVitals {
    pub node_id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub uptime_secs: u64,
    pub sent_at_unix: i64,
    pub host: Option<HostFacts>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostFacts {
    pub hostname: Option<String>,
    pub os: String,
    pub arch: String,
}

/// Inbound subscription topic for a node: the subtree under its id.
pub fn sync_topic(node_id: &str) -> String {
    format!("{}.>", node_id)
}

/// Correlation topic for a workload operation response. The subject (a
/// container name or query prefix) is appended only when non-empty.
pub fn response_topic(node_id: &str, operation: &str, subject: &str) -> String {
    let mut topic = format!("{}.app_operation.{}_app", node_id, operation);
    if !subject.is_empty() {
        topic.push('.');
        topic.push_str(subject);
    }
    topic
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] bincode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] bincode::Error),
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(value).map_err(CodecError::Encode)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(CodecError::Decode)
}
