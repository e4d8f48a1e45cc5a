use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use quay_proto::{
    App, AvailabilityCheckAppResponse, HealthcheckAppResponse, OperationRequest,
    QueryAllAppResponse, QueryAppResponse, StartAppResponse, StopAppResponse,
};
use serde::Serialize;
use topic_bus::{Bus, Subscription};
use tracing::{debug, info, warn};

use crate::config::{NodeConfig, RuntimeSettings};
use crate::runtime::{ContainerRecord, ContainerRuntime};

/// Command every started workload runs; keeps the container alive until an
/// explicit stop.
const PLACEHOLDER_CMD: [&str; 3] = ["ash", "-c", "while true; do sleep 1000; done"];

/// Executes workload operations requested over the bus and publishes
/// correlated responses. One task is spawned per request; handlers share
/// no mutable state, and two operations on the same container name race at
/// the runtime layer.
pub struct OperationExecutor<B, R> {
    shared: Arc<Shared<B, R>>,
    ops_topic: String,
}

struct Shared<B, R> {
    bus: Arc<B>,
    runtime: Arc<R>,
    node_id: String,
    image: String,
}

impl<B: Bus + 'static, R: ContainerRuntime + 'static> OperationExecutor<B, R> {
    pub fn new(
        bus: Arc<B>,
        runtime: Arc<R>,
        config: &NodeConfig,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                bus,
                runtime,
                node_id: config.node_id.clone(),
                image: settings.image,
            }),
            ops_topic: config.ops_topic.clone(),
        }
    }

    /// Subscribes to the operation request topic. Split from
    /// [`OperationExecutor::serve`] so a transport failure at startup stays
    /// fatal for the process.
    pub async fn subscribe(&self) -> Result<Subscription> {
        let sub = self
            .shared
            .bus
            .subscribe(&self.ops_topic)
            .await
            .context("failed to subscribe to operation requests")?;
        info!(target: "quay.ops", topic = %self.ops_topic, "operation executor listening");
        Ok(sub)
    }

    /// Drains operation requests, spawning one unit of work per request so
    /// a slow runtime call never blocks the next inbound operation.
    pub async fn serve(self, mut sub: Subscription) {
        while let Some(msg) = sub.recv().await {
            let request: OperationRequest = match quay_proto::decode(&msg.payload) {
                Ok(request) => request,
                Err(err) => {
                    debug!(
                        target: "quay.ops",
                        error = %err,
                        "discarding undecodable operation request"
                    );
                    continue;
                }
            };
            debug!(
                target: "quay.ops",
                operation = %request.operation,
                name = %request.name,
                "received app operation"
            );
            if let Err(err) = self.dispatch(request) {
                warn!(target: "quay.ops", error = %err, "rejected operation request");
            }
        }
    }

    /// Dispatch table keyed by operation name. Unknown operations surface
    /// an error to the delivery context; nothing is published for them.
    fn dispatch(&self, request: OperationRequest) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        match request.operation.as_str() {
            "start" => {
                tokio::spawn(async move { shared.handle_start(request).await });
            }
            "stop" => {
                tokio::spawn(async move { shared.handle_stop(request).await });
            }
            "query" => {
                tokio::spawn(async move { shared.handle_query(request).await });
            }
            "healthcheck" => {
                tokio::spawn(async move { shared.handle_healthcheck(request).await });
            }
            "availabilitycheck" => {
                tokio::spawn(async move { shared.handle_availability_check(request).await });
            }
            "query_healthy" => {
                tokio::spawn(async move { shared.handle_query_healthy(request).await });
            }
            "query_available" => {
                tokio::spawn(async move { shared.handle_query_available(request).await });
            }
            "query_all" => {
                tokio::spawn(async move { shared.handle_query_all(request).await });
            }
            other => bail!("unknown operation: {}", other),
        }
        Ok(())
    }
}

impl<B: Bus, R: ContainerRuntime> Shared<B, R> {
    async fn handle_start(&self, request: OperationRequest) {
        let mut error_messages = Vec::new();
        let cmd: Vec<String> = PLACEHOLDER_CMD.iter().map(|part| part.to_string()).collect();
        let container_id = match self
            .runtime
            .create(&request.name, &self.image, &cmd, &request.selector_labels)
            .await
        {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(target: "quay.ops", error = %err, name = %request.name, "failed to create container");
                error_messages.push(format!("Error creating container: {}", err));
                None
            }
        };
        let created = container_id.is_some();

        // The start attempt happens even when creation failed; the runtime
        // then sees an empty id and reports its own error.
        let started = match self
            .runtime
            .start(container_id.as_deref().unwrap_or_default())
            .await
        {
            Ok(()) => true,
            Err(err) => {
                warn!(target: "quay.ops", error = %err, name = %request.name, "failed to start container");
                error_messages.push(format!("Error starting container: {}", err));
                false
            }
        };

        let response = StartAppResponse {
            success: created && started,
            error_messages,
        };
        self.publish_response(&response, "start", &request.name).await;
    }

    async fn handle_stop(&self, request: OperationRequest) {
        let mut error_messages = Vec::new();
        let success = match self.runtime.stop(&request.name).await {
            Ok(()) => true,
            Err(err) => {
                warn!(target: "quay.ops", error = %err, name = %request.name, "failed to stop container");
                error_messages.push(format!("Error stopping container: {}", err));
                false
            }
        };
        let response = StopAppResponse {
            success,
            error_messages,
        };
        self.publish_response(&response, "stop", &request.name).await;
    }

    async fn handle_query(&self, request: OperationRequest) {
        let mut error_messages = Vec::new();
        let (records, success) = self.list_matches(&request, &mut error_messages).await;
        let apps = records.iter().map(app_for).collect();
        let response = QueryAppResponse {
            success,
            error_messages,
            apps,
        };
        self.publish_response(&response, "query", &request.name).await;
    }

    async fn handle_healthcheck(&self, request: OperationRequest) {
        let mut error_messages = Vec::new();
        let (healthy, success) = match self.runtime.inspect(&request.name).await {
            Ok(status) => (status.running, true),
            Err(err) => {
                warn!(target: "quay.ops", error = %err, name = %request.name, "failed to inspect container");
                error_messages.push(format!("Failed to inspect container: {}", err));
                (false, false)
            }
        };
        let response = HealthcheckAppResponse {
            success,
            error_messages,
            healthy,
        };
        self.publish_response(&response, "healthcheck", &request.name)
            .await;
    }

    async fn handle_availability_check(&self, request: OperationRequest) {
        let mut error_messages = Vec::new();
        let (available, success) = match self.runtime.inspect(&request.name).await {
            Ok(status) => {
                let available = status.running
                    && past_ready_window(
                        status.started_at.as_deref(),
                        request.min_ready_seconds,
                        &mut error_messages,
                    );
                (available, true)
            }
            Err(err) => {
                warn!(target: "quay.ops", error = %err, name = %request.name, "failed to inspect container");
                error_messages.push(format!("Failed to inspect container: {}", err));
                (false, false)
            }
        };
        let response = AvailabilityCheckAppResponse {
            success,
            error_messages,
            available,
        };
        self.publish_response(&response, "availabilitycheck", &request.name)
            .await;
    }

    async fn handle_query_healthy(&self, request: OperationRequest) {
        let mut error_messages = Vec::new();
        let (records, success) = self.list_matches(&request, &mut error_messages).await;
        let mut apps = Vec::new();
        for record in &records {
            let name = display_name(&record.name);
            match self.runtime.inspect(name).await {
                Ok(status) if status.running => apps.push(app_for(record)),
                Ok(_) => {}
                Err(err) => {
                    warn!(target: "quay.ops", error = %err, name = %name, "failed to inspect container");
                    error_messages.push(format!("Failed to inspect container: {}", err));
                }
            }
        }
        let response = QueryAppResponse {
            success,
            error_messages,
            apps,
        };
        self.publish_response(&response, "query_healthy", &request.name)
            .await;
    }

    async fn handle_query_available(&self, request: OperationRequest) {
        let mut error_messages = Vec::new();
        let (records, success) = self.list_matches(&request, &mut error_messages).await;
        let mut apps = Vec::new();
        for record in &records {
            let name = display_name(&record.name);
            match self.runtime.inspect(name).await {
                Ok(status) => {
                    if status.running
                        && past_ready_window(
                            status.started_at.as_deref(),
                            request.min_ready_seconds,
                            &mut error_messages,
                        )
                    {
                        apps.push(app_for(record));
                    }
                }
                Err(err) => {
                    warn!(target: "quay.ops", error = %err, name = %name, "failed to inspect container");
                    error_messages.push(format!("Failed to inspect container: {}", err));
                }
            }
        }
        let response = QueryAppResponse {
            success,
            error_messages,
            apps,
        };
        self.publish_response(&response, "query_available", &request.name)
            .await;
    }

    /// Single list plus one inspect per match, producing the three result
    /// tiers in one pass. Each tier is a subset of the one before it.
    async fn handle_query_all(&self, request: OperationRequest) {
        let mut error_messages = Vec::new();
        let (records, success) = self.list_matches(&request, &mut error_messages).await;
        let mut total = Vec::new();
        let mut ready = Vec::new();
        let mut available = Vec::new();
        for record in &records {
            let name = display_name(&record.name);
            let app = app_for(record);
            total.push(app.clone());
            match self.runtime.inspect(name).await {
                Ok(status) if status.running => {
                    ready.push(app.clone());
                    if past_ready_window(
                        status.started_at.as_deref(),
                        request.min_ready_seconds,
                        &mut error_messages,
                    ) {
                        available.push(app);
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(target: "quay.ops", error = %err, name = %name, "failed to inspect container");
                    error_messages.push(format!("Failed to inspect container: {}", err));
                }
            }
        }
        let response = QueryAllAppResponse {
            success,
            error_messages,
            total,
            ready,
            available,
        };
        self.publish_response(&response, "query_all", &request.name)
            .await;
    }

    async fn list_matches(
        &self,
        request: &OperationRequest,
        error_messages: &mut Vec<String>,
    ) -> (Vec<ContainerRecord>, bool) {
        let filters = label_filters(&request.name, &request.selector_labels);
        match self.runtime.list(&filters).await {
            Ok(records) => (records, true),
            Err(err) => {
                warn!(target: "quay.ops", error = %err, prefix = %request.name, "failed to list containers");
                error_messages.push(format!("Failed to list containers: {}", err));
                (Vec::new(), false)
            }
        }
    }

    /// Publishes the response to its correlation topic regardless of the
    /// operation's outcome. A publish failure is logged and swallowed.
    async fn publish_response<T: Serialize>(&self, response: &T, operation: &str, subject: &str) {
        let topic = quay_proto::response_topic(&self.node_id, operation, subject);
        let bytes = match quay_proto::encode(response) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(target: "quay.ops", error = %err, %topic, "failed to encode operation response");
                return;
            }
        };
        if let Err(err) = self.bus.publish(&topic, bytes.into()).await {
            warn!(target: "quay.ops", error = %err, %topic, "failed to publish operation response");
        } else {
            debug!(target: "quay.ops", %topic, "operation response published");
        }
    }
}

/// Matches are containers labelled `revision=<prefix>` and carrying every
/// selector label, all ANDed.
fn label_filters(prefix: &str, selector_labels: &HashMap<String, String>) -> Vec<String> {
    let mut filters = vec![format!("revision={}", prefix)];
    for (key, value) in selector_labels {
        filters.push(format!("{}={}", key, value));
    }
    filters
}

/// The runtime reports names with one leading separator; strip it.
fn display_name(raw: &str) -> &str {
    match raw.strip_prefix('/') {
        Some(rest) if !rest.is_empty() => rest,
        _ => raw,
    }
}

fn app_for(record: &ContainerRecord) -> App {
    App {
        name: display_name(&record.name).to_string(),
        selector_labels: record.labels.clone(),
    }
}

/// Equality counts: a container started exactly `min_ready_seconds` ago is
/// available. An unparseable start timestamp is reported and leaves the
/// container unavailable.
fn past_ready_window(
    started_at: Option<&str>,
    min_ready_seconds: i64,
    error_messages: &mut Vec<String>,
) -> bool {
    let Some(raw) = started_at else {
        error_messages.push("Failed to parse start time: timestamp missing".to_string());
        return false;
    };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(started) => {
            Utc::now().signed_duration_since(started) >= chrono::Duration::seconds(min_ready_seconds)
        }
        Err(err) => {
            warn!(target: "quay.ops", error = %err, "failed to parse container start time");
            error_messages.push(format!("Failed to parse start time: {}", err));
            false
        }
    }
}
