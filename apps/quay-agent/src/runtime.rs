use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::Docker;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container runtime error: {0}")]
    Driver(String),
}

/// Live view of one container as reported by the runtime. Never cached;
/// the executor fetches fresh on every operation. The name is reported
/// verbatim and may carry the runtime's leading separator.
#[derive(Debug, Clone)]
pub struct ContainerRecord {
    pub name: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct ContainerStatus {
    pub running: bool,
    /// RFC3339 start timestamp, verbatim from the runtime.
    pub started_at: Option<String>,
}

/// Seam over the local container runtime. The driver's transport and
/// defaults (including timeouts) are its own concern.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Creates a container and returns its runtime id.
    async fn create(
        &self,
        name: &str,
        image: &str,
        cmd: &[String],
        labels: &HashMap<String, String>,
    ) -> Result<String, RuntimeError>;

    async fn start(&self, id_or_name: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;

    /// Lists containers, running or not, whose labels satisfy every
    /// `key=value` filter.
    async fn list(&self, label_filters: &[String]) -> Result<Vec<ContainerRecord>, RuntimeError>;

    async fn inspect(&self, name: &str) -> Result<ContainerStatus, RuntimeError>;
}

/// Docker engine driver.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults().map_err(driver)?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create(
        &self,
        name: &str,
        image: &str,
        cmd: &[String],
        labels: &HashMap<String, String>,
    ) -> Result<String, RuntimeError> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(cmd.to_vec()),
            labels: Some(labels.clone()),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(driver)?;
        Ok(created.id)
    }

    async fn start(&self, id_or_name: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id_or_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(driver)
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.docker
            .stop_container(name, None::<StopContainerOptions>)
            .await
            .map_err(driver)
    }

    async fn list(&self, label_filters: &[String]) -> Result<Vec<ContainerRecord>, RuntimeError> {
        let filters = HashMap::from([("label".to_string(), label_filters.to_vec())]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let summaries = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(driver)?;
        Ok(summaries
            .into_iter()
            .map(|summary| ContainerRecord {
                name: summary
                    .names
                    .and_then(|names| names.into_iter().next())
                    .unwrap_or_default(),
                labels: summary.labels.unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect(&self, name: &str) -> Result<ContainerStatus, RuntimeError> {
        let info = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(driver)?;
        let state = info.state.unwrap_or_default();
        Ok(ContainerStatus {
            running: state.running.unwrap_or(false),
            started_at: state.started_at,
        })
    }
}

fn driver(err: bollard::errors::Error) -> RuntimeError {
    RuntimeError::Driver(err.to_string())
}
