use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Persisted node configuration. The file is rewritten wholesale on every
/// identity rotation; nothing is appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub version: String,
    pub node_id: String,
    /// Inbound subscription topic, `<node_id>.>`.
    pub sync_topic: String,
    /// Upstream topic for forwarded acknowledgements.
    pub update_topic: String,
    /// Topic for periodic node vitals.
    pub status_topic: String,
    /// Topic the workload operation executor listens on.
    pub ops_topic: String,
    pub name: String,
    pub bus_url: String,
    pub heartbeat_period_secs: u64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

#[derive(Serialize, Deserialize)]
struct ConfigFile {
    node: NodeConfig,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read node config at {}", path.display()))?;
        let file: ConfigFile =
            toml::from_str(&raw).context("node config is not valid TOML")?;
        Ok(file.node)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let raw = toml::to_string_pretty(&ConfigFile { node: self.clone() })
            .context("failed to serialize node config")?;
        fs::write(path, raw)
            .with_context(|| format!("failed to write node config at {}", path.display()))?;
        Ok(())
    }

    pub fn update_id(&mut self, new_id: &str) {
        self.node_id = new_id.to_string();
    }

    pub fn update_sync_topic(&mut self, topic: &str) {
        self.sync_topic = topic.to_string();
    }
}

/// Settings the executor reads from the environment rather than the
/// persisted config file.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Image used for every `start` operation.
    pub image: String,
}

impl RuntimeSettings {
    pub fn from_env() -> Self {
        Self {
            image: env::var("QUAY_RUNTIME_IMAGE").unwrap_or_else(|_| "alpine:3.20".to_string()),
        }
    }
}
