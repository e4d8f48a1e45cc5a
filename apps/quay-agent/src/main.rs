use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use quay_agent::actors::{ActionsActor, BusUploader, ConfigsActor, SecretsActor, TopologyActor};
use quay_agent::agent::{NodeIdentity, SyncAgent};
use quay_agent::cli::Cli;
use quay_agent::config::{NodeConfig, RuntimeSettings};
use quay_agent::executor::OperationExecutor;
use quay_agent::heartbeat::Heartbeat;
use quay_agent::router::ActorRegistry;
use quay_agent::runtime::DockerRuntime;
use topic_bus::RedisBus;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = NodeConfig::load(&cli.config)?;
    let bus_url = cli.bus_url.clone().unwrap_or_else(|| config.bus_url.clone());
    info!(node = %config.node_id, topic = %config.sync_topic, "starting quay agent");

    let bus = Arc::new(
        RedisBus::connect(&bus_url)
            .await
            .context("failed to connect to the message bus")?,
    );
    let runtime =
        Arc::new(DockerRuntime::connect().context("failed to connect to the container runtime")?);

    let (identity_tx, identity_rx) = watch::channel(NodeIdentity::new(&config.node_id));
    let (rotate_tx, rotate_rx) = mpsc::channel(8);

    let uploader = Arc::new(BusUploader::new(
        bus.clone(),
        config.update_topic.clone(),
        identity_rx.clone(),
    ));
    let mut registry = ActorRegistry::new();
    registry.register("configs", Arc::new(ConfigsActor::new(uploader.clone())));
    registry.register("actions", Arc::new(ActionsActor::new(uploader.clone())));
    registry.register("secrets", Arc::new(SecretsActor::new(uploader.clone())));
    registry.register(
        "topology",
        Arc::new(TopologyActor::new(uploader, rotate_tx)),
    );

    let heartbeat = Heartbeat::new(bus.clone(), &config, identity_rx);
    tokio::spawn(heartbeat.run());

    let executor = OperationExecutor::new(
        bus.clone(),
        runtime,
        &config,
        RuntimeSettings::from_env(),
    );
    let ops_sub = executor.subscribe().await?;
    tokio::spawn(executor.serve(ops_sub));

    let agent = SyncAgent::new(
        bus,
        registry,
        config,
        cli.config.clone(),
        identity_tx,
        rotate_rx,
    );

    tokio::select! {
        result = agent.run() => result.context("agent dispatch loop failed")?,
        _ = signal::ctrl_c() => info!("interrupt received; shutting down"),
    }
    Ok(())
}
