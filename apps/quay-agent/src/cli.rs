use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "quay-agent")]
#[command(about = "Quay per-node control-plane agent")]
pub struct Cli {
    /// Path to the persisted node configuration file. Rewritten in place
    /// whenever the node identity rotates.
    #[arg(long, env = "QUAY_CONFIG", default_value = "quay.toml")]
    pub config: PathBuf,

    /// Bus address override; falls back to the configured value.
    #[arg(long, env = "QUAY_BUS_URL")]
    pub bus_url: Option<String>,
}
