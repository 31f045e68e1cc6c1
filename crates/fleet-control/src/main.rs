//! Mission control (`mission-control`)
//!
//! Connects to the configured node agents and keeps the master node network
//! up to date with what they report.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use fleet_control::{ControlConfig, MissionControl};

#[derive(Parser, Debug)]
#[command(name = "mission-control", version, about = "Fleet mission control")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let path = cli
        .config
        .or_else(ControlConfig::default_path)
        .ok_or_else(|| anyhow::anyhow!("no --config given and no default config directory"))?;
    let config = ControlConfig::load(&path)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        agents = config.agent_addresses().len(),
        nodes = config.nodes.len(),
        "Mission control starting"
    );

    let mission = MissionControl::new(config).await;
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutdown signal received");
                    shutdown.cancel();
                }
                Err(e) => tracing::error!(error = %e, "Cannot listen for shutdown signal"),
            }
        });
    }

    mission.run(shutdown).await?;
    tracing::info!("Mission control stopped");
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
