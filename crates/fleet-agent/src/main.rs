//! Fleet node agent (`fleet-agent`)
//!
//! Listens for mission control, runs the nodes it is told to run and reports
//! their state back.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use fleet_agent::{Agent, AgentConfig, ProcessExecutor};

#[derive(Parser, Debug)]
#[command(name = "fleet-agent", version, about = "Fleet node agent")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overriding the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let mut config = match cli.config.or_else(AgentConfig::default_path) {
        Some(path) => AgentConfig::load(&path)?,
        None => AgentConfig::default(),
    };
    if let Some(listen) = cli.listen {
        config.agent.listen = listen;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        listen = %config.agent.listen,
        deploy_root = %config.deploy.root.display(),
        "Fleet agent starting"
    );

    let executor = Arc::new(ProcessExecutor::new(&config.executor));
    let agent = Agent::new(config, executor);

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

    agent.run(shutdown).await
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}
