//! Status probes: periodic, failure-isolated inspection of the agent process
//! and of the managed nodes' logs.
//!
//! Health and log rounds tick on separate loops, so a slow disk can delay
//! node heights but never the agent's own health and update stamp.

pub mod health;
pub mod log;

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

pub use health::AgentHealthProbe;
pub use log::{LogCursor, NodeLogProbe};

use crate::state::AgentModel;

/// Ticks every probe on a fixed interval and writes results to the model.
pub struct ProbeRunner {
    model: AgentModel,
    health: AgentHealthProbe,
    logs: NodeLogProbe,
    interval: Duration,
}

impl ProbeRunner {
    pub fn new(model: AgentModel, interval: Duration) -> Self {
        Self {
            model,
            health: AgentHealthProbe::new(),
            logs: NodeLogProbe::new(),
            interval,
        }
    }

    pub fn with_logs(mut self, logs: NodeLogProbe) -> Self {
        self.logs = logs;
        self
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let Self {
            model,
            mut health,
            logs,
            interval,
        } = self;
        let interval = interval.max(Duration::from_millis(1));
        tracing::info!(interval_ms = interval.as_millis() as u64, "Status probes running");

        let log_task = {
            let model = model.clone();
            let logs = logs.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut ticker = ticker(interval);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => tokio::select! {
                            _ = shutdown.cancelled() => break,
                            read = refresh_logs(&model, &logs) => {
                                tracing::trace!(nodes = read, "Log round complete");
                            }
                        },
                    }
                }
            })
        };

        let mut ticker = ticker(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let round = refresh_health(&model, &mut health).await;
                    tracing::trace!(round, "Health round complete");
                }
            }
        }

        if let Err(e) = log_task.await {
            tracing::error!(error = %e, "Log probe loop failed");
        }
        logs.close().await;
        tracing::info!("Status probes stopped");
    }
}

fn ticker(interval: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// One log round; returns how many nodes were read.
async fn refresh_logs(model: &AgentModel, logs: &NodeLogProbe) -> usize {
    let nodes = model.managed_nodes().await;
    let results = logs.probe(&nodes).await;
    let read = results.len();
    for (name, log_state) in results {
        model.update_log_state(&name, log_state).await;
    }
    read
}

/// One health round, then the update counter and timestamp are stamped.
async fn refresh_health(model: &AgentModel, health: &mut AgentHealthProbe) -> u64 {
    let code_directories = model.code_directories().await;
    let client_count = model.client_count().await;
    let previous = model.health().await;
    let state = health.probe(client_count, &code_directories, &previous);
    model.set_health(state).await;
    model.stamp_update().await
}
