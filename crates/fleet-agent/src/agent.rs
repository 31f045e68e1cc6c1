use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use fleet_session::{ConnectionFactory, Dispatcher, RequestProcessor, Session, SessionEvent, TypedProcessor};
use fleet_transport::{ConnectionState, Listener};

use crate::config::AgentConfig;
use crate::dispatchers::{AgentRegistrationDispatcher, NodeDataDispatcher, ResourceListDispatcher};
use crate::executor::NodeActionExecutor;
use crate::probes::{NodeLogProbe, ProbeRunner};
use crate::processors::{
    ActionRequestHandler, ClientRegistrationHandler, DeployFileHandler, NodeConfigurationHandler,
};
use crate::state::AgentModel;

/// Agent wiring for every mission control connection.
pub struct AgentFactory {
    model: AgentModel,
    executor: Arc<dyn NodeActionExecutor>,
    config: AgentConfig,
}

impl AgentFactory {
    pub fn new(config: AgentConfig, model: AgentModel, executor: Arc<dyn NodeActionExecutor>) -> Self {
        Self {
            model,
            executor,
            config,
        }
    }
}

impl ConnectionFactory for AgentFactory {
    fn processors(&self, _address: &str) -> Vec<Box<dyn RequestProcessor>> {
        vec![
            TypedProcessor::boxed(ClientRegistrationHandler::new(self.model.clone())),
            TypedProcessor::boxed(NodeConfigurationHandler::new(self.model.clone())),
            TypedProcessor::boxed(ActionRequestHandler::new(
                self.model.clone(),
                Arc::clone(&self.executor),
            )),
            TypedProcessor::boxed(DeployFileHandler::new(
                self.model.clone(),
                self.config.deploy.root.clone(),
            )),
        ]
    }

    fn dispatchers(&self, address: &str) -> Vec<Arc<dyn Dispatcher>> {
        vec![
            Arc::new(AgentRegistrationDispatcher::new(
                self.model.clone(),
                self.config.refresh_interval(),
            )),
            Arc::new(NodeDataDispatcher::new(
                address,
                self.model.clone(),
                self.config.update_frequency(),
            )),
            Arc::new(ResourceListDispatcher::new(
                address,
                self.model.clone(),
                self.config.deploy.root.clone(),
                self.config.resource_list_interval(),
            )),
        ]
    }
}

/// The node agent: accepts mission control clients, serves them over one
/// session and keeps the node model fresh with the status probes.
pub struct Agent {
    config: AgentConfig,
    model: AgentModel,
    session: Arc<Session<AgentFactory>>,
}

impl Agent {
    pub fn new(config: AgentConfig, executor: Arc<dyn NodeActionExecutor>) -> Self {
        let model = AgentModel::new();
        let factory = AgentFactory::new(config.clone(), model.clone(), executor);
        Self {
            session: Session::new(factory),
            config,
            model,
        }
    }

    pub fn model(&self) -> &AgentModel {
        &self.model
    }

    pub fn session(&self) -> &Arc<Session<AgentFactory>> {
        &self.session
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let listener = Listener::bind(&self.config.agent.listen, self.config.agent.max_clients).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve clients accepted on `listener` until `shutdown` fires.
    pub async fn serve(&self, listener: Listener, shutdown: CancellationToken) -> anyhow::Result<()> {
        tracing::info!(address = %listener.local_addr()?, "Agent listening");

        let mut events = self.session.subscribe();
        let session = Arc::clone(&self.session);
        let session_shutdown = shutdown.child_token();
        let driver = tokio::spawn(async move { session.run(session_shutdown).await });

        let probes = ProbeRunner::new(self.model.clone(), self.config.probe_interval())
            .with_logs(NodeLogProbe::with_read_timeout(self.config.log_read_timeout()));
        let probe_task = tokio::spawn(probes.run(shutdown.child_token()));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => {
                        tracing::info!(address = %accepted.address, "Client connected");
                        if let Err(e) = self.session.accept(accepted).await {
                            tracing::warn!(error = %e, "Cannot attach client");
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                event = events.recv() => match event {
                    Ok(event) => self.on_event(event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Event consumer lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        shutdown.cancel();
        driver.await??;
        probe_task.await?;
        tracing::info!("Agent stopped");
        Ok(())
    }

    async fn on_event(&self, event: SessionEvent) {
        if let SessionEvent::ConnectionStatusChanged { address, state, message } = event {
            match state {
                ConnectionState::Open => self.model.add_client(&address).await,
                ConnectionState::Closed | ConnectionState::Error => {
                    tracing::info!(address = %address, reason = %message, "Client gone");
                    self.model.remove_client(&address).await;
                }
                _ => {}
            }
        }
    }
}
