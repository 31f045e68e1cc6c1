use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use fleet_protocol::{ActionRequest, ClientRegistration, Envelope, MessageTag, NodeAction, ResourceScope};
use fleet_session::{
    ConnectionFactory, DispatchCommand, Dispatcher, RequestProcessor, Session, SessionEvent, TypedProcessor,
};
use fleet_state::NetworkModel;
use fleet_transport::ConnectionState;

use crate::config::ControlConfig;
use crate::directory::AgentDirectory;
use crate::dispatchers::{
    ClientRegistrationDispatcher, DeploymentDispatcher, NodeActionDispatcher, NodeConfigurationDispatcher,
};
use crate::processors::{AgentRegistrationHandler, NodeDataHandler, ResourceListHandler};

/// Mission control wiring for every agent connection.
pub struct ControlFactory {
    model: NetworkModel,
    directory: AgentDirectory,
    registration: ClientRegistration,
    refresh: Duration,
    command_poll: Duration,
}

impl ControlFactory {
    pub fn new(config: &ControlConfig, model: NetworkModel, directory: AgentDirectory) -> Self {
        Self {
            model,
            directory,
            registration: config.client_registration(),
            refresh: config.dispatch.refresh_interval(),
            command_poll: config.dispatch.command_poll_interval(),
        }
    }
}

impl ConnectionFactory for ControlFactory {
    fn processors(&self, _address: &str) -> Vec<Box<dyn RequestProcessor>> {
        vec![
            TypedProcessor::boxed(AgentRegistrationHandler::new(self.directory.clone())),
            TypedProcessor::boxed(NodeDataHandler::new(self.model.clone())),
            TypedProcessor::boxed(ResourceListHandler::new(self.directory.clone())),
        ]
    }

    fn dispatchers(&self, address: &str) -> Vec<Arc<dyn Dispatcher>> {
        vec![
            Arc::new(ClientRegistrationDispatcher::new(self.registration.clone(), self.refresh)),
            Arc::new(NodeConfigurationDispatcher::new(address, self.model.clone(), self.refresh)),
            Arc::new(NodeActionDispatcher::new(self.command_poll)),
            Arc::new(DeploymentDispatcher::new(self.command_poll)),
        ]
    }

    fn greeting(&self, address: &str) -> Option<Envelope> {
        match Envelope::new(MessageTag::ClientRegistration, &self.registration) {
            Ok(envelope) => Some(envelope),
            Err(e) => {
                tracing::error!(address = %address, error = %e, "Cannot encode client registration");
                None
            }
        }
    }
}

/// The mission control service: master network, agent sessions and the
/// command surface consumers use.
pub struct MissionControl {
    config: ControlConfig,
    model: NetworkModel,
    directory: AgentDirectory,
    session: Arc<Session<ControlFactory>>,
}

impl MissionControl {
    pub async fn new(config: ControlConfig) -> Self {
        let model = NetworkModel::new();
        model.load_topology(config.nodes.clone()).await;
        let directory = AgentDirectory::new();
        let factory = ControlFactory::new(&config, model.clone(), directory.clone());
        Self {
            session: Session::new(factory),
            config,
            model,
            directory,
        }
    }

    pub fn model(&self) -> &NetworkModel {
        &self.model
    }

    pub fn directory(&self) -> &AgentDirectory {
        &self.directory
    }

    pub fn session(&self) -> &Arc<Session<ControlFactory>> {
        &self.session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }

    /// Agents from the config plus any referenced by the current topology.
    pub async fn agent_addresses(&self) -> Vec<String> {
        let mut addresses = self.config.agent_addresses();
        addresses.extend(self.model.agent_addresses().await);
        addresses.sort();
        addresses.dedup();
        addresses
    }

    /// Connect to every known agent that has no registered connection.
    /// Attempts run concurrently, each bounded by the connect timeout.
    /// Returns how many agents were connected.
    pub async fn connect_missing(&self) -> usize {
        let addresses = self.agent_addresses().await;
        connect_all(Arc::clone(&self.session), addresses, self.config.session.connect_timeout()).await
    }

    pub async fn start_node(&self, node: &str) -> anyhow::Result<()> {
        self.node_action(NodeAction::StartNode, node, Vec::new()).await
    }

    pub async fn stop_node(&self, node: &str) -> anyhow::Result<()> {
        self.node_action(NodeAction::StopNode, node, Vec::new()).await
    }

    /// Ask the node's agent to delete `file` from the node's network directory.
    pub async fn remove_file(&self, node: &str, file: &str) -> anyhow::Result<()> {
        self.node_action(NodeAction::RemoveFile, node, vec![file.to_string()])
            .await
    }

    /// Ship a local file to the agent at `address`.
    pub async fn deploy_file(
        &self,
        address: &str,
        scope: ResourceScope,
        target: &str,
        path: PathBuf,
    ) -> anyhow::Result<()> {
        let command = DispatchCommand::Deploy {
            scope,
            target: target.to_string(),
            path,
        };
        self.session.arm(address, MessageTag::DeployFile, command).await?;
        Ok(())
    }

    async fn node_action(&self, action: NodeAction, node: &str, parameters: Vec<String>) -> anyhow::Result<()> {
        let address = self
            .model
            .node(node)
            .await
            .map(|n| n.config.agent)
            .ok_or_else(|| anyhow::anyhow!("unknown node {node}"))?;
        let command = DispatchCommand::Action(ActionRequest {
            action,
            node: node.to_string(),
            parameters,
        });
        self.session.arm(&address, MessageTag::ActionRequest, command).await?;
        tracing::info!(node = %node, agent = %address, action = %action, "Node action queued");
        Ok(())
    }

    /// Run until `shutdown` fires: drive the session, keep agents connected
    /// and log what they report.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let mut events = self.subscribe();
        let session = Arc::clone(&self.session);
        let session_shutdown = shutdown.child_token();
        let driver = tokio::spawn(async move { session.run(session_shutdown).await });

        let mut reconnect = tokio::time::interval(self.config.session.reconnect_interval());
        reconnect.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut connecting: Option<JoinHandle<usize>> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = reconnect.tick() => {
                    if connecting.as_ref().is_some_and(|round| !round.is_finished()) {
                        tracing::debug!("Previous connect round still running");
                        continue;
                    }
                    let addresses = self.agent_addresses().await;
                    let timeout = self.config.session.connect_timeout();
                    connecting = Some(tokio::spawn(connect_all(Arc::clone(&self.session), addresses, timeout)));
                }
                event = events.recv() => match event {
                    Ok(event) => self.on_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Event consumer lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        shutdown.cancel();
        if let Some(round) = connecting {
            round.abort();
        }
        driver.await??;
        Ok(())
    }

    /// Log what agents report. A disconnected agent's registration and
    /// resource listing are dropped; it re-sends both when it reconnects.
    async fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::ConnectionStatusChanged { address, state, message } => {
                tracing::info!(address = %address, state = %state, message = %message, "Agent connection status");
                if matches!(state, ConnectionState::Closed | ConnectionState::Error) {
                    self.directory.forget(address).await;
                }
            }
            SessionEvent::StatsUpdated { address, segment } => {
                tracing::debug!(
                    address = %address,
                    nodes = segment.as_ref().map(|s| s.len()).unwrap_or_default(),
                    "Node stats updated"
                );
            }
            SessionEvent::RegistrationUpdated { address, registration } => {
                if let Some(registration) = registration {
                    tracing::info!(address = %address, host = %registration.host_name, "Agent registration updated");
                }
            }
            SessionEvent::DownloadUpdated { address, resources } => {
                tracing::debug!(
                    address = %address,
                    files = resources.as_ref().map(Vec::len).unwrap_or_default(),
                    "Resource list updated"
                );
            }
            SessionEvent::MessageProcessed { .. } => {}
        }
    }
}

async fn connect_all(session: Arc<Session<ControlFactory>>, addresses: Vec<String>, timeout: Duration) -> usize {
    let mut attempts = JoinSet::new();
    for address in addresses {
        if session.is_registered(&address).await {
            continue;
        }
        let session = Arc::clone(&session);
        attempts.spawn(async move {
            match tokio::time::timeout(timeout, session.connect(&address)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    tracing::warn!(address = %address, error = %e, "Agent unreachable");
                    false
                }
                Err(_) => {
                    tracing::warn!(
                        address = %address,
                        timeout_ms = timeout.as_millis() as u64,
                        "Agent connect timed out"
                    );
                    // Drop the half-open registration so the next round retries.
                    if let Err(e) = session.close(&address).await {
                        tracing::debug!(address = %address, error = %e, "Nothing to drop");
                    }
                    false
                }
            }
        });
    }

    let mut connected = 0;
    while let Some(joined) = attempts.join_next().await {
        match joined {
            Ok(true) => connected += 1,
            Ok(false) => {}
            Err(e) => tracing::error!(error = %e, "Connect attempt failed"),
        }
    }
    connected
}
