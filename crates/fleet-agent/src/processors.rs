//! Handlers for messages mission control sends to the agent.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use fleet_protocol::{ActionRequest, ClientRegistration, FileDeployment, MessageTag, NodeConfig, ResourceScope};
use fleet_session::{PayloadHandler, ProcessorContext, SessionError};

use crate::error::AgentError;
use crate::executor::{validate_file_name, NodeActionExecutor};
use crate::state::AgentModel;

pub struct ClientRegistrationHandler {
    model: AgentModel,
}

impl ClientRegistrationHandler {
    pub fn new(model: AgentModel) -> Self {
        Self { model }
    }
}

#[async_trait]
impl PayloadHandler for ClientRegistrationHandler {
    type Payload = ClientRegistration;

    fn tag(&self) -> MessageTag {
        MessageTag::ClientRegistration
    }

    async fn apply(&mut self, ctx: &ProcessorContext, payload: Option<&ClientRegistration>) -> Result<(), SessionError> {
        let Some(registration) = payload else {
            return Ok(());
        };
        tracing::info!(address = %ctx.address, client = %registration, "Client registered");
        self.model
            .set_client_registration(&ctx.address, registration.clone())
            .await;
        Ok(())
    }
}

/// Replaces the node set this client assigned to the agent.
pub struct NodeConfigurationHandler {
    model: AgentModel,
}

impl NodeConfigurationHandler {
    pub fn new(model: AgentModel) -> Self {
        Self { model }
    }
}

#[async_trait]
impl PayloadHandler for NodeConfigurationHandler {
    type Payload = Vec<NodeConfig>;

    fn tag(&self) -> MessageTag {
        MessageTag::NodeConfiguration
    }

    async fn apply(&mut self, ctx: &ProcessorContext, payload: Option<&Vec<NodeConfig>>) -> Result<(), SessionError> {
        let Some(configs) = payload else {
            return Ok(());
        };
        let enabled: Vec<NodeConfig> = configs.iter().filter(|c| c.enabled).cloned().collect();
        tracing::debug!(address = %ctx.address, nodes = enabled.len(), "Node configuration received");
        self.model.replace_client_nodes(&ctx.address, enabled).await;
        Ok(())
    }
}

pub struct ActionRequestHandler {
    model: AgentModel,
    executor: Arc<dyn NodeActionExecutor>,
}

impl ActionRequestHandler {
    pub fn new(model: AgentModel, executor: Arc<dyn NodeActionExecutor>) -> Self {
        Self { model, executor }
    }

    async fn execute(&self, request: &ActionRequest) -> Result<(), AgentError> {
        let node = self
            .model
            .node_config(&request.node)
            .await
            .ok_or_else(|| AgentError::UnknownNode(request.node.clone()))?;
        self.executor.execute(&node, request).await
    }
}

#[async_trait]
impl PayloadHandler for ActionRequestHandler {
    type Payload = Vec<ActionRequest>;

    fn tag(&self) -> MessageTag {
        MessageTag::ActionRequest
    }

    async fn apply(&mut self, ctx: &ProcessorContext, payload: Option<&Vec<ActionRequest>>) -> Result<(), SessionError> {
        let Some(requests) = payload else {
            return Ok(());
        };
        let mut first_error = None;
        for request in requests {
            tracing::info!(address = %ctx.address, node = %request.node, action = %request.action, "Executing action");
            if let Err(e) = self.execute(request).await {
                tracing::warn!(node = %request.node, action = %request.action, error = %e, "Action failed");
                first_error = first_error.or(Some(e));
            }
        }
        match first_error {
            Some(e) => Err(e.into_session(self.tag())),
            None => Ok(()),
        }
    }
}

/// Writes deployed files into the directory their scope names.
pub struct DeployFileHandler {
    model: AgentModel,
    root: PathBuf,
}

impl DeployFileHandler {
    pub fn new(model: AgentModel, root: impl Into<PathBuf>) -> Self {
        Self {
            model,
            root: root.into(),
        }
    }

    async fn directory(&self, deployment: &FileDeployment) -> Result<PathBuf, AgentError> {
        if deployment.scope == ResourceScope::Agent {
            return Ok(self.root.clone());
        }
        let node = self
            .model
            .node_config(&deployment.target)
            .await
            .ok_or_else(|| AgentError::UnknownNode(deployment.target.clone()))?;
        Ok(match deployment.scope {
            ResourceScope::Node => node.network_directory().join(node.endpoint.node()),
            _ => node.network_directory(),
        })
    }

    async fn write(&self, deployment: &FileDeployment) -> Result<PathBuf, AgentError> {
        let name = validate_file_name(&deployment.file_name)?;
        let data = deployment.decode_content()?;
        let dir = self.directory(deployment).await?;
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(name);
        tokio::fs::write(&path, &data).await?;
        Ok(path)
    }
}

#[async_trait]
impl PayloadHandler for DeployFileHandler {
    type Payload = Vec<FileDeployment>;

    fn tag(&self) -> MessageTag {
        MessageTag::DeployFile
    }

    async fn apply(&mut self, ctx: &ProcessorContext, payload: Option<&Vec<FileDeployment>>) -> Result<(), SessionError> {
        let Some(deployments) = payload else {
            return Ok(());
        };
        let mut first_error = None;
        for deployment in deployments {
            match self.write(deployment).await {
                Ok(path) => tracing::info!(address = %ctx.address, path = %path.display(), "File deployed"),
                Err(e) => {
                    tracing::warn!(file = %deployment.file_name, error = %e, "Deployment rejected");
                    first_error = first_error.or(Some(e));
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into_session(self.tag())),
            None => Ok(()),
        }
    }
}
