//! Handlers for messages agents send to mission control.

use async_trait::async_trait;

use fleet_protocol::{AgentRegistration, MessageTag, NodeNetwork, Resource};
use fleet_session::{PayloadHandler, ProcessorContext, SessionError, SessionEvent};
use fleet_state::NetworkModel;

use crate::directory::AgentDirectory;

pub struct AgentRegistrationHandler {
    directory: AgentDirectory,
}

impl AgentRegistrationHandler {
    pub fn new(directory: AgentDirectory) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl PayloadHandler for AgentRegistrationHandler {
    type Payload = AgentRegistration;

    fn tag(&self) -> MessageTag {
        MessageTag::AgentRegistration
    }

    async fn apply(&mut self, ctx: &ProcessorContext, payload: Option<&AgentRegistration>) -> Result<(), SessionError> {
        let Some(registration) = payload else {
            return Ok(());
        };
        tracing::info!(
            address = %ctx.address,
            host = %registration.host_name,
            version = %registration.agent_version,
            nodes = registration.managed_nodes,
            "Agent registered"
        );
        self.directory
            .set_registration(&ctx.address, registration.clone())
            .await;
        Ok(())
    }

    fn completion(&self, ctx: &ProcessorContext, payload: Option<&AgentRegistration>) -> SessionEvent {
        SessionEvent::RegistrationUpdated {
            address: ctx.address.clone(),
            registration: payload.cloned(),
        }
    }
}

/// Folds the segment an agent reports into the master network.
pub struct NodeDataHandler {
    model: NetworkModel,
}

impl NodeDataHandler {
    pub fn new(model: NetworkModel) -> Self {
        Self { model }
    }
}

#[async_trait]
impl PayloadHandler for NodeDataHandler {
    type Payload = NodeNetwork;

    fn tag(&self) -> MessageTag {
        MessageTag::NodeData
    }

    async fn apply(&mut self, ctx: &ProcessorContext, payload: Option<&NodeNetwork>) -> Result<(), SessionError> {
        if let Some(segment) = payload {
            let summary = self.model.merge_segment(segment).await;
            tracing::debug!(address = %ctx.address, nodes = summary.touched(), "Node data received");
        }
        Ok(())
    }

    fn completion(&self, ctx: &ProcessorContext, payload: Option<&NodeNetwork>) -> SessionEvent {
        SessionEvent::StatsUpdated {
            address: ctx.address.clone(),
            segment: payload.cloned(),
        }
    }
}

pub struct ResourceListHandler {
    directory: AgentDirectory,
}

impl ResourceListHandler {
    pub fn new(directory: AgentDirectory) -> Self {
        Self { directory }
    }
}

#[async_trait]
impl PayloadHandler for ResourceListHandler {
    type Payload = Vec<Resource>;

    fn tag(&self) -> MessageTag {
        MessageTag::FileDownload
    }

    async fn apply(&mut self, ctx: &ProcessorContext, payload: Option<&Vec<Resource>>) -> Result<(), SessionError> {
        if let Some(resources) = payload {
            tracing::info!(address = %ctx.address, files = resources.len(), "Received resource list");
            self.directory.set_resources(&ctx.address, resources.clone()).await;
        }
        Ok(())
    }

    fn completion(&self, ctx: &ProcessorContext, payload: Option<&Vec<Resource>>) -> SessionEvent {
        SessionEvent::DownloadUpdated {
            address: ctx.address.clone(),
            resources: payload.cloned(),
        }
    }
}
