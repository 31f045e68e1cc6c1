//! Outbound messages from mission control to one agent.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use fleet_protocol::{ActionRequest, ClientRegistration, Envelope, FileDeployment, MessageTag, ResourceScope};
use fleet_session::{DeliveryMode, DispatchCommand, Dispatcher, SessionError};
use fleet_state::NetworkModel;

/// Periodic re-announcement of this mission control. The first announcement
/// travels as the connection greeting, so ticks start one interval later.
pub struct ClientRegistrationDispatcher {
    registration: ClientRegistration,
    interval: Duration,
}

impl ClientRegistrationDispatcher {
    pub fn new(registration: ClientRegistration, interval: Duration) -> Self {
        Self { registration, interval }
    }
}

#[async_trait]
impl Dispatcher for ClientRegistrationDispatcher {
    fn tag(&self) -> MessageTag {
        MessageTag::ClientRegistration
    }

    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Timed
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn initial_delay(&self) -> Duration {
        self.interval
    }

    async fn produce(&self) -> Result<Option<Envelope>, SessionError> {
        Ok(Some(Envelope::new(self.tag(), &self.registration)?))
    }
}

/// Pushes the enabled node configurations assigned to this agent.
pub struct NodeConfigurationDispatcher {
    address: String,
    model: NetworkModel,
    interval: Duration,
}

impl NodeConfigurationDispatcher {
    pub fn new(address: impl Into<String>, model: NetworkModel, interval: Duration) -> Self {
        Self {
            address: address.into(),
            model,
            interval,
        }
    }
}

#[async_trait]
impl Dispatcher for NodeConfigurationDispatcher {
    fn tag(&self) -> MessageTag {
        MessageTag::NodeConfiguration
    }

    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Timed
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn produce(&self) -> Result<Option<Envelope>, SessionError> {
        let configs = self.model.configs_for_agent(&self.address).await;
        tracing::debug!(address = %self.address, nodes = configs.len(), "Pushing node configuration");
        Ok(Some(Envelope::new(self.tag(), &configs)?))
    }
}

/// Start/stop/remove-file commands, sent once per arm.
pub struct NodeActionDispatcher {
    queue: Mutex<Vec<ActionRequest>>,
    poll: Duration,
}

impl NodeActionDispatcher {
    pub fn new(poll: Duration) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            poll,
        }
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, Vec<ActionRequest>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Dispatcher for NodeActionDispatcher {
    fn tag(&self) -> MessageTag {
        MessageTag::ActionRequest
    }

    fn mode(&self) -> DeliveryMode {
        DeliveryMode::EdgeTriggered
    }

    fn interval(&self) -> Duration {
        self.poll
    }

    async fn produce(&self) -> Result<Option<Envelope>, SessionError> {
        let batch = std::mem::take(&mut *self.queue());
        if batch.is_empty() {
            return Ok(None);
        }
        Ok(Some(Envelope::new(self.tag(), &batch)?))
    }

    async fn stage(&self, command: DispatchCommand) -> Result<(), SessionError> {
        match command {
            DispatchCommand::Action(action) => {
                self.queue().push(action);
                Ok(())
            }
            DispatchCommand::Deploy { .. } => Err(SessionError::InvalidCommand {
                tag: self.tag(),
                reason: "file deployments go through the DeployFile dispatcher".to_string(),
            }),
        }
    }

    async fn close(&self) {
        self.queue().clear();
    }
}

struct StagedFile {
    scope: ResourceScope,
    target: String,
    file_name: String,
    file: tokio::fs::File,
}

/// Ships local files to the agent. Files are opened when staged and read
/// when the armed tick fires; closing drops any handle still staged.
pub struct DeploymentDispatcher {
    staged: tokio::sync::Mutex<Vec<StagedFile>>,
    poll: Duration,
}

impl DeploymentDispatcher {
    pub fn new(poll: Duration) -> Self {
        Self {
            staged: tokio::sync::Mutex::new(Vec::new()),
            poll,
        }
    }

    pub async fn staged_count(&self) -> usize {
        self.staged.lock().await.len()
    }
}

#[async_trait]
impl Dispatcher for DeploymentDispatcher {
    fn tag(&self) -> MessageTag {
        MessageTag::DeployFile
    }

    fn mode(&self) -> DeliveryMode {
        DeliveryMode::EdgeTriggered
    }

    fn interval(&self) -> Duration {
        self.poll
    }

    async fn produce(&self) -> Result<Option<Envelope>, SessionError> {
        let staged = std::mem::take(&mut *self.staged.lock().await);
        if staged.is_empty() {
            return Ok(None);
        }

        let mut deployments = Vec::with_capacity(staged.len());
        for mut item in staged {
            let mut data = Vec::new();
            item.file.read_to_end(&mut data).await?;
            tracing::info!(file = %item.file_name, bytes = data.len(), "Deploying file");
            deployments.push(FileDeployment::from_bytes(item.scope, item.target, item.file_name, &data));
        }
        Ok(Some(Envelope::new(self.tag(), &deployments)?))
    }

    async fn stage(&self, command: DispatchCommand) -> Result<(), SessionError> {
        let DispatchCommand::Deploy { scope, target, path } = command else {
            return Err(SessionError::InvalidCommand {
                tag: self.tag(),
                reason: "expected a file deployment".to_string(),
            });
        };
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SessionError::InvalidCommand {
                tag: MessageTag::DeployFile,
                reason: format!("{} has no file name", path.display()),
            })?;
        let file = tokio::fs::File::open(&path).await?;
        self.staged.lock().await.push(StagedFile {
            scope,
            target,
            file_name,
            file,
        });
        Ok(())
    }

    async fn close(&self) {
        let dropped = std::mem::take(&mut *self.staged.lock().await);
        if !dropped.is_empty() {
            tracing::debug!(files = dropped.len(), "Dropped staged deployments");
        }
    }
}
