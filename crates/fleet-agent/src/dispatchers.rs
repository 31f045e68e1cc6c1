//! Outbound messages from the agent to one mission control client.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use fleet_protocol::{
    sha256_hex, AgentRegistration, Envelope, MessageTag, Resource, ResourceScope, MAX_MESSAGE_SIZE, PROTOCOL_VERSION,
};
use fleet_session::{DeliveryMode, Dispatcher, SessionError};

use crate::state::AgentModel;

/// Node data ticks this often; each tick checks the client's own cadence.
pub const NODE_DATA_TICK: Duration = Duration::from_millis(500);

pub fn agent_registration(managed_nodes: usize) -> AgentRegistration {
    AgentRegistration {
        agent_version: env!("CARGO_PKG_VERSION").to_string(),
        host_name: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
        platform: std::env::consts::OS.to_string(),
        managed_nodes,
        protocol_version: PROTOCOL_VERSION.to_string(),
    }
}

/// Announces the agent right after connect, then on a slow refresh.
pub struct AgentRegistrationDispatcher {
    model: AgentModel,
    interval: Duration,
}

impl AgentRegistrationDispatcher {
    pub fn new(model: AgentModel, interval: Duration) -> Self {
        Self { model, interval }
    }
}

#[async_trait]
impl Dispatcher for AgentRegistrationDispatcher {
    fn tag(&self) -> MessageTag {
        MessageTag::AgentRegistration
    }

    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Timed
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn produce(&self) -> Result<Option<Envelope>, SessionError> {
        let registration = agent_registration(self.model.managed_count().await);
        Ok(Some(Envelope::new(self.tag(), &registration)?))
    }
}

/// Reports the client's segment at the frequency it registered.
pub struct NodeDataDispatcher {
    address: String,
    model: AgentModel,
    default_frequency: Duration,
    last_sent: Mutex<Option<Instant>>,
}

impl NodeDataDispatcher {
    pub fn new(address: impl Into<String>, model: AgentModel, default_frequency: Duration) -> Self {
        Self {
            address: address.into(),
            model,
            default_frequency,
            last_sent: Mutex::new(None),
        }
    }

    async fn frequency(&self) -> Duration {
        self.model
            .update_frequency_ms(&self.address)
            .await
            .map(Duration::from_millis)
            .unwrap_or(self.default_frequency)
    }

    fn last_sent(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.last_sent.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Dispatcher for NodeDataDispatcher {
    fn tag(&self) -> MessageTag {
        MessageTag::NodeData
    }

    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Timed
    }

    fn interval(&self) -> Duration {
        NODE_DATA_TICK
    }

    async fn produce(&self) -> Result<Option<Envelope>, SessionError> {
        let frequency = self.frequency().await;
        let now = Instant::now();
        let last = *self.last_sent();
        if let Some(last) = last {
            if now.duration_since(last) < frequency {
                return Ok(None);
            }
        }

        let segment = self.model.segment_for_client(&self.address).await;
        let envelope = Envelope::new(self.tag(), &segment)?;
        *self.last_sent() = Some(now);
        Ok(Some(envelope))
    }

    async fn close(&self) {
        *self.last_sent() = None;
    }
}

/// Lists the files held for this client: agent files under the deploy root
/// and network files next to each managed node.
pub struct ResourceListDispatcher {
    address: String,
    model: AgentModel,
    root: std::path::PathBuf,
    interval: Duration,
}

impl ResourceListDispatcher {
    pub fn new(address: impl Into<String>, model: AgentModel, root: impl Into<std::path::PathBuf>, interval: Duration) -> Self {
        Self {
            address: address.into(),
            model,
            root: root.into(),
            interval,
        }
    }

    pub async fn resources(&self) -> Vec<Resource> {
        let mut resources = list_directory(&self.root, ResourceScope::Agent, "").await;

        let segment = self.model.segment_for_client(&self.address).await;
        let mut seen = std::collections::HashSet::new();
        for node in segment.nodes.values() {
            let dir = node.config.network_directory();
            if seen.insert(dir.clone()) {
                resources.extend(list_directory(&dir, ResourceScope::Network, node.full_name()).await);
            }
        }
        resources
    }
}

/// Top-level regular files of `dir`. A missing directory lists as empty.
async fn list_directory(dir: &Path, scope: ResourceScope, target: &str) -> Vec<Resource> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %dir.display(), error = %e, "Cannot list resources");
            }
            return Vec::new();
        }
    };

    let mut resources = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Resource listing interrupted");
                break;
            }
        };
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }

        let size = metadata.len();
        // Files too large to ship are listed without a digest.
        let sha256 = if size as usize <= MAX_MESSAGE_SIZE {
            match tokio::fs::read(entry.path()).await {
                Ok(data) => sha256_hex(&data),
                Err(e) => {
                    tracing::debug!(path = %entry.path().display(), error = %e, "Cannot hash resource");
                    continue;
                }
            }
        } else {
            String::new()
        };

        resources.push(Resource {
            name: entry.file_name().to_string_lossy().into_owned(),
            scope,
            target: target.to_string(),
            size,
            sha256,
        });
    }
    resources.sort_by(|a, b| a.name.cmp(&b.name));
    resources
}

#[async_trait]
impl Dispatcher for ResourceListDispatcher {
    fn tag(&self) -> MessageTag {
        MessageTag::FileDownload
    }

    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Timed
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn produce(&self) -> Result<Option<Envelope>, SessionError> {
        let resources = self.resources().await;
        Ok(Some(Envelope::new(self.tag(), &resources)?))
    }
}
