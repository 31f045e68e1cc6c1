use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ProtocolError;

/// Fully qualified node name: `<network>.<blockchain>.<node>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeEndpointName {
    full_name: String,
    network_len: usize,
    blockchain_len: usize,
}

impl NodeEndpointName {
    pub fn parse(full_name: &str) -> Result<Self, ProtocolError> {
        let parts: Vec<&str> = full_name.splitn(3, '.').collect();
        match parts.as_slice() {
            [network, blockchain, node]
                if !network.is_empty() && !blockchain.is_empty() && !node.is_empty() =>
            {
                Ok(Self {
                    full_name: full_name.to_string(),
                    network_len: network.len(),
                    blockchain_len: blockchain.len(),
                })
            }
            _ => Err(ProtocolError::NodeName(full_name.to_string())),
        }
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn network(&self) -> &str {
        &self.full_name[..self.network_len]
    }

    pub fn blockchain(&self) -> &str {
        let start = self.network_len + 1;
        &self.full_name[start..start + self.blockchain_len]
    }

    pub fn node(&self) -> &str {
        &self.full_name[self.network_len + self.blockchain_len + 2..]
    }
}

impl TryFrom<String> for NodeEndpointName {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<NodeEndpointName> for String {
    fn from(value: NodeEndpointName) -> Self {
        value.full_name
    }
}

impl std::fmt::Display for NodeEndpointName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full_name)
    }
}

fn default_true() -> bool {
    true
}

/// Configuration of one managed node, owned by mission control and pushed to
/// the agent the node is assigned to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub endpoint: NodeEndpointName,
    #[serde(default)]
    pub display_name: String,
    /// Node configuration file name, relative to the network directory.
    #[serde(default)]
    pub config_file: String,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub code_directory: Option<PathBuf>,
    #[serde(default)]
    pub project_directory: Option<PathBuf>,
    #[serde(default)]
    pub startup_switches: String,
    /// Address (`host:port`) of the agent that manages this node.
    pub agent: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl NodeConfig {
    pub fn new(endpoint: NodeEndpointName, agent: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            display_name: endpoint.node().to_string(),
            endpoint,
            config_file: String::new(),
            data_dir: data_dir.into(),
            code_directory: None,
            project_directory: None,
            startup_switches: String::new(),
            agent: agent.into(),
            enabled: true,
        }
    }

    pub fn full_name(&self) -> &str {
        self.endpoint.full_name()
    }

    /// `<data_dir>/<network>/<blockchain>`
    pub fn network_directory(&self) -> PathBuf {
        self.data_dir
            .join(self.endpoint.network())
            .join(self.endpoint.blockchain())
    }

    pub fn config_path(&self) -> PathBuf {
        self.network_directory().join(&self.config_file)
    }

    /// The node's main log file, tailed by the agent's log probe.
    pub fn log_file(&self) -> PathBuf {
        self.network_directory().join("Logs").join("node.txt")
    }

    pub fn daemon_name(&self) -> Option<String> {
        self.project_directory
            .as_ref()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeStatus {
    #[default]
    Unknown,
    Starting,
    Running,
    Stopped,
}

/// Heights and counters parsed from a node's log file.
///
/// `None` means the value has not been seen yet or was not numeric.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeLogState {
    pub headers_height: Option<u64>,
    pub consensus_height: Option<u64>,
    pub block_store_height: Option<u64>,
    pub wallet_height: Option<u64>,
    /// Total complete lines consumed from the log since the cursor was opened.
    pub lines_read: u64,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Operational state of one node as observed by its agent.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub header_height: Option<u64>,
    pub consensus_height: Option<u64>,
    pub block_height: Option<u64>,
    pub wallet_height: Option<u64>,
    pub network_height: Option<u64>,
    pub peer_count: Option<u32>,
    pub uptime_secs: Option<u64>,
    pub mempool_size: Option<u64>,
    pub log_state: Option<NodeLogState>,
}

impl NodeState {
    /// Copy the log-derived heights into the node-level fields.
    pub fn apply_log_state(&mut self, log: NodeLogState) {
        self.header_height = log.headers_height.or(self.header_height);
        self.consensus_height = log.consensus_height.or(self.consensus_height);
        self.block_height = log.block_store_height.or(self.block_height);
        self.wallet_height = log.wallet_height.or(self.wallet_height);
        self.log_state = Some(log);
    }
}

/// A managed blockchain node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub config: NodeConfig,
    #[serde(default)]
    pub state: NodeState,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            state: NodeState::default(),
        }
    }

    pub fn full_name(&self) -> &str {
        self.config.full_name()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RepositoryState {
    Present,
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryStatus {
    pub path: PathBuf,
    pub state: RepositoryState,
}

/// Health of the agent process itself.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AgentHealthState {
    pub thread_count: usize,
    /// Private (unshared) memory of the agent process. Resident set size
    /// where the platform does not report private memory.
    pub memory_usage_mb: u64,
    pub client_count: usize,
    pub last_update: Option<chrono::DateTime<chrono::Utc>>,
    pub update_count: u64,
    #[serde(default)]
    pub repositories: Vec<RepositoryStatus>,
}

/// A set of nodes keyed by full node name, plus the reporting agent's health.
///
/// Mission control keeps the master network; each agent reports a segment
/// containing only the nodes it manages.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeNetwork {
    pub nodes: BTreeMap<String, Node>,
    #[serde(default)]
    pub agent_health: Option<AgentHealthState>,
}

impl NodeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node: Node) -> Option<Node> {
        self.nodes.insert(node.full_name().to_string(), node)
    }

    pub fn get(&self, full_name: &str) -> Option<&Node> {
        self.nodes.get(full_name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Enabled node configurations assigned to the agent at `address`.
    pub fn configs_for_agent(&self, address: &str) -> Vec<NodeConfig> {
        self.nodes
            .values()
            .filter(|n| n.config.agent == address && n.config.enabled)
            .map(|n| n.config.clone())
            .collect()
    }
}

/// Sent by mission control right after connecting to an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    /// How often the client wants node data pushed, in milliseconds.
    pub update_frequency_ms: u64,
    pub network: String,
    pub user: String,
    pub platform: String,
    pub workstation_name: String,
    pub protocol_version: String,
}

impl std::fmt::Display for ClientRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} on {}/{} ({}, every {}s)",
            self.user,
            self.platform,
            self.workstation_name,
            self.network,
            self.update_frequency_ms / 1000
        )
    }
}

/// Sent by an agent to every connected client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_version: String,
    pub host_name: String,
    pub platform: String,
    pub managed_nodes: usize,
    pub protocol_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeAction {
    StartNode,
    StopNode,
    RemoveFile,
}

impl std::fmt::Display for NodeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StartNode => "start",
            Self::StopNode => "stop",
            Self::RemoveFile => "remove-file",
        };
        f.write_str(s)
    }
}

/// One command for one node. `ActionRequest` envelopes carry a list of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: NodeAction,
    pub node: String,
    #[serde(default)]
    pub parameters: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceScope {
    Agent,
    Network,
    Node,
}

/// A file shipped to an agent. `DeployFile` envelopes carry a list of these.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDeployment {
    pub scope: ResourceScope,
    /// Node full name (or network name) the file belongs to; empty for agent scope.
    #[serde(default)]
    pub target: String,
    pub file_name: String,
    /// Hex-encoded file content.
    pub content: String,
    /// Hex-encoded SHA-256 of the raw content.
    pub sha256: String,
}

impl FileDeployment {
    pub fn from_bytes(scope: ResourceScope, target: impl Into<String>, file_name: impl Into<String>, data: &[u8]) -> Self {
        Self {
            scope,
            target: target.into(),
            file_name: file_name.into(),
            content: hex::encode(data),
            sha256: sha256_hex(data),
        }
    }

    /// Decode the content and verify it against the announced digest.
    pub fn decode_content(&self) -> Result<Vec<u8>, ProtocolError> {
        let data = hex::decode(&self.content).map_err(|e| ProtocolError::Integrity {
            file: self.file_name.clone(),
            reason: format!("invalid hex content: {e}"),
        })?;
        let digest = sha256_hex(&data);
        if !digest.eq_ignore_ascii_case(&self.sha256) {
            return Err(ProtocolError::Integrity {
                file: self.file_name.clone(),
                reason: format!("sha256 mismatch: announced {}, computed {digest}", self.sha256),
            });
        }
        Ok(data)
    }
}

/// A file held by an agent, reported under `FileDownload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub scope: ResourceScope,
    #[serde(default)]
    pub target: String,
    pub size: u64,
    pub sha256: String,
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
