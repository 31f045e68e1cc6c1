//! Mission control configuration, read from a TOML file.
//!
//! ```toml
//! [session]
//! update_frequency_ms = 3000
//! network = "StratisTestnet"
//!
//! [dispatch]
//! refresh_secs = 3600
//! command_poll_ms = 500
//!
//! [[agents]]
//! address = "10.0.0.5:9380"
//!
//! [[nodes]]
//! endpoint = "StratisTest.Stratis.node1"
//! agent = "10.0.0.5:9380"
//! data_dir = "/var/lib/stratis"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleet_protocol::{
    ClientRegistration, NodeConfig, DEFAULT_COMMAND_POLL_MS, DEFAULT_REFRESH_SECS, DEFAULT_UPDATE_FREQUENCY_MS,
    PROTOCOL_VERSION,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub session: SessionSection,
    pub dispatch: DispatchSection,
    pub agents: Vec<AgentEntry>,
    pub nodes: Vec<NodeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// How often agents should push node data.
    pub update_frequency_ms: u64,
    pub network: String,
    pub user: String,
    pub workstation_name: String,
    /// How often agents that are not connected are retried.
    pub reconnect_secs: u64,
    /// Longest wait for one agent to accept a connection.
    pub connect_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            update_frequency_ms: DEFAULT_UPDATE_FREQUENCY_MS,
            network: "StratisTestnet".to_string(),
            user: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "operator".to_string()),
            workstation_name: sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string()),
            reconnect_secs: 10,
            connect_timeout_ms: 5_000,
        }
    }
}

impl SessionSection {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    /// Interval of the registration and node configuration refresh.
    pub refresh_secs: u64,
    /// Poll interval of the command dispatchers.
    pub command_poll_ms: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            refresh_secs: DEFAULT_REFRESH_SECS,
            command_poll_ms: DEFAULT_COMMAND_POLL_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentEntry {
    /// `host:port` of the agent.
    pub address: String,
}

impl DispatchSection {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs.max(1))
    }

    pub fn command_poll_interval(&self) -> Duration {
        Duration::from_millis(self.command_poll_ms.max(1))
    }
}

impl ControlConfig {
    /// `<config dir>/fleet-control/mission-control.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("fleet-control").join("mission-control.toml"))
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
        Self::from_toml(&content).map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// The registration announced to every agent.
    pub fn client_registration(&self) -> ClientRegistration {
        ClientRegistration {
            update_frequency_ms: self.session.update_frequency_ms,
            network: self.session.network.clone(),
            user: self.session.user.clone(),
            platform: std::env::consts::OS.to_string(),
            workstation_name: self.session.workstation_name.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Explicitly listed agents plus every agent referenced by a node.
    pub fn agent_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self
            .agents
            .iter()
            .map(|a| a.address.clone())
            .chain(self.nodes.iter().map(|n| n.agent.clone()))
            .collect();
        addresses.sort();
        addresses.dedup();
        addresses
    }
}
