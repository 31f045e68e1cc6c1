use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleet_protocol::{
    DEFAULT_AGENT_PORT, DEFAULT_REFRESH_SECS, DEFAULT_RESOURCE_LIST_SECS, DEFAULT_UPDATE_FREQUENCY_MS,
};

/// Agent configuration, read from a TOML file. Every field has a default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub agent: AgentSection,
    pub probes: ProbeSection,
    pub dispatch: DispatchSection,
    pub deploy: DeploySection,
    pub executor: ExecutorSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub listen: String,
    pub max_clients: usize,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{DEFAULT_AGENT_PORT}"),
            max_clients: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    pub interval_ms: u64,
    /// Longest wait for one node's log in a round.
    pub log_read_timeout_ms: u64,
}

impl Default for ProbeSection {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_UPDATE_FREQUENCY_MS,
            log_read_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    /// Agent registration refresh.
    pub refresh_secs: u64,
    /// Node data cadence until a client registers its own.
    pub update_frequency_ms: u64,
    pub resource_list_secs: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            refresh_secs: DEFAULT_REFRESH_SECS,
            update_frequency_ms: DEFAULT_UPDATE_FREQUENCY_MS,
            resource_list_secs: DEFAULT_RESOURCE_LIST_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySection {
    /// Where agent-scoped files are written.
    pub root: PathBuf,
}

impl Default for DeploySection {
    fn default() -> Self {
        let base = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            root: base.join("fleet-agent").join("deploy"),
        }
    }
}

/// How node daemons are launched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub program: String,
    /// Arguments placed before the node's own startup switches.
    pub args: Vec<String>,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            program: "dotnet".to_string(),
            args: vec!["run".to_string(), "--no-build".to_string(), "--".to_string()],
        }
    }
}

impl AgentConfig {
    /// `<config dir>/fleet-control/agent.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("fleet-control").join("agent.toml"))
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
        toml::from_str(&content).map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probes.interval_ms.max(1))
    }

    pub fn log_read_timeout(&self) -> Duration {
        Duration::from_millis(self.probes.log_read_timeout_ms.max(1))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch.refresh_secs.max(1))
    }

    pub fn resource_list_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch.resource_list_secs.max(1))
    }

    pub fn update_frequency(&self) -> Duration {
        Duration::from_millis(self.dispatch.update_frequency_ms.max(1))
    }
}
