use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use fleet_protocol::{AgentRegistration, Resource};

/// What mission control knows about one agent beyond its nodes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentRecord {
    pub registration: Option<AgentRegistration>,
    pub resources: Vec<Resource>,
}

/// Registrations and resource listings reported by agents, keyed by address.
#[derive(Debug, Clone, Default)]
pub struct AgentDirectory {
    inner: Arc<RwLock<HashMap<String, AgentRecord>>>,
}

impl AgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_registration(&self, address: &str, registration: AgentRegistration) {
        self.inner
            .write()
            .await
            .entry(address.to_string())
            .or_default()
            .registration = Some(registration);
    }

    pub async fn set_resources(&self, address: &str, resources: Vec<Resource>) {
        self.inner
            .write()
            .await
            .entry(address.to_string())
            .or_default()
            .resources = resources;
    }

    pub async fn get(&self, address: &str) -> Option<AgentRecord> {
        self.inner.read().await.get(address).cloned()
    }

    pub async fn forget(&self, address: &str) {
        self.inner.write().await.remove(address);
    }
}
