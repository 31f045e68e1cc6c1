use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use fleet_protocol::{AgentHealthState, ClientRegistration, Node, NodeConfig, NodeLogState, NodeNetwork};

#[derive(Debug, Clone, Default)]
struct ClientRecord {
    registration: Option<ClientRegistration>,
    nodes: Vec<NodeConfig>,
}

#[derive(Debug, Default)]
struct AgentState {
    clients: HashMap<String, ClientRecord>,
    /// Union of every client's nodes, with observed state.
    nodes: BTreeMap<String, Node>,
    health: AgentHealthState,
}

impl AgentState {
    /// Rebuild the managed set from the clients, keeping observed state of
    /// nodes that stay managed.
    fn rebuild_nodes(&mut self) {
        let mut nodes = BTreeMap::new();
        for client in self.clients.values() {
            for config in &client.nodes {
                let name = config.full_name().to_string();
                let state = self
                    .nodes
                    .get(&name)
                    .map(|n| n.state.clone())
                    .unwrap_or_default();
                nodes.insert(
                    name,
                    Node {
                        config: config.clone(),
                        state,
                    },
                );
            }
        }
        self.nodes = nodes;
    }
}

/// Everything the agent knows: connected clients, the nodes they assigned
/// to it and the latest probe results.
#[derive(Debug, Clone, Default)]
pub struct AgentModel {
    inner: Arc<RwLock<AgentState>>,
}

impl AgentModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_client(&self, address: &str) {
        self.inner
            .write()
            .await
            .clients
            .entry(address.to_string())
            .or_default();
    }

    /// Forget a client and the nodes only it had assigned.
    pub async fn remove_client(&self, address: &str) {
        let mut state = self.inner.write().await;
        if state.clients.remove(address).is_some() {
            state.rebuild_nodes();
        }
    }

    pub async fn client_count(&self) -> usize {
        self.inner.read().await.clients.len()
    }

    pub async fn set_client_registration(&self, address: &str, registration: ClientRegistration) {
        self.inner
            .write()
            .await
            .clients
            .entry(address.to_string())
            .or_default()
            .registration = Some(registration);
    }

    pub async fn client_registration(&self, address: &str) -> Option<ClientRegistration> {
        self.inner
            .read()
            .await
            .clients
            .get(address)
            .and_then(|c| c.registration.clone())
    }

    /// Node data cadence the client asked for, in milliseconds.
    pub async fn update_frequency_ms(&self, address: &str) -> Option<u64> {
        self.client_registration(address)
            .await
            .map(|r| r.update_frequency_ms)
            .filter(|ms| *ms > 0)
    }

    /// Replace the node set assigned by one client.
    pub async fn replace_client_nodes(&self, address: &str, configs: Vec<NodeConfig>) {
        let mut state = self.inner.write().await;
        state
            .clients
            .entry(address.to_string())
            .or_default()
            .nodes = configs;
        state.rebuild_nodes();
    }

    pub async fn managed_nodes(&self) -> Vec<NodeConfig> {
        self.inner
            .read()
            .await
            .nodes
            .values()
            .map(|n| n.config.clone())
            .collect()
    }

    pub async fn managed_count(&self) -> usize {
        self.inner.read().await.nodes.len()
    }

    pub async fn node_config(&self, full_name: &str) -> Option<NodeConfig> {
        self.inner
            .read()
            .await
            .nodes
            .get(full_name)
            .map(|n| n.config.clone())
    }

    pub async fn node(&self, full_name: &str) -> Option<Node> {
        self.inner.read().await.nodes.get(full_name).cloned()
    }

    pub async fn code_directories(&self) -> Vec<PathBuf> {
        let state = self.inner.read().await;
        let mut dirs: Vec<PathBuf> = state
            .nodes
            .values()
            .filter_map(|n| n.config.code_directory.clone())
            .collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }

    pub async fn update_log_state(&self, full_name: &str, log: NodeLogState) {
        if let Some(node) = self.inner.write().await.nodes.get_mut(full_name) {
            node.state.apply_log_state(log);
        }
    }

    pub async fn set_health(&self, health: AgentHealthState) {
        self.inner.write().await.health = health;
    }

    pub async fn health(&self) -> AgentHealthState {
        self.inner.read().await.health.clone()
    }

    /// Record a completed probe round.
    pub async fn stamp_update(&self) -> u64 {
        let mut state = self.inner.write().await;
        state.health.update_count += 1;
        state.health.last_update = Some(chrono::Utc::now());
        state.health.update_count
    }

    /// The segment reported to one client: its own nodes plus agent health.
    pub async fn segment_for_client(&self, address: &str) -> NodeNetwork {
        let state = self.inner.read().await;
        let mut segment = NodeNetwork::new();
        if let Some(client) = state.clients.get(address) {
            for config in &client.nodes {
                if let Some(node) = state.nodes.get(config.full_name()) {
                    segment.insert(node.clone());
                }
            }
        }
        segment.agent_health = Some(state.health.clone());
        segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_protocol::NodeEndpointName;

    fn config(name: &str) -> NodeConfig {
        NodeConfig::new(NodeEndpointName::parse(name).unwrap(), "me:9380", "/data")
    }

    #[tokio::test]
    async fn test_replacing_nodes_keeps_state_of_survivors() {
        let model = AgentModel::new();
        model
            .replace_client_nodes("mc:1", vec![config("T.S.a"), config("T.S.b")])
            .await;
        model
            .update_log_state(
                "T.S.a",
                NodeLogState {
                    headers_height: Some(5),
                    ..Default::default()
                },
            )
            .await;

        model.replace_client_nodes("mc:1", vec![config("T.S.a")]).await;
        assert_eq!(model.managed_count().await, 1);
        assert_eq!(model.node("T.S.a").await.unwrap().state.header_height, Some(5));
    }

    #[tokio::test]
    async fn test_shared_node_survives_one_client_leaving() {
        let model = AgentModel::new();
        model.replace_client_nodes("mc:1", vec![config("T.S.a")]).await;
        model
            .replace_client_nodes("mc:2", vec![config("T.S.a"), config("T.S.b")])
            .await;
        assert_eq!(model.client_count().await, 2);

        model.remove_client("mc:2").await;
        assert_eq!(model.managed_count().await, 1);
        assert!(model.node("T.S.b").await.is_none());
    }

    #[tokio::test]
    async fn test_segment_holds_only_the_clients_nodes() {
        let model = AgentModel::new();
        model.replace_client_nodes("mc:1", vec![config("T.S.a")]).await;
        model.replace_client_nodes("mc:2", vec![config("T.S.b")]).await;
        model.stamp_update().await;

        let segment = model.segment_for_client("mc:1").await;
        assert_eq!(segment.len(), 1);
        assert!(segment.get("T.S.a").is_some());
        assert_eq!(segment.agent_health.unwrap().update_count, 1);
    }
}
