use std::sync::Arc;

use tokio::sync::RwLock;

use fleet_protocol::{Node, NodeConfig, NodeNetwork};

use crate::merge::{merge_segment, MergeSummary};

/// Shared handle to the master node network.
///
/// Writers hold the lock only for a synchronous mutation. Readers clone the
/// subset they need and release the lock before doing any I/O with it.
#[derive(Debug, Clone, Default)]
pub struct NetworkModel {
    inner: Arc<RwLock<NodeNetwork>>,
}

impl NetworkModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the node topology. Nodes already known keep their observed
    /// state and take the new configuration; unknown nodes are added.
    pub async fn load_topology(&self, configs: Vec<NodeConfig>) {
        let mut network = self.inner.write().await;
        for config in configs {
            match network.nodes.get_mut(config.full_name()) {
                Some(node) => node.config = config,
                None => {
                    network.insert(Node::new(config));
                }
            }
        }
        tracing::info!(nodes = network.len(), "Node topology loaded");
    }

    pub async fn merge_segment(&self, segment: &NodeNetwork) -> MergeSummary {
        let summary = {
            let mut network = self.inner.write().await;
            merge_segment(&mut network, segment)
        };
        tracing::debug!(
            updated = summary.updated.len(),
            added = summary.added.len(),
            "Merged network segment"
        );
        summary
    }

    pub async fn snapshot(&self) -> NodeNetwork {
        self.inner.read().await.clone()
    }

    pub async fn node(&self, full_name: &str) -> Option<Node> {
        self.inner.read().await.get(full_name).cloned()
    }

    /// Enabled configurations of the nodes assigned to the agent at `address`.
    pub async fn configs_for_agent(&self, address: &str) -> Vec<NodeConfig> {
        self.inner.read().await.configs_for_agent(address)
    }

    /// Distinct agent addresses referenced by the topology.
    pub async fn agent_addresses(&self) -> Vec<String> {
        let network = self.inner.read().await;
        let mut addresses: Vec<String> = network.nodes.values().map(|n| n.config.agent.clone()).collect();
        addresses.sort();
        addresses.dedup();
        addresses
    }

    /// Returns `false` when the node is unknown.
    pub async fn set_enabled(&self, full_name: &str, enabled: bool) -> bool {
        let mut network = self.inner.write().await;
        match network.nodes.get_mut(full_name) {
            Some(node) => {
                node.config.enabled = enabled;
                true
            }
            None => false,
        }
    }
}
