use fleet_protocol::NodeNetwork;

/// What a merge changed in the master network.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Nodes already known to the master and overwritten.
    pub updated: Vec<String>,
    /// Nodes the master had not seen before.
    pub added: Vec<String>,
}

impl MergeSummary {
    pub fn touched(&self) -> usize {
        self.updated.len() + self.added.len()
    }
}

/// Fold a partial segment reported by one agent into the master network.
///
/// Every node present in the segment replaces the master's entry (or is
/// added). Nodes absent from the segment are left alone; a merge never
/// deletes. The segment's agent health replaces the master's wholesale.
/// Last writer wins: there is no ordering or version check.
pub fn merge_segment(master: &mut NodeNetwork, segment: &NodeNetwork) -> MergeSummary {
    let mut summary = MergeSummary::default();

    for (name, node) in &segment.nodes {
        match master.nodes.insert(name.clone(), node.clone()) {
            Some(_) => summary.updated.push(name.clone()),
            None => summary.added.push(name.clone()),
        }
    }
    master.agent_health = segment.agent_health.clone();

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_protocol::{AgentHealthState, Node, NodeConfig, NodeEndpointName};

    fn node(name: &str, height: u64) -> Node {
        let config = NodeConfig::new(NodeEndpointName::parse(name).unwrap(), "agent:1", "/data");
        let mut node = Node::new(config);
        node.state.block_height = Some(height);
        node
    }

    #[test]
    fn test_empty_segment_only_replaces_health() {
        let mut master = NodeNetwork::new();
        master.insert(node("T.S.a", 1));
        master.agent_health = Some(AgentHealthState {
            thread_count: 4,
            ..Default::default()
        });

        let summary = merge_segment(&mut master, &NodeNetwork::new());
        assert_eq!(summary.touched(), 0);
        assert_eq!(master.len(), 1);
        assert!(master.agent_health.is_none());
    }

    #[test]
    fn test_summary_separates_updates_from_additions() {
        let mut master = NodeNetwork::new();
        master.insert(node("T.S.a", 1));
        let mut segment = NodeNetwork::new();
        segment.insert(node("T.S.a", 2));
        segment.insert(node("T.S.b", 3));

        let summary = merge_segment(&mut master, &segment);
        assert_eq!(summary.updated, vec!["T.S.a".to_string()]);
        assert_eq!(summary.added, vec!["T.S.b".to_string()]);
    }
}
