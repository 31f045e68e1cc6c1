//! Agent served on a real TCP listener, driven by a scripted mission control.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use fleet_agent::{Agent, AgentConfig, ProcessExecutor};
use fleet_protocol::{
    AgentRegistration, ClientRegistration, Envelope, FileDeployment, MessageTag, NodeConfig, NodeEndpointName,
    NodeNetwork, Resource, ResourceScope, PROTOCOL_VERSION,
};
use fleet_transport::{Connection, ConnectionEvent, Listener, TransportEvent};

struct FakeMission {
    conn: Arc<Connection>,
    rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl FakeMission {
    async fn next_with_tag(&mut self, tag: MessageTag) -> Envelope {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match self.rx.recv().await.expect("mission events closed").event {
                    TransportEvent::Message(bytes) => {
                        let envelope = Envelope::from_slice(&bytes).unwrap();
                        if envelope.message_tag() == Some(tag) {
                            return envelope;
                        }
                    }
                    TransportEvent::Open => continue,
                    other => panic!("unexpected event {other:?}"),
                }
            }
        })
        .await
        .expect("timed out waiting for agent message")
    }

    async fn send<T: serde::Serialize>(&self, tag: MessageTag, payload: &T) {
        self.conn
            .send_envelope(&Envelope::new(tag, payload).unwrap())
            .await
            .unwrap();
    }
}

fn registration(update_frequency_ms: u64) -> ClientRegistration {
    ClientRegistration {
        update_frequency_ms,
        network: "Test".to_string(),
        user: "tester".to_string(),
        platform: "linux".to_string(),
        workstation_name: "ws".to_string(),
        protocol_version: PROTOCOL_VERSION.to_string(),
    }
}

async fn setup(dir: &Path) -> (Arc<Agent>, FakeMission, CancellationToken) {
    let mut config = AgentConfig::default();
    config.probes.interval_ms = 50;
    config.dispatch.resource_list_secs = 1;
    config.deploy.root = dir.join("deploy");

    let listener = Listener::bind("127.0.0.1:0", 4).await.unwrap();
    let address = listener.local_addr().unwrap().to_string();

    let agent = Arc::new(Agent::new(config.clone(), Arc::new(ProcessExecutor::new(&config.executor))));
    let shutdown = CancellationToken::new();
    {
        let agent = Arc::clone(&agent);
        let token = shutdown.clone();
        tokio::spawn(async move { agent.serve(listener, token).await });
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let conn = Connection::new(address, tx);
    let greeting = Envelope::new(MessageTag::ClientRegistration, &registration(100)).unwrap();
    conn.connect(Some(&greeting)).await.unwrap();

    (agent, FakeMission { conn, rx }, shutdown)
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition never held");
}

#[tokio::test]
async fn test_agent_registers_after_connect() {
    let dir = tempfile::tempdir().unwrap();
    let (_agent, mut mission, shutdown) = setup(dir.path()).await;

    let registration: AgentRegistration = mission
        .next_with_tag(MessageTag::AgentRegistration)
        .await
        .payload()
        .unwrap();
    assert_eq!(registration.managed_nodes, 0);
    assert_eq!(registration.protocol_version, PROTOCOL_VERSION);
    shutdown.cancel();
}

#[tokio::test]
async fn test_node_data_carries_heights_from_the_node_log() {
    let dir = tempfile::tempdir().unwrap();
    let (_agent, mut mission, shutdown) = setup(dir.path()).await;

    let node = NodeConfig::new(NodeEndpointName::parse("Test.Chain.n1").unwrap(), "me:1", dir.path());
    let logs = node.network_directory().join("Logs");
    std::fs::create_dir_all(&logs).unwrap();
    std::fs::write(logs.join("node.txt"), "Headers.Height: 42\nConsensus.Height: 41\n").unwrap();
    mission.send(MessageTag::NodeConfiguration, &vec![node]).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let segment: NodeNetwork = mission.next_with_tag(MessageTag::NodeData).await.payload().unwrap();
            if let Some(node) = segment.get("Test.Chain.n1") {
                if node.state.header_height == Some(42) {
                    assert_eq!(node.state.consensus_height, Some(41));
                    assert!(segment.agent_health.unwrap().update_count > 0);
                    return;
                }
            }
        }
    })
    .await
    .expect("node data never reflected the log");
    shutdown.cancel();
}

#[tokio::test]
async fn test_deployed_file_is_written_and_listed() {
    let dir = tempfile::tempdir().unwrap();
    let (_agent, mut mission, shutdown) = setup(dir.path()).await;

    let deployment = FileDeployment::from_bytes(ResourceScope::Agent, "", "settings.json", b"{\"a\":1}");
    mission.send(MessageTag::DeployFile, &vec![deployment]).await;

    let target = dir.path().join("deploy").join("settings.json");
    eventually(|| {
        let target = target.clone();
        async move { target.exists() }
    })
    .await;
    assert_eq!(std::fs::read(&target).unwrap(), b"{\"a\":1}");

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let resources: Vec<Resource> = mission.next_with_tag(MessageTag::FileDownload).await.payload().unwrap();
            if resources.iter().any(|r| r.name == "settings.json" && r.size == 7) {
                return;
            }
        }
    })
    .await
    .expect("deployed file never listed");
    shutdown.cancel();
}

#[tokio::test]
async fn test_client_leaving_releases_its_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let (agent, mut mission, shutdown) = setup(dir.path()).await;
    mission.next_with_tag(MessageTag::AgentRegistration).await;

    let node = NodeConfig::new(NodeEndpointName::parse("Test.Chain.n1").unwrap(), "me:1", dir.path());
    mission.send(MessageTag::NodeConfiguration, &vec![node]).await;
    let model = agent.model().clone();
    eventually(|| {
        let model = model.clone();
        async move { model.managed_count().await == 1 }
    })
    .await;
    assert_eq!(model.update_frequency_ms(&agent.session().addresses().await[0]).await, Some(100));

    mission.conn.close();
    eventually(|| {
        let model = model.clone();
        async move { model.client_count().await == 0 && model.managed_count().await == 0 }
    })
    .await;
    shutdown.cancel();
}
