use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use fleet_protocol::{Envelope, MessageTag};
use fleet_session::{
    ConnectionFactory, DeliveryMode, Dispatcher, PayloadHandler, ProcessorContext, RequestProcessor, Session,
    SessionError, SessionEvent, TypedProcessor,
};
use fleet_transport::{Connection, ConnectionEvent, ConnectionState, TransportEvent};

type Calls = Arc<Mutex<HashMap<MessageTag, usize>>>;

struct Recorder {
    tag: MessageTag,
    calls: Calls,
    delay: Duration,
}

#[async_trait]
impl PayloadHandler for Recorder {
    type Payload = serde_json::Value;

    fn tag(&self) -> MessageTag {
        self.tag
    }

    async fn apply(&mut self, _ctx: &ProcessorContext, _payload: Option<&serde_json::Value>) -> Result<(), SessionError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        *self.calls.lock().unwrap().entry(self.tag).or_default() += 1;
        Ok(())
    }
}

struct Ticker {
    sent: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Dispatcher for Ticker {
    fn tag(&self) -> MessageTag {
        MessageTag::NodeData
    }

    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Timed
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(10)
    }

    async fn produce(&self) -> Result<Option<Envelope>, SessionError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Envelope::new(self.tag(), &serde_json::json!({}))?))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct TestFactory {
    calls: Calls,
    sent: Arc<AtomicUsize>,
    closed: Arc<AtomicBool>,
    with_ticker: bool,
    /// Address whose processors take this long per message.
    slow: Option<(&'static str, Duration)>,
}

impl ConnectionFactory for TestFactory {
    fn processors(&self, address: &str) -> Vec<Box<dyn RequestProcessor>> {
        let delay = match self.slow {
            Some((slow, delay)) if slow == address => delay,
            _ => Duration::ZERO,
        };
        MessageTag::ALL
            .into_iter()
            .map(|tag| {
                TypedProcessor::boxed(Recorder {
                    tag,
                    calls: self.calls.clone(),
                    delay,
                })
            })
            .collect()
    }

    fn dispatchers(&self, _address: &str) -> Vec<Arc<dyn Dispatcher>> {
        if !self.with_ticker {
            return Vec::new();
        }
        vec![Arc::new(Ticker {
            sent: self.sent.clone(),
            closed: self.closed.clone(),
        })]
    }
}

struct Harness {
    session: Arc<Session<TestFactory>>,
    events: broadcast::Receiver<SessionEvent>,
    peer: Arc<Connection>,
    peer_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    shutdown: CancellationToken,
}

/// Back `address` in the session with one end of an in-memory pipe and
/// return a peer connection on the other end, once the session reports it open.
async fn open_peer(
    session: &Session<TestFactory>,
    events: &mut broadcast::Receiver<SessionEvent>,
    address: &str,
) -> (Arc<Connection>, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (peer_tx, mut peer_events) = mpsc::unbounded_channel();
    let peer = Connection::new("session", peer_tx);
    peer.attach(remote, None).unwrap();
    assert_eq!(peer_events.recv().await.unwrap().event, TransportEvent::Open);

    session.attach(address, local).await.unwrap();
    loop {
        if let SessionEvent::ConnectionStatusChanged { address: changed, state, .. } = events.recv().await.unwrap() {
            if changed == address && state == ConnectionState::Open {
                break;
            }
        }
    }
    (peer, peer_events)
}

fn spawn_session(factory: TestFactory) -> (Arc<Session<TestFactory>>, CancellationToken) {
    let session = Session::new(factory);
    let shutdown = CancellationToken::new();
    {
        let session = session.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { session.run(shutdown).await });
    }
    (session, shutdown)
}

async fn harness(factory: TestFactory) -> Harness {
    let (session, shutdown) = spawn_session(factory);
    let mut events = session.subscribe();
    let (peer, peer_events) = open_peer(&session, &mut events, "peer:9380").await;

    Harness {
        session,
        events,
        peer,
        peer_events,
        shutdown,
    }
}

async fn next_processed(events: &mut broadcast::Receiver<SessionEvent>) -> MessageTag {
    loop {
        if let SessionEvent::MessageProcessed { tag, .. } = events.recv().await.unwrap() {
            return tag;
        }
    }
}

#[tokio::test]
async fn test_each_tag_reaches_exactly_one_processor() {
    let factory = TestFactory::default();
    let calls = factory.calls.clone();
    let mut h = harness(factory).await;

    for tag in MessageTag::ALL {
        let envelope = Envelope::new(tag, &serde_json::json!({ "n": 1 })).unwrap();
        h.peer.send_envelope(&envelope).await.unwrap();
        assert_eq!(next_processed(&mut h.events).await, tag);
    }

    let calls = calls.lock().unwrap();
    for tag in MessageTag::ALL {
        assert_eq!(calls.get(&tag), Some(&1), "{tag}");
    }
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_unknown_tag_is_dropped_without_completion() {
    let factory = TestFactory::default();
    let calls = factory.calls.clone();
    let mut h = harness(factory).await;

    h.peer
        .send(Bytes::from_static(br#"{"id":"x","tag":"Telemetry","payload":{}}"#))
        .await
        .unwrap();
    h.peer.send(Bytes::from_static(b"garbage")).await.unwrap();
    let known = Envelope::new(MessageTag::FileDownload, &Vec::<u8>::new()).unwrap();
    h.peer.send_envelope(&known).await.unwrap();

    // The first completion observed belongs to the known tag.
    assert_eq!(next_processed(&mut h.events).await, MessageTag::FileDownload);
    assert_eq!(calls.lock().unwrap().values().sum::<usize>(), 1);
    assert_eq!(h.session.state("peer:9380").await, Some(ConnectionState::Open));
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_close_stops_dispatchers_and_unregisters() {
    let factory = TestFactory {
        with_ticker: true,
        ..Default::default()
    };
    let sent = factory.sent.clone();
    let closed = factory.closed.clone();
    let mut h = harness(factory).await;

    // Wait for a couple of ticks to arrive at the peer.
    let mut received = 0;
    while received < 2 {
        if let TransportEvent::Message(_) = h.peer_events.recv().await.unwrap().event {
            received += 1;
        }
    }
    assert_eq!(h.session.dispatcher_running("peer:9380", MessageTag::NodeData).await, Some(true));

    h.session.close("peer:9380").await.unwrap();
    assert!(!h.session.is_registered("peer:9380").await);
    assert!(closed.load(Ordering::SeqCst));

    let after_close = sent.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(sent.load(Ordering::SeqCst) <= after_close + 1);
    let before = sent.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(sent.load(Ordering::SeqCst), before);

    loop {
        if let SessionEvent::ConnectionStatusChanged { state, .. } = h.events.recv().await.unwrap() {
            assert_eq!(state, ConnectionState::Closed);
            break;
        }
    }
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_peer_close_removes_connection() {
    let mut h = harness(TestFactory::default()).await;
    h.peer.close();

    loop {
        if let SessionEvent::ConnectionStatusChanged { state, address, .. } = h.events.recv().await.unwrap() {
            assert_eq!(address, "peer:9380");
            assert_eq!(state, ConnectionState::Closed);
            break;
        }
    }
    assert!(!h.session.is_registered("peer:9380").await);
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_reconnect_right_after_close_survives_the_old_close_event() {
    let factory = TestFactory {
        with_ticker: true,
        ..Default::default()
    };
    let calls = factory.calls.clone();
    let mut h = harness(factory).await;

    // The old connection's Closed event is still queued when the address is
    // backed again.
    h.session.close("peer:9380").await.unwrap();
    let (peer, _peer_events) = open_peer(&h.session, &mut h.events, "peer:9380").await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.session.is_registered("peer:9380").await);
    assert_eq!(h.session.state("peer:9380").await, Some(ConnectionState::Open));
    assert_eq!(h.session.dispatcher_running("peer:9380", MessageTag::NodeData).await, Some(true));

    let envelope = Envelope::new(MessageTag::FileDownload, &Vec::<u8>::new()).unwrap();
    peer.send_envelope(&envelope).await.unwrap();
    assert_eq!(next_processed(&mut h.events).await, MessageTag::FileDownload);
    assert_eq!(calls.lock().unwrap().get(&MessageTag::FileDownload), Some(&1));
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_slow_processor_does_not_hold_up_other_connections() {
    let factory = TestFactory {
        slow: Some(("slow:1", Duration::from_millis(800))),
        ..Default::default()
    };
    let (session, shutdown) = spawn_session(factory);
    let mut events = session.subscribe();
    let (slow, _slow_events) = open_peer(&session, &mut events, "slow:1").await;
    let (fast, _fast_events) = open_peer(&session, &mut events, "fast:1").await;

    let envelope = Envelope::new(MessageTag::NodeData, &serde_json::json!({})).unwrap();
    slow.send_envelope(&envelope).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = tokio::time::Instant::now();
    fast.send_envelope(&envelope).await.unwrap();
    let address = tokio::time::timeout(Duration::from_millis(400), async {
        loop {
            if let SessionEvent::MessageProcessed { address, .. } = events.recv().await.unwrap() {
                return address;
            }
        }
    })
    .await
    .expect("fast connection waited on the slow one");
    assert_eq!(address, "fast:1");
    assert!(started.elapsed() < Duration::from_millis(400));

    // The slow connection still completes its own message.
    let address = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let SessionEvent::MessageProcessed { address, .. } = events.recv().await.unwrap() {
                return address;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(address, "slow:1");
    shutdown.cancel();
}

#[tokio::test]
async fn test_messages_of_one_connection_are_processed_in_order() {
    let mut h = harness(TestFactory::default()).await;
    let tags = [MessageTag::NodeData, MessageTag::FileDownload, MessageTag::AgentRegistration];
    for tag in tags {
        let envelope = Envelope::new(tag, &serde_json::json!({})).unwrap();
        h.peer.send_envelope(&envelope).await.unwrap();
    }
    for tag in tags {
        assert_eq!(next_processed(&mut h.events).await, tag);
    }
    h.shutdown.cancel();
}

#[tokio::test]
async fn test_register_is_idempotent() {
    let session = Session::new(TestFactory::default());
    assert!(session.register("a:1").await);
    assert!(!session.register("a:1").await);
    assert_eq!(session.addresses().await, vec!["a:1".to_string()]);
    assert_eq!(session.state("a:1").await, Some(ConnectionState::Closed));
}

#[tokio::test]
async fn test_event_loop_runs_once() {
    let session = Session::new(TestFactory::default());
    let shutdown = CancellationToken::new();
    let first = {
        let session = session.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { session.run(shutdown).await })
    };
    tokio::task::yield_now().await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(matches!(
        session.run(CancellationToken::new()).await,
        Err(SessionError::AlreadyRunning)
    ));
    shutdown.cancel();
    assert!(first.await.unwrap().is_ok());
}
