use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use fleet_protocol::{ActionRequest, Envelope, MessageTag, NodeAction};
use fleet_session::{
    DeliveryMode, DispatchCommand, Dispatcher, DispatcherHandle, EnvelopeSink, SessionError, TickOutcome,
};

struct ChannelSink(mpsc::UnboundedSender<Envelope>);

#[async_trait]
impl EnvelopeSink for ChannelSink {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), SessionError> {
        let _ = self.0.send(envelope.clone());
        Ok(())
    }
}

struct FailingSink;

#[async_trait]
impl EnvelopeSink for FailingSink {
    async fn deliver(&self, _envelope: &Envelope) -> Result<(), SessionError> {
        Err(SessionError::UnknownConnection("gone:1".into()))
    }
}

#[derive(Default)]
struct ActionQueue {
    queue: Mutex<Vec<ActionRequest>>,
    closed: AtomicBool,
}

#[async_trait]
impl Dispatcher for ActionQueue {
    fn tag(&self) -> MessageTag {
        MessageTag::ActionRequest
    }

    fn mode(&self) -> DeliveryMode {
        DeliveryMode::EdgeTriggered
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(500)
    }

    async fn produce(&self) -> Result<Option<Envelope>, SessionError> {
        let batch: Vec<ActionRequest> = std::mem::take(&mut *self.queue.lock().unwrap());
        if batch.is_empty() {
            return Ok(None);
        }
        Ok(Some(Envelope::new(self.tag(), &batch)?))
    }

    async fn stage(&self, command: DispatchCommand) -> Result<(), SessionError> {
        match command {
            DispatchCommand::Action(action) => {
                self.queue.lock().unwrap().push(action);
                Ok(())
            }
            DispatchCommand::Deploy { .. } => Err(SessionError::InvalidCommand {
                tag: self.tag(),
                reason: "not an action".into(),
            }),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct Heartbeat {
    produced: AtomicUsize,
}

#[async_trait]
impl Dispatcher for Heartbeat {
    fn tag(&self) -> MessageTag {
        MessageTag::ClientRegistration
    }

    fn mode(&self) -> DeliveryMode {
        DeliveryMode::Timed
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(1)
    }

    async fn produce(&self) -> Result<Option<Envelope>, SessionError> {
        let n = self.produced.fetch_add(1, Ordering::SeqCst);
        Ok(Some(Envelope::new(self.tag(), &n)?))
    }
}

fn start(node: &str) -> DispatchCommand {
    DispatchCommand::Action(ActionRequest {
        action: NodeAction::StartNode,
        node: node.to_string(),
        parameters: Vec::new(),
    })
}

fn bound(dispatcher: Arc<dyn Dispatcher>) -> (DispatcherHandle, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = DispatcherHandle::new("agent:1", dispatcher);
    handle.binding().bind(Arc::new(ChannelSink(tx)));
    (handle, rx)
}

#[tokio::test]
async fn test_edge_triggered_sends_once_per_arm() {
    let (handle, mut rx) = bound(Arc::new(ActionQueue::default()));

    assert_eq!(handle.tick().await, TickOutcome::Disarmed);

    handle.arm(start("T.S.a")).await.unwrap();
    assert!(handle.is_enabled());
    assert_eq!(handle.tick().await, TickOutcome::Sent);
    assert!(!handle.is_enabled());

    assert_eq!(handle.tick().await, TickOutcome::Disarmed);
    assert_eq!(handle.tick().await, TickOutcome::Disarmed);

    handle.arm(start("T.S.b")).await.unwrap();
    assert_eq!(handle.tick().await, TickOutcome::Sent);

    let first: Vec<ActionRequest> = rx.recv().await.unwrap().payload().unwrap();
    let second: Vec<ActionRequest> = rx.recv().await.unwrap().payload().unwrap();
    assert_eq!(first[0].node, "T.S.a");
    assert_eq!(second[0].node, "T.S.b");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_arming_without_queued_work_sends_nothing() {
    let (handle, mut rx) = bound(Arc::new(ActionQueue::default()));
    handle.set_enabled(true);
    assert_eq!(handle.tick().await, TickOutcome::Empty);
    assert!(!handle.is_enabled());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_rejected_command_does_not_arm() {
    let (handle, _rx) = bound(Arc::new(ActionQueue::default()));
    let deploy = DispatchCommand::Deploy {
        scope: fleet_protocol::ResourceScope::Agent,
        target: String::new(),
        path: "x".into(),
    };
    assert!(handle.arm(deploy).await.is_err());
    assert!(!handle.is_enabled());
}

#[tokio::test]
async fn test_timed_dispatcher_is_not_armable() {
    let (handle, _rx) = bound(Arc::new(Heartbeat::default()));
    let err = handle.arm(start("T.S.a")).await.unwrap_err();
    assert!(matches!(err, SessionError::NotArmable(MessageTag::ClientRegistration)));
}

#[tokio::test]
async fn test_failed_send_loses_the_command() {
    let handle = DispatcherHandle::new("agent:1", Arc::new(ActionQueue::default()));
    handle.binding().bind(Arc::new(FailingSink));
    handle.arm(start("T.S.a")).await.unwrap();
    assert_eq!(handle.tick().await, TickOutcome::Failed);
    assert_eq!(handle.tick().await, TickOutcome::Disarmed);
}

#[tokio::test]
async fn test_unbound_dispatcher_does_not_send() {
    let (handle, mut rx) = bound(Arc::new(Heartbeat::default()));
    handle.binding().unbind();
    assert_eq!(handle.tick().await, TickOutcome::Unbound);
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_timed_loop_fires_at_start_then_every_interval() {
    let heartbeat = Arc::new(Heartbeat::default());
    let (mut handle, mut rx) = bound(heartbeat.clone());
    handle.start();
    assert!(handle.is_running());

    rx.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(3500)).await;
    let mut count = 1;
    while rx.try_recv().is_ok() {
        count += 1;
    }
    assert_eq!(count, 4);

    handle.stop();
    assert!(!handle.is_running());
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_edge_triggered_loop_consumes_arm_on_next_tick() {
    let queue = Arc::new(ActionQueue::default());
    let (mut handle, mut rx) = bound(queue.clone());
    handle.start();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(rx.try_recv().is_err());

    handle.arm(start("T.S.a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(rx.try_recv().is_ok());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(rx.try_recv().is_err());

    handle.close().await;
    assert!(queue.closed.load(Ordering::SeqCst));
}
