//! Outbound scheduler: one tick loop per dispatcher per connection.
//!
//! A *timed* dispatcher sends on every tick. An *edge-triggered* dispatcher
//! sends only when armed, and the tick that observes the armed flag clears
//! it before building the payload. Delivery is fire-and-forget: if building
//! or sending fails the command is logged and gone.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use fleet_protocol::{ActionRequest, Envelope, MessageTag, ResourceScope};
use fleet_transport::Connection;

use crate::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Sends every interval; ignores the armed flag.
    Timed,
    /// Sends once per arm.
    EdgeTriggered,
}

/// A consumer-issued command for an edge-triggered dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchCommand {
    Action(ActionRequest),
    Deploy {
        scope: ResourceScope,
        target: String,
        path: PathBuf,
    },
}

/// Producer of one outbound message type for one connection.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    fn tag(&self) -> MessageTag;

    fn mode(&self) -> DeliveryMode;

    fn interval(&self) -> Duration;

    /// Delay before the first tick. Zero fires the first tick at start.
    fn initial_delay(&self) -> Duration {
        Duration::ZERO
    }

    /// Build the next outbound envelope from a snapshot of shared state.
    /// `None` means there is nothing to send this tick.
    async fn produce(&self) -> Result<Option<Envelope>, SessionError>;

    /// Queue a command ahead of the next armed tick.
    async fn stage(&self, _command: DispatchCommand) -> Result<(), SessionError> {
        Err(SessionError::NotArmable(self.tag()))
    }

    /// Release resources held by the dispatcher.
    async fn close(&self) {}
}

/// Where dispatchers deliver their envelopes.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), SessionError>;
}

#[async_trait]
impl EnvelopeSink for Connection {
    async fn deliver(&self, envelope: &Envelope) -> Result<(), SessionError> {
        Ok(self.send_envelope(envelope).await?)
    }
}

/// Explicit subscription of a dispatcher's output to a send path.
/// Unbinding detaches the dispatcher; ticks after that send nothing.
#[derive(Clone, Default)]
pub struct Binding {
    slot: Arc<Mutex<Option<Arc<dyn EnvelopeSink>>>>,
}

impl Binding {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&self, sink: Arc<dyn EnvelopeSink>) {
        *self.lock() = Some(sink);
    }

    pub fn unbind(&self) {
        self.lock().take();
    }

    pub fn is_bound(&self) -> bool {
        self.lock().is_some()
    }

    fn current(&self) -> Option<Arc<dyn EnvelopeSink>> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Arc<dyn EnvelopeSink>>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// What a single tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Sent,
    /// Edge-triggered and not armed.
    Disarmed,
    /// Nothing to send.
    Empty,
    Unbound,
    Failed,
}

/// Runtime wrapper around one dispatcher: armed flag, binding and tick loop.
pub struct DispatcherHandle {
    address: String,
    dispatcher: Arc<dyn Dispatcher>,
    enabled: Arc<AtomicBool>,
    binding: Binding,
    running: Option<CancellationToken>,
}

impl DispatcherHandle {
    pub fn new(address: impl Into<String>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self {
            address: address.into(),
            dispatcher,
            enabled: Arc::new(AtomicBool::new(false)),
            binding: Binding::new(),
            running: None,
        }
    }

    pub fn tag(&self) -> MessageTag {
        self.dispatcher.tag()
    }

    pub fn mode(&self) -> DeliveryMode {
        self.dispatcher.mode()
    }

    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Stage a command and arm the dispatcher for its next tick.
    pub async fn arm(&self, command: DispatchCommand) -> Result<(), SessionError> {
        self.dispatcher.stage(command).await?;
        self.set_enabled(true);
        Ok(())
    }

    /// Start the tick loop. No-op when already running.
    pub fn start(&mut self) {
        if self.running.is_some() {
            return;
        }
        let cancel = CancellationToken::new();
        self.running = Some(cancel.clone());

        let tick = TickContext {
            address: self.address.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            enabled: Arc::clone(&self.enabled),
            binding: self.binding.clone(),
        };
        let period = self.dispatcher.interval().max(Duration::from_millis(1));
        let start = Instant::now() + self.dispatcher.initial_delay();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                // Outside the select: stopping never interrupts a send.
                tick.run().await;
            }
            tracing::trace!(address = %tick.address, tag = %tick.dispatcher.tag(), "Dispatcher stopped");
        });
    }

    /// Halt future ticks. A send already in progress completes.
    pub fn stop(&mut self) {
        if let Some(cancel) = self.running.take() {
            cancel.cancel();
        }
    }

    /// Stop and release dispatcher-owned resources.
    pub async fn close(&mut self) {
        self.stop();
        self.dispatcher.close().await;
    }

    /// Run one tick immediately, outside the loop.
    pub async fn tick(&self) -> TickOutcome {
        TickContext {
            address: self.address.clone(),
            dispatcher: Arc::clone(&self.dispatcher),
            enabled: Arc::clone(&self.enabled),
            binding: self.binding.clone(),
        }
        .run()
        .await
    }
}

impl Drop for DispatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

struct TickContext {
    address: String,
    dispatcher: Arc<dyn Dispatcher>,
    enabled: Arc<AtomicBool>,
    binding: Binding,
}

impl TickContext {
    async fn run(&self) -> TickOutcome {
        let tag = self.dispatcher.tag();

        if self.dispatcher.mode() == DeliveryMode::EdgeTriggered && !self.enabled.swap(false, Ordering::SeqCst) {
            return TickOutcome::Disarmed;
        }

        let Some(sink) = self.binding.current() else {
            return TickOutcome::Unbound;
        };

        let envelope = match self.dispatcher.produce().await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return TickOutcome::Empty,
            Err(e) => {
                tracing::warn!(address = %self.address, tag = %tag, error = %e, "Cannot build outbound message");
                return TickOutcome::Failed;
            }
        };

        match sink.deliver(&envelope).await {
            Ok(()) => {
                tracing::debug!(address = %self.address, tag = %tag, id = %envelope.id, "Sent");
                TickOutcome::Sent
            }
            Err(e) => {
                tracing::warn!(address = %self.address, tag = %tag, error = %e, "Send failed");
                TickOutcome::Failed
            }
        }
    }
}
