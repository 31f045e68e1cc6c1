use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use fleet_protocol::{Envelope, MessageTag};
use fleet_transport::{Accepted, Connection, ConnectionEvent, ConnectionState, TransportEvent};

use crate::dispatcher::{DispatchCommand, Dispatcher, DispatcherHandle, EnvelopeSink};
use crate::events::{EventBus, SessionEvent};
use crate::processor::{ProcessorContext, ProcessorTable, RequestProcessor, RouteOutcome};
use crate::SessionError;

/// Per-side wiring of a connection: which processors and dispatchers it gets.
pub trait ConnectionFactory: Send + Sync + 'static {
    /// One fresh processor per inbound tag.
    fn processors(&self, address: &str) -> Vec<Box<dyn RequestProcessor>>;

    /// One fresh dispatcher per outbound tag.
    fn dispatchers(&self, address: &str) -> Vec<Arc<dyn Dispatcher>>;

    /// Sent ahead of everything else when this side opens a connection.
    fn greeting(&self, _address: &str) -> Option<Envelope> {
        None
    }
}

struct ConnectionEntry {
    connection: Arc<Connection>,
    /// Feeds the connection's routing task; `None` until the connection opens.
    inbound: Option<mpsc::UnboundedSender<Bytes>>,
    dispatchers: HashMap<MessageTag, DispatcherHandle>,
}

impl ConnectionEntry {
    fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            inbound: None,
            dispatchers: HashMap::new(),
        }
    }

    fn is_backed_by(&self, connection: u64) -> bool {
        self.connection.id() == connection
    }
}

/// Route every message of one connection, in arrival order, through its
/// processor table. Ends once the sender is dropped and the queue drained.
fn spawn_inbound(address: &str, mut table: ProcessorTable, events: EventBus) -> mpsc::UnboundedSender<Bytes> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let ctx = ProcessorContext::new(address, events);
    tokio::spawn(async move {
        while let Some(raw) = rx.recv().await {
            if let RouteOutcome::Processed(tag) = table.route(&ctx, &raw).await {
                tracing::trace!(address = %ctx.address, tag = %tag, "Message processed");
            }
        }
        tracing::trace!(address = %ctx.address, "Inbound routing stopped");
    });
    tx
}

/// Registry of connections plus the event loop that drives them.
pub struct Session<F: ConnectionFactory> {
    factory: Arc<F>,
    registry: RwLock<HashMap<String, ConnectionEntry>>,
    events: EventBus,
    transport_tx: mpsc::UnboundedSender<ConnectionEvent>,
    transport_rx: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
}

impl<F: ConnectionFactory> Session<F> {
    pub fn new(factory: F) -> Arc<Self> {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            factory: Arc::new(factory),
            registry: RwLock::new(HashMap::new()),
            events: EventBus::default(),
            transport_tx,
            transport_rx: Mutex::new(Some(transport_rx)),
        })
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Register a connection for `address`. Returns `false` when the address
    /// is already registered, in which case nothing changes.
    pub async fn register(&self, address: &str) -> bool {
        let mut registry = self.registry.write().await;
        if registry.contains_key(address) {
            return false;
        }
        let connection = Connection::new(address, self.transport_tx.clone());
        registry.insert(address.to_string(), ConnectionEntry::new(connection));
        tracing::debug!(address = %address, "Connection registered");
        true
    }

    /// Register (if needed) and open the connection to `address`.
    pub async fn connect(&self, address: &str) -> Result<(), SessionError> {
        self.register(address).await;
        let connection = self.connection(address).await?;
        let greeting = self.factory.greeting(address);
        connection.connect(greeting.as_ref()).await?;
        Ok(())
    }

    /// Back a registered connection with an existing stream.
    pub async fn attach<S>(&self, address: &str, stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.register(address).await;
        let connection = self.connection(address).await?;
        let greeting = self
            .factory
            .greeting(address)
            .map(|g| g.to_bytes())
            .transpose()?
            .map(bytes::Bytes::from);
        connection.attach(stream, greeting)?;
        Ok(())
    }

    /// Take over a socket accepted by a listener.
    pub async fn accept(&self, accepted: Accepted) -> Result<(), SessionError> {
        let address = accepted.address.clone();
        if !self.register(&address).await {
            tracing::debug!(address = %address, "Peer address already registered");
        }
        let connection = self.connection(&address).await?;
        connection.attach_accepted(accepted)?;
        Ok(())
    }

    /// Close the connection to `address` and drop it from the registry.
    ///
    /// The terminal event the transport raises afterwards belongs to the
    /// dropped connection and is ignored, so the address can be connected
    /// again right away.
    pub async fn close(&self, address: &str) -> Result<(), SessionError> {
        let connection = self.connection(address).await?;
        connection.close();
        self.teardown(address, connection.id(), ConnectionState::Closed, "closed".to_string())
            .await;
        Ok(())
    }

    /// Close every connection.
    pub async fn close_all(&self) {
        for address in self.addresses().await {
            if let Err(e) = self.close(&address).await {
                tracing::debug!(address = %address, error = %e, "Close skipped");
            }
        }
    }

    /// Arm a dispatcher of the connection to `address` with a command. It is
    /// sent on that dispatcher's next tick.
    pub async fn arm(&self, address: &str, tag: MessageTag, command: DispatchCommand) -> Result<(), SessionError> {
        let registry = self.registry.read().await;
        let entry = registry
            .get(address)
            .ok_or_else(|| SessionError::UnknownConnection(address.to_string()))?;
        let handle = entry.dispatchers.get(&tag).ok_or_else(|| SessionError::NoDispatcher {
            address: address.to_string(),
            tag,
        })?;
        handle.arm(command).await?;
        tracing::debug!(address = %address, tag = %tag, "Dispatcher armed");
        Ok(())
    }

    pub async fn addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.registry.read().await.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub async fn is_registered(&self, address: &str) -> bool {
        self.registry.read().await.contains_key(address)
    }

    pub async fn state(&self, address: &str) -> Option<ConnectionState> {
        self.registry
            .read()
            .await
            .get(address)
            .map(|e| e.connection.state())
    }

    /// Whether the `tag` dispatcher of `address` is ticking.
    pub async fn dispatcher_running(&self, address: &str, tag: MessageTag) -> Option<bool> {
        self.registry
            .read()
            .await
            .get(address)
            .and_then(|e| e.dispatchers.get(&tag))
            .map(DispatcherHandle::is_running)
    }

    async fn connection(&self, address: &str) -> Result<Arc<Connection>, SessionError> {
        self.registry
            .read()
            .await
            .get(address)
            .map(|e| Arc::clone(&e.connection))
            .ok_or_else(|| SessionError::UnknownConnection(address.to_string()))
    }

    /// Drive connection events until `shutdown` fires. May run only once.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SessionError> {
        let mut rx = self
            .transport_rx
            .lock()
            .await
            .take()
            .ok_or(SessionError::AlreadyRunning)?;

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle_event(event).await;
        }

        self.close_all().await;
        tracing::info!("Session stopped");
        Ok(())
    }

    /// Handling never waits on a processor: messages are handed to the
    /// connection's routing task, so one slow connection cannot stall the
    /// events of the others.
    async fn handle_event(&self, event: ConnectionEvent) {
        let ConnectionEvent {
            address,
            connection,
            event,
        } = event;
        match event {
            TransportEvent::Open => self.on_open(&address, connection).await,
            TransportEvent::Message(bytes) => self.on_message(&address, connection, bytes).await,
            TransportEvent::Closed => {
                self.on_terminal(&address, connection, ConnectionState::Closed, "closed by peer".to_string())
                    .await
            }
            TransportEvent::Error(reason) => {
                self.on_terminal(&address, connection, ConnectionState::Error, reason)
                    .await
            }
        }
    }

    async fn on_open(&self, address: &str, connection: u64) {
        let processors = ProcessorTable::from_processors(self.factory.processors(address));
        let processor_count = processors.len();
        let dispatchers = self.factory.dispatchers(address);

        {
            let mut registry = self.registry.write().await;
            let Some(entry) = registry.get_mut(address) else {
                tracing::warn!(address = %address, "Open event for unregistered connection");
                return;
            };
            if !entry.is_backed_by(connection) {
                tracing::debug!(address = %address, connection, "Open event of a replaced connection dropped");
                return;
            }

            for (_, mut old) in entry.dispatchers.drain() {
                old.binding().unbind();
                old.stop();
            }

            entry.inbound = Some(spawn_inbound(address, processors, self.events.clone()));
            let sink: Arc<dyn EnvelopeSink> = entry.connection.clone();
            for dispatcher in dispatchers {
                let mut handle = DispatcherHandle::new(address, dispatcher);
                handle.binding().bind(Arc::clone(&sink));
                handle.start();
                if let Some(mut replaced) = entry.dispatchers.insert(handle.tag(), handle) {
                    tracing::warn!(address = %address, tag = %replaced.tag(), "Replaced duplicate dispatcher");
                    replaced.binding().unbind();
                    replaced.stop();
                }
            }
            tracing::info!(
                address = %address,
                processors = processor_count,
                dispatchers = entry.dispatchers.len(),
                "Connection ready"
            );
        }

        self.events.publish(SessionEvent::ConnectionStatusChanged {
            address: address.to_string(),
            state: ConnectionState::Open,
            message: "connected".to_string(),
        });
    }

    async fn on_message(&self, address: &str, connection: u64, raw: Bytes) {
        let registry = self.registry.read().await;
        let inbound = match registry.get(address) {
            Some(entry) if entry.is_backed_by(connection) => entry.inbound.as_ref(),
            _ => None,
        };
        let Some(inbound) = inbound else {
            tracing::debug!(address = %address, connection, "Message for unknown connection dropped");
            return;
        };
        if inbound.send(raw).is_err() {
            tracing::debug!(address = %address, "Routing task gone, message dropped");
        }
    }

    /// Terminal transport event. A connection that is live again raised it
    /// for an earlier socket; the reopen already rebuilt its wiring.
    async fn on_terminal(&self, address: &str, connection: u64, state: ConnectionState, message: String) {
        let reopened = self
            .registry
            .read()
            .await
            .get(address)
            .filter(|entry| entry.is_backed_by(connection))
            .map(|entry| {
                matches!(
                    entry.connection.state(),
                    ConnectionState::Connecting | ConnectionState::Open
                )
            });
        if reopened == Some(true) {
            tracing::debug!(address = %address, "Terminal event of an earlier socket dropped");
            return;
        }
        self.teardown(address, connection, state, message).await;
    }

    /// Unbind, stop and close every dispatcher, then forget the connection.
    /// Does nothing unless `connection` is the one registered for `address`.
    async fn teardown(&self, address: &str, connection: u64, state: ConnectionState, message: String) {
        let removed = {
            let mut registry = self.registry.write().await;
            match registry.get(address).map(|entry| entry.is_backed_by(connection)) {
                Some(true) => registry.remove(address),
                Some(false) => {
                    tracing::debug!(address = %address, connection, "Terminal event of a replaced connection dropped");
                    None
                }
                None => None,
            }
        };
        let Some(mut entry) = removed else {
            return;
        };
        // Dropping the sender lets the routing task drain and stop.
        entry.inbound = None;

        for handle in entry.dispatchers.values() {
            handle.binding().unbind();
        }
        for handle in entry.dispatchers.values_mut() {
            handle.close().await;
        }

        match state {
            ConnectionState::Error => tracing::warn!(address = %address, reason = %message, "Connection failed"),
            _ => tracing::info!(address = %address, "Connection closed"),
        }
        self.events.publish(SessionEvent::ConnectionStatusChanged {
            address: address.to_string(),
            state,
            message,
        });
    }
}
