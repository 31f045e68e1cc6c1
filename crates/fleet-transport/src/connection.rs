//! A logical connection to one peer, keyed by its `host:port` address.
//!
//! State machine per socket: `Connecting -> Open -> {Closed, Error}`.
//! The `Connection` object itself outlives its sockets and can be connected
//! again after reaching a terminal state. Each socket gets a generation
//! number so a late exit from an old socket's tasks cannot tear down a newer
//! one, and the terminal transition for a socket runs exactly once.
//!
//! Every event carries the connection's process-unique id. A consumer that
//! replaces the `Connection` registered under an address uses it to drop
//! events still queued from the replaced one.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use fleet_protocol::{Envelope, FRAME_CHUNK_SIZE, MAX_MESSAGE_SIZE};

use crate::frame::{split_message, Frame, FrameCodec, FrameKind, MessageAssembler};
use crate::TransportError;

const OUTBOUND_QUEUE: usize = 64;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Notification raised by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Open,
    /// One complete, reassembled message.
    Message(Bytes),
    Closed,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub address: String,
    /// Id of the `Connection` that raised the event.
    pub connection: u64,
    pub event: TransportEvent,
}

/// Channel on which connections publish their events.
pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

enum Outbound {
    Message(Bytes),
    Close,
}

/// Handles of the socket currently backing the connection.
struct Live {
    generation: u64,
    outbound: mpsc::Sender<Outbound>,
    cancel: CancellationToken,
    _permit: Option<OwnedSemaphorePermit>,
}

enum Terminal {
    /// Closed by this side; a close frame is sent to the peer.
    ClosedLocally,
    /// Peer sent a close frame or the stream ended.
    ClosedByPeer,
    Error(String),
}

pub struct Connection {
    id: u64,
    address: String,
    state: Mutex<ConnectionState>,
    info: Mutex<String>,
    live: Mutex<Option<Live>>,
    generation: AtomicU64,
    events: EventSender,
    chunk_size: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Connection {
    pub fn new(address: impl Into<String>, events: EventSender) -> Arc<Self> {
        Self::with_chunk_size(address, events, FRAME_CHUNK_SIZE)
    }

    pub fn with_chunk_size(address: impl Into<String>, events: EventSender, chunk_size: usize) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            address: address.into(),
            state: Mutex::new(ConnectionState::Closed),
            info: Mutex::new(String::new()),
            live: Mutex::new(None),
            generation: AtomicU64::new(0),
            events,
            chunk_size: chunk_size.max(1),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Last diagnostic for this connection; empty while healthy.
    pub fn info(&self) -> String {
        lock(&self.info).clone()
    }

    /// Open a TCP socket to the connection's address.
    ///
    /// On success the optional `greeting` is queued ahead of any other
    /// message, `Open` is raised and the receive loop starts. On failure the
    /// connection moves to `Error` and an `Error` event carries the reason.
    pub async fn connect(self: &Arc<Self>, greeting: Option<&Envelope>) -> Result<(), TransportError> {
        let greeting = greeting.map(Envelope::to_bytes).transpose()?.map(Bytes::from);
        self.begin_connect()?;
        tracing::debug!(address = %self.address, "Connecting");

        match TcpStream::connect(&self.address).await {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(address = %self.address, error = %e, "Cannot set TCP_NODELAY");
                }
                self.start(stream, greeting, None);
                Ok(())
            }
            Err(e) => {
                let reason = format!("cannot connect to {}: {e}", self.address);
                *lock(&self.state) = ConnectionState::Error;
                *lock(&self.info) = reason.clone();
                tracing::warn!(address = %self.address, error = %e, "Connection failed");
                self.emit(TransportEvent::Error(reason));
                Err(TransportError::Io(e))
            }
        }
    }

    /// Back the connection with an already established stream.
    pub fn attach<S>(self: &Arc<Self>, stream: S, greeting: Option<Bytes>) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.begin_connect()?;
        self.start(stream, greeting, None);
        Ok(())
    }

    pub(crate) fn attach_with_permit<S>(
        self: &Arc<Self>,
        stream: S,
        permit: OwnedSemaphorePermit,
    ) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        self.begin_connect()?;
        self.start(stream, None, Some(permit));
        Ok(())
    }

    /// Queue one message. Frames are produced by the writer task, so two
    /// concurrent calls never interleave their frames on the wire.
    pub async fn send(&self, message: Bytes) -> Result<(), TransportError> {
        if message.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::MessageTooLarge {
                size: message.len(),
                limit: MAX_MESSAGE_SIZE,
            });
        }

        let outbound = match lock(&self.live).as_ref() {
            Some(live) => live.outbound.clone(),
            None => return Err(TransportError::NotOpen(self.address.clone())),
        };
        outbound
            .send(Outbound::Message(message))
            .await
            .map_err(|_| TransportError::NotOpen(self.address.clone()))
    }

    pub async fn send_envelope(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let bytes = envelope.to_bytes()?;
        self.send(Bytes::from(bytes)).await
    }

    /// Close the current socket: a close frame is sent, the receive loop is
    /// cancelled and `Closed` is raised. No-op when nothing is open.
    pub fn close(&self) {
        let generation = self.generation.load(Ordering::SeqCst);
        self.finish(generation, Terminal::ClosedLocally);
    }

    fn begin_connect(&self) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if matches!(*state, ConnectionState::Connecting | ConnectionState::Open) {
            return Err(TransportError::AlreadyOpen(self.address.clone()));
        }
        *state = ConnectionState::Connecting;
        Ok(())
    }

    fn start<S>(self: &Arc<Self>, stream: S, greeting: Option<Bytes>, permit: Option<OwnedSemaphorePermit>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (reader, writer) = tokio::io::split(stream);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let cancel = CancellationToken::new();

        if let Some(greeting) = greeting {
            // Fresh channel with free capacity: cannot fail.
            let _ = outbound_tx.try_send(Outbound::Message(greeting));
        }

        *lock(&self.live) = Some(Live {
            generation,
            outbound: outbound_tx,
            cancel: cancel.clone(),
            _permit: permit,
        });
        *lock(&self.state) = ConnectionState::Open;
        lock(&self.info).clear();
        tracing::info!(address = %self.address, "Connection open");
        self.emit(TransportEvent::Open);

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.write_loop(FramedWrite::new(writer, FrameCodec::new()), outbound_rx, generation)
                .await;
        });

        let conn = Arc::clone(self);
        tokio::spawn(async move {
            conn.read_loop(FramedRead::new(reader, FrameCodec::new()), cancel, generation)
                .await;
        });
    }

    async fn write_loop<W>(
        &self,
        mut framed: FramedWrite<W, FrameCodec>,
        mut outbound: mpsc::Receiver<Outbound>,
        generation: u64,
    ) where
        W: AsyncWrite + Unpin,
    {
        while let Some(item) = outbound.recv().await {
            let result = match item {
                Outbound::Message(message) => {
                    let mut result = Ok(());
                    for frame in split_message(message, self.chunk_size) {
                        result = framed.feed(frame).await;
                        if result.is_err() {
                            break;
                        }
                    }
                    match result {
                        Ok(()) => framed.flush().await,
                        Err(e) => Err(e),
                    }
                }
                Outbound::Close => {
                    if let Err(e) = framed.send(Frame::close()).await {
                        tracing::debug!(address = %self.address, error = %e, "Close frame not delivered");
                    }
                    break;
                }
            };

            if let Err(e) = result {
                self.finish(generation, Terminal::Error(format!("send failed: {e}")));
                break;
            }
        }

        if let Err(e) = framed.close().await {
            tracing::trace!(address = %self.address, error = %e, "Socket shutdown error");
        }
    }

    async fn read_loop<R>(&self, mut framed: FramedRead<R, FrameCodec>, cancel: CancellationToken, generation: u64)
    where
        R: AsyncRead + Unpin,
    {
        let mut assembler = MessageAssembler::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = framed.next() => match frame {
                    Some(Ok(frame)) if frame.kind == FrameKind::Close => {
                        self.finish(generation, Terminal::ClosedByPeer);
                        break;
                    }
                    Some(Ok(frame)) => match assembler.push(frame) {
                        Ok(Some(message)) => self.emit(TransportEvent::Message(message)),
                        Ok(None) => {}
                        Err(e) => {
                            self.finish(generation, Terminal::Error(e.to_string()));
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        self.finish(generation, Terminal::Error(format!("receive failed: {e}")));
                        break;
                    }
                    None => {
                        self.finish(generation, Terminal::ClosedByPeer);
                        break;
                    }
                },
            }
        }
    }

    /// Terminal transition for socket `generation`; runs at most once per socket.
    fn finish(&self, generation: u64, terminal: Terminal) {
        let live = {
            let mut live = lock(&self.live);
            match live.as_ref() {
                Some(current) if current.generation == generation => live.take(),
                _ => None,
            }
        };
        let Some(live) = live else {
            return;
        };

        if matches!(terminal, Terminal::ClosedLocally) {
            let _ = live.outbound.try_send(Outbound::Close);
        }
        live.cancel.cancel();
        drop(live);

        let (state, info, event) = match terminal {
            Terminal::ClosedLocally | Terminal::ClosedByPeer => {
                (ConnectionState::Closed, String::new(), TransportEvent::Closed)
            }
            Terminal::Error(reason) => (
                ConnectionState::Error,
                reason.clone(),
                TransportEvent::Error(reason),
            ),
        };
        *lock(&self.state) = state;
        *lock(&self.info) = info;
        tracing::info!(address = %self.address, state = %state, "Connection finished");
        self.emit(event);
    }

    fn emit(&self, event: TransportEvent) {
        let event = ConnectionEvent {
            address: self.address.clone(),
            connection: self.id,
            event,
        };
        if self.events.send(event).is_err() {
            tracing::trace!(address = %self.address, "No listener for connection events");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}
