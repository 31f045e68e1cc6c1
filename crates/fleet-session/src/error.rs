use fleet_protocol::{MessageTag, ProtocolError};
use fleet_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no connection registered for {0}")]
    UnknownConnection(String),

    #[error("connection {address} has no {tag} dispatcher")]
    NoDispatcher { address: String, tag: MessageTag },

    #[error("{0} dispatcher does not accept commands")]
    NotArmable(MessageTag),

    #[error("{tag} command rejected: {reason}")]
    InvalidCommand { tag: MessageTag, reason: String },

    #[error("{tag} handler failed: {reason}")]
    Handler { tag: MessageTag, reason: String },

    #[error("session event loop is already running")]
    AlreadyRunning,
}
