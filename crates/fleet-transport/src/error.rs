/// Errors raised by the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection to {0} is not open")]
    NotOpen(String),

    #[error("connection to {0} is already open")]
    AlreadyOpen(String),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("protocol error: {0}")]
    Protocol(#[from] fleet_protocol::ProtocolError),
}
