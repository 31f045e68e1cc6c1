use fleet_protocol::{MessageTag, ProtocolError};
use fleet_session::SessionError;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("node {0} is not managed by this agent")]
    UnknownNode(String),

    #[error("invalid file name '{0}'")]
    InvalidFileName(String),

    #[error("cannot launch {node}: {reason}")]
    Launch { node: String, reason: String },

    #[error("node {0} was not started by this agent")]
    NotRunning(String),
}

impl AgentError {
    pub fn into_session(self, tag: MessageTag) -> SessionError {
        SessionError::Handler {
            tag,
            reason: self.to_string(),
        }
    }
}
