/// Errors raised while encoding or decoding protocol messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Envelope(String),

    #[error("cannot decode {tag} payload: {reason}")]
    Payload { tag: String, reason: String },

    #[error("cannot encode {tag} payload: {reason}")]
    Encode { tag: String, reason: String },

    #[error("invalid node name '{0}': expected <network>.<blockchain>.<node>")]
    NodeName(String),

    #[error("deployment of '{file}' failed integrity check: {reason}")]
    Integrity { file: String, reason: String },
}
