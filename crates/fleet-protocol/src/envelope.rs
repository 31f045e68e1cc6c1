use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ProtocolError;

/// Message types carried over a fleet connection.
///
/// The tag travels as a plain string so that a peer running a newer protocol
/// can send tags this build does not know; those decode as an [`Envelope`]
/// and are dropped at routing time instead of failing the whole message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MessageTag {
    /// Mission control introduces itself to an agent.
    ClientRegistration,
    /// Agent introduces itself to mission control.
    AgentRegistration,
    /// Node configuration pushed from mission control to an agent.
    NodeConfiguration,
    /// Network segment (node state + agent health) reported by an agent.
    NodeData,
    /// Start/stop/remove-file commands for managed nodes.
    ActionRequest,
    /// File deployment from mission control to an agent.
    DeployFile,
    /// Resource listing reported by an agent.
    FileDownload,
}

impl MessageTag {
    pub const ALL: [MessageTag; 7] = [
        MessageTag::ClientRegistration,
        MessageTag::AgentRegistration,
        MessageTag::NodeConfiguration,
        MessageTag::NodeData,
        MessageTag::ActionRequest,
        MessageTag::DeployFile,
        MessageTag::FileDownload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientRegistration => "ClientRegistration",
            Self::AgentRegistration => "AgentRegistration",
            Self::NodeConfiguration => "NodeConfiguration",
            Self::NodeData => "NodeData",
            Self::ActionRequest => "ActionRequest",
            Self::DeployFile => "DeployFile",
            Self::FileDownload => "FileDownload",
        }
    }

    /// Resolve a wire tag. Returns `None` for tags this build does not know.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_str() == s)
    }
}

impl std::fmt::Display for MessageTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged message envelope. One envelope is one logical message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub tag: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Wrap a typed payload under the given tag.
    pub fn new<T: Serialize>(tag: MessageTag, payload: &T) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_value(payload).map_err(|e| ProtocolError::Encode {
            tag: tag.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            tag: tag.to_string(),
            payload,
        })
    }

    /// The known tag of this envelope, if any.
    pub fn message_tag(&self) -> Option<MessageTag> {
        MessageTag::parse(&self.tag)
    }

    /// Decode the payload into its typed form.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.payload).map_err(|e| ProtocolError::Payload {
            tag: self.tag.clone(),
            reason: e.to_string(),
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::Encode {
            tag: self.tag.clone(),
            reason: e.to_string(),
        })
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(data).map_err(|e| ProtocolError::Envelope(e.to_string()))
    }
}
