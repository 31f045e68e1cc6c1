use tokio::sync::broadcast;

use fleet_protocol::{AgentRegistration, MessageTag, NodeNetwork, Resource};
use fleet_transport::ConnectionState;

const EVENT_CAPACITY: usize = 256;

/// Notifications published to session consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionStatusChanged {
        address: String,
        state: ConnectionState,
        message: String,
    },
    /// An agent (re)registered. `None` when its payload could not be decoded.
    RegistrationUpdated {
        address: String,
        registration: Option<AgentRegistration>,
    },
    /// An agent reported a network segment, already merged into the master.
    StatsUpdated {
        address: String,
        segment: Option<NodeNetwork>,
    },
    DownloadUpdated {
        address: String,
        resources: Option<Vec<Resource>>,
    },
    /// Completion of an inbound message with no dedicated notification.
    MessageProcessed { address: String, tag: MessageTag },
}

impl SessionEvent {
    pub fn address(&self) -> &str {
        match self {
            Self::ConnectionStatusChanged { address, .. }
            | Self::RegistrationUpdated { address, .. }
            | Self::StatsUpdated { address, .. }
            | Self::DownloadUpdated { address, .. }
            | Self::MessageProcessed { address, .. } => address,
        }
    }
}

/// Publish/subscribe channel for [`SessionEvent`]s. Subscribing registers a
/// listener; dropping the receiver unregisters it.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SessionEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}
