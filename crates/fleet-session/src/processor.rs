//! Inbound pipeline: envelope decode, tag lookup, typed processing.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use fleet_protocol::{Envelope, MessageTag};

use crate::events::{EventBus, SessionEvent};
use crate::SessionError;

/// What a processor sees of the connection it belongs to.
#[derive(Debug, Clone)]
pub struct ProcessorContext {
    pub address: String,
    pub events: EventBus,
}

impl ProcessorContext {
    pub fn new(address: impl Into<String>, events: EventBus) -> Self {
        Self {
            address: address.into(),
            events,
        }
    }
}

/// Domain half of a processor: what to do with one decoded payload type.
#[async_trait]
pub trait PayloadHandler: Send + 'static {
    type Payload: DeserializeOwned + Send + Sync + 'static;

    fn tag(&self) -> MessageTag;

    /// Apply the effect of a message. `payload` is `None` when decoding
    /// failed; handlers must cope with that.
    async fn apply(&mut self, ctx: &ProcessorContext, payload: Option<&Self::Payload>) -> Result<(), SessionError>;

    /// The notification raised once processing is over.
    fn completion(&self, ctx: &ProcessorContext, _payload: Option<&Self::Payload>) -> SessionEvent {
        SessionEvent::MessageProcessed {
            address: ctx.address.clone(),
            tag: self.tag(),
        }
    }
}

/// Object-safe processor bound to a single tag, owned by one connection.
#[async_trait]
pub trait RequestProcessor: Send {
    fn tag(&self) -> MessageTag;

    /// Decode, apply, notify. Never fails: errors are logged here.
    async fn process(&mut self, ctx: &ProcessorContext, envelope: &Envelope);
}

/// Adapts a [`PayloadHandler`] into a [`RequestProcessor`] and keeps the most
/// recently decoded payload.
pub struct TypedProcessor<H: PayloadHandler> {
    handler: H,
    last: Option<H::Payload>,
}

impl<H: PayloadHandler> TypedProcessor<H> {
    pub fn new(handler: H) -> Self {
        Self { handler, last: None }
    }

    pub fn boxed(handler: H) -> Box<dyn RequestProcessor> {
        Box::new(Self::new(handler))
    }

    pub fn last(&self) -> Option<&H::Payload> {
        self.last.as_ref()
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

#[async_trait]
impl<H: PayloadHandler> RequestProcessor for TypedProcessor<H> {
    fn tag(&self) -> MessageTag {
        self.handler.tag()
    }

    async fn process(&mut self, ctx: &ProcessorContext, envelope: &Envelope) {
        let tag = self.handler.tag();

        self.last = match envelope.payload::<H::Payload>() {
            Ok(payload) => Some(payload),
            Err(e) => {
                tracing::warn!(address = %ctx.address, tag = %tag, error = %e, "Cannot decode payload");
                None
            }
        };

        if let Err(e) = self.handler.apply(ctx, self.last.as_ref()).await {
            tracing::error!(address = %ctx.address, tag = %tag, error = %e, "Processor failed");
        }

        ctx.events.publish(self.handler.completion(ctx, self.last.as_ref()));
    }
}

/// Result of routing one raw inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Processed(MessageTag),
    MalformedEnvelope,
    UnknownTag(String),
}

/// The tag to processor table of one connection.
#[derive(Default)]
pub struct ProcessorTable {
    processors: HashMap<MessageTag, Box<dyn RequestProcessor>>,
}

impl ProcessorTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_processors(processors: Vec<Box<dyn RequestProcessor>>) -> Self {
        let mut table = Self::new();
        for processor in processors {
            table.register(processor);
        }
        table
    }

    /// Register a processor, replacing any previous one for the same tag.
    pub fn register(&mut self, processor: Box<dyn RequestProcessor>) {
        let tag = processor.tag();
        if self.processors.insert(tag, processor).is_some() {
            tracing::warn!(tag = %tag, "Replaced duplicate processor");
        }
    }

    pub fn contains(&self, tag: MessageTag) -> bool {
        self.processors.contains_key(&tag)
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Route one raw message. Nothing raised here escapes to the caller and
    /// the connection stays usable whatever the outcome.
    pub async fn route(&mut self, ctx: &ProcessorContext, raw: &[u8]) -> RouteOutcome {
        let envelope = match Envelope::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(address = %ctx.address, bytes = raw.len(), error = %e, "Dropping malformed message");
                return RouteOutcome::MalformedEnvelope;
            }
        };

        let processor = envelope
            .message_tag()
            .and_then(|tag| self.processors.get_mut(&tag));
        let Some(processor) = processor else {
            tracing::error!(address = %ctx.address, tag = %envelope.tag, "Unknown message type, dropping");
            return RouteOutcome::UnknownTag(envelope.tag);
        };

        tracing::trace!(address = %ctx.address, tag = %envelope.tag, id = %envelope.id, "Routing message");
        processor.process(ctx, &envelope).await;
        RouteOutcome::Processed(processor.tag())
    }
}
