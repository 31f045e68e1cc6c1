//! Fleet Session - the runtime shared by mission control and the agent.
//!
//! A [`Session`] owns every connection of one side, keyed by address. When a
//! connection opens, the side's [`ConnectionFactory`] supplies a fresh
//! [`ProcessorTable`] for inbound tags and one [`DispatcherHandle`] per
//! outbound tag. Inbound messages are routed to exactly one processor;
//! dispatchers tick on their own cadence and send through a [`Binding`] to
//! the connection. Consumers observe [`SessionEvent`]s on a broadcast bus.

pub mod dispatcher;
pub mod error;
pub mod events;
pub mod processor;
pub mod session;

pub use dispatcher::{
    Binding, DeliveryMode, DispatchCommand, Dispatcher, DispatcherHandle, EnvelopeSink, TickOutcome,
};
pub use error::SessionError;
pub use events::{EventBus, SessionEvent};
pub use processor::{
    PayloadHandler, ProcessorContext, ProcessorTable, RequestProcessor, RouteOutcome, TypedProcessor,
};
pub use session::{ConnectionFactory, Session};
