//! Duplex transport for fleet connections.
//!
//! A [`Connection`] owns one socket at a time. Outbound messages are split
//! into fixed-size [`Frame`]s by a single writer task, so frames of two
//! messages never interleave. The receive loop reassembles frames until the
//! FIN flag and reports each complete message as a [`TransportEvent`].

pub mod connection;
pub mod error;
pub mod frame;
pub mod listener;

pub use connection::{Connection, ConnectionEvent, ConnectionState, EventSender, TransportEvent};
pub use error::TransportError;
pub use frame::{split_message, Frame, FrameCodec, FrameKind, MessageAssembler};
pub use listener::{Accepted, Listener};
