//! Fleet Protocol - envelope and payload definitions
//!
//! Every message exchanged between mission control and an agent travels as an
//! [`Envelope`]: a string tag naming the message type plus an opaque JSON
//! payload. Typed payloads live in [`types`].

pub mod constants;
pub mod envelope;
pub mod error;
pub mod types;

pub use constants::*;
pub use envelope::*;
pub use error::*;
pub use types::*;
