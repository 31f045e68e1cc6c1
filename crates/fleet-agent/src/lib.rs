//! Fleet Agent - runs next to the managed nodes.
//!
//! Accepts connections from mission control, applies the node configuration
//! and commands it receives, and reports node state derived from the
//! [`probes`] back on every connection.

pub mod agent;
pub mod config;
pub mod dispatchers;
pub mod error;
pub mod executor;
pub mod probes;
pub mod processors;
pub mod state;

pub use agent::{Agent, AgentFactory};
pub use config::AgentConfig;
pub use error::AgentError;
pub use executor::{NodeActionExecutor, ProcessExecutor};
pub use state::AgentModel;
