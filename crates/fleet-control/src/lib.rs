//! Mission control side of the fleet control plane.
//!
//! Connects to every configured agent, pushes registration, node
//! configuration and one-shot commands, and folds the network segments the
//! agents report back into the master [`fleet_state::NetworkModel`].

pub mod config;
pub mod directory;
pub mod dispatchers;
pub mod mission;
pub mod processors;

pub use config::ControlConfig;
pub use directory::{AgentDirectory, AgentRecord};
pub use mission::{ControlFactory, MissionControl};
