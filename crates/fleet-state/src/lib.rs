//! Fleet State - the master node network and how agent segments fold into it.

pub mod merge;
pub mod model;

pub use merge::{merge_segment, MergeSummary};
pub use model::NetworkModel;
