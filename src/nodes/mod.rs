//! Node registry
//!
//! Nodes are driver processes that enrolled with the hub. The registry owns
//! their records, declared actions and most recent published state

pub mod registry;
pub mod types;

pub use registry::NodeRegistry;
pub use types::{Action, ConnectionStatus, Node, NodeDescriptor, NodeId, NodeRecord};
