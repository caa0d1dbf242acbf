//! The ports layer: routed, ordered, at-most-once message delivery over
//! an overlay graph of nodes. Pure logic, no I/O — see
//! [`node_controller`](crate::node_controller) for the layer that wires
//! this to real channels.

pub mod message;
pub mod node;
pub mod port;

pub use message::{Event, Message, PortDescriptor};
pub use node::{Node, NodeDelegate};
pub use port::{PortObserver, PortRef, PortState, PortStatus};
