//! Wire shapes for the ports layer's internal event protocol.
//!
//! A [`Message`] is the unit routed by [`crate::ports::node::Node`]: a
//! typed [`Event`] header plus zero or more [`PortDescriptor`]s carrying
//! transferred ports, plus an opaque user payload. Unlike the original
//! implementation this crate does not lay these out as a single
//! contiguous byte buffer with manual offset arithmetic; `Event` and
//! `PortDescriptor` are ordinary `serde` types, bincode-encoded only at
//! the node-channel boundary (§6.1/§6.2 of the design doc). In-process
//! routing passes them by value.

use serde::{Deserialize, Serialize};

use crate::names::{NodeName, PortName};

/// Everything needed to reconstitute a transferred port on the receiving
/// side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub peer_node: NodeName,
    pub peer_port: PortName,
    pub referring_node: NodeName,
    pub referring_port: PortName,
    pub next_sequence_num_to_send: u64,
    pub next_sequence_num_to_receive: u64,
    pub last_sequence_num_to_receive: Option<u64>,
    pub peer_closed: bool,
}

/// The internal control-message protocol routed between [`Node`]s.
///
/// [`Node`]: crate::ports::node::Node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// A user message bound for `port`, carrying zero or more transferred
    /// ports and an opaque payload.
    User {
        port: PortName,
        sequence_num: u64,
        /// Transferred ports, paired with the fresh name each was given
        /// by `will_send_port` on the sending side.
        ports: Vec<(PortName, PortDescriptor)>,
        payload: Vec<u8>,
    },
    /// Sent back toward a transferred port's referring port once the
    /// destination node has materialized the new port.
    PortAccepted { port: PortName },
    /// Notifies a port's peer that it now has a new route.
    ObserveProxy {
        port: PortName,
        proxy_node: NodeName,
        proxy_port: PortName,
        proxy_to_node: NodeName,
        proxy_to_port: PortName,
    },
    /// Acknowledges an `ObserveProxy`, telling the proxy how many more
    /// in-flight messages to expect before it may retire.
    ObserveProxyAck { port: PortName, last_sequence_num: u64 },
    /// Informs a port that its peer has closed, and up to which sequence
    /// number messages are still valid.
    ObserveClosure { port: PortName, last_sequence_num: u64 },
    /// Requests that `new_name` (already on this node) be merged with the
    /// port described by `descriptor`.
    MergePort { new_name: PortName, descriptor: PortDescriptor },
}

impl Event {
    /// The port this event targets.
    pub fn target_port(&self) -> PortName {
        match self {
            Event::User { port, .. }
            | Event::PortAccepted { port }
            | Event::ObserveProxy { port, .. }
            | Event::ObserveProxyAck { port, .. }
            | Event::ObserveClosure { port, .. } => *port,
            Event::MergePort { new_name, .. } => *new_name,
        }
    }
}

/// A routed message: the event itself, tagged with the node it is
/// addressed to. Messages destined for the local node are handed
/// straight to [`Node::accept_message`]; otherwise the node controller
/// encodes them onto a node channel.
///
/// [`Node::accept_message`]: crate::ports::node::Node::accept_message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub destination: NodeName,
    pub event: Event,
}
