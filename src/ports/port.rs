//! The port: the unit of routing.
//!
//! Each `Port` is owned by its node's name table (`Arc<Port>`, looked up
//! by [`PortName`]); nothing outside the node holds a port directly.
//! Internal mutable state lives behind `Port`'s own lock, which per the
//! locking discipline in the design doc may only be acquired *after* the
//! node's `ports_lock` — never the other way around.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::names::{NodeName, PortName};
use crate::ports::message::PortDescriptor;

/// The lifecycle states of a port, per the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Created but not yet wired to a peer.
    Uninitialized,
    /// Received from a peer via port transfer; not yet observed locally.
    Received,
    /// Normal steady state: actively able to send and receive.
    Receiving,
    /// Transiently holding messages while a route update is in flight.
    Buffering,
    /// Splice-joined: messages from the peer are forwarded to `proxy_to`.
    Proxying,
    /// Terminal; removed from the node's table shortly after entering
    /// this state.
    Closed,
}

/// A message sitting in a port's receive queue, already sequence-checked.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub sequence_num: u64,
    pub ports: Vec<(PortName, PortDescriptor)>,
    pub payload: Vec<u8>,
}

/// A narrow hook fired when a port's observable status changes: a new
/// head message arrives, or the peer closes. Modeled as a boxed closure
/// per the design doc's note on `UserData`/`PortObserver` — dispatchers
/// register one when they wrap a port, and the port never stores
/// anything stronger than this callback.
pub trait PortObserver: Send + Sync {
    fn on_status_changed(&self, port: PortName);
}

/// A port's observable status, returned by `Node::get_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStatus {
    pub has_messages: bool,
    pub receiving_messages: bool,
    pub peer_closed: bool,
}

pub(crate) struct PortInner {
    pub state: PortState,
    pub peer_node: NodeName,
    pub peer_port: PortName,
    pub next_sequence_num_to_send: u64,
    pub next_sequence_num_to_receive: u64,
    pub last_sequence_num_to_receive: Option<u64>,
    pub peer_closed: bool,
    /// Set while `state == Proxying`: where messages arriving from the
    /// peer are re-emitted to.
    pub proxy_to: Option<(NodeName, PortName)>,
    /// The port on whose behalf this one was transferred, used to route
    /// `PortAccepted`/`ObserveProxy` upstream. `None` for ports created
    /// locally via `create_port_pair`.
    pub referring_port: Option<(NodeName, PortName)>,
    /// Messages are buffered here keyed by sequence number so
    /// out-of-order arrivals (a gap not yet filled) never deliver early.
    pub message_queue: BTreeMap<u64, QueuedMessage>,
    pub observer: Option<Arc<dyn PortObserver>>,
}

impl PortInner {
    fn new() -> PortInner {
        PortInner {
            state: PortState::Uninitialized,
            peer_node: NodeName::INVALID,
            peer_port: PortName::INVALID,
            next_sequence_num_to_send: 0,
            next_sequence_num_to_receive: 0,
            last_sequence_num_to_receive: None,
            peer_closed: false,
            proxy_to: None,
            referring_port: None,
            message_queue: BTreeMap::new(),
            observer: None,
        }
    }

    /// Whether the head of the queue (sequence `next_sequence_num_to_receive`)
    /// is present and ready to dequeue.
    pub fn has_next_message(&self) -> bool {
        self.message_queue.contains_key(&self.next_sequence_num_to_receive)
    }

    pub fn status(&self) -> PortStatus {
        PortStatus {
            has_messages: self.has_next_message(),
            receiving_messages: self.state == PortState::Receiving,
            peer_closed: self.peer_closed,
        }
    }
}

/// A port, owned by its node's name table.
pub struct Port {
    pub name: PortName,
    pub(crate) inner: Mutex<PortInner>,
}

impl Port {
    pub fn new(name: PortName) -> Arc<Port> {
        Arc::new(Port { name, inner: Mutex::new(PortInner::new()) })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, PortInner> {
        self.inner.lock().unwrap()
    }

    pub fn status(&self) -> PortStatus {
        self.lock().status()
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port").field("name", &self.name).finish_non_exhaustive()
    }
}

/// A lightweight, `Copy`able reference to a port: just its name plus the
/// node it belongs to. The public `Node` API takes and returns
/// `PortRef`s rather than exposing `Arc<Port>` directly, the way the
/// original implementation's `PortRef` decouples callers from the node's
/// internal table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRef {
    pub name: PortName,
}

impl PortRef {
    pub fn new(name: PortName) -> PortRef {
        PortRef { name }
    }
}
