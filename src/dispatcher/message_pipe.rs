//! The message pipe dispatcher: a single Ports port, writable and
//! readable as discrete framed messages.

use std::sync::{Arc, Weak};

use crate::dispatcher::{Dispatcher, DispatcherKind, Envelope, HandleSignalsState, Signals};
use crate::error::{MojoResult, Result};
use crate::ports::node::Node;
use crate::ports::port::PortRef;

/// Flags controlling `read_message`'s overflow behavior.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadFlags {
    /// Discard the head message instead of returning `ResourceExhausted`
    /// when the caller's buffer is too small.
    pub may_discard: bool,
    /// The caller's buffer capacity. `None` means unbounded. A head
    /// message whose payload exceeds this is rejected with
    /// `ResourceExhausted`, discarded if `may_discard` is set and left
    /// in place otherwise.
    pub max_payload_bytes: Option<usize>,
}

/// One endpoint of a message pipe.
pub struct MessagePipeDispatcher {
    node: Arc<Node>,
    port: PortRef,
    envelope: Envelope,
}

/// A message read off a pipe: the payload plus any ports transferred
/// alongside it (still raw port references — `Core` wraps these into
/// fresh dispatchers and handles before returning to the caller).
pub struct ReadResult {
    pub payload: Vec<u8>,
    pub ports: Vec<PortRef>,
}

impl MessagePipeDispatcher {
    pub fn new(node: Arc<Node>, port: PortRef) -> Arc<MessagePipeDispatcher> {
        let d = Arc::new(MessagePipeDispatcher { node, port, envelope: Envelope::new() });
        let observer = PipeObserver { dispatcher: Arc::downgrade(&d) };
        let _ = d.node.set_user_data(d.port, Arc::new(observer));
        d
    }

    pub fn port(&self) -> PortRef {
        self.port
    }

    /// §4.4.2: write `payload`, transferring ownership of each pipe in
    /// `attachments` (which must not include `self`).
    pub fn write_message(
        &self,
        payload: Vec<u8>,
        attachments: &[Arc<MessagePipeDispatcher>],
    ) -> Result<()> {
        self.envelope.check_mutable()?;
        for a in attachments {
            a.begin_transit()?;
        }
        let ports: Vec<PortRef> = attachments.iter().map(|a| a.port).collect();
        let result = self.node.send_message(self.port, payload, &ports);
        match &result {
            Ok(()) => {
                for a in attachments {
                    a.complete_transit_and_close();
                }
            }
            Err(_) => {
                for a in attachments {
                    a.cancel_transit();
                }
            }
        }
        result
    }

    /// Length of the head message's payload without dequeuing it, or
    /// `None` if no message is queued yet.
    pub fn peek_message_len(&self) -> Result<Option<usize>> {
        if self.envelope.is_closed() {
            return Err(MojoResult::InvalidArgument);
        }
        self.node.peek_message_len(self.port)
    }

    /// §4.4.2: dequeue the head message, or `ShouldWait` if none is
    /// available yet, or `FailedPrecondition` if the peer is gone and
    /// the queue is empty.
    pub fn read_message(&self) -> Result<ReadResult> {
        if self.envelope.is_closed() {
            return Err(MojoResult::InvalidArgument);
        }
        match self.node.get_message(self.port) {
            Ok(Some(msg)) => Ok(ReadResult {
                payload: msg.payload,
                ports: msg.ports.into_iter().map(|(name, _)| PortRef::new(name)).collect(),
            }),
            Ok(None) => Err(MojoResult::ShouldWait),
            Err(e) => Err(e),
        }
    }

    /// §4.4.2: when both endpoints are local and uninitialized, splice
    /// their peers together and close both.
    pub fn fuse(&self, other: &MessagePipeDispatcher) -> Result<()> {
        let result = self.node.merge_local_ports(self.port, other.port);
        let _ = self.close();
        let _ = other.close();
        result
    }

    /// The primitive `Core::write_message` (§4.5) builds its generalized,
    /// any-`Arc<dyn Dispatcher>`-attachment send on top of: ports have
    /// already been materialized as replacement names by the caller's
    /// `begin_transit`/`Node::send_message` dance, so this just forwards
    /// bytes and ports with no attachment-type knowledge of its own.
    pub(crate) fn send_raw(&self, payload: Vec<u8>, ports: &[PortRef]) -> Result<()> {
        self.envelope.check_mutable()?;
        self.node.send_message(self.port, payload, ports)
    }
}

impl Dispatcher for MessagePipeDispatcher {
    fn kind(&self) -> DispatcherKind {
        DispatcherKind::MessagePipe
    }

    fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }

    fn handle_signals_state(&self) -> HandleSignalsState {
        if self.envelope.is_closed() {
            return HandleSignalsState::default();
        }
        let status = match self.node.get_status(self.port) {
            Ok(s) => s,
            Err(_) => return HandleSignalsState::default(),
        };
        let mut satisfied = Signals::NONE;
        let mut satisfiable = Signals::NONE;
        if status.has_messages {
            satisfied = satisfied.union(Signals::READABLE);
        }
        if !status.peer_closed || status.has_messages {
            satisfiable = satisfiable.union(Signals::READABLE);
        }
        if !status.peer_closed {
            satisfied = satisfied.union(Signals::WRITABLE);
            satisfiable = satisfiable.union(Signals::WRITABLE);
        }
        if status.peer_closed {
            satisfied = satisfied.union(Signals::PEER_CLOSED);
        }
        satisfiable = satisfiable.union(Signals::PEER_CLOSED);
        HandleSignalsState { satisfied, satisfiable }
    }

    fn close(&self) -> Result<()> {
        if !self.envelope.mark_closed() {
            return Err(MojoResult::InvalidArgument);
        }
        self.envelope.awakables.cancel_all();
        let _ = self.node.close_port(self.port);
        Ok(())
    }

    fn start_serialize(&self) -> Result<crate::dispatcher::SerializeSizes> {
        Ok(crate::dispatcher::SerializeSizes { num_bytes: 9, num_ports: 1, num_platform_handles: 0 })
    }

    /// §6.1: an 8-byte `pipe_id` (the port's own name, truncated to its
    /// first half — unique enough to serve as a wire identifier) plus a
    /// single `endpoint` byte. This build never distinguishes the two
    /// endpoints of a pipe by role, so `endpoint` is always `0`.
    fn end_serialize(&self, buf: &mut Vec<u8>) -> Result<()> {
        let (pipe_id, _) = self.port.name.as_u64_pair();
        buf.extend_from_slice(&pipe_id.to_le_bytes());
        buf.push(0);
        Ok(())
    }

    /// The port this dispatcher is backed by is the thing that actually
    /// moves through the Ports layer on transfer (§6.1's "one port").
    fn transit_port(&self) -> Option<PortRef> {
        Some(self.port)
    }
}

/// Bridges a port's status-change notifications to the dispatcher's own
/// awakable list. Holds only a weak reference to the dispatcher, per the
/// design doc's note on avoiding a port→dispatcher strong cycle: the
/// dispatcher owns the port (by name, through the node), never the
/// other way around.
struct PipeObserver {
    dispatcher: Weak<MessagePipeDispatcher>,
}

impl crate::ports::port::PortObserver for PipeObserver {
    fn on_status_changed(&self, _port: crate::names::PortName) {
        if let Some(d) = self.dispatcher.upgrade() {
            let state = d.handle_signals_state();
            d.envelope.awakables.awake_for_state_change(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::names::NodeName;
    use crate::ports::message::Message;
    use crate::ports::node::NodeDelegate;

    struct NoopDelegate;
    impl NodeDelegate for NoopDelegate {
        fn forward_message(&self, _node: NodeName, _message: Message) {}
        fn broadcast_message(&self, _message: Message) {}
        fn port_status_changed(&self, _port: PortRef) {}
    }

    fn pair() -> (Arc<MessagePipeDispatcher>, Arc<MessagePipeDispatcher>) {
        let node = Arc::new(Node::new(NodeName::random(), Arc::new(NoopDelegate)));
        let (a, b) = node.create_port_pair();
        (MessagePipeDispatcher::new(node.clone(), a), MessagePipeDispatcher::new(node, b))
    }

    #[test]
    fn round_trips_payload_with_no_attachments() {
        let (a, b) = pair();
        a.write_message(b"hello".to_vec(), &[]).unwrap();
        let read = b.read_message().unwrap();
        assert_eq!(read.payload, b"hello");
        assert!(read.ports.is_empty());
    }

    #[test]
    fn write_message_transfers_an_attached_pipe() {
        let (a, b) = pair();
        let (c, d) = pair();

        a.write_message(b"carrier".to_vec(), &[c.clone()]).unwrap();
        assert!(c.envelope.is_closed());

        let read = b.read_message().unwrap();
        assert_eq!(read.payload, b"carrier");
        assert_eq!(read.ports.len(), 1);

        let received = MessagePipeDispatcher::new(b.node.clone(), read.ports[0]);
        d.write_message(b"hi".to_vec(), &[]).unwrap();
        let inner = received.read_message().unwrap();
        assert_eq!(inner.payload, b"hi");
    }

    #[test]
    fn read_on_empty_pipe_should_wait() {
        let (_a, b) = pair();
        assert_eq!(b.read_message().unwrap_err(), MojoResult::ShouldWait);
    }

    #[test]
    fn signal_state_reflects_readability_and_peer_closure() {
        let (a, b) = pair();
        let state = a.handle_signals_state();
        assert!(state.satisfied.contains(Signals::WRITABLE));
        assert!(!state.satisfied.contains(Signals::READABLE));

        a.write_message(b"x".to_vec(), &[]).unwrap();
        let state = b.handle_signals_state();
        assert!(state.satisfied.contains(Signals::READABLE));

        a.close().unwrap();
        b.read_message().unwrap();
        let state = b.handle_signals_state();
        assert!(state.satisfied.contains(Signals::PEER_CLOSED));
        assert!(!state.satisfiable.contains(Signals::WRITABLE));
    }

    #[test]
    fn start_and_end_serialize_report_nine_bytes_and_the_backing_port() {
        let (a, _b) = pair();
        let sizes = a.start_serialize().unwrap();
        assert_eq!(sizes.num_bytes, 9);
        assert_eq!(sizes.num_ports, 1);
        let mut buf = Vec::new();
        a.end_serialize(&mut buf).unwrap();
        assert_eq!(buf.len(), 9);
    }
}
