//! The ports node: routing, ordering, proxy collapsing, port lifecycle.
//!
//! `Node` is pure logic with no I/O of its own. It talks to the outside
//! world exclusively through [`NodeDelegate`], the seam the node
//! controller implements to wire ports traffic onto real channels — this
//! mirrors the original implementation's `NodeDelegate` abstract
//! interface (`ForwardMessage`/`BroadcastMessage`/`PortStatusChanged`),
//! kept deliberately narrow so `Node` never has to know whether its peer
//! is local, across a pipe, or across a process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{trace, warn};

use crate::error::{MojoResult, Result};
use crate::names::{NodeName, PortName};
use crate::ports::message::{Event, Message, PortDescriptor};
use crate::ports::port::{Port, PortObserver, PortRef, PortState, PortStatus, QueuedMessage};

/// The seam between the ports layer and everything that moves its
/// messages around. Implementations must not call back into `Node`
/// synchronously from `forward_message`/`broadcast_message` — per the
/// original contract, re-entrancy here would violate the lock
/// hierarchy.
pub trait NodeDelegate: Send + Sync {
    /// Hand a message to the node controller for delivery to `node`
    /// (which is never this node's own name).
    fn forward_message(&self, node: NodeName, message: Message);

    /// Fan a handle-free message out to every known peer.
    fn broadcast_message(&self, message: Message);

    /// A port's observable status changed (new head message, peer
    /// closed). Used by the node controller to wake dispatcher
    /// observers; `Node` itself does not know about dispatchers.
    fn port_status_changed(&self, port: PortRef);
}

/// A routed, ordered, at-most-once message delivery fabric over an
/// overlay graph of nodes. One `Node` exists per process.
pub struct Node {
    name: NodeName,
    delegate: Arc<dyn NodeDelegate>,
    ports: Mutex<HashMap<PortName, Arc<Port>>>,
}

impl Node {
    pub fn new(name: NodeName, delegate: Arc<dyn NodeDelegate>) -> Node {
        Node { name, delegate, ports: Mutex::new(HashMap::new()) }
    }

    pub fn name(&self) -> NodeName {
        self.name
    }

    fn get_port(&self, name: PortName) -> Result<Arc<Port>> {
        self.ports
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or(MojoResult::NotFound)
    }

    /// Create a new port in `Uninitialized` state, not yet wired to a
    /// peer.
    pub fn create_uninitialized_port(&self) -> PortRef {
        let name = PortName::random();
        let port = Port::new(name);
        self.ports.lock().unwrap().insert(name, port);
        PortRef::new(name)
    }

    /// Wire an uninitialized port to a peer, moving it to `Receiving`.
    pub fn initialize_port(
        &self,
        port: PortRef,
        peer_node: NodeName,
        peer_port: PortName,
    ) -> Result<()> {
        let p = self.get_port(port.name)?;
        let mut inner = p.lock();
        if inner.state != PortState::Uninitialized && inner.state != PortState::Received {
            return Err(MojoResult::FailedPrecondition);
        }
        inner.peer_node = peer_node;
        inner.peer_port = peer_port;
        inner.state = PortState::Receiving;
        Ok(())
    }

    /// Create two ports on this node, already wired to each other.
    pub fn create_port_pair(&self) -> (PortRef, PortRef) {
        let a = self.create_uninitialized_port();
        let b = self.create_uninitialized_port();
        self.initialize_port(a, self.name, b.name).unwrap();
        self.initialize_port(b, self.name, a.name).unwrap();
        (a, b)
    }

    pub fn set_user_data(&self, port: PortRef, observer: Arc<dyn PortObserver>) -> Result<()> {
        let p = self.get_port(port.name)?;
        p.lock().observer = Some(observer);
        Ok(())
    }

    pub fn get_status(&self, port: PortRef) -> Result<PortStatus> {
        Ok(self.get_port(port.name)?.status())
    }

    /// Length of the head message's payload, without dequeuing it —
    /// lets a caller decide whether to commit to a real `get_message`
    /// before it has a buffer sized for the result (§4.4.2's
    /// `MAY_DISCARD` overflow check).
    pub fn peek_message_len(&self, port: PortRef) -> Result<Option<usize>> {
        let p = self.get_port(port.name)?;
        let inner = p.lock();
        Ok(inner.message_queue.get(&inner.next_sequence_num_to_receive).map(|m| m.payload.len()))
    }

    /// Dequeue the head message if present, advancing
    /// `next_sequence_num_to_receive`.
    pub fn get_message(&self, port: PortRef) -> Result<Option<QueuedMessage>> {
        let p = self.get_port(port.name)?;
        let mut inner = p.lock();
        if let Some(msg) = inner.message_queue.remove(&inner.next_sequence_num_to_receive) {
            inner.next_sequence_num_to_receive += 1;
            Ok(Some(msg))
        } else if inner.peer_closed {
            Err(MojoResult::FailedPrecondition)
        } else {
            Ok(None)
        }
    }

    /// §4.1.1: send a user message from `port`, consisting of `payload`
    /// and zero or more `transferred` ports (which must be local,
    /// `Receiving`, and not `port` itself).
    pub fn send_message(
        &self,
        port: PortRef,
        payload: Vec<u8>,
        transferred: &[PortRef],
    ) -> Result<()> {
        let p = self.get_port(port.name)?;
        let (peer_node, peer_port, seq, descriptors) = {
            let mut inner = p.lock();
            if inner.state == PortState::Closed {
                return Err(MojoResult::InvalidArgument);
            }
            if inner.peer_closed {
                return Err(MojoResult::FailedPrecondition);
            }
            let peer_node = inner.peer_node;
            let peer_port = inner.peer_port;
            let mut descriptors = Vec::with_capacity(transferred.len());
            for &t in transferred {
                if t.name == port.name {
                    return Err(MojoResult::InvalidArgument);
                }
                descriptors.push(self.will_send_port(t, peer_node)?);
            }
            let seq = inner.next_sequence_num_to_send;
            inner.next_sequence_num_to_send += 1;
            (peer_node, peer_port, seq, descriptors)
        };

        let event = Event::User { port: peer_port, sequence_num: seq, ports: descriptors, payload };
        self.route(peer_node, event);
        Ok(())
    }

    /// §4.1.2: convert an attached port into a proxy bound for its new
    /// home, producing the descriptor the receiving node will use to
    /// materialize it. `destination_node` is the node the transferred
    /// port is headed to (the sending port's own peer) — `proxy_to` is
    /// set to it immediately so any message that arrives here from the
    /// old peer before the transfer settles is forwarded on, not queued.
    fn will_send_port(
        &self,
        port: PortRef,
        destination_node: NodeName,
    ) -> Result<(PortName, PortDescriptor)> {
        let p = self.get_port(port.name)?;
        let mut inner = p.lock();
        if inner.state != PortState::Receiving {
            return Err(MojoResult::FailedPrecondition);
        }
        let new_name = PortName::random();
        let descriptor = PortDescriptor {
            peer_node: inner.peer_node,
            peer_port: inner.peer_port,
            referring_node: self.name,
            referring_port: port.name,
            next_sequence_num_to_send: inner.next_sequence_num_to_send,
            next_sequence_num_to_receive: inner.next_sequence_num_to_receive,
            last_sequence_num_to_receive: inner.last_sequence_num_to_receive,
            peer_closed: inner.peer_closed,
        };
        inner.state = PortState::Proxying;
        inner.proxy_to = Some((destination_node, new_name));
        Ok((new_name, descriptor))
    }

    fn route(&self, destination: NodeName, event: Event) {
        if destination == self.name {
            self.accept_message(Message { destination, event });
        } else {
            self.delegate.forward_message(destination, Message { destination, event });
        }
    }

    /// §4.1.3: entry point for inbound routing, whether the message
    /// originated locally or arrived over a node channel.
    pub fn accept_message(&self, message: Message) {
        trace!("node {:?}: accept {:?}", self.name, message.event);
        match message.event {
            Event::User { port, sequence_num, ports, payload } => {
                self.on_user_message(port, sequence_num, ports, payload)
            }
            Event::PortAccepted { port } => self.on_port_accepted(port),
            Event::ObserveProxy { port, proxy_node, proxy_port, proxy_to_node, proxy_to_port } => {
                self.on_observe_proxy(port, proxy_node, proxy_port, proxy_to_node, proxy_to_port)
            }
            Event::ObserveProxyAck { port, last_sequence_num } => {
                self.on_observe_proxy_ack(port, last_sequence_num)
            }
            Event::ObserveClosure { port, last_sequence_num } => {
                self.on_observe_closure(port, last_sequence_num)
            }
            Event::MergePort { new_name, descriptor } => self.on_merge_port(new_name, descriptor),
        }
    }

    fn on_user_message(
        &self,
        port: PortName,
        sequence_num: u64,
        ports: Vec<(PortName, PortDescriptor)>,
        payload: Vec<u8>,
    ) {
        let p = match self.ports.lock().unwrap().get(&port).cloned() {
            Some(p) => p,
            None => {
                trace!("node {:?}: dropping message for unknown port {:?}", self.name, port);
                return;
            }
        };

        // §4.1.3: a port mid-transfer re-emits traffic from its old peer
        // to its new home instead of queuing it locally. Sequence numbers
        // carry over unchanged — the destination port was materialized
        // with the transferred port's own counters, so the peer's send
        // sequence and the destination's receive sequence already agree.
        let proxy_to = {
            let inner = p.lock();
            if inner.state == PortState::Proxying { inner.proxy_to } else { None }
        };
        if let Some((proxy_node, proxy_port)) = proxy_to {
            self.route(proxy_node, Event::User { port: proxy_port, sequence_num, ports, payload });
            return;
        }

        // Materialize every transferred port before enqueueing, so a
        // reader that wakes immediately after delivery already sees them
        // live in the table.
        let mut accepted = Vec::with_capacity(ports.len());
        for (new_name, descriptor) in &ports {
            let new_port = Port::new(*new_name);
            {
                let mut inner = new_port.lock();
                inner.state = PortState::Received;
                inner.peer_node = descriptor.peer_node;
                inner.peer_port = descriptor.peer_port;
                inner.next_sequence_num_to_send = descriptor.next_sequence_num_to_send;
                inner.next_sequence_num_to_receive = descriptor.next_sequence_num_to_receive;
                inner.last_sequence_num_to_receive = descriptor.last_sequence_num_to_receive;
                inner.peer_closed = descriptor.peer_closed;
                inner.referring_port = Some((descriptor.referring_node, descriptor.referring_port));
            }
            self.ports.lock().unwrap().insert(*new_name, new_port);
            accepted.push((descriptor.referring_node, descriptor.referring_port, *new_name));
        }

        let changed = {
            let mut inner = p.lock();
            inner.message_queue.insert(sequence_num, QueuedMessage { sequence_num, ports, payload });
            inner.has_next_message()
        };

        for (referring_node, referring_port, _new_name) in accepted {
            self.route(referring_node, Event::PortAccepted { port: referring_port });
        }

        if changed {
            self.notify_status_changed(&p, port);
        }
    }

    /// Fire both the per-port observer (if one is attached) and the
    /// node-wide delegate hook. The observer lets a dispatcher react
    /// without the node controller's port-name→dispatcher indirection;
    /// the delegate lets the node controller do the same for ports it
    /// doesn't directly own an observer handle for.
    fn notify_status_changed(&self, p: &Arc<Port>, port: PortName) {
        let observer = p.lock().observer.clone();
        if let Some(observer) = observer {
            observer.on_status_changed(port);
        }
        self.delegate.port_status_changed(PortRef::new(port));
    }

    fn on_port_accepted(&self, port: PortName) {
        let p = match self.ports.lock().unwrap().get(&port).cloned() {
            Some(p) => p,
            None => return,
        };
        let (peer_node, peer_port, proxy_to) = {
            let inner = p.lock();
            (inner.peer_node, inner.peer_port, inner.proxy_to)
        };
        let (proxy_to_node, proxy_to_port) = match proxy_to {
            Some(target) => target,
            None => {
                warn!(
                    "node {:?}: PortAccepted for {:?} with no recorded proxy target",
                    self.name, port
                );
                return;
            }
        };
        self.route(
            peer_node,
            Event::ObserveProxy {
                port: peer_port,
                proxy_node: self.name,
                proxy_port: port,
                proxy_to_node,
                proxy_to_port,
            },
        );
    }

    fn on_observe_proxy(
        &self,
        port: PortName,
        proxy_node: NodeName,
        proxy_port: PortName,
        proxy_to_node: NodeName,
        proxy_to_port: PortName,
    ) {
        let p = match self.ports.lock().unwrap().get(&port).cloned() {
            Some(p) => p,
            None => return,
        };
        let (new_peer_node, new_peer_port, last_sent) = {
            let mut inner = p.lock();
            if inner.peer_node == proxy_node && inner.peer_port == proxy_port {
                inner.peer_node = proxy_to_node;
                inner.peer_port = proxy_to_port;
            }
            (inner.peer_node, inner.peer_port, inner.next_sequence_num_to_send)
        };
        let _ = (new_peer_node, new_peer_port);
        self.route(proxy_node, Event::ObserveProxyAck { port: proxy_port, last_sequence_num: last_sent });
    }

    fn on_observe_proxy_ack(&self, port: PortName, last_sequence_num: u64) {
        let p = match self.ports.lock().unwrap().get(&port).cloned() {
            Some(p) => p,
            None => return,
        };
        let maybe_done = {
            let inner = p.lock();
            inner.state == PortState::Proxying
                && inner.next_sequence_num_to_receive >= last_sequence_num
        };
        if maybe_done {
            self.erase_port(port);
        }
    }

    fn on_observe_closure(&self, port: PortName, last_sequence_num: u64) {
        let p = match self.ports.lock().unwrap().get(&port).cloned() {
            Some(p) => p,
            None => return,
        };
        let (proxy_target, became_closed) = {
            let mut inner = p.lock();
            inner.peer_closed = true;
            inner.last_sequence_num_to_receive = Some(last_sequence_num);
            inner.message_queue.retain(|&seq, _| seq <= last_sequence_num);
            (inner.proxy_to, inner.state != PortState::Proxying)
        };
        if let Some((proxy_node, proxy_port)) = proxy_target {
            self.route(proxy_node, Event::ObserveClosure { port: proxy_port, last_sequence_num });
            self.erase_port(port);
        } else if became_closed {
            self.notify_status_changed(&p, port);
        }
    }

    fn on_merge_port(&self, new_name: PortName, descriptor: PortDescriptor) {
        let local = PortRef::new(new_name);
        {
            let mut table = self.ports.lock().unwrap();
            table.entry(new_name).or_insert_with(|| Port::new(new_name));
        }
        let remote = self.create_uninitialized_port();
        if self.initialize_port(remote, descriptor.peer_node, descriptor.peer_port).is_err() {
            warn!("node {:?}: failed to initialize merge-port peer", self.name);
            return;
        }
        if let Err(err) = self.merge_local_ports(local, remote) {
            warn!("node {:?}: merge_port failed: {:?}", self.name, err);
        }
    }

    /// §4.1.5: connect `a`'s peer to `b`'s peer; both close.
    pub fn merge_local_ports(&self, a: PortRef, b: PortRef) -> Result<()> {
        let pa = self.get_port(a.name)?;
        let pb = self.get_port(b.name)?;
        let ((a_peer_node, a_peer_port), (b_peer_node, b_peer_port)) = {
            let ia = pa.lock();
            let ib = pb.lock();
            if ia.next_sequence_num_to_send != 0
                || ia.next_sequence_num_to_receive != 0
                || ib.next_sequence_num_to_send != 0
                || ib.next_sequence_num_to_receive != 0
            {
                return Err(MojoResult::FailedPrecondition);
            }
            ((ia.peer_node, ia.peer_port), (ib.peer_node, ib.peer_port))
        };

        self.close_port_internal(a.name);
        self.close_port_internal(b.name);

        self.route(
            a_peer_node,
            Event::ObserveProxy {
                port: a_peer_port,
                proxy_node: self.name,
                proxy_port: a.name,
                proxy_to_node: b_peer_node,
                proxy_to_port: b_peer_port,
            },
        );
        self.route(
            b_peer_node,
            Event::ObserveProxy {
                port: b_peer_port,
                proxy_node: self.name,
                proxy_port: b.name,
                proxy_to_node: a_peer_node,
                proxy_to_port: a_peer_port,
            },
        );
        Ok(())
    }

    /// Request a cross-node merge: `local`'s peer becomes the port
    /// described by `remote_node`/`remote_port`.
    pub fn merge_ports(&self, local: PortRef, remote_node: NodeName, remote_port: PortName) {
        let p = match self.ports.lock().unwrap().get(&local.name).cloned() {
            Some(p) => p,
            None => return,
        };
        let descriptor = {
            let inner = p.lock();
            PortDescriptor {
                peer_node: inner.peer_node,
                peer_port: inner.peer_port,
                referring_node: self.name,
                referring_port: local.name,
                next_sequence_num_to_send: inner.next_sequence_num_to_send,
                next_sequence_num_to_receive: inner.next_sequence_num_to_receive,
                last_sequence_num_to_receive: inner.last_sequence_num_to_receive,
                peer_closed: inner.peer_closed,
            }
        };
        self.route(remote_node, Event::MergePort { new_name: remote_port, descriptor });
    }

    /// §4.1.6: close a port, draining its queue and notifying the peer.
    pub fn close_port(&self, port: PortRef) -> Result<()> {
        let p = self.get_port(port.name)?;
        let (peer_node, peer_port, last_sent, queued) = {
            let mut inner = p.lock();
            inner.state = PortState::Closed;
            let queued: Vec<_> = std::mem::take(&mut inner.message_queue).into_values().collect();
            (inner.peer_node, inner.peer_port, inner.next_sequence_num_to_send, queued)
        };
        for msg in queued {
            for (name, _) in msg.ports {
                self.erase_port(name);
            }
        }
        self.route(peer_node, Event::ObserveClosure { port: peer_port, last_sequence_num: last_sent });
        self.erase_port(port.name);
        Ok(())
    }

    fn close_port_internal(&self, name: PortName) {
        if let Some(p) = self.ports.lock().unwrap().get(&name).cloned() {
            p.lock().state = PortState::Closed;
        }
        self.erase_port(name);
    }

    fn erase_port(&self, name: PortName) {
        self.ports.lock().unwrap().remove(&name);
    }

    /// A peer node is gone: synthesize `ObserveClosure` for every port
    /// whose peer lived there.
    pub fn lost_connection_to_node(&self, node: NodeName) {
        let affected: Vec<(PortName, u64)> = {
            let table = self.ports.lock().unwrap();
            table
                .values()
                .filter_map(|p| {
                    let inner = p.lock();
                    if inner.peer_node == node && !inner.peer_closed {
                        Some((p.name, inner.next_sequence_num_to_receive))
                    } else {
                        None
                    }
                })
                .collect()
        };
        for (port, last_seq) in affected {
            self.on_observe_closure(port, last_seq.saturating_sub(1));
        }
    }

    /// Whether the node currently has any port in `Proxying` state,
    /// used by the node controller's level-triggered shutdown check
    /// (§4.2.6).
    pub fn has_proxies(&self) -> bool {
        self.ports.lock().unwrap().values().any(|p| p.lock().state == PortState::Proxying)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct LocalDelegate {
        notified: StdMutex<Vec<PortName>>,
    }

    impl NodeDelegate for LocalDelegate {
        fn forward_message(&self, _node: NodeName, _message: Message) {
            panic!("single-node test should never forward remotely");
        }
        fn broadcast_message(&self, _message: Message) {}
        fn port_status_changed(&self, port: PortRef) {
            self.notified.lock().unwrap().push(port.name);
        }
    }

    fn local_node() -> Node {
        let delegate = Arc::new(LocalDelegate { notified: StdMutex::new(Vec::new()) });
        Node::new(NodeName::random(), delegate)
    }

    #[test]
    fn local_pipe_echo() {
        let node = local_node();
        let (a, b) = node.create_port_pair();

        node.send_message(a, b"ping".to_vec(), &[]).unwrap();
        let msg = node.get_message(b).unwrap().unwrap();
        assert_eq!(msg.payload, b"ping");

        node.close_port(a).unwrap();
        assert!(node.get_status(b).unwrap().peer_closed);
        assert_eq!(node.get_message(b).unwrap_err(), MojoResult::FailedPrecondition);
    }

    #[test]
    fn sequence_numbers_strictly_increase() {
        let node = local_node();
        let (a, b) = node.create_port_pair();
        for i in 0..5u8 {
            node.send_message(a, vec![i], &[]).unwrap();
        }
        for i in 0..5u8 {
            let msg = node.get_message(b).unwrap().unwrap();
            assert_eq!(msg.sequence_num, i as u64);
            assert_eq!(msg.payload, vec![i]);
        }
    }

    #[test]
    fn merge_local_ports_joins_peers() {
        let node = local_node();
        let (a, b) = node.create_port_pair();
        let (c, d) = node.create_port_pair();

        node.merge_local_ports(b, c).unwrap();
        node.send_message(a, b"hi".to_vec(), &[]).unwrap();
        let msg = node.get_message(d).unwrap().unwrap();
        assert_eq!(msg.payload, b"hi");
    }
}
