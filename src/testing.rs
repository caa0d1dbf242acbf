//! A single-process cluster of fully-wired [`NodeController`]s, for
//! exercising cross-node routing without any real platform transport
//! (§1b, supplementing a feature the distilled spec otherwise drops).
//!
//! Grounded on `Switchboard::local()`'s pattern of standing up a whole
//! cluster in one call for tests and examples: there, a single-process
//! `Switchboard` binds a Unix socket per node and spins a runtime to
//! pump it; here there is no real transport to bind, so `LocalCluster`
//! just wires every node pair directly over a fresh
//! [`LoopbackChannel`](crate::channel::loopback::LoopbackChannel) pair
//! and lets each node's own background thread (already spawned by
//! [`NodeController::add_peer`]) take it from there.

use std::sync::Arc;

use crate::channel::loopback::LoopbackChannel;
use crate::names::NodeName;
use crate::node_controller::NodeController;

/// A fully-connected mesh of in-process nodes, the first of which is
/// the broker. Every node can reach every other node directly — no
/// relaying through the broker is required for basic routing, though
/// [`LocalCluster::broker`] is still the one node other nodes treat as
/// authoritative for bootstrap-style scenarios.
pub struct LocalCluster {
    nodes: Vec<Arc<NodeController>>,
}

impl LocalCluster {
    /// Build a cluster of `count` nodes (the first is the broker),
    /// with every pair wired directly.
    pub fn new(count: usize) -> LocalCluster {
        assert!(count >= 1, "a cluster needs at least one node");
        let nodes: Vec<Arc<NodeController>> = (0..count)
            .map(|i| NodeController::new(NodeName::random(), i == 0))
            .collect();

        for i in 0..nodes.len() {
            for j in (i + 1)..nodes.len() {
                let (ci, cj) = LoopbackChannel::pair();
                nodes[i].add_peer(nodes[j].name(), Arc::new(ci));
                nodes[j].add_peer(nodes[i].name(), Arc::new(cj));
            }
        }

        LocalCluster { nodes }
    }

    pub fn broker(&self) -> &Arc<NodeController> {
        &self.nodes[0]
    }

    pub fn node(&self, index: usize) -> &Arc<NodeController> {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    /// Wire one port on each of two nodes directly to each other
    /// (standing in for a completed bootstrap handshake) and confirm a
    /// message sent on one is routed, over the loopback channel and the
    /// peer's background I/O thread, all the way to the other.
    #[test]
    fn two_node_cross_routing_delivers_messages() {
        let cluster = LocalCluster::new(2);
        let a = cluster.node(0);
        let b = cluster.node(1);

        let a_port = a.node().create_uninitialized_port();
        let b_port = b.node().create_uninitialized_port();
        a.node().initialize_port(a_port, b.name(), b_port.name).unwrap();
        b.node().initialize_port(b_port, a.name(), a_port.name).unwrap();

        a.node().send_message(a_port, b"across the cluster".to_vec(), &[]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let msg = loop {
            if let Some(msg) = b.node().get_message(b_port).unwrap() {
                break msg;
            }
            assert!(Instant::now() < deadline, "message never arrived");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(msg.payload, b"across the cluster");
    }

    /// Seed scenario 6 (§8): a three-node mesh still routes correctly —
    /// exercising that `LocalCluster::new` wires every pair, not just
    /// node 0 to everyone else.
    #[test]
    fn three_node_mesh_routes_between_any_pair() {
        let cluster = LocalCluster::new(3);
        let n1 = cluster.node(1);
        let n2 = cluster.node(2);

        let p1 = n1.node().create_uninitialized_port();
        let p2 = n2.node().create_uninitialized_port();
        n1.node().initialize_port(p1, n2.name(), p2.name).unwrap();
        n2.node().initialize_port(p2, n1.name(), p1.name).unwrap();

        n1.node().send_message(p1, b"leaf to leaf".to_vec(), &[]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let msg = loop {
            if let Some(msg) = n2.node().get_message(p2).unwrap() {
                break msg;
            }
            assert!(Instant::now() < deadline, "message never arrived");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(msg.payload, b"leaf to leaf");
    }
}
