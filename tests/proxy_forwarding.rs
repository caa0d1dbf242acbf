//! Exercises proxy creation, forwarding, and collapsing (§4.1.2-§4.1.4)
//! across a real multi-node [`LocalCluster`], not just a single `Node`.

#![cfg(feature = "testing")]

use std::time::{Duration, Instant};

use mojo_edk::ports::node::Node;
use mojo_edk::ports::port::{PortRef, QueuedMessage};
use mojo_edk::testing::LocalCluster;

fn wait_for_message(node: &Node, port: PortRef) -> QueuedMessage {
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if let Some(msg) = node.get_message(port).unwrap() {
            return msg;
        }
        assert!(Instant::now() < deadline, "message never arrived");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// A <-> B <-> C, with B relaying a port it just received from A on to C
/// without ever reading a real message through it. The port must become
/// a proxy on B pointing at C, and A's own local peer for it must end up
/// forwarding straight through, not queuing or dropping.
#[test]
fn proxy_chain_forwards_then_collapses_to_direct_routing() {
    let cluster = LocalCluster::new(3);
    let a = cluster.node(0);
    let b = cluster.node(1);
    let c = cluster.node(2);

    let (a1, a2) = a.node().create_port_pair();

    let ab = a.node().create_uninitialized_port();
    let ba = b.node().create_uninitialized_port();
    a.node().initialize_port(ab, b.name(), ba.name).unwrap();
    b.node().initialize_port(ba, a.name(), ab.name).unwrap();

    let bc = b.node().create_uninitialized_port();
    let cb = c.node().create_uninitialized_port();
    b.node().initialize_port(bc, c.name(), cb.name).unwrap();
    c.node().initialize_port(cb, b.name(), bc.name).unwrap();

    // A hands its a2 endpoint to B.
    a.node().send_message(ab, b"to b".to_vec(), &[a2]).unwrap();
    let msg = wait_for_message(b.node(), ba);
    assert_eq!(msg.ports.len(), 1);
    let b2 = PortRef::new(msg.ports[0].0);

    // B relays it straight on to C without ever reading through it.
    b.node().send_message(bc, b"to c".to_vec(), &[b2]).unwrap();
    let msg = wait_for_message(c.node(), cb);
    assert_eq!(msg.ports.len(), 1);
    let c2 = PortRef::new(msg.ports[0].0);

    // Let the PortAccepted/ObserveProxy chatter settle.
    std::thread::sleep(Duration::from_millis(50));

    // A message sent from A's a1 must still reach C's c2, despite having
    // crossed through a proxy hop on B.
    a.node().send_message(a1, b"ping".to_vec(), &[]).unwrap();
    let msg = wait_for_message(c.node(), c2);
    assert_eq!(msg.payload, b"ping");

    // And the reverse direction works too, once C learns where to send.
    c.node().send_message(c2, b"pong".to_vec(), &[]).unwrap();
    let msg = wait_for_message(a.node(), a1);
    assert_eq!(msg.payload, b"pong");
}

/// Two independent hops on the same relay node (B) must not interfere
/// with each other's proxy state.
#[test]
fn two_independent_proxy_chains_on_the_same_relay_dont_cross_talk() {
    let cluster = LocalCluster::new(3);
    let a = cluster.node(0);
    let b = cluster.node(1);
    let c = cluster.node(2);

    let (a1, a2) = a.node().create_port_pair();
    let (d1, d2) = a.node().create_port_pair();

    let ab = a.node().create_uninitialized_port();
    let ba = b.node().create_uninitialized_port();
    a.node().initialize_port(ab, b.name(), ba.name).unwrap();
    b.node().initialize_port(ba, a.name(), ab.name).unwrap();

    let bc = b.node().create_uninitialized_port();
    let cb = c.node().create_uninitialized_port();
    b.node().initialize_port(bc, c.name(), cb.name).unwrap();
    c.node().initialize_port(cb, b.name(), bc.name).unwrap();

    a.node().send_message(ab, b"first".to_vec(), &[a2]).unwrap();
    let first = wait_for_message(b.node(), ba);
    let b2 = PortRef::new(first.ports[0].0);

    a.node().send_message(ab, b"second".to_vec(), &[d2]).unwrap();
    let second = wait_for_message(b.node(), ba);
    let b_d2 = PortRef::new(second.ports[0].0);

    b.node().send_message(bc, b"relay a".to_vec(), &[b2]).unwrap();
    let msg = wait_for_message(c.node(), cb);
    let c2 = PortRef::new(msg.ports[0].0);

    b.node().send_message(bc, b"relay d".to_vec(), &[b_d2]).unwrap();
    let msg = wait_for_message(c.node(), cb);
    let c_d2 = PortRef::new(msg.ports[0].0);

    std::thread::sleep(Duration::from_millis(50));

    a.node().send_message(a1, b"via a".to_vec(), &[]).unwrap();
    a.node().send_message(d1, b"via d".to_vec(), &[]).unwrap();

    let got_a = wait_for_message(c.node(), c2);
    let got_d = wait_for_message(c.node(), c_d2);
    assert_eq!(got_a.payload, b"via a");
    assert_eq!(got_d.payload, b"via d");
}
