//! The node-channel control protocol (§4.2.3/§6.2): framing only, not a
//! byte-exact wire format. Encoded with `serde`+`bincode` into a
//! [`crate::channel::Frame`]'s payload; OS handles travel alongside in
//! the frame's handle list and are matched up positionally by each
//! variant's documented handle count.

use serde::{Deserialize, Serialize};

use crate::names::{NodeName, PortName};
use crate::ports::message::Message;

/// One message on a node channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum NodeChannelMessage {
    /// Broker → child: you are `temp_name`, I am `broker_name`.
    AcceptChild { broker_name: NodeName, temp_name: NodeName },
    /// Child → broker: I have adopted `real_name` in place of `temp_name`.
    AcceptParent { temp_name: NodeName, real_name: NodeName },
    /// A broker client asks its parent to introduce it to the true
    /// broker, forwarding its own name.
    AddBrokerClient { client_name: NodeName },
    /// True broker → original parent: the client has been registered.
    BrokerClientAdded { client_name: NodeName },
    /// True broker → client: here is how to reach me directly.
    AcceptBrokerClient { broker_name: NodeName },
    /// A Ports-layer message, routed verbatim. Its own `destination`
    /// field is redundant with the channel it arrived on but kept for
    /// symmetry with `Broadcast`.
    PortsMessage(Message),
    /// Ask the peer on the other end of this channel to merge its port
    /// reserved under `token` with `port`, which the sender already
    /// owns.
    RequestPortMerge { token: String, port: PortName },
    /// Ask the broker to introduce the sender to `peer`.
    RequestIntroduction { peer: NodeName },
    /// Broker → both sides of a fresh introduction: here is your new
    /// peer's name; a platform handle for the new channel is attached.
    Introduce { peer: NodeName },
    /// Handle-free message fanned out to every known peer.
    Broadcast(Message),
    /// Sent by the broker to announce a newly accepted peer to existing
    /// peers that might want to pre-open a channel (best-effort).
    AcceptPeer { peer: NodeName },
    /// Non-broker → broker: relay this Ports message to `destination`
    /// because the sender isn't allowed to hand it handles directly.
    RelayPortsMessage { destination: NodeName, message: Message },
    /// Broker → destination: forwarded on behalf of `from`, already
    /// rewritten into the broker's and now the destination's process.
    PortsMessageFromRelay { from: NodeName, message: Message },
}
