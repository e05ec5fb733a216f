//! Message envelopes exchanged between simulated nodes.
//!
//! A packet is immutable once sent. Requests carry the resolver of the
//! sender's pending [`Request`]; the responder builds a distinct reply
//! envelope bearing the same resolver, so resolution happens when the reply
//! finishes passing through the original sender's service queue.

use std::fmt;

use dhtsim_core::Resolver;

use crate::node::{DhtRef, Key, NodeRef, SimNode, Value};

/// Typed payload of a packet.
#[derive(Clone)]
pub enum PacketBody {
    /// Ask for the known nodes closest to `key`.
    FindNode { key: Key },
    FindNodeReply { nodes: Vec<DhtRef> },
    /// Client-facing lookup of the value stored under `key`.
    FindValue { key: Key },
    FindValueReply { value: Option<Value>, hops: i64 },
    /// Client-facing store of `value` under `key`.
    StoreValue { key: Key, value: Value },
    StoreValueReply { hops: i64 },
    /// Read from the receiving node's local table.
    GetValue { key: Key },
    GetValueReply { value: Option<Value> },
    /// Write into the receiving node's local table.
    SetValue { key: Key, value: Value },
    SetValueReply,
    // Ring maintenance, Chord only.
    GetSuccessor,
    GetSuccessorReply { succ: Option<DhtRef> },
    SetSuccessor { succ: DhtRef },
    SetSuccessorReply,
    GetPredecessor,
    GetPredecessorReply { pred: Option<DhtRef> },
    SetPredecessor { pred: DhtRef },
    SetPredecessorReply,
}

impl PacketBody {
    /// Whether this payload answers an earlier request.
    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            PacketBody::FindNodeReply { .. }
                | PacketBody::FindValueReply { .. }
                | PacketBody::StoreValueReply { .. }
                | PacketBody::GetValueReply { .. }
                | PacketBody::SetValueReply
                | PacketBody::GetSuccessorReply { .. }
                | PacketBody::SetSuccessorReply
                | PacketBody::GetPredecessorReply { .. }
                | PacketBody::SetPredecessorReply
        )
    }

    /// Short name for log lines.
    pub fn label(&self) -> &'static str {
        match self {
            PacketBody::FindNode { .. } => "find_node",
            PacketBody::FindNodeReply { .. } => "find_node_reply",
            PacketBody::FindValue { .. } => "find_value",
            PacketBody::FindValueReply { .. } => "find_value_reply",
            PacketBody::StoreValue { .. } => "store_value",
            PacketBody::StoreValueReply { .. } => "store_value_reply",
            PacketBody::GetValue { .. } => "get_value",
            PacketBody::GetValueReply { .. } => "get_value_reply",
            PacketBody::SetValue { .. } => "set_value",
            PacketBody::SetValueReply => "set_value_reply",
            PacketBody::GetSuccessor => "get_successor",
            PacketBody::GetSuccessorReply { .. } => "get_successor_reply",
            PacketBody::SetSuccessor { .. } => "set_successor",
            PacketBody::SetSuccessorReply => "set_successor_reply",
            PacketBody::GetPredecessor => "get_predecessor",
            PacketBody::GetPredecessorReply { .. } => "get_predecessor_reply",
            PacketBody::SetPredecessor { .. } => "set_predecessor",
            PacketBody::SetPredecessorReply => "set_predecessor_reply",
        }
    }
}

/// A message in flight.
pub struct Packet {
    /// Monotonically increasing identifier, for tracing only.
    pub id: u64,
    /// Typed payload.
    pub body: PacketBody,
    /// Assigned when the packet is sent.
    pub sender: Option<NodeRef>,
    /// Resolver of the request this packet belongs to.
    pub reply: Option<Resolver<Packet>>,
}

impl Packet {
    /// Fresh packet with no sender and no pending request.
    pub fn new(id: u64, body: PacketBody) -> Self {
        Self {
            id,
            body,
            sender: None,
            reply: None,
        }
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("id", &self.id)
            .field("kind", &self.body.label())
            .field(
                "sender",
                &self.sender.as_ref().map(|s| s.core().name().to_owned()),
            )
            .finish()
    }
}

/// Pending reply to a sent packet.
pub type Request = dhtsim_core::Request<Packet>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_classification() {
        assert!(!PacketBody::FindNode { key: 3 }.is_reply());
        assert!(PacketBody::FindNodeReply { nodes: Vec::new() }.is_reply());
        assert!(!PacketBody::GetSuccessor.is_reply());
        assert!(PacketBody::SetValueReply.is_reply());
    }
}
