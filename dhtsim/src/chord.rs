//! Chord node: modular ring metric, successor/predecessor links and a
//! finger table.
//!
//! Lookups forward greedily: ask the best known finger for *its* best node
//! and stop once a node names itself. Joining locates the successor of the
//! joiner's identifier and splices the newcomer into the ring; finger tables
//! are filled by an explicit refresh after the join wave and kept honest by
//! periodic stabilization during steady state.

use std::cell::RefCell;
use std::rc::Rc;

use async_trait::async_trait;
use tracing::{debug, warn};

use dhtsim_core::{Sampler, SimEnv};

use crate::error::DhtTimeoutError;
use crate::node::{
    dht_dispatch, same_node, DhtNode, DhtRef, Key, LookupOutcome, NodeConfig, NodeCore, NodeRef,
    SharedCollector, SimNode,
};
use crate::packet::{Packet, PacketBody};

/// All-ones mask of the identifier space.
fn world_mask(bits: u32) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// Clockwise ring distance from `from` to `to` in a `bits`-wide space.
pub fn ring_distance(from: Key, to: Key, bits: u32) -> u64 {
    to.wrapping_sub(from) & world_mask(bits)
}

struct ChordState {
    succ: Option<DhtRef>,
    pred: Option<DhtRef>,
    fingers: Vec<DhtRef>,
    next_finger: usize,
}

/// A Chord DHT member. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ChordNode {
    core: Rc<NodeCore>,
    state: Rc<RefCell<ChordState>>,
}

impl ChordNode {
    pub fn new(
        name: String,
        env: SimEnv,
        config: NodeConfig,
        sampler: Rc<Sampler>,
        collector: SharedCollector,
    ) -> Self {
        let bits = config.log_world_size;
        let node = Self {
            core: Rc::new(NodeCore::new(name, env, config, sampler, collector)),
            state: Rc::new(RefCell::new(ChordState {
                succ: None,
                pred: None,
                fingers: Vec::new(),
                next_finger: 0,
            })),
        };
        // Every finger starts pointing at ourselves.
        let me = node.dht_ref();
        node.state.borrow_mut().fingers = vec![me; bits as usize];
        node
    }

    fn bits(&self) -> u32 {
        self.core.config().log_world_size
    }

    pub fn successor(&self) -> Option<DhtRef> {
        self.state.borrow().succ.clone()
    }

    pub fn predecessor(&self) -> Option<DhtRef> {
        self.state.borrow().pred.clone()
    }

    /// Adopt `node` as successor; the last finger tracks the successor.
    pub fn set_successor(&self, node: DhtRef) {
        let mut state = self.state.borrow_mut();
        if let Some(last) = state.fingers.last_mut() {
            *last = node.clone();
        }
        state.succ = Some(node);
    }

    pub fn set_predecessor(&self, node: DhtRef) {
        self.state.borrow_mut().pred = Some(node);
    }

    /// Finger snapshot, for overlay dumps.
    pub fn fingers(&self) -> Vec<DhtRef> {
        self.state.borrow().fingers.clone()
    }

    /// The known node closest behind `key` on the ring, and whether that is
    /// this node itself.
    fn best_node(&self, key: Key) -> (DhtRef, bool) {
        let bits = self.bits();
        let state = self.state.borrow();
        let mut best = self.dht_ref();
        let mut best_dist = ring_distance(best.core().id(), key, bits);
        for finger in &state.fingers {
            let dist = ring_distance(finger.core().id(), key, bits);
            if dist < best_dist {
                best = finger.clone();
                best_dist = dist;
            }
        }
        let found = best.core().name() == self.core.name();
        (best, found)
    }

    /// One stabilization round: adopt our successor's predecessor when it
    /// sits between us, then refresh one finger.
    pub async fn stabilize(&self) {
        let Some(succ) = self.successor() else {
            return;
        };
        let request = self
            .core
            .send_req(self.node_ref(), succ.node_ref(), PacketBody::GetPredecessor);
        match self.core.wait_resp(request).await {
            Ok(packet) => {
                if let PacketBody::GetPredecessorReply { pred: Some(between) } = &packet.body {
                    let bits = self.bits();
                    let closer = ring_distance(self.core.id(), between.core().id(), bits)
                        < ring_distance(self.core.id(), succ.core().id(), bits);
                    if closer && between.core().name() != self.core.name() {
                        debug!(
                            node = self.core.name(),
                            adopted = between.core().name(),
                            "stabilize found a closer successor"
                        );
                        self.set_successor(between.clone());
                        let request = self.core.send_req(
                            self.node_ref(),
                            between.node_ref(),
                            PacketBody::SetPredecessor {
                                pred: self.dht_ref(),
                            },
                        );
                        let _ = self.core.wait_resp(request).await;
                    }
                }
            }
            Err(_) => {
                debug!(
                    node = self.core.name(),
                    succ = succ.core().name(),
                    "successor silent during stabilize"
                );
            }
        }
        let index = {
            let mut state = self.state.borrow_mut();
            let index = state.next_finger;
            state.next_finger = (index + 1) % state.fingers.len().max(1);
            index
        };
        self.refresh_finger(index).await;
    }

    /// Point finger `index` at the current owner of `id + 2^index`.
    async fn refresh_finger(&self, index: usize) {
        let bits = self.bits();
        let key = self.core.id().wrapping_add(1u64 << index) & world_mask(bits);
        let outcome = self.find_node(key, None).await;
        if let Some(owner) = outcome.found() {
            self.state.borrow_mut().fingers[index] = owner.clone();
        }
    }
}

impl SimNode for ChordNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn node_ref(&self) -> NodeRef {
        Rc::new(self.clone())
    }

    fn as_dht(&self) -> Option<DhtRef> {
        Some(self.dht_ref())
    }

    fn dispatch(&self, packet: Packet) {
        dht_dispatch(self, packet);
    }
}

#[async_trait(?Send)]
impl DhtNode for ChordNode {
    fn dht_ref(&self) -> DhtRef {
        Rc::new(self.clone())
    }

    fn distance(&self, key: Key) -> u64 {
        ring_distance(self.core.id(), key, self.bits())
    }

    async fn find_node(&self, key: Key, ask_to: Option<DhtRef>) -> LookupOutcome {
        debug!(node = self.core.name(), id = self.core.id(), key, "lookup");
        let (mut best, mut found) = match ask_to {
            Some(seed) => (seed, false),
            None => self.best_node(key),
        };
        let mut hops = 0i64;
        // Stale fingers can bounce a lookup around; bound the walk.
        let max_hops = 2 * self.bits() as i64 + 16;
        while !found {
            hops += 1;
            if hops > max_hops {
                warn!(
                    node = self.core.name(),
                    id = self.core.id(),
                    key,
                    "lookup abandoned after {max_hops} hops"
                );
                return LookupOutcome::unreachable();
            }
            let request = self.core.send_req(
                self.node_ref(),
                best.node_ref(),
                PacketBody::FindNode { key },
            );
            match self.core.wait_resp(request).await {
                Ok(packet) => {
                    let next = match &packet.body {
                        PacketBody::FindNodeReply { nodes } => nodes.first().cloned(),
                        _ => None,
                    };
                    match next {
                        Some(node) => {
                            found = same_node(&node, &best);
                            best = node;
                        }
                        None => return LookupOutcome::unreachable(),
                    }
                }
                Err(_) => {
                    warn!(
                        node = self.core.name(),
                        id = self.core.id(),
                        key,
                        "lookup timed out"
                    );
                    return LookupOutcome::unreachable();
                }
            }
        }
        LookupOutcome {
            nodes: vec![best],
            hops,
        }
    }

    fn handle_request(&self, mut packet: Packet) {
        let reply = match &packet.body {
            PacketBody::FindNode { key } => {
                let (best, _) = self.best_node(*key);
                Some(PacketBody::FindNodeReply { nodes: vec![best] })
            }
            PacketBody::GetSuccessor => Some(PacketBody::GetSuccessorReply {
                succ: self.successor(),
            }),
            PacketBody::SetSuccessor { succ } => {
                self.set_successor(succ.clone());
                Some(PacketBody::SetSuccessorReply)
            }
            PacketBody::GetPredecessor => Some(PacketBody::GetPredecessorReply {
                pred: self.predecessor(),
            }),
            PacketBody::SetPredecessor { pred } => {
                self.set_predecessor(pred.clone());
                Some(PacketBody::SetPredecessorReply)
            }
            _ => None,
        };
        match reply {
            Some(body) => self.core.send_resp(self.node_ref(), &mut packet, body),
            None => debug!(
                node = self.core.name(),
                kind = packet.body.label(),
                "unhandled request"
            ),
        }
    }

    /// Locate our successor through `to`, then splice into the ring: the
    /// owner of our identifier becomes our predecessor, its old successor
    /// becomes ours, and both get rewired towards us.
    async fn join_network(&self, to: DhtRef) -> Result<(), DhtTimeoutError> {
        let outcome = self.find_node(self.core.id(), Some(to)).await;
        let owner = match outcome.found() {
            Some(owner) => owner.clone(),
            None => {
                return Err(DhtTimeoutError {
                    received: Vec::new(),
                })
            }
        };
        let request =
            self.core
                .send_req(self.node_ref(), owner.node_ref(), PacketBody::GetSuccessor);
        let packet = self.core.wait_resp(request).await?;
        let succ = match &packet.body {
            PacketBody::GetSuccessorReply { succ: Some(succ) } => succ.clone(),
            _ => owner.clone(),
        };
        let rewire_owner = self.core.send_req(
            self.node_ref(),
            owner.node_ref(),
            PacketBody::SetSuccessor {
                succ: self.dht_ref(),
            },
        );
        let rewire_succ = self.core.send_req(
            self.node_ref(),
            succ.node_ref(),
            PacketBody::SetPredecessor {
                pred: self.dht_ref(),
            },
        );
        self.core
            .wait_resps(vec![rewire_owner, rewire_succ])
            .await?;
        self.set_predecessor(owner);
        self.set_successor(succ);
        let now = self.core.env().now();
        self.core
            .collector()
            .borrow_mut()
            .record_join(self.core.name(), now);
        debug!(node = self.core.name(), id = self.core.id(), "joined the ring");
        Ok(())
    }

    /// Fill every finger by looking up `id + 2^x` across the ring.
    async fn refresh(&self) {
        for index in 0..self.bits() as usize {
            self.refresh_finger(index).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_distance_identity() {
        for bits in [8u32, 10, 32, 64] {
            assert_eq!(ring_distance(123 & world_mask(bits), 123 & world_mask(bits), bits), 0);
        }
    }

    #[test]
    fn test_ring_distance_wraps_to_world_size() {
        let bits = 8;
        for (a, b) in [(3u64, 200u64), (0, 255), (17, 16)] {
            let there = ring_distance(a, b, bits);
            let back = ring_distance(b, a, bits);
            assert_eq!((there + back) & world_mask(bits), 0);
            assert_eq!(there + back, 1 << bits);
        }
    }

    #[test]
    fn test_ring_distance_is_directional() {
        let bits = 8;
        assert_eq!(ring_distance(10, 20, bits), 10);
        assert_eq!(ring_distance(20, 10, bits), 246);
    }

    fn test_node(name: &str) -> ChordNode {
        ChordNode::new(
            name.to_owned(),
            SimEnv::new(),
            NodeConfig {
                log_world_size: 8,
                ..NodeConfig::default()
            },
            Rc::new(Sampler::new(1)),
            SharedCollector::default(),
        )
    }

    #[test]
    fn test_lone_node_owns_every_key() {
        let node = test_node("node_00000");
        for key in [0u64, 17, 200, 255] {
            let (best, found) = node.best_node(key);
            assert!(found);
            assert_eq!(best.core().name(), "node_00000");
        }
    }

    #[test]
    fn test_successor_tracks_last_finger() {
        let node = test_node("node_00000");
        let peer = test_node("node_00001").dht_ref();
        node.set_successor(peer.clone());
        let fingers = node.fingers();
        assert_eq!(
            fingers.last().map(|n| n.core().name().to_owned()),
            Some("node_00001".to_owned())
        );
        assert_eq!(
            node.successor().map(|n| n.core().name().to_owned()),
            Some("node_00001".to_owned())
        );
    }
}
