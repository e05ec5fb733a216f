//! Kademlia node: XOR metric and k-bucket routing.
//!
//! Ported semantics: buckets hold up to `k` nodes per distance prefix with
//! move-to-tail refresh; lookups contact `alpha` uncontacted candidates per
//! round and keep the `k` closest seen, terminating when a round uncovers
//! nothing closer. Every observed sender refreshes the buckets, so routing
//! tables improve as a side effect of traffic.

use std::cell::RefCell;
use std::rc::Rc;

use async_trait::async_trait;
use hashbrown::HashSet;
use tracing::debug;

use dhtsim_core::{Sampler, SimEnv};

use crate::error::DhtTimeoutError;
use crate::node::{
    dht_dispatch, same_node, DhtNode, DhtRef, Key, LookupOutcome, NodeConfig, NodeCore, NodeRef,
    SharedCollector, SimNode,
};
use crate::packet::{Packet, PacketBody, Request};

/// XOR distance between two identifiers.
pub fn xor_distance(a: Key, b: Key) -> u64 {
    a ^ b
}

/// Kademlia parameters.
#[derive(Debug, Clone)]
pub struct KadConfig {
    /// Lookup parallelism per round.
    pub alpha: usize,
    /// Bucket capacity and candidate-set size.
    pub k: usize,
    /// Kademlia tolerates a tighter wait budget than the ring variant.
    pub max_timeout: f64,
}

impl Default for KadConfig {
    fn default() -> Self {
        Self {
            alpha: 3,
            k: 5,
            max_timeout: 10.0,
        }
    }
}

struct KadState {
    buckets: Vec<Vec<DhtRef>>,
}

/// A Kademlia DHT member. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct KadNode {
    core: Rc<NodeCore>,
    kad: Rc<KadConfig>,
    state: Rc<RefCell<KadState>>,
}

impl KadNode {
    pub fn new(
        name: String,
        env: SimEnv,
        mut config: NodeConfig,
        kad: KadConfig,
        sampler: Rc<Sampler>,
        collector: SharedCollector,
    ) -> Self {
        config.max_timeout = kad.max_timeout;
        let buckets = vec![Vec::new(); config.log_world_size as usize];
        Self {
            core: Rc::new(NodeCore::new(name, env, config, sampler, collector)),
            kad: Rc::new(kad),
            state: Rc::new(RefCell::new(KadState { buckets })),
        }
    }

    /// Bucket index for `key`: the bit length of its XOR distance from us.
    fn bucket_index(&self, key: Key) -> usize {
        let dst = xor_distance(self.core.id(), key);
        if dst == 0 {
            0
        } else {
            (63 - dst.leading_zeros()) as usize
        }
    }

    /// Refresh the bucket for `node`: move to tail on re-contact, append if
    /// there is room, otherwise evict the stalest entry.
    pub fn update_bucket(&self, node: &DhtRef) {
        if node.core().name() == self.core.name() {
            return;
        }
        let index = self.bucket_index(node.core().id());
        let mut state = self.state.borrow_mut();
        let bucket = &mut state.buckets[index];
        if let Some(pos) = bucket.iter().position(|n| same_node(n, node)) {
            let refreshed = bucket.remove(pos);
            bucket.push(refreshed);
        } else if bucket.len() < self.kad.k {
            bucket.push(node.clone());
        } else {
            bucket.remove(0);
            bucket.push(node.clone());
        }
    }

    /// The `k` closest known nodes to `key`, this node included, scanning
    /// the target bucket first and fanning out to neighbouring buckets.
    fn pick_neighbors(&self, key: Key) -> Vec<DhtRef> {
        let state = self.state.borrow();
        let buckets = &state.buckets;
        let start = self.bucket_index(key);
        let mut picked: Vec<DhtRef> = vec![self.dht_ref()];
        let mut scan = vec![start];
        for step in 1..buckets.len() {
            if start >= step {
                scan.push(start - step);
            }
            if start + step < buckets.len() {
                scan.push(start + step);
            }
        }
        'outer: for index in scan {
            for node in &buckets[index] {
                if !picked.iter().any(|n| same_node(n, node)) {
                    picked.push(node.clone());
                    if picked.len() >= 2 * self.kad.k {
                        break 'outer;
                    }
                }
            }
        }
        sort_by_distance(&mut picked, key);
        picked.truncate(self.kad.k);
        picked
    }

    /// Every node currently held in a bucket, for overlay dumps.
    pub fn known_peers(&self) -> Vec<DhtRef> {
        self.state
            .borrow()
            .buckets
            .iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Merge replies into the candidate set. Returns true when the merge
    /// yields nothing new to contact, i.e. the lookup converged.
    fn update_candidates(
        &self,
        replies: &[Packet],
        key: Key,
        current: &mut Vec<DhtRef>,
        contacted: &HashSet<String>,
    ) -> bool {
        let mut merged = current.clone();
        for packet in replies {
            if let PacketBody::FindNodeReply { nodes } = &packet.body {
                for node in nodes {
                    if !merged.iter().any(|n| same_node(n, node)) {
                        merged.push(node.clone());
                    }
                }
            }
        }
        sort_by_distance(&mut merged, key);
        merged.truncate(self.kad.k);
        let unchanged = merged.len() == current.len()
            && merged
                .iter()
                .zip(current.iter())
                .all(|(a, b)| same_node(a, b));
        let exhausted = merged
            .iter()
            .all(|n| contacted.contains(n.core().name()));
        if !unchanged && !exhausted {
            *current = merged;
            false
        } else {
            true
        }
    }
}

/// Stable order by distance to `key`, names breaking ties.
fn sort_by_distance(nodes: &mut [DhtRef], key: Key) {
    nodes.sort_by(|a, b| {
        xor_distance(a.core().id(), key)
            .cmp(&xor_distance(b.core().id(), key))
            .then_with(|| a.core().name().cmp(b.core().name()))
    });
}

impl SimNode for KadNode {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn node_ref(&self) -> NodeRef {
        Rc::new(self.clone())
    }

    fn as_dht(&self) -> Option<DhtRef> {
        Some(self.dht_ref())
    }

    fn observe_sender(&self, packet: &Packet) {
        if let Some(sender) = &packet.sender {
            if let Some(peer) = sender.as_dht() {
                self.update_bucket(&peer);
            }
        }
    }

    fn dispatch(&self, packet: Packet) {
        dht_dispatch(self, packet);
    }
}

#[async_trait(?Send)]
impl DhtNode for KadNode {
    fn dht_ref(&self) -> DhtRef {
        Rc::new(self.clone())
    }

    fn distance(&self, key: Key) -> u64 {
        xor_distance(self.core.id(), key)
    }

    async fn find_node(&self, key: Key, ask_to: Option<DhtRef>) -> LookupOutcome {
        debug!(node = self.core.name(), id = self.core.id(), key, "lookup");
        if let Some(seed) = &ask_to {
            self.update_bucket(seed);
        }
        let mut contacted: HashSet<String> = HashSet::new();
        contacted.insert(self.core.name().to_owned());
        let mut current = self.pick_neighbors(key);
        let mut hops = 0i64;
        loop {
            let to_contact: Vec<DhtRef> = current
                .iter()
                .filter(|n| !contacted.contains(n.core().name()))
                .take(self.kad.alpha)
                .cloned()
                .collect();
            if to_contact.is_empty() {
                break;
            }
            for node in &to_contact {
                contacted.insert(node.core().name().to_owned());
            }
            let requests: Vec<Request> = to_contact
                .iter()
                .map(|n| {
                    self.core
                        .send_req(self.node_ref(), n.node_ref(), PacketBody::FindNode { key })
                })
                .collect();
            hops += 1;
            let replies = match self.core.wait_resps(requests).await {
                Ok(packets) => packets,
                Err(err) => {
                    debug!(
                        node = self.core.name(),
                        id = self.core.id(),
                        key,
                        "lookup round timed out, continuing with partial replies"
                    );
                    err.received
                }
            };
            if self.update_candidates(&replies, key, &mut current, &contacted) {
                break;
            }
        }
        for node in &current {
            self.update_bucket(node);
        }
        LookupOutcome {
            nodes: current,
            hops,
        }
    }

    fn handle_request(&self, mut packet: Packet) {
        let reply = match &packet.body {
            PacketBody::FindNode { key } => Some(PacketBody::FindNodeReply {
                nodes: self.pick_neighbors(*key),
            }),
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

    async fn join_network(&self, to: DhtRef) -> Result<(), DhtTimeoutError> {
        self.update_bucket(&to);
        self.find_node(self.core.id(), None).await;
        let now = self.core.env().now();
        self.core
            .collector()
            .borrow_mut()
            .record_join(self.core.name(), now);
        debug!(node = self.core.name(), id = self.core.id(), "joined the network");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_distance_identity_and_symmetry() {
        assert_eq!(xor_distance(37, 37), 0);
        assert_eq!(xor_distance(12, 99), xor_distance(99, 12));
    }

    fn test_node(name: &str) -> KadNode {
        let env = SimEnv::new();
        let sampler = Rc::new(Sampler::new(1));
        let collector = SharedCollector::default();
        KadNode::new(
            name.to_owned(),
            env,
            NodeConfig {
                log_world_size: 8,
                ..NodeConfig::default()
            },
            KadConfig::default(),
            sampler,
            collector,
        )
    }

    #[test]
    fn test_bucket_update_is_lru() {
        let node = test_node("node_00000");
        let peers: Vec<DhtRef> = (1..=10)
            .map(|i| test_node(&format!("node_{i:05}")).dht_ref())
            .collect();
        for peer in &peers {
            node.update_bucket(peer);
        }
        for bucket in &node.state.borrow().buckets {
            assert!(bucket.len() <= node.kad.k);
        }
        // Re-adding a known peer must not duplicate it.
        node.update_bucket(&peers[0]);
        let total: usize = node.state.borrow().buckets.iter().map(Vec::len).sum();
        let mut names: Vec<String> = node
            .state
            .borrow()
            .buckets
            .iter()
            .flatten()
            .map(|n| n.core().name().to_owned())
            .collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), total);
    }

    #[test]
    fn test_pick_neighbors_includes_self_and_sorts_by_distance() {
        let node = test_node("node_00000");
        for i in 1..=10 {
            node.update_bucket(&test_node(&format!("node_{i:05}")).dht_ref());
        }
        let own = node.core().id();
        let picked = node.pick_neighbors(own);
        assert!(!picked.is_empty());
        assert_eq!(picked[0].core().name(), "node_00000");
        let dists: Vec<u64> = picked
            .iter()
            .map(|n| xor_distance(n.core().id(), own))
            .collect();
        let mut sorted = dists.clone();
        sorted.sort_unstable();
        assert_eq!(dists, sorted);
    }
}
