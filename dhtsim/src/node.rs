//! Node substrate: identity, transmission primitives, the serialized packet
//! service and the abstract DHT contract.
//!
//! Concrete protocol handlers run inside the node's single-slot queue and can
//! therefore be written as if single-threaded: no other inbound packet is
//! processed by the same node until the handler's service time has elapsed.
//! Long-running operations (serving `find_value` / `store_value`, which must
//! perform their own lookups) are spawned as separate processes, exactly so
//! they do not hold the queue slot across awaits.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use async_trait::async_trait;
use hashbrown::HashMap;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use dhtsim_core::{race_all, DataCollector, Sampler, ServiceQueue, SimEnv};

use crate::error::DhtTimeoutError;
use crate::packet::{Packet, PacketBody, Request};

/// Identifier in the `[0, 2^log_world_size)` key space.
pub type Key = u64;

/// Stored values.
pub type Value = String;

/// Shared handle to any simulated node (DHT member or client).
pub type NodeRef = Rc<dyn SimNode>;

/// Shared handle to a DHT member.
pub type DhtRef = Rc<dyn DhtNode>;

/// Shared handle to the run's metrics sink.
pub type SharedCollector = Rc<RefCell<DataCollector>>;

/// Tunables shared by every node in a run.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Bits of the identifier space.
    pub log_world_size: u32,
    /// Wait budget for outstanding responses.
    pub max_timeout: f64,
    /// Mean of the per-hop transmission delay.
    pub mean_transmission_delay: f64,
    /// Mean of the per-packet service time.
    pub mean_service_time: f64,
    /// Inbound packets dropped beyond this waiting-room size.
    pub queue_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            log_world_size: 10,
            max_timeout: 50.0,
            mean_transmission_delay: 0.5,
            mean_service_time: 0.1,
            queue_capacity: 100,
        }
    }
}

/// Hash a logical name into the identifier space: the top `bits` bits of its
/// SHA-256 digest, as an integer in `[0, 2^bits)`.
pub fn compute_key(name: &str, bits: u32) -> Key {
    let digest = Sha256::digest(name.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let word = u64::from_be_bytes(prefix);
    if bits >= 64 {
        word
    } else {
        word >> (64 - bits)
    }
}

/// Whether two handles name the same node. Names are unique per run, unlike
/// identifiers in a small key space.
pub fn same_node(a: &DhtRef, b: &DhtRef) -> bool {
    a.core().name() == b.core().name()
}

/// Result of an iterative lookup: the closest nodes found and the number of
/// request rounds it took. An empty node list means the target was
/// unreachable (`hops == -1`).
pub struct LookupOutcome {
    pub nodes: Vec<DhtRef>,
    pub hops: i64,
}

impl LookupOutcome {
    pub fn unreachable() -> Self {
        Self {
            nodes: Vec::new(),
            hops: -1,
        }
    }

    pub fn found(&self) -> Option<&DhtRef> {
        self.nodes.first()
    }
}

/// State and primitives common to every simulated node.
pub struct NodeCore {
    name: String,
    id: Key,
    config: NodeConfig,
    sampler: Rc<Sampler>,
    collector: SharedCollector,
    env: RefCell<SimEnv>,
    queue: RefCell<ServiceQueue>,
    store: RefCell<HashMap<Key, Value>>,
    crashed: Cell<bool>,
}

impl NodeCore {
    /// Create the substrate for a node named `name`; the identifier is
    /// derived from the name once and never changes.
    pub fn new(
        name: String,
        env: SimEnv,
        config: NodeConfig,
        sampler: Rc<Sampler>,
        collector: SharedCollector,
    ) -> Self {
        let id = compute_key(&name, config.log_world_size);
        Self {
            name,
            id,
            config,
            sampler,
            collector,
            env: RefCell::new(env),
            queue: RefCell::new(ServiceQueue::new()),
            store: RefCell::new(HashMap::new()),
            crashed: Cell::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Key {
        self.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn env(&self) -> SimEnv {
        self.env.borrow().clone()
    }

    pub fn sampler(&self) -> &Rc<Sampler> {
        &self.sampler
    }

    pub fn collector(&self) -> &SharedCollector {
        &self.collector
    }

    pub fn queue(&self) -> ServiceQueue {
        self.queue.borrow().clone()
    }

    /// Rebind to a fresh scheduler between phases. The service queue restarts
    /// empty against the new environment.
    pub fn change_env(&self, env: SimEnv) {
        *self.env.borrow_mut() = env;
        *self.queue.borrow_mut() = ServiceQueue::new();
    }

    /// Local table read.
    pub fn get(&self, key: Key) -> Option<Value> {
        self.store.borrow().get(&key).cloned()
    }

    /// Local table write.
    pub fn put(&self, key: Key, value: Value) {
        self.store.borrow_mut().insert(key, value);
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.get()
    }

    /// Take the node down: every packet addressed to it is dropped from now
    /// on, so its peers only notice through timeouts.
    pub fn crash(&self) {
        self.crashed.set(true);
        self.collector
            .borrow_mut()
            .record_crash(&self.name, self.env().now());
    }

    /// Send a request packet. The transmission delay is charged before the
    /// receiver sees it; the call itself never blocks. Returns the pending
    /// reply.
    pub fn send_req(&self, sender: NodeRef, dest: NodeRef, body: PacketBody) -> Request {
        let env = self.env();
        let (request, resolver) = dhtsim_core::channel();
        let mut packet = Packet::new(env.next_serial(), body);
        debug!(
            t = %env.now(),
            node = self.name(),
            id = self.id,
            to = dest.core().name(),
            packet = packet.id,
            kind = packet.body.label(),
            "sending request"
        );
        packet.sender = Some(sender);
        packet.reply = Some(resolver);
        let delay = self.sampler.exponential(self.config.mean_transmission_delay);
        let env_task = env.clone();
        env.spawn(async move {
            env_task.timeout(delay).await;
            dest.receive(packet).await;
        });
        request
    }

    /// Answer a request: build the reply envelope carrying the original
    /// resolver and send it back through the network. The reply passes the
    /// requester's own service queue before the pending request resolves.
    pub fn send_resp(&self, sender: NodeRef, packet: &mut Packet, body: PacketBody) {
        let dest = match packet.sender.take() {
            Some(dest) => dest,
            None => panic!("protocol violation: responding to a packet without a sender"),
        };
        let resolver = match packet.reply.take() {
            Some(resolver) => resolver,
            None => panic!("protocol violation: responding to a packet without a pending request"),
        };
        let env = self.env();
        let mut reply = Packet::new(env.next_serial(), body);
        debug!(
            t = %env.now(),
            node = self.name(),
            id = self.id,
            to = dest.core().name(),
            packet = reply.id,
            kind = reply.body.label(),
            "sending response"
        );
        reply.sender = Some(sender);
        reply.reply = Some(resolver);
        let delay = self.sampler.exponential(self.config.mean_transmission_delay);
        let env_task = env.clone();
        env.spawn(async move {
            env_task.timeout(delay).await;
            dest.receive(reply).await;
        });
    }

    /// Wait for every pending reply or `max_timeout`, whichever comes first.
    /// A timeout counts once in the collector and surfaces the replies that
    /// did arrive.
    pub async fn wait_resps(&self, requests: Vec<Request>) -> Result<Vec<Packet>, DhtTimeoutError> {
        let expected = requests.len();
        let timeout = self.env().timeout(self.config.max_timeout);
        match race_all(requests, timeout).await {
            Ok(packets) => {
                debug!(
                    t = %self.env().now(),
                    node = self.name(),
                    id = self.id,
                    "received {expected}/{expected} responses"
                );
                Ok(packets)
            }
            Err(partial) => {
                warn!(
                    t = %self.env().now(),
                    node = self.name(),
                    id = self.id,
                    received = partial.received.len(),
                    expected,
                    "responses timed out"
                );
                self.collector.borrow_mut().record_timeout();
                Err(DhtTimeoutError {
                    received: partial.received,
                })
            }
        }
    }

    /// Wait for a single reply (see [`NodeCore::wait_resps`]).
    pub async fn wait_resp(&self, request: Request) -> Result<Packet, DhtTimeoutError> {
        let mut packets = self.wait_resps(vec![request]).await?;
        match packets.pop() {
            Some(packet) => Ok(packet),
            None => Err(DhtTimeoutError {
                received: Vec::new(),
            }),
        }
    }

    fn record_load(&self, queue: &ServiceQueue) {
        self.collector
            .borrow_mut()
            .record_load(&self.name, self.env().now(), queue.waiting());
    }

    fn record_wait(&self, wait: f64) {
        self.collector.borrow_mut().record_wait(&self.name, wait);
    }
}

/// Anything that can receive packets over the simulated network.
#[async_trait(?Send)]
pub trait SimNode {
    fn core(&self) -> &NodeCore;

    /// A shareable handle to this node.
    fn node_ref(&self) -> NodeRef;

    /// This node as a DHT member, if it is one.
    fn as_dht(&self) -> Option<DhtRef> {
        None
    }

    /// Variant hook run for every inbound packet inside the critical section
    /// (Kademlia refreshes its buckets from here).
    fn observe_sender(&self, _packet: &Packet) {}

    /// Handle a request packet. Runs inside the critical section; default is
    /// to drop it, which is all a plain client ever needs.
    fn dispatch(&self, packet: Packet) {
        let core = self.core();
        warn!(
            node = core.name(),
            id = core.id(),
            kind = packet.body.label(),
            "unexpected request dropped"
        );
    }

    /// Deliver a packet through the node's serialized inbound queue: sample
    /// the queue length, wait for the single slot, record the wait, run the
    /// handler, charge the service time, release and sample again.
    async fn receive(&self, mut packet: Packet) {
        let core = self.core();
        let env = core.env();
        if core.is_crashed() {
            debug!(
                t = %env.now(),
                node = core.name(),
                id = core.id(),
                packet = packet.id,
                "node is down, packet lost"
            );
            return;
        }
        debug!(
            t = %env.now(),
            node = core.name(),
            id = core.id(),
            packet = packet.id,
            kind = packet.body.label(),
            "received"
        );
        let queue = core.queue();
        if queue.waiting() >= core.config().queue_capacity {
            warn!(
                t = %env.now(),
                node = core.name(),
                id = core.id(),
                packet = packet.id,
                "queue full, dropping packet"
            );
            return;
        }
        let arrival = env.now();
        let acquire = queue.acquire();
        core.record_load(&queue);
        let guard = acquire.await;
        core.record_wait(env.now() - arrival);
        self.observe_sender(&packet);
        if packet.body.is_reply() {
            if let Some(resolver) = packet.reply.take() {
                if resolver.resolve(packet).is_err() {
                    panic!("protocol violation: request resolved twice");
                }
            }
        } else {
            self.dispatch(packet);
        }
        let service = core.sampler().exponential(core.config().mean_service_time);
        env.timeout(service).await;
        drop(guard);
        core.record_load(&queue);
    }
}

/// The abstract DHT contract both routing variants implement.
#[async_trait(?Send)]
pub trait DhtNode: SimNode {
    /// A shareable DHT handle to this node.
    fn dht_ref(&self) -> DhtRef;

    /// Variant distance from this node's identifier to `key`. Zero iff the
    /// key equals the identifier; totally ordered for "closer than".
    fn distance(&self, key: Key) -> u64;

    /// Iterative lookup of the nodes responsible for `key`, optionally
    /// seeded with a first node to ask.
    async fn find_node(&self, key: Key, ask_to: Option<DhtRef>) -> LookupOutcome;

    /// Handle a variant routing request inside the critical section.
    fn handle_request(&self, packet: Packet);

    /// Bootstrap this node's routing state from a known member.
    async fn join_network(&self, to: DhtRef) -> Result<(), DhtTimeoutError>;

    /// Post-join routing refresh; Chord fills its finger table here.
    async fn refresh(&self) {}
}

/// Route a request packet to its handler. Client-facing operations spawn
/// their own serving process; everything else runs in place.
pub(crate) fn dht_dispatch<N>(node: &N, packet: Packet)
where
    N: DhtNode + Clone + 'static,
{
    match &packet.body {
        PacketBody::FindValue { .. } => {
            let serving = node.clone();
            let _ = node.core().env().spawn(async move {
                serve_find_value(&serving, packet).await;
            });
        }
        PacketBody::StoreValue { .. } => {
            let serving = node.clone();
            let _ = node.core().env().spawn(async move {
                serve_store_value(&serving, packet).await;
            });
        }
        PacketBody::GetValue { .. } => get_value(node, packet),
        PacketBody::SetValue { .. } => set_value(node, packet),
        _ => node.handle_request(packet),
    }
}

/// Local table read, answered to the requester.
fn get_value<N: DhtNode>(node: &N, mut packet: Packet) {
    let core = node.core();
    let key = match &packet.body {
        PacketBody::GetValue { key } => *key,
        _ => return,
    };
    let value = core.get(key);
    core.send_resp(node.node_ref(), &mut packet, PacketBody::GetValueReply { value });
}

/// Local table write, acknowledged to the requester.
fn set_value<N: DhtNode>(node: &N, mut packet: Packet) {
    let core = node.core();
    let (key, value) = match &packet.body {
        PacketBody::SetValue { key, value } => (*key, value.clone()),
        _ => return,
    };
    core.put(key, value);
    core.send_resp(node.node_ref(), &mut packet, PacketBody::SetValueReply);
}

/// Serve a client lookup: find the responsible nodes, read from them, answer
/// with the most frequent value. Unreachable targets answer `None` with a
/// hop count of -1.
pub(crate) async fn serve_find_value<N>(node: &N, mut packet: Packet)
where
    N: DhtNode + Clone + 'static,
{
    let core = node.core();
    let key = match &packet.body {
        PacketBody::FindValue { key } => *key,
        _ => return,
    };
    debug!(node = core.name(), id = core.id(), key, "serving find_value");
    let outcome = node.find_node(key, None).await;
    let mut hops = outcome.hops;
    let mut replies = Vec::new();
    if outcome.nodes.is_empty() {
        hops = -1;
    } else {
        let requests: Vec<Request> = outcome
            .nodes
            .iter()
            .map(|n| {
                core.send_req(node.node_ref(), n.node_ref(), PacketBody::GetValue { key })
            })
            .collect();
        match core.wait_resps(requests).await {
            Ok(packets) => replies = packets,
            Err(err) => {
                if err.received.is_empty() {
                    hops = -1;
                }
                replies = err.received;
            }
        }
    }
    let value = decide_value(&replies);
    core.send_resp(
        node.node_ref(),
        &mut packet,
        PacketBody::FindValueReply { value, hops },
    );
}

/// Serve a client store: find the responsible nodes and write to all of
/// them. Any timeout reports a hop count of -1.
pub(crate) async fn serve_store_value<N>(node: &N, mut packet: Packet)
where
    N: DhtNode + Clone + 'static,
{
    let core = node.core();
    let (key, value) = match &packet.body {
        PacketBody::StoreValue { key, value } => (*key, value.clone()),
        _ => return,
    };
    debug!(node = core.name(), id = core.id(), key, "serving store_value");
    let outcome = node.find_node(key, None).await;
    let mut hops = outcome.hops;
    if outcome.nodes.is_empty() {
        hops = -1;
    } else {
        let requests: Vec<Request> = outcome
            .nodes
            .iter()
            .map(|n| {
                core.send_req(
                    node.node_ref(),
                    n.node_ref(),
                    PacketBody::SetValue {
                        key,
                        value: value.clone(),
                    },
                )
            })
            .collect();
        if core.wait_resps(requests).await.is_err() {
            hops = -1;
        }
    }
    core.send_resp(
        node.node_ref(),
        &mut packet,
        PacketBody::StoreValueReply { hops },
    );
}

/// Most frequent value among the replies; ties break on the smaller value so
/// the choice is deterministic.
pub fn decide_value(replies: &[Packet]) -> Option<Value> {
    let mut counts: BTreeMap<&Value, usize> = BTreeMap::new();
    for packet in replies {
        if let PacketBody::GetValueReply { value: Some(value) } = &packet.body {
            *counts.entry(value).or_insert(0) += 1;
        }
    }
    counts
        .into_iter()
        .max_by(|(va, ca), (vb, cb)| ca.cmp(cb).then(vb.cmp(va)))
        .map(|(value, _)| value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_key_stays_in_world() {
        for bits in [1u32, 8, 10, 32, 64] {
            for i in 0..50 {
                let key = compute_key(&format!("node_{i:05}"), bits);
                if bits < 64 {
                    assert!(key < 1u64 << bits, "key {key} escapes {bits} bits");
                }
            }
        }
    }

    #[test]
    fn test_compute_key_is_deterministic() {
        assert_eq!(compute_key("node_00001", 10), compute_key("node_00001", 10));
        assert_ne!(compute_key("node_00001", 64), compute_key("node_00002", 64));
    }

    #[test]
    fn test_wider_world_extends_prefix() {
        // The 8-bit identity is the top byte of the 16-bit identity.
        let narrow = compute_key("node_00042", 8);
        let wide = compute_key("node_00042", 16);
        assert_eq!(narrow, wide >> 8);
    }

    #[test]
    fn test_decide_value_majority() {
        let packets: Vec<Packet> = [Some("a"), Some("b"), Some("b"), None]
            .into_iter()
            .map(|v| {
                Packet::new(
                    0,
                    PacketBody::GetValueReply {
                        value: v.map(str::to_owned),
                    },
                )
            })
            .collect();
        assert_eq!(decide_value(&packets), Some("b".to_owned()));
        assert_eq!(decide_value(&[]), None);
    }
}
