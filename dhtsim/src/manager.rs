//! Construction and wiring of the simulated overlay.
//!
//! A manager instantiates the node set against the join-phase environment,
//! hardwires the first two nodes so the network is bootstrappable, rebinds
//! every node when the driver switches phases, and can dump the converged
//! overlay as Graphviz for external rendering.

use std::io;
use std::path::Path;
use std::rc::Rc;

use tracing::{info, warn};

use dhtsim_core::{Sampler, SimEnv};

use crate::chord::ChordNode;
use crate::kad::{KadConfig, KadNode};
use crate::node::{DhtNode, DhtRef, NodeConfig, SharedCollector, SimNode};

/// Construction and lifecycle of a node population.
pub trait NetManager {
    /// The node set, join order.
    fn nodes(&self) -> &[DhtRef];

    /// Rebind every node to a new environment between phases.
    fn change_env(&self, env: SimEnv);

    /// Crash a random healthy node. Returns the victim, if any remained.
    fn crash_random(&self) -> Option<DhtRef>;

    /// Spawn variant-specific periodic maintenance on the steady-state
    /// environment.
    fn start_maintenance(&self, _env: &SimEnv) {}

    /// Dump the overlay in Graphviz dot format.
    fn write_dot(&self, path: &Path) -> io::Result<()>;
}

fn node_name(index: usize) -> String {
    format!("node_{index:05}")
}

fn crash_random_of(nodes: &[DhtRef], sampler: &Sampler) -> Option<DhtRef> {
    let healthy: Vec<&DhtRef> = nodes.iter().filter(|n| !n.core().is_crashed()).collect();
    if healthy.is_empty() {
        return None;
    }
    let victim = healthy[sampler.index(healthy.len())].clone();
    victim.core().crash();
    warn!(node = victim.core().name(), id = victim.core().id(), "node crashed");
    Some(victim)
}

/// Manager for a Kademlia population.
pub struct KadNetManager {
    nodes: Vec<KadNode>,
    refs: Vec<DhtRef>,
    sampler: Rc<Sampler>,
}

impl KadNetManager {
    /// Create `n_nodes` Kademlia nodes and hardwire the first two into each
    /// other's buckets.
    pub fn new(
        env: SimEnv,
        n_nodes: usize,
        config: NodeConfig,
        kad: KadConfig,
        sampler: Rc<Sampler>,
        collector: SharedCollector,
    ) -> Self {
        let nodes: Vec<KadNode> = (0..n_nodes)
            .map(|i| {
                KadNode::new(
                    node_name(i),
                    env.clone(),
                    config.clone(),
                    kad.clone(),
                    Rc::clone(&sampler),
                    Rc::clone(&collector),
                )
            })
            .collect();
        let refs: Vec<DhtRef> = nodes.iter().map(|n| n.dht_ref()).collect();
        if refs.len() >= 2 {
            nodes[0].update_bucket(&refs[1]);
            nodes[1].update_bucket(&refs[0]);
        }
        info!(nodes = n_nodes, "kademlia network created");
        Self {
            nodes,
            refs,
            sampler,
        }
    }
}

impl NetManager for KadNetManager {
    fn nodes(&self) -> &[DhtRef] {
        &self.refs
    }

    fn change_env(&self, env: SimEnv) {
        for node in &self.refs {
            node.core().change_env(env.clone());
        }
    }

    fn crash_random(&self) -> Option<DhtRef> {
        crash_random_of(&self.refs, &self.sampler)
    }

    fn write_dot(&self, path: &Path) -> io::Result<()> {
        let mut dot = String::from("digraph kad {\n");
        for node in &self.nodes {
            for peer in node.known_peers() {
                dot.push_str(&format!(
                    "  \"{}\" -> \"{}\";\n",
                    node.core().name(),
                    peer.core().name()
                ));
            }
        }
        dot.push_str("}\n");
        std::fs::write(path, dot)
    }
}

/// Manager for a Chord population.
pub struct ChordNetManager {
    nodes: Vec<ChordNode>,
    refs: Vec<DhtRef>,
    sampler: Rc<Sampler>,
    stabilize: StabilizeConfig,
}

/// Period of the steady-state stabilization timer, a capped normal.
#[derive(Debug, Clone)]
pub struct StabilizeConfig {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
}

impl Default for StabilizeConfig {
    fn default() -> Self {
        Self {
            mean: 50.0,
            std_dev: 10.0,
            min: 5.0,
        }
    }
}

impl ChordNetManager {
    /// Create `n_nodes` Chord nodes and hardwire the first two into a
    /// two-node ring.
    pub fn new(
        env: SimEnv,
        n_nodes: usize,
        config: NodeConfig,
        stabilize: StabilizeConfig,
        sampler: Rc<Sampler>,
        collector: SharedCollector,
    ) -> Self {
        let nodes: Vec<ChordNode> = (0..n_nodes)
            .map(|i| {
                ChordNode::new(
                    node_name(i),
                    env.clone(),
                    config.clone(),
                    Rc::clone(&sampler),
                    Rc::clone(&collector),
                )
            })
            .collect();
        let refs: Vec<DhtRef> = nodes.iter().map(|n| n.dht_ref()).collect();
        if refs.len() >= 2 {
            nodes[0].set_successor(refs[1].clone());
            nodes[0].set_predecessor(refs[1].clone());
            nodes[1].set_successor(refs[0].clone());
            nodes[1].set_predecessor(refs[0].clone());
        }
        info!(nodes = n_nodes, "chord ring created");
        Self {
            nodes,
            refs,
            sampler,
            stabilize,
        }
    }
}

impl NetManager for ChordNetManager {
    fn nodes(&self) -> &[DhtRef] {
        &self.refs
    }

    fn change_env(&self, env: SimEnv) {
        for node in &self.refs {
            node.core().change_env(env.clone());
        }
    }

    fn crash_random(&self) -> Option<DhtRef> {
        crash_random_of(&self.refs, &self.sampler)
    }

    fn start_maintenance(&self, env: &SimEnv) {
        for node in &self.nodes {
            let node = node.clone();
            let env_task = env.clone();
            let sampler = Rc::clone(&self.sampler);
            let stabilize = self.stabilize.clone();
            env.spawn(async move {
                loop {
                    let period =
                        sampler.normal(stabilize.mean, stabilize.std_dev, stabilize.min);
                    env_task.timeout(period).await;
                    if node.core().is_crashed() {
                        break;
                    }
                    node.stabilize().await;
                }
            });
        }
    }

    fn write_dot(&self, path: &Path) -> io::Result<()> {
        let mut dot = String::from("digraph chord {\n");
        for node in &self.nodes {
            if let Some(succ) = node.successor() {
                dot.push_str(&format!(
                    "  \"{}\" -> \"{}\" [style=bold];\n",
                    node.core().name(),
                    succ.core().name()
                ));
            }
            for finger in node.fingers() {
                if finger.core().name() != node.core().name() {
                    dot.push_str(&format!(
                        "  \"{}\" -> \"{}\" [style=dotted];\n",
                        node.core().name(),
                        finger.core().name()
                    ));
                }
            }
        }
        dot.push_str("}\n");
        std::fs::write(path, dot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dhtsim_core::DataCollector;
    use std::cell::RefCell;

    fn harness() -> (SimEnv, Rc<Sampler>, SharedCollector) {
        (
            SimEnv::new(),
            Rc::new(Sampler::new(42)),
            Rc::new(RefCell::new(DataCollector::new())),
        )
    }

    #[test]
    fn test_kad_manager_hardwires_first_pair() {
        let (env, sampler, collector) = harness();
        let manager = KadNetManager::new(
            env,
            4,
            NodeConfig::default(),
            KadConfig::default(),
            sampler,
            collector,
        );
        assert_eq!(manager.nodes().len(), 4);
        let names: Vec<&str> = manager.nodes().iter().map(|n| n.core().name()).collect();
        assert_eq!(names[0], "node_00000");
        assert_eq!(names[3], "node_00003");
    }

    #[test]
    fn test_chord_manager_builds_two_ring() {
        let (env, sampler, collector) = harness();
        let manager = ChordNetManager::new(
            env,
            2,
            NodeConfig::default(),
            StabilizeConfig::default(),
            sampler,
            collector,
        );
        let succ_of_first = manager.nodes[0].successor();
        assert_eq!(
            succ_of_first.map(|n| n.core().name().to_owned()),
            Some("node_00001".to_owned())
        );
    }

    #[test]
    fn test_crash_random_eventually_exhausts() {
        let (env, sampler, collector) = harness();
        let manager = KadNetManager::new(
            env,
            3,
            NodeConfig::default(),
            KadConfig::default(),
            sampler,
            collector,
        );
        for _ in 0..3 {
            assert!(manager.crash_random().is_some());
        }
        assert!(manager.crash_random().is_none());
    }
}
