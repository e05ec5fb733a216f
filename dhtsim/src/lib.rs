#![forbid(unsafe_code)]
//! dhtsim - Kademlia and Chord over a discrete-event virtual network.
//!
//! Simulates DHT lookup latency, queue contention and timeout rates on top
//! of the `dhtsim-core` substrate. A run has two phases driven by
//! [`sim::Simulator`]: a join phase that bootstraps the population to
//! quiescence, and a steady-state phase with Poisson client arrivals and
//! optional node crashes. Routing is pluggable through the
//! [`node::DhtNode`] contract; [`kad::KadNode`] (XOR metric, k-buckets) and
//! [`chord::ChordNode`] (ring metric, finger tables) are the two variants.
//!
//! # Module structure
//!
//! - [`packet`] - Typed message envelopes and pending-reply handles
//! - [`node`] - Node substrate, transmission primitives, DHT contract
//! - [`kad`] - Kademlia routing
//! - [`chord`] - Chord routing
//! - [`manager`] - Population construction and wiring
//! - [`client`] - Synthetic workload clients
//! - [`sim`] - Two-phase driver and snapshot persistence
//! - [`error`] - Recoverable timeout and configuration errors

pub mod chord;
pub mod client;
pub mod error;
pub mod kad;
pub mod manager;
pub mod node;
pub mod packet;
pub mod sim;

pub use chord::ChordNode;
pub use client::Client;
pub use error::{ConfigError, DhtTimeoutError, SnapshotError};
pub use kad::{KadConfig, KadNode};
pub use manager::{ChordNetManager, KadNetManager, NetManager, StabilizeConfig};
pub use node::{compute_key, DhtNode, DhtRef, Key, NodeConfig, SimNode, Value};
pub use packet::{Packet, PacketBody, Request};
pub use sim::{Simulator, SimulatorConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    use dhtsim_core::{DataCollector, Sampler, SimEnv};

    use crate::kad::xor_distance;
    use crate::node::SharedCollector;

    struct Net {
        env: SimEnv,
        manager: Rc<dyn NetManager>,
        sim: Simulator,
        sampler: Rc<Sampler>,
        collector: SharedCollector,
        config: NodeConfig,
    }

    fn kad_net(seed: u64, nodes: usize) -> Net {
        let env = SimEnv::new();
        let sampler = Rc::new(Sampler::new(seed));
        let collector: SharedCollector = Rc::new(RefCell::new(DataCollector::new()));
        let config = NodeConfig {
            log_world_size: 8,
            ..NodeConfig::default()
        };
        let manager: Rc<dyn NetManager> = Rc::new(KadNetManager::new(
            env.clone(),
            nodes,
            config.clone(),
            KadConfig::default(),
            Rc::clone(&sampler),
            Rc::clone(&collector),
        ));
        let sim = Simulator::new(
            env.clone(),
            Rc::clone(&manager),
            (0..16).map(|i| format!("key_{i}")).collect(),
            config.clone(),
            SimulatorConfig {
                max_time: 50,
                mean_arrival: 1.0,
                ..SimulatorConfig::default()
            },
            Rc::clone(&sampler),
            Rc::clone(&collector),
        );
        Net {
            env,
            manager,
            sim,
            sampler,
            collector,
            config,
        }
    }

    fn chord_net(seed: u64, nodes: usize) -> Net {
        let env = SimEnv::new();
        let sampler = Rc::new(Sampler::new(seed));
        let collector: SharedCollector = Rc::new(RefCell::new(DataCollector::new()));
        let config = NodeConfig {
            log_world_size: 8,
            ..NodeConfig::default()
        };
        let manager: Rc<dyn NetManager> = Rc::new(ChordNetManager::new(
            env.clone(),
            nodes,
            config.clone(),
            StabilizeConfig::default(),
            Rc::clone(&sampler),
            Rc::clone(&collector),
        ));
        let sim = Simulator::new(
            env.clone(),
            Rc::clone(&manager),
            (0..16).map(|i| format!("key_{i}")).collect(),
            config.clone(),
            SimulatorConfig {
                max_time: 50,
                mean_arrival: 1.0,
                ..SimulatorConfig::default()
            },
            Rc::clone(&sampler),
            Rc::clone(&collector),
        );
        Net {
            env,
            manager,
            sim,
            sampler,
            collector,
            config,
        }
    }

    #[test]
    fn test_kad_join_makes_every_node_find_itself() {
        let net = kad_net(42, 10);
        net.sim.simulate_join();
        for node in net.manager.nodes() {
            let own = node.core().id();
            let name = node.core().name().to_owned();
            let lookup = node.clone();
            let outcome = net
                .env
                .spawn(async move { lookup.find_node(own, None).await });
            net.env.run();
            let outcome = outcome.try_take().expect("lookup must complete");
            let closest = outcome.nodes.first().expect("lookup must find nodes");
            assert_eq!(
                xor_distance(closest.core().id(), own),
                0,
                "{name}: closest candidate is not at distance zero"
            );
            assert!(
                outcome.nodes.iter().any(|n| n.core().name() == name),
                "{name} does not appear in its own lookup"
            );
        }
    }

    #[test]
    fn test_chord_join_makes_every_node_find_itself() {
        let net = chord_net(42, 10);
        net.sim.simulate_join();
        for node in net.manager.nodes() {
            let own = node.core().id();
            let name = node.core().name().to_owned();
            let lookup = node.clone();
            let outcome = net
                .env
                .spawn(async move { lookup.find_node(own, None).await });
            net.env.run();
            let outcome = outcome.try_take().expect("lookup must complete");
            assert_eq!(
                outcome.nodes.first().map(|n| n.core().name().to_owned()),
                Some(name),
                "node does not own its own identifier"
            );
            assert_eq!(outcome.hops, 0);
        }
    }

    fn store_then_find(net: &Net) {
        net.sim.simulate_join();
        let writer = Client::new(
            "client_writer".to_owned(),
            net.env.clone(),
            net.config.clone(),
            Rc::clone(&net.sampler),
            Rc::clone(&net.collector),
        );
        let ask_store = net.manager.nodes()[3].clone();
        let stored = net.env.spawn(async move {
            writer
                .store_value(ask_store, "key_1", "v".to_owned())
                .await
        });
        net.env.run();
        assert!(matches!(stored.try_take(), Some(Ok(()))));

        let reader = Client::new(
            "client_reader".to_owned(),
            net.env.clone(),
            net.config.clone(),
            Rc::clone(&net.sampler),
            Rc::clone(&net.collector),
        );
        let ask_find = net.manager.nodes()[7].clone();
        let found = net
            .env
            .spawn(async move { reader.find_value(ask_find, "key_1").await });
        net.env.run();
        match found.try_take() {
            Some(Ok(Some(value))) => assert_eq!(value, "v"),
            other => panic!("stored value not found: {other:?}"),
        }
    }

    #[test]
    fn test_kad_stored_value_is_found_from_another_node() {
        store_then_find(&kad_net(42, 10));
    }

    #[test]
    fn test_chord_stored_value_is_found_from_another_node() {
        store_then_find(&chord_net(42, 10));
    }

    #[test]
    fn test_unreachable_node_times_out_after_exactly_max_timeout() {
        let net = kad_net(42, 10);
        net.sim.simulate_join();
        let victim = net.manager.nodes()[5].clone();
        victim.core().crash();
        let timeouts_before = net.collector.borrow().timed_out_requests;
        let client = Client::new(
            "client_00000".to_owned(),
            net.env.clone(),
            net.config.clone(),
            Rc::clone(&net.sampler),
            Rc::clone(&net.collector),
        );
        let env = net.env.clone();
        let started = net.env.now();
        let outcome = net.env.spawn(async move {
            let result = client.find_value(victim, "key_1").await;
            (result, env.now())
        });
        net.env.run();
        let (result, finished) = outcome.try_take().expect("client must give up");
        assert!(result.is_err(), "lookup against a dead node must time out");
        let elapsed = finished - started;
        let budget = net.config.max_timeout;
        assert!(
            (elapsed - budget).abs() < 1e-9,
            "timed out after {elapsed}, expected exactly {budget}"
        );
        assert_eq!(
            net.collector.borrow().timed_out_requests,
            timeouts_before + 1
        );
    }

    #[test]
    fn test_full_run_is_deterministic() {
        let snapshot = |seed: u64| -> String {
            let net = kad_net(seed, 8);
            net.sim.simulate_join();
            net.collector.borrow_mut().clear();
            net.sim.change_env(SimEnv::new());
            net.sim.simulate();
            let json = serde_json::to_string(&*net.collector.borrow())
                .expect("snapshot serializes");
            json
        };
        assert_eq!(snapshot(42), snapshot(42));
        assert_ne!(snapshot(42), snapshot(7));
    }

    #[test]
    fn test_queue_load_per_node_moves_by_single_steps() {
        let net = kad_net(42, 10);
        net.sim.simulate_join();
        let collector = net.collector.borrow();
        assert!(!collector.queue_load.is_empty());
        for (node, samples) in &collector.queue_load {
            for pair in samples.windows(2) {
                let (_, a) = pair[0];
                let (_, b) = pair[1];
                assert!(
                    b <= a + 1,
                    "{node}: queue length jumped from {a} to {b}"
                );
            }
        }
        // Waits were recorded alongside the load samples.
        assert!(!collector.queue_waits.is_empty());
    }
}
