//! Two-phase simulation driver.
//!
//! Phase one (`simulate_join`) bootstraps the whole population on a join
//! environment and runs it to quiescence. The driver then clears the
//! collector, rebinds every node to a fresh environment and runs phase two
//! (`simulate`): Poisson client arrivals, optional crashes and variant
//! maintenance, advanced tick by tick so progress is observable.

use std::cell::RefCell;
use std::fs::File;
use std::path::Path;
use std::rc::Rc;

use tracing::{info, warn};

use dhtsim_core::{Sampler, SimEnv, SimTime};

use crate::client::Client;
use crate::error::SnapshotError;
use crate::manager::NetManager;
use crate::node::{DhtNode, DhtRef, NodeConfig, SharedCollector, SimNode};

/// Workload parameters of a run.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Steady-state duration in whole ticks.
    pub max_time: u64,
    /// Mean inter-arrival time of client requests.
    pub mean_arrival: f64,
    /// Client stores draw values below this bound.
    pub max_value: u64,
    /// Mean time between crashes; `None` disables crashing.
    pub mean_crash: Option<f64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            max_time: 1000,
            mean_arrival: 0.1,
            max_value: 1_000_000_000,
            mean_crash: None,
        }
    }
}

/// Drives the two simulation phases over one node population.
pub struct Simulator {
    env: RefCell<SimEnv>,
    manager: Rc<dyn NetManager>,
    keys: Vec<String>,
    node_config: NodeConfig,
    cfg: SimulatorConfig,
    sampler: Rc<Sampler>,
    collector: SharedCollector,
}

impl Simulator {
    pub fn new(
        env: SimEnv,
        manager: Rc<dyn NetManager>,
        keys: Vec<String>,
        node_config: NodeConfig,
        cfg: SimulatorConfig,
        sampler: Rc<Sampler>,
        collector: SharedCollector,
    ) -> Self {
        Self {
            env: RefCell::new(env),
            manager,
            keys,
            node_config,
            cfg,
            sampler,
            collector,
        }
    }

    pub fn env(&self) -> SimEnv {
        self.env.borrow().clone()
    }

    pub fn manager(&self) -> &Rc<dyn NetManager> {
        &self.manager
    }

    pub fn collector(&self) -> &SharedCollector {
        &self.collector
    }

    /// Join phase: after the two hardwired nodes, every node bootstraps
    /// through a random already-joined member, then routing tables are
    /// refreshed. Runs the join environment to quiescence.
    pub fn simulate_join(&self) {
        let env = self.env();
        let nodes: Vec<DhtRef> = self.manager.nodes().to_vec();
        let sampler = Rc::clone(&self.sampler);
        let collector = Rc::clone(&self.collector);
        env.spawn(async move {
            for i in 2..nodes.len() {
                let to = nodes[sampler.index(i)].clone();
                let node = nodes[i].clone();
                if node.join_network(to).await.is_err() {
                    warn!(node = node.core().name(), "failed to join");
                    collector
                        .borrow_mut()
                        .record_failed_join(node.core().name());
                }
            }
            info!("all nodes joined");
            for node in &nodes {
                node.refresh().await;
            }
            info!("routing tables refreshed");
        });
        env.run();
        info!(t = %env.now(), "join phase quiescent");
    }

    /// Rebind the driver and every node to a fresh environment. The caller
    /// clears the collector around this to separate the phases.
    pub fn change_env(&self, env: SimEnv) {
        *self.env.borrow_mut() = env.clone();
        self.manager.change_env(env);
    }

    /// Steady-state phase, advanced one tick of virtual time at a time.
    pub fn simulate(&self) {
        let env = self.env();
        self.spawn_clients(&env);
        if let Some(mean_crash) = self.cfg.mean_crash {
            self.spawn_crashes(&env, mean_crash);
        }
        self.manager.start_maintenance(&env);
        for tick in 0..self.cfg.max_time {
            env.run_until(SimTime::new((tick + 1) as f64));
        }
        info!(
            t = %env.now(),
            timeouts = self.collector.borrow().timed_out_requests,
            served = self.collector.borrow().client_requests.len(),
            "steady state finished"
        );
    }

    /// Poisson stream of client operations against random nodes and keys.
    fn spawn_clients(&self, env: &SimEnv) {
        let env_task = env.clone();
        let nodes: Vec<DhtRef> = self.manager.nodes().to_vec();
        let keys = self.keys.clone();
        let node_config = self.node_config.clone();
        let sampler = Rc::clone(&self.sampler);
        let collector = Rc::clone(&self.collector);
        let mean_arrival = self.cfg.mean_arrival;
        let max_value = self.cfg.max_value;
        env.spawn(async move {
            let mut serial = 0u64;
            loop {
                env_task.timeout(sampler.exponential(mean_arrival)).await;
                let client = Client::new(
                    format!("client_{serial:05}"),
                    env_task.clone(),
                    node_config.clone(),
                    Rc::clone(&sampler),
                    Rc::clone(&collector),
                );
                let ask_to = nodes[sampler.index(nodes.len())].clone();
                let key = keys[sampler.index(keys.len())].clone();
                if sampler.index(2) == 0 {
                    env_task.spawn(async move {
                        let _ = client.find_value(ask_to, &key).await;
                    });
                } else {
                    let value = sampler.value(max_value).to_string();
                    env_task.spawn(async move {
                        let _ = client.store_value(ask_to, &key, value).await;
                    });
                }
                serial += 1;
            }
        });
    }

    /// Poisson stream of node crashes.
    fn spawn_crashes(&self, env: &SimEnv, mean_crash: f64) {
        let env_task = env.clone();
        let manager = Rc::clone(&self.manager);
        let sampler = Rc::clone(&self.sampler);
        env.spawn(async move {
            loop {
                env_task.timeout(sampler.exponential(mean_crash)).await;
                if manager.crash_random().is_none() {
                    break;
                }
            }
        });
    }

    /// Persist the collector snapshot as JSON, once per run.
    pub fn write_snapshot(&self, path: &Path) -> Result<(), SnapshotError> {
        let file = File::create(path)?;
        serde_json::to_writer(file, &*self.collector.borrow())?;
        info!(path = %path.display(), "metrics snapshot written");
        Ok(())
    }
}
