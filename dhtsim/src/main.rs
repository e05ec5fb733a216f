//! dhtsim CLI
//!
//! Run a Kademlia or Chord simulation with configurable topology and load.
//!
//! # Example
//!
//! ```bash
//! # 50 Kademlia nodes, 2000 steady-state ticks, fixed seed
//! dhtsim -d kad -n 50 -t 2000 -s 42
//!
//! # Chord with crashes and an overlay dump
//! dhtsim -d chord -n 30 --crash-rate 200 -p
//! ```

use std::path::PathBuf;
use std::rc::Rc;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use dhtsim_core::{DataCollector, Sampler, SimEnv};
use dhtsim::error::ConfigError;
use dhtsim::manager::{ChordNetManager, KadNetManager, NetManager, StabilizeConfig};
use dhtsim::node::NodeConfig;
use dhtsim::sim::{Simulator, SimulatorConfig};
use dhtsim::KadConfig;

const LOG_WORLD_SIZE: u32 = 10;

/// Which routing variant to simulate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Dht {
    Kad,
    Chord,
}

/// Kademlia and Chord simulator
///
/// Single-threaded and reproducible: the same seed always yields the same
/// run.
#[derive(Parser, Debug)]
#[command(name = "dhtsim")]
#[command(version, about, long_about = None)]
struct Args {
    /// Steady-state duration in ticks
    #[arg(short = 't', long, default_value = "1000")]
    max_time: u64,

    /// Number of nodes joining at the beginning
    #[arg(short = 'n', long, default_value = "10")]
    nodes: usize,

    /// Random seed
    #[arg(short = 's', long, default_value = "42")]
    seed: u64,

    /// Log level or filter directive
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// DHT variant to simulate
    #[arg(short = 'd', long, value_enum)]
    dht: Dht,

    /// Mean client inter-arrival time (lower is more load)
    #[arg(short = 'r', long, default_value = "0.1")]
    rate: f64,

    /// Waiting-room size of each node's service queue
    #[arg(short = 'q', long, default_value = "100")]
    capacity: usize,

    /// Number of distinct keys in the workload
    #[arg(long, default_value = "10000")]
    nkeys: usize,

    /// Kademlia lookup parallelism
    #[arg(short = 'a', long, default_value = "3")]
    alpha: usize,

    /// Kademlia bucket size and candidate-set size
    #[arg(short = 'k', long, default_value = "5")]
    k: usize,

    /// Dump the converged overlay as a Graphviz file
    #[arg(short = 'p', long)]
    plot: bool,

    /// Mean time between node crashes; omit to disable crashing
    #[arg(long)]
    crash_rate: Option<f64>,

    /// Metrics snapshot path
    #[arg(short = 'o', long, default_value = "data.json")]
    output: PathBuf,
}

fn validate(args: &Args) -> Result<(), ConfigError> {
    if !(1..=64).contains(&LOG_WORLD_SIZE) {
        return Err(ConfigError::WorldBits(LOG_WORLD_SIZE));
    }
    if args.nodes < 2 {
        return Err(ConfigError::NodeCount(args.nodes));
    }
    if args.nkeys == 0 {
        return Err(ConfigError::NoKeys);
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    if let Err(err) = run(args) {
        eprintln!("dhtsim: {err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    validate(&args)?;

    let sampler = Rc::new(Sampler::new(args.seed));
    let collector = Rc::new(std::cell::RefCell::new(DataCollector::new()));
    let node_config = NodeConfig {
        log_world_size: LOG_WORLD_SIZE,
        queue_capacity: args.capacity,
        ..NodeConfig::default()
    };

    info!(
        dht = ?args.dht,
        nodes = args.nodes,
        max_time = args.max_time,
        seed = args.seed,
        "starting simulation"
    );

    let join_env = SimEnv::new();
    let manager: Rc<dyn NetManager> = match args.dht {
        Dht::Kad => Rc::new(KadNetManager::new(
            join_env.clone(),
            args.nodes,
            node_config.clone(),
            KadConfig {
                alpha: args.alpha,
                k: args.k,
                ..KadConfig::default()
            },
            Rc::clone(&sampler),
            Rc::clone(&collector),
        )),
        Dht::Chord => Rc::new(ChordNetManager::new(
            join_env.clone(),
            args.nodes,
            node_config.clone(),
            StabilizeConfig::default(),
            Rc::clone(&sampler),
            Rc::clone(&collector),
        )),
    };

    let keys: Vec<String> = (0..args.nkeys).map(|i| format!("key_{i}")).collect();
    let simulator = Simulator::new(
        join_env,
        Rc::clone(&manager),
        keys,
        node_config,
        SimulatorConfig {
            max_time: args.max_time,
            mean_arrival: args.rate,
            mean_crash: args.crash_rate,
            ..SimulatorConfig::default()
        },
        sampler,
        Rc::clone(&collector),
    );

    simulator.simulate_join();

    if args.plot {
        let dot = args.output.with_extension("dot");
        manager.write_dot(&dot)?;
        info!(path = %dot.display(), "overlay dumped");
    }

    // Steady state starts from a clean slate on a fresh scheduler.
    collector.borrow_mut().clear();
    simulator.change_env(SimEnv::new());
    simulator.simulate();

    simulator.write_snapshot(&args.output)?;

    let collector = collector.borrow();
    info!(
        timed_out = collector.timed_out_requests,
        served = collector.client_requests.len(),
        crashed = collector.crashed_time.len(),
        "run complete"
    );
    Ok(())
}
