//! Metrics sink for a simulation run.
//!
//! One collector per run, injected into every node's queue wrapper and into
//! the workload driver. The driver clears it between the join phase and the
//! steady-state phase so the persisted snapshot only covers steady state.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::time::SimTime;

/// Accumulated counters and samples, serialized once per run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct DataCollector {
    /// Waits that expired before every response arrived.
    pub timed_out_requests: u64,
    /// Completed client operations as `(time, latency, hops)`.
    pub client_requests: Vec<(f64, f64, i64)>,
    /// Per-node queue length samples as `(time, waiting)`.
    pub queue_load: BTreeMap<String, Vec<(f64, usize)>>,
    /// Per-node time spent waiting for the service slot.
    pub queue_waits: BTreeMap<String, Vec<f64>>,
    /// Join completion time per node.
    pub joined_time: BTreeMap<String, f64>,
    /// Crash time per node.
    pub crashed_time: BTreeMap<String, f64>,
    /// Nodes whose bootstrap never completed.
    pub failed_to_join: Vec<String>,
}

impl DataCollector {
    /// Fresh, empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything collected so far.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Count one expired wait.
    pub fn record_timeout(&mut self) {
        self.timed_out_requests += 1;
    }

    /// Record a completed client operation.
    pub fn record_client(&mut self, time: SimTime, latency: f64, hops: i64) {
        self.client_requests.push((time.as_f64(), latency, hops));
    }

    /// Sample a node's queue length.
    pub fn record_load(&mut self, node: &str, time: SimTime, waiting: usize) {
        self.queue_load
            .entry(node.to_owned())
            .or_default()
            .push((time.as_f64(), waiting));
    }

    /// Record how long a packet waited for the service slot.
    pub fn record_wait(&mut self, node: &str, wait: f64) {
        self.queue_waits.entry(node.to_owned()).or_default().push(wait);
    }

    /// Record when a node finished joining.
    pub fn record_join(&mut self, node: &str, time: SimTime) {
        self.joined_time.insert(node.to_owned(), time.as_f64());
    }

    /// Record when a node crashed.
    pub fn record_crash(&mut self, node: &str, time: SimTime) {
        self.crashed_time.insert(node.to_owned(), time.as_f64());
    }

    /// Record a bootstrap that gave up.
    pub fn record_failed_join(&mut self, node: &str) {
        self.failed_to_join.push(node.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clear_resets_everything() {
        let mut collector = DataCollector::new();
        collector.record_timeout();
        collector.record_load("node_00000", SimTime::new(1.0), 3);
        collector.record_wait("node_00000", 0.5);
        collector.record_join("node_00001", SimTime::new(2.0));
        collector.clear();
        assert_eq!(collector.timed_out_requests, 0);
        assert!(collector.queue_load.is_empty());
        assert!(collector.queue_waits.is_empty());
        assert!(collector.joined_time.is_empty());
    }

    #[test]
    fn test_load_samples_keep_order() {
        let mut collector = DataCollector::new();
        collector.record_load("n", SimTime::new(1.0), 0);
        collector.record_load("n", SimTime::new(2.0), 1);
        collector.record_load("n", SimTime::new(3.0), 0);
        assert_eq!(
            collector.queue_load["n"],
            vec![(1.0, 0), (2.0, 1), (3.0, 0)]
        );
    }
}
