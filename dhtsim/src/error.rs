//! Error taxonomy of the DHT layer.
//!
//! Transport-level failure is always recoverable: a timed-out wait surfaces
//! as [`DhtTimeoutError`] and protocol logic decides whether to retry, drop a
//! candidate or fail the client operation. Only contract violations abort the
//! process (see `dhtsim_core::ProtocolViolation`).

use std::io;

use thiserror::Error;

use crate::packet::Packet;

/// A response did not arrive within the node's timeout window.
///
/// Carries whatever replies did arrive, so callers can tell partial failure
/// apart from total silence.
#[derive(Debug, Error)]
#[error("request timed out after {} replies", received.len())]
pub struct DhtTimeoutError {
    /// Replies received before the timeout fired.
    pub received: Vec<Packet>,
}

/// Invalid run parameters, rejected before the simulation starts.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("identifier space must be 1..=64 bits, got {0}")]
    WorldBits(u32),
    #[error("at least two nodes are required, got {0}")]
    NodeCount(usize),
    #[error("at least one key is required")]
    NoKeys,
}

/// Failure while persisting the metrics snapshot.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io: {0}")]
    Io(#[from] io::Error),
    #[error("snapshot encoding: {0}")]
    Encode(#[from] serde_json::Error),
}
