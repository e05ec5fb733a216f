//! Synthetic client issuing lookups and stores against the overlay.
//!
//! A client is an ordinary node without routing state: its requests go to a
//! DHT member of the driver's choosing, and the replies pass through the
//! client's own service queue like any other traffic.

use std::rc::Rc;

use tracing::{debug, warn};

use dhtsim_core::{Sampler, SimEnv};

use crate::error::DhtTimeoutError;
use crate::node::{compute_key, DhtRef, NodeConfig, NodeCore, NodeRef, SharedCollector, SimNode};
use crate::packet::PacketBody;

/// A client of the DHT.
#[derive(Clone)]
pub struct Client {
    core: Rc<NodeCore>,
}

impl Client {
    pub fn new(
        name: String,
        env: SimEnv,
        config: NodeConfig,
        sampler: Rc<Sampler>,
        collector: SharedCollector,
    ) -> Self {
        Self {
            core: Rc::new(NodeCore::new(name, env, config, sampler, collector)),
        }
    }

    /// Look up the value stored under `key`, asking `ask_to`. A completed
    /// operation is recorded with its latency and hop count; an expired one
    /// surfaces the timeout to the caller after logging it.
    pub async fn find_value(
        &self,
        ask_to: DhtRef,
        key: &str,
    ) -> Result<Option<String>, DhtTimeoutError> {
        let core = &self.core;
        let start = core.env().now();
        let key_hash = compute_key(key, core.config().log_world_size);
        debug!(
            t = %start,
            node = core.name(),
            id = core.id(),
            key,
            to = ask_to.core().name(),
            "client lookup"
        );
        let request = core.send_req(
            self.node_ref(),
            ask_to.node_ref(),
            PacketBody::FindValue { key: key_hash },
        );
        match core.wait_resp(request).await {
            Ok(packet) => {
                let (value, hops) = match &packet.body {
                    PacketBody::FindValueReply { value, hops } => (value.clone(), *hops),
                    _ => (None, -1),
                };
                let now = core.env().now();
                core.collector()
                    .borrow_mut()
                    .record_client(now, now - start, hops);
                debug!(
                    t = %now,
                    node = core.name(),
                    key,
                    found = value.is_some(),
                    hops,
                    "client lookup finished"
                );
                Ok(value)
            }
            Err(err) => {
                warn!(
                    t = %core.env().now(),
                    node = core.name(),
                    id = core.id(),
                    key,
                    "client lookup timed out"
                );
                Err(err)
            }
        }
    }

    /// Store `value` under `key`, asking `ask_to`.
    pub async fn store_value(
        &self,
        ask_to: DhtRef,
        key: &str,
        value: String,
    ) -> Result<(), DhtTimeoutError> {
        let core = &self.core;
        let start = core.env().now();
        let key_hash = compute_key(key, core.config().log_world_size);
        debug!(
            t = %start,
            node = core.name(),
            id = core.id(),
            key,
            to = ask_to.core().name(),
            "client store"
        );
        let request = core.send_req(
            self.node_ref(),
            ask_to.node_ref(),
            PacketBody::StoreValue {
                key: key_hash,
                value,
            },
        );
        match core.wait_resp(request).await {
            Ok(packet) => {
                let hops = match &packet.body {
                    PacketBody::StoreValueReply { hops } => *hops,
                    _ => -1,
                };
                let now = core.env().now();
                core.collector()
                    .borrow_mut()
                    .record_client(now, now - start, hops);
                debug!(t = %now, node = core.name(), key, hops, "client store finished");
                Ok(())
            }
            Err(err) => {
                warn!(
                    t = %core.env().now(),
                    node = core.name(),
                    id = core.id(),
                    key,
                    "client store timed out"
                );
                Err(err)
            }
        }
    }
}

impl SimNode for Client {
    fn core(&self) -> &NodeCore {
        &self.core
    }

    fn node_ref(&self) -> NodeRef {
        Rc::new(self.clone())
    }
}
