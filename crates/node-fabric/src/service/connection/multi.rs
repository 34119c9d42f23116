//! Bounded fan-out of connection attempts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::debug;

use super::NodeConnectionManager;
use crate::domain::{Interrupted, NodeAddress, NodeConnectionError, NodeId};
use crate::service::OpContext;

impl NodeConnectionManager {
    /// Try every `(node, address)` pair, at most `limit` at a time.
    ///
    /// Completes once every node has one successful connection, cancelling
    /// the attempts still running, or once every attempt finished. Returns
    /// the address each connected node answered on.
    pub async fn establish_multi_connection(
        &self,
        node_ids: &[NodeId],
        addresses: &[NodeAddress],
        limit: usize,
        ctx: &OpContext,
    ) -> Result<HashMap<NodeId, NodeAddress>, NodeConnectionError> {
        let ctx = self.op_context(ctx)?;
        let own = self.graph.node_id_own().await;
        let wanted: HashSet<&NodeId> = node_ids.iter().filter(|id| **id != own).collect();
        let mut connected: HashMap<NodeId, NodeAddress> = HashMap::new();
        if wanted.is_empty() || addresses.is_empty() {
            return Ok(connected);
        }

        let fan_out = ctx.child();
        let semaphore = Arc::new(Semaphore::new(limit.max(1)));
        let mut attempts = FuturesUnordered::new();
        for node_id in wanted.iter().copied() {
            for address in addresses {
                let semaphore = Arc::clone(&semaphore);
                let fan_out = fan_out.clone();
                attempts.push(async move {
                    let result = match fan_out.run(semaphore.acquire_owned()).await {
                        Ok(Ok(_permit)) => self
                            .connect_with_addresses(
                                node_id,
                                std::slice::from_ref(address),
                                &fan_out,
                                false,
                            )
                            .await
                            .map(|_| ()),
                        Ok(Err(_)) => Err(Interrupted::Cancelled.into()),
                        Err(interrupted) => Err(interrupted.into()),
                    };
                    (node_id, address, result)
                });
            }
        }

        while let Some((node_id, address, result)) = attempts.next().await {
            match result {
                Ok(()) => {
                    connected
                        .entry(node_id.clone())
                        .or_insert_with(|| address.clone());
                    if connected.len() == wanted.len() {
                        fan_out.cancel();
                        break;
                    }
                }
                Err(e) if e.is_interrupted() => ctx.check()?,
                Err(e) => debug!(node_id = %node_id, address = %address, error = %e, "Attempt failed"),
            }
        }
        debug!(
            requested = wanted.len(),
            connected = connected.len(),
            "Multi-connection finished"
        );
        Ok(connected)
    }
}
