//! NAT traversal and the responder side of peer queries.
//!
//! A node behind NAT is reached in three steps: the initiator asks every
//! connected seed to relay a signalling request, the seed forwards it to the
//! target together with the initiator's observed address, and both sides
//! punch toward each other before the initiator dials.

use tracing::{debug, trace, warn};

use super::NodeConnectionManager;
use crate::domain::{NodeAddress, NodeConnectionError, NodeId};
use crate::ports::SignallingRequest;
use crate::service::OpContext;

impl NodeConnectionManager {
    /// Punch toward `address` so that `target` can reach us back.
    pub async fn hole_punch_forward(
        &self,
        target: &NodeId,
        address: &NodeAddress,
        ctx: &OpContext,
    ) -> Result<(), NodeConnectionError> {
        self.hole_punch(target, address, ctx).await
    }

    /// Punch toward the initiator of a relayed signalling request.
    pub async fn hole_punch_reverse(
        &self,
        source: &NodeId,
        proxy_address: &NodeAddress,
        ctx: &OpContext,
    ) -> Result<(), NodeConnectionError> {
        self.hole_punch(source, proxy_address, ctx).await
    }

    async fn hole_punch(
        &self,
        node_id: &NodeId,
        address: &NodeAddress,
        ctx: &OpContext,
    ) -> Result<(), NodeConnectionError> {
        let ctx = self
            .op_context(ctx)?
            .child_with_timeout(self.config.hole_punch_timeout_time);
        ctx.run(self.ports.transport.hole_punch(address))
            .await?
            .map_err(|source| NodeConnectionError::Connect {
                node_id: node_id.clone(),
                address: address.clone(),
                source,
            })
    }

    /// Ask every connected seed to relay a signalling request for `target`.
    ///
    /// Best-effort: relay failures are logged and skipped.
    pub(super) async fn send_signalling(&self, target: &NodeId, ctx: &OpContext) {
        let source = self.graph.node_id_own().await;
        for seed in &self.config.seed_nodes {
            if seed.node_id == *target {
                continue;
            }
            let Some(conn) = self.pooled(&seed.node_id) else {
                continue;
            };
            let request = SignallingRequest {
                source: source.clone(),
                target: target.clone(),
                proxy_address: None,
            };
            match ctx
                .run(self.ports.rpc.relay_signalling(conn.as_ref(), request))
                .await
            {
                Ok(Ok(())) => trace!(seed = %seed.node_id, target = %target, "Signalling sent"),
                Ok(Err(e)) => {
                    warn!(seed = %seed.node_id, target = %target, error = %e, "Signalling relay failed")
                }
                Err(_) => return,
            }
        }
    }

    // =========================================================================
    // Responder side
    // =========================================================================

    /// Answer a remote closest-nodes query from the local routing table.
    ///
    /// At most `node_bucket_limit` entries, each with its most recent address.
    pub async fn handle_closest_local_nodes(
        &self,
        target: &NodeId,
    ) -> Result<Vec<(NodeId, NodeAddress)>, NodeConnectionError> {
        self.op_context(&OpContext::new())?;
        let closest = self
            .graph
            .get_closest_nodes(target, self.config.node_bucket_limit)
            .await?;
        Ok(closest
            .into_iter()
            .filter_map(|(node_id, contact)| {
                let address = contact.addresses_by_recency().into_iter().next()?;
                Some((node_id, address))
            })
            .collect())
    }

    /// Forward a signalling request to its target as a relay.
    ///
    /// `requester_address` is the initiator's address as observed on the
    /// incoming connection. Returns `false` when the target is not connected
    /// to this node.
    pub async fn handle_signalling_relay(
        &self,
        request: SignallingRequest,
        requester_address: NodeAddress,
        ctx: &OpContext,
    ) -> Result<bool, NodeConnectionError> {
        let ctx = self.op_context(ctx)?;
        let Some(conn) = self.pooled(&request.target) else {
            debug!(target = %request.target, "Signalling target not connected");
            return Ok(false);
        };
        let forwarded = SignallingRequest {
            proxy_address: Some(requester_address),
            ..request
        };
        let target = forwarded.target.clone();
        ctx.run(self.ports.rpc.relay_signalling(conn.as_ref(), forwarded))
            .await??;
        trace!(target = %target, "Signalling relayed");
        Ok(true)
    }

    /// Punch back toward the initiator of a relayed signalling request.
    ///
    /// Best-effort: a request without proxy address or a failed punch is
    /// logged and ignored.
    pub async fn handle_signalling_request(
        &self,
        request: SignallingRequest,
        ctx: &OpContext,
    ) -> Result<(), NodeConnectionError> {
        let ctx = self.op_context(ctx)?;
        let Some(proxy_address) = request.proxy_address else {
            debug!(source = %request.source, "Signalling request without proxy address");
            return Ok(());
        };
        match self
            .hole_punch_reverse(&request.source, &proxy_address, &ctx)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_interrupted() => Err(e),
            Err(e) => {
                debug!(source = %request.source, error = %e, "Reverse hole punch failed");
                Ok(())
            }
        }
    }
}
