//! Iterative Kademlia lookup, pings and peer backoff.

use std::collections::HashSet;

use tokio::time::Instant;
use tracing::{debug, trace};

use super::NodeConnectionManager;
use crate::domain::{
    sort_by_distance, BackoffEntry, LookupOutcome, NodeAddress, NodeConnectionError, NodeId,
    NodesEvent, SortOrder,
};
use crate::service::OpContext;

impl NodeConnectionManager {
    /// Address of `target`, from the routing table or the network.
    ///
    /// `Ok(None)` when the lookup was exhausted. With `ignore_recent_offline`
    /// peers in backoff are not contacted.
    pub async fn find_node(
        &self,
        target: &NodeId,
        ignore_recent_offline: bool,
        ctx: &OpContext,
    ) -> Result<Option<NodeAddress>, NodeConnectionError> {
        let ctx = self.op_context(ctx)?;
        if let Some(contact) = self.graph.get_node_contact(target).await? {
            if let Some(address) = contact.addresses_by_recency().into_iter().next() {
                return Ok(Some(address));
            }
        }
        Ok(self
            .get_closest_global_nodes(target, ignore_recent_offline, &ctx)
            .await?
            .found)
    }

    /// Walk the network toward `target`, nearest unexplored peer first.
    ///
    /// The shortlist is seeded with the `initial_closest_nodes` closest local
    /// peers; an empty table ends the lookup without any network call. The
    /// walk stops once `node_bucket_limit` peers answered or the target
    /// itself answered a ping.
    pub async fn get_closest_global_nodes(
        &self,
        target: &NodeId,
        ignore_recent_offline: bool,
        ctx: &OpContext,
    ) -> Result<LookupOutcome, NodeConnectionError> {
        let ctx = self.op_context(ctx)?;
        let own = self.graph.node_id_own().await;
        let seeds = self
            .graph
            .get_closest_nodes(target, self.config.initial_closest_nodes)
            .await?;
        if seeds.is_empty() {
            debug!(target = %target, "Lookup skipped, routing table is empty");
            return Ok(LookupOutcome::default());
        }

        // Sorted by descending distance so `pop` yields the nearest candidate.
        let mut shortlist: Vec<(NodeId, Vec<NodeAddress>)> = seeds
            .into_iter()
            .map(|(node_id, contact)| (node_id, contact.addresses_by_recency()))
            .collect();
        sort_by_distance(&mut shortlist, target, SortOrder::Desc);

        let limit = self.config.node_bucket_limit;
        let mut tried: HashSet<NodeId> = HashSet::new();
        let mut contacted = 0usize;
        let mut found = None;

        while contacted < limit {
            ctx.check()?;
            let Some((candidate, addresses)) = shortlist.pop() else {
                break;
            };
            if !tried.insert(candidate.clone()) {
                continue;
            }
            if ignore_recent_offline && self.is_backed_off(&candidate) {
                trace!(node_id = %candidate, "Skipping peer in backoff");
                continue;
            }
            let Some(address) = self
                .ping_node_addresses(&candidate, &addresses, &ctx)
                .await?
            else {
                continue;
            };
            contacted += 1;
            if candidate == *target {
                found = Some(address);
                break;
            }

            let learned = match self
                .query_closest(&candidate, &address, target, &ctx)
                .await
            {
                Ok(learned) => learned,
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => {
                    debug!(node_id = %candidate, error = %e, "Closest-nodes query failed");
                    continue;
                }
            };
            trace!(node_id = %candidate, learned = learned.len(), "Peer answered lookup");
            for (node_id, address) in learned {
                if node_id == own
                    || node_id.bits() != self.graph.node_id_bits()
                    || tried.contains(&node_id)
                {
                    continue;
                }
                match shortlist.iter_mut().find(|(id, _)| *id == node_id) {
                    Some((_, addresses)) => {
                        if !addresses.contains(&address) {
                            addresses.push(address);
                        }
                    }
                    None => shortlist.push((node_id, vec![address])),
                }
            }
            sort_by_distance(&mut shortlist, target, SortOrder::Desc);
        }

        debug!(target = %target, contacted, found = found.is_some(), "Lookup finished");
        if found.is_none() && contacted < limit {
            self.events.emit(NodesEvent::LookupExhausted {
                target: target.clone(),
                contacted,
            });
        }
        Ok(LookupOutcome { found, contacted })
    }

    async fn query_closest(
        &self,
        peer: &NodeId,
        address: &NodeAddress,
        target: &NodeId,
        ctx: &OpContext,
    ) -> Result<Vec<(NodeId, NodeAddress)>, NodeConnectionError> {
        let leased = self
            .connect_with_addresses(peer, std::slice::from_ref(address), ctx, true)
            .await?;
        let lease = self.lease_from(peer, leased)?;
        let conn = lease.connection();
        let result = match ctx
            .run(self.ports.rpc.closest_local_nodes(conn.as_ref(), target))
            .await
        {
            Ok(Ok(nodes)) => Ok(nodes),
            Ok(Err(e)) => Err(NodeConnectionError::from(e)),
            Err(interrupted) => Err(interrupted.into()),
        };
        lease.release(result.as_ref().err()).await;
        result
    }

    // =========================================================================
    // Ping
    // =========================================================================

    /// Whether `target` answers within the ping timeout.
    ///
    /// Unknown nodes are looked up first.
    pub async fn ping_node(
        &self,
        target: &NodeId,
        ctx: &OpContext,
    ) -> Result<bool, NodeConnectionError> {
        let ctx = self.op_context(ctx)?;
        let addresses = match self.graph.get_node_contact(target).await? {
            Some(contact) => contact.addresses_by_recency(),
            None => Vec::new(),
        };
        if addresses.is_empty() {
            let outcome = self.get_closest_global_nodes(target, false, &ctx).await?;
            return Ok(outcome.found.is_some());
        }
        Ok(self
            .ping_node_addresses(target, &addresses, &ctx)
            .await?
            .is_some())
    }

    /// Ping `target` at `addresses`, returning the address that answered.
    ///
    /// While the dial runs, non-seed targets are asked to punch back through
    /// every connected seed and are punched toward; traversal is abandoned
    /// once the dial settles. The outcome updates the target's backoff.
    /// Failures are `Ok(None)`; only interruption of `ctx` and routing table
    /// or lifecycle errors propagate.
    pub async fn ping_node_addresses(
        &self,
        target: &NodeId,
        addresses: &[NodeAddress],
        ctx: &OpContext,
    ) -> Result<Option<NodeAddress>, NodeConnectionError> {
        let ctx = self.op_context(ctx)?;
        if let Some(address) = self.pooled_address(target) {
            self.backoff.lock().record_success(target);
            return Ok(Some(address));
        }

        let attempt = ctx.child_with_timeout(self.config.ping_timeout_time);
        let traversal = attempt.child();
        let punch = async {
            if self.is_seed(target) {
                return;
            }
            self.send_signalling(target, &traversal).await;
            for address in addresses {
                match self.hole_punch_forward(target, address, &traversal).await {
                    Ok(()) => {}
                    Err(e) if e.is_interrupted() => break,
                    Err(e) => {
                        trace!(node_id = %target, address = %address, error = %e, "Hole punch failed")
                    }
                }
            }
        };
        // Traversal is best-effort; the dial keeps the whole ping budget.
        let dial = async {
            let result = self
                .connect_with_addresses(target, addresses, &attempt, false)
                .await;
            traversal.cancel();
            result
        };
        let ((), dialed) = futures::join!(punch, dial);

        match dialed {
            Ok((_, conn)) => {
                if self.backoff.lock().record_success(target) {
                    debug!(node_id = %target, "Backoff cleared");
                }
                Ok(Some(
                    self.pooled_address(target)
                        .unwrap_or_else(|| conn.remote_address()),
                ))
            }
            Err(e) => {
                ctx.check()?;
                if matches!(
                    e,
                    NodeConnectionError::Graph(_) | NodeConnectionError::Lifecycle(_)
                ) {
                    return Err(e);
                }
                let delay = self.backoff.lock().record_failure(target, Instant::now());
                debug!(node_id = %target, error = %e, backoff = ?delay, "Ping failed");
                Ok(None)
            }
        }
    }

    // =========================================================================
    // Backoff
    // =========================================================================

    /// Whether `node_id` is cooling down after failed pings.
    pub fn is_backed_off(&self, node_id: &NodeId) -> bool {
        self.backoff.lock().is_backed_off(node_id, Instant::now())
    }

    /// Backoff state of `node_id`.
    pub fn backoff_entry(&self, node_id: &NodeId) -> Option<BackoffEntry> {
        self.backoff.lock().get(node_id).copied()
    }

    pub(super) fn is_seed(&self, node_id: &NodeId) -> bool {
        self.config
            .seed_nodes
            .iter()
            .any(|seed| seed.node_id == *node_id)
    }
}
