//! Background maintenance: pending queues, garbage collection and bucket
//! refresh.

use std::collections::HashMap;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::NodeManager;
use crate::domain::{
    jittered_delay, random_node_id_in_bucket, LookupOutcome, NodeAddress, NodeContactAddressData,
    NodeGraphError, NodeId, NodeManagerError, NodesEvent, SortOrder,
};
use crate::service::{BucketSort, OpContext, TaskKey};

impl NodeManager {
    // =========================================================================
    // Pending queues
    // =========================================================================

    /// Candidates waiting for room in bucket `index`, oldest first.
    pub fn pending_nodes(&self, index: usize) -> Vec<NodeId> {
        self.pending
            .lock()
            .get(&index)
            .map(|queue| queue.iter().map(|(node_id, _)| node_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Queue a candidate; a repeated candidate moves to the back with its
    /// new address and the oldest entry is dropped on overflow.
    pub(super) fn push_pending(&self, index: usize, node_id: NodeId, address: NodeAddress) {
        let limit = self.config.max_pending_per_bucket.max(1);
        let mut pending = self.pending.lock();
        let queue = pending.entry(index).or_default();
        queue.retain(|(queued, _)| *queued != node_id);
        queue.push_back((node_id, address));
        while queue.len() > limit {
            if let Some((dropped, _)) = queue.pop_front() {
                trace!(node_id = %dropped, bucket = index, "Pending node dropped");
            }
        }
    }

    pub(super) fn forget_pending(&self, node_id: &NodeId) {
        let mut pending = self.pending.lock();
        for queue in pending.values_mut() {
            queue.retain(|(queued, _)| queued != node_id);
        }
        pending.retain(|_, queue| !queue.is_empty());
    }

    fn take_pending(&self, index: usize) -> Vec<(NodeId, NodeAddress)> {
        self.pending
            .lock()
            .remove(&index)
            .map(Vec::from)
            .unwrap_or_default()
    }

    // =========================================================================
    // Garbage collection
    // =========================================================================

    pub(super) fn schedule_garbage_collection(&self, index: usize) {
        let this = self.this.clone();
        let scheduled = self.scheduler.schedule_if_absent(
            TaskKey::GarbageCollect(index),
            Duration::ZERO,
            move |ctx| async move {
                let Some(manager) = this.upgrade() else {
                    return;
                };
                if let Err(e) = manager.garbage_collect_bucket(index, &ctx).await {
                    if !e.is_interrupted() {
                        warn!(bucket = index, error = %e, "Garbage collection failed");
                    }
                }
            },
        );
        if scheduled {
            trace!(bucket = index, "Garbage collection scheduled");
        }
    }

    /// Make room in bucket `index` for its pending candidates.
    ///
    /// Every member is pinged, `gc_concurrency` at a time. Members that
    /// answer are refreshed; silent members are removed, but no more of them
    /// than there are candidates. Candidates then fill the free slots in
    /// queue order and the rest are discarded.
    pub async fn garbage_collect_bucket(
        &self,
        index: usize,
        ctx: &OpContext,
    ) -> Result<(), NodeManagerError> {
        let ctx = self.op_context(ctx)?;
        let candidates = self.take_pending(index);
        if candidates.is_empty() {
            return Ok(());
        }
        let members = self
            .graph
            .get_bucket(index, BucketSort::ConnectedTime, SortOrder::Asc)
            .await?;
        let free = self.graph.bucket_limit().saturating_sub(members.len());
        let rank: HashMap<NodeId, usize> = members
            .iter()
            .enumerate()
            .map(|(position, (node_id, _))| (node_id.clone(), position))
            .collect();

        let ctx_ref = &ctx;
        let pings: Vec<_> = stream::iter(members)
            .map(|(node_id, contact)| async move {
                let addresses = contact.addresses_by_recency();
                let result = self
                    .connections
                    .ping_node_addresses(&node_id, &addresses, ctx_ref)
                    .await;
                (node_id, result)
            })
            .buffer_unordered(self.config.gc_concurrency.max(1))
            .collect()
            .await;

        let mut silent = Vec::new();
        for (node_id, result) in pings {
            match result? {
                Some(address) => {
                    let data = NodeContactAddressData::direct(self.now());
                    match self
                        .graph
                        .set_node_contact_address_data(&node_id, &address, data)
                        .await
                    {
                        Ok(_) | Err(NodeGraphError::BucketFull { .. }) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
                None => silent.push(node_id),
            }
        }

        // Pings finish in any order; evict the least recently connected first.
        silent.sort_by_key(|node_id| rank.get(node_id).copied().unwrap_or(usize::MAX));
        let removals = candidates.len().saturating_sub(free);
        let mut removed = 0usize;
        for node_id in silent.into_iter().take(removals) {
            if self.graph.unset_node_contact(&node_id).await? {
                removed += 1;
                debug!(node_id = %node_id, bucket = index, "Unresponsive node removed");
                self.events.emit(NodesEvent::NodeRemoved {
                    node_id,
                    bucket: index,
                });
            }
        }

        let data = NodeContactAddressData::direct(self.now());
        let mut tx = self.graph.transaction().await?;
        self.graph.lock_bucket(&mut tx, index).await?;
        let mut stored = Vec::new();
        let mut discarded = 0usize;
        for (node_id, address) in candidates {
            if !matches!(self.graph.bucket_index_in(&tx, &node_id), Ok(i) if i == index) {
                discarded += 1;
                continue;
            }
            match self
                .graph
                .set_node_contact_address_data_in(&mut tx, &node_id, &address, data.clone())
                .await
            {
                Ok(inserted) => stored.push((node_id, inserted)),
                Err(NodeGraphError::BucketFull { .. }) => discarded += 1,
                Err(e) => return Err(e.into()),
            }
        }
        tx.commit().await?;

        debug!(
            bucket = index,
            removed,
            stored = stored.len(),
            discarded,
            "Bucket garbage collected"
        );
        if !stored.is_empty() {
            self.update_refresh_bucket_delay(index, self.config.refresh_bucket_delay, false);
        }
        for (node_id, inserted) in stored {
            self.events.emit(if inserted {
                NodesEvent::NodeAdded {
                    node_id,
                    bucket: index,
                }
            } else {
                NodesEvent::NodeUpdated {
                    node_id,
                    bucket: index,
                }
            });
        }
        Ok(())
    }

    // =========================================================================
    // Refresh
    // =========================================================================

    /// Look up a random id of bucket `index`.
    ///
    /// Peers met along the way refresh the table even though the random id
    /// itself is almost never found. Peers in backoff are skipped.
    pub async fn refresh_bucket(
        &self,
        index: usize,
        ctx: &OpContext,
    ) -> Result<LookupOutcome, NodeManagerError> {
        let ctx = self.op_context(ctx)?;
        let own = self.graph.node_id_own().await;
        let target = random_node_id_in_bucket(&own, index, &mut rand::thread_rng())?;
        trace!(bucket = index, target = %target, "Refreshing bucket");
        Ok(self
            .connections
            .get_closest_global_nodes(&target, true, &ctx)
            .await?)
    }

    fn refresh_delay(&self, base: Duration) -> Duration {
        jittered_delay(
            base,
            self.config.refresh_bucket_delay_spread,
            &mut rand::thread_rng(),
        )
    }

    /// Refresh bucket `index` after `delay`, then again every jittered
    /// `refresh_bucket_delay` while the manager runs.
    pub(super) fn schedule_refresh(&self, index: usize, delay: Duration) {
        let this = self.this.clone();
        self.scheduler
            .schedule(TaskKey::RefreshBucket(index), delay, move |ctx| async move {
                let Some(manager) = this.upgrade() else {
                    return;
                };
                match manager.refresh_bucket(index, &ctx).await {
                    Ok(outcome) => {
                        trace!(bucket = index, contacted = outcome.contacted, "Bucket refreshed")
                    }
                    Err(e) if e.is_interrupted() => {}
                    Err(e) => warn!(bucket = index, error = %e, "Bucket refresh failed"),
                }
                if manager.lifecycle.is_running() && !ctx.is_cancelled() {
                    let next = manager.refresh_delay(manager.config.refresh_bucket_delay);
                    manager.schedule_refresh(index, next);
                }
            });
    }

    /// Move the refresh of bucket `index` to a jittered `delay` from now.
    ///
    /// With `lazy` an already scheduled refresh keeps its deadline and only a
    /// missing one is created. A refresh that is running reschedules itself.
    pub fn update_refresh_bucket_delay(&self, index: usize, delay: Duration, lazy: bool) {
        if !self.lifecycle.is_running() || index >= self.graph.node_id_bits() {
            return;
        }
        let key = TaskKey::RefreshBucket(index);
        if self.scheduler.is_running(key) {
            return;
        }
        let delay = self.refresh_delay(delay);
        if self.scheduler.is_scheduled(key) {
            if !lazy {
                self.scheduler.reschedule(key, delay);
            }
            return;
        }
        self.schedule_refresh(index, delay);
    }

    /// Restart the refresh countdown of every bucket holding fewer nodes
    /// than its capacity, never pushing a refresh later than it was.
    /// Returns the number of sparse buckets.
    pub async fn reset_refresh_delays_for_sparse_buckets(&self) -> Result<usize, NodeManagerError> {
        self.lifecycle.ensure_running()?;
        let counts: HashMap<usize, usize> =
            self.graph.get_bucket_counts().await?.into_iter().collect();
        let limit = self.graph.bucket_limit();
        let mut reset = 0usize;
        for index in 0..self.graph.node_id_bits() {
            if counts.get(&index).copied().unwrap_or(0) < limit {
                self.pull_refresh_forward(index, self.config.refresh_bucket_delay);
                reset += 1;
            }
        }
        debug!(buckets = reset, "Refresh delays reset for sparse buckets");
        Ok(reset)
    }

    /// Bring the refresh of bucket `index` to at most a jittered `delay`
    /// from now. A refresh already due sooner keeps its deadline.
    fn pull_refresh_forward(&self, index: usize, delay: Duration) {
        let key = TaskKey::RefreshBucket(index);
        if self.scheduler.is_running(key) {
            return;
        }
        let delay = self.refresh_delay(delay);
        match self.scheduler.deadline(key) {
            Some(deadline) if deadline <= Instant::now() + delay => {}
            Some(_) => {
                self.scheduler.reschedule(key, delay);
            }
            None => self.schedule_refresh(index, delay),
        }
    }

    /// Ensure every bucket has exactly one refresh task.
    pub(super) fn reconcile_refresh_tasks(&self) -> usize {
        let mut created = 0usize;
        for index in 0..self.graph.node_id_bits() {
            let key = TaskKey::RefreshBucket(index);
            if self.scheduler.is_scheduled(key) || self.scheduler.is_running(key) {
                continue;
            }
            let delay = self.refresh_delay(self.config.refresh_bucket_delay);
            self.schedule_refresh(index, delay);
            created += 1;
        }
        created
    }
}
