//! # Bucket Policy
//!
//! Decides what happens to an address learned from anywhere in the node:
//! insert it, refresh it, evict the oldest node for it, or queue it until
//! garbage collection frees a slot.
//!
//! ## Flow
//!
//! ```text
//! set_node ─► bucket lock ─┬─ known / room ──► insert, reset refresh delay
//!                          ├─ full + force ──► evict oldest, insert
//!                          └─ full ──────────► pending queue ─► GC task
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::{
    bucket_index, EventKind, Lifecycle, LifecycleState, NodeAddress, NodeContact,
    NodeContactAddressData, NodeId, NodeManagerError, NodesConfig, NodesEvent, ResetReport,
    SetNodeOutcome,
};
use crate::ports::{NodeDiscoveryApi, Sigchain};
use crate::service::{
    EventHub, NodeConnectionManager, NodeGraph, OpContext, Scheduler, Subscription, TaskKey,
};

const COMPONENT: &str = "NodeManager";

pub(super) type PendingQueues = HashMap<usize, VecDeque<(NodeId, NodeAddress)>>;

/// Routing-table policy on top of the graph and the connection pool.
///
/// # Thread Safety
///
/// Always held in an `Arc`; background tasks keep a weak reference.
pub struct NodeManager {
    pub(super) this: Weak<Self>,
    pub(super) config: NodesConfig,
    pub(super) graph: Arc<NodeGraph>,
    pub(super) connections: Arc<NodeConnectionManager>,
    pub(super) sigchain: Arc<dyn Sigchain>,
    pub(super) events: EventHub,
    pub(super) scheduler: Scheduler,
    pub(super) pending: Mutex<PendingQueues>,
    pub(super) lifecycle: Lifecycle,
    stop: Mutex<CancellationToken>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl std::fmt::Debug for NodeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeManager")
            .field("state", &self.lifecycle.state())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl NodeManager {
    /// Create a stopped manager over `connections` and its routing table.
    pub fn new(connections: Arc<NodeConnectionManager>, sigchain: Arc<dyn Sigchain>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config: connections.config().clone(),
            graph: Arc::clone(connections.graph()),
            events: connections.events().clone(),
            connections,
            sigchain,
            scheduler: Scheduler::new(),
            pending: Mutex::new(HashMap::new()),
            lifecycle: Lifecycle::new(COMPONENT),
            stop: Mutex::new(CancellationToken::new()),
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start background maintenance.
    ///
    /// Addresses of newly established connections are fed into
    /// [`NodeManager::set_node`], exhausted lookups pull the refresh of
    /// sparse buckets forward, and every bucket gets one refresh task.
    pub async fn start(&self) -> Result<(), NodeManagerError> {
        let transition = self.lifecycle.transition().await;
        transition.ensure_not_destroyed()?;
        if transition.state() == LifecycleState::Running {
            return Ok(());
        }
        transition.set(LifecycleState::Starting);
        *self.stop.lock() = CancellationToken::new();

        let learned = {
            let this = self.this.clone();
            self.events
                .subscribe(EventKind::ConnectionEstablished, move |event| {
                    let NodesEvent::ConnectionEstablished { node_id, address } = event else {
                        return;
                    };
                    let (Some(manager), Ok(runtime)) = (this.upgrade(), Handle::try_current())
                    else {
                        return;
                    };
                    let (node_id, address) = (node_id.clone(), address.clone());
                    runtime.spawn(async move {
                        if let Err(e) = manager
                            .set_node(&node_id, &address, false, &OpContext::new())
                            .await
                        {
                            debug!(node_id = %node_id, error = %e, "Learned address not stored");
                        }
                    });
                })
        };
        let sparse = {
            let this = self.this.clone();
            self.events.subscribe(EventKind::LookupExhausted, move |_| {
                let (Some(manager), Ok(runtime)) = (this.upgrade(), Handle::try_current()) else {
                    return;
                };
                runtime.spawn(async move {
                    if let Err(e) = manager.reset_refresh_delays_for_sparse_buckets().await {
                        debug!(error = %e, "Refresh delays not reset");
                    }
                });
            })
        };
        self.subscriptions.lock().extend([learned, sparse]);

        transition.set(LifecycleState::Running);
        let reconciled = self.reconcile_refresh_tasks();
        info!(refresh_tasks = reconciled, "NodeManager started");
        Ok(())
    }

    /// Cancel background tasks and stop reacting to events.
    pub async fn stop(&self) -> Result<(), NodeManagerError> {
        let transition = self.lifecycle.transition().await;
        if transition.state() != LifecycleState::Running {
            return Ok(());
        }
        transition.set(LifecycleState::Stopping);
        self.subscriptions.lock().clear();
        self.stop.lock().cancel();
        self.scheduler.cancel_all();
        transition.set(LifecycleState::Stopped);
        info!("NodeManager stopped");
        Ok(())
    }

    /// Stop for good and forget every pending candidate.
    pub async fn destroy(&self) -> Result<(), NodeManagerError> {
        self.stop().await?;
        let transition = self.lifecycle.transition().await;
        transition.set(LifecycleState::Destroyed);
        self.pending.lock().clear();
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    pub(super) fn op_context(&self, ctx: &OpContext) -> Result<OpContext, NodeManagerError> {
        self.lifecycle.ensure_running()?;
        Ok(ctx.linked_to(&self.stop.lock()))
    }

    pub(super) fn now(&self) -> u64 {
        self.connections.ports().time.now().as_secs()
    }

    /// Background task scheduler, exposed for inspection.
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    // =========================================================================
    // Bucket policy
    // =========================================================================

    /// Record `address` for `node_id`, applying the bucket policy.
    ///
    /// Known nodes and buckets with room take the address directly and push
    /// the bucket's refresh back. A full bucket evicts its least recently
    /// connected node when `force` is set, and otherwise queues the
    /// candidate for garbage collection.
    pub async fn set_node(
        &self,
        node_id: &NodeId,
        address: &NodeAddress,
        force: bool,
        ctx: &OpContext,
    ) -> Result<SetNodeOutcome, NodeManagerError> {
        let ctx = self.op_context(ctx)?;
        ctx.check()?;
        let data = NodeContactAddressData::direct(self.now());

        let mut tx = self.graph.transaction().await?;
        let index = self.graph.bucket_index_in(&tx, node_id)?;
        self.graph.lock_bucket(&mut tx, index).await?;
        let known = self.graph.get_node_contact_in(&mut tx, node_id).await?.is_some();
        let count = self.graph.get_bucket_meta_in(&mut tx, index).await?.count;

        if known || count < self.graph.bucket_limit() {
            self.graph
                .set_node_contact_address_data_in(&mut tx, node_id, address, data)
                .await?;
            tx.commit().await?;
            self.forget_pending(node_id);
            self.update_refresh_bucket_delay(index, self.config.refresh_bucket_delay, false);
            let (outcome, event) = if known {
                (
                    SetNodeOutcome::Updated,
                    NodesEvent::NodeUpdated {
                        node_id: node_id.clone(),
                        bucket: index,
                    },
                )
            } else {
                (
                    SetNodeOutcome::Inserted,
                    NodesEvent::NodeAdded {
                        node_id: node_id.clone(),
                        bucket: index,
                    },
                )
            };
            self.events.emit(event);
            return Ok(outcome);
        }

        if force {
            if let Some(evicted) = self
                .graph
                .get_oldest_node_in(&mut tx, index, 1)
                .await?
                .into_iter()
                .next()
            {
                self.graph.unset_node_contact_in(&mut tx, &evicted).await?;
                self.graph
                    .set_node_contact_address_data_in(&mut tx, node_id, address, data)
                    .await?;
                tx.commit().await?;
                self.forget_pending(node_id);
                self.update_refresh_bucket_delay(index, self.config.refresh_bucket_delay, false);
                debug!(node_id = %node_id, evicted = %evicted, bucket = index, "Oldest node evicted");
                self.events.emit(NodesEvent::NodeEvicted {
                    evicted: evicted.clone(),
                    replacement: node_id.clone(),
                    bucket: index,
                });
                return Ok(SetNodeOutcome::Evicted { evicted });
            }
        }

        tx.rollback().await?;
        self.push_pending(index, node_id.clone(), address.clone());
        self.schedule_garbage_collection(index);
        debug!(node_id = %node_id, bucket = index, "Bucket full, node pending");
        self.events.emit(NodesEvent::NodePending {
            node_id: node_id.clone(),
            bucket: index,
        });
        Ok(SetNodeOutcome::Pending)
    }

    /// Forget a node and any pending entry for it.
    pub async fn unset_node(&self, node_id: &NodeId) -> Result<(), NodeManagerError> {
        self.lifecycle.ensure_running()?;
        self.forget_pending(node_id);
        let (index, _) = self.graph.bucket_index(node_id).await?;
        if self.graph.unset_node_contact(node_id).await? {
            self.events.emit(NodesEvent::NodeRemoved {
                node_id: node_id.clone(),
                bucket: index,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Most recently used address of a node, from the routing table only.
    pub async fn get_node_address(
        &self,
        node_id: &NodeId,
    ) -> Result<Option<NodeAddress>, NodeManagerError> {
        self.lifecycle.ensure_running()?;
        Ok(self
            .graph
            .get_node_contact(node_id)
            .await?
            .and_then(|contact| contact.addresses_by_recency().into_iter().next()))
    }

    /// Up to `limit` known nodes ordered by distance to `target`.
    pub async fn get_closest_nodes(
        &self,
        target: &NodeId,
        limit: usize,
    ) -> Result<Vec<(NodeId, NodeContact)>, NodeManagerError> {
        self.lifecycle.ensure_running()?;
        Ok(self.graph.get_closest_nodes(target, limit).await?)
    }

    /// Locate a node, skipping peers in backoff.
    pub async fn find_node(
        &self,
        node_id: &NodeId,
        ctx: &OpContext,
    ) -> Result<Option<NodeAddress>, NodeManagerError> {
        let ctx = self.op_context(ctx)?;
        Ok(self.connections.find_node(node_id, true, &ctx).await?)
    }

    /// Whether the node answers within the ping timeout.
    pub async fn ping_node(&self, node_id: &NodeId, ctx: &OpContext) -> Result<bool, NodeManagerError> {
        let ctx = self.op_context(ctx)?;
        Ok(self.connections.ping_node(node_id, &ctx).await?)
    }

    // =========================================================================
    // Bootstrap and key renewal
    // =========================================================================

    /// Join the network through the configured seed nodes.
    ///
    /// Connects to every seed, stores the ones that answered, looks up the
    /// local id to fill nearby buckets and then refreshes every bucket
    /// farther out than the closest node found. Returns the number of seeds
    /// that answered.
    pub async fn sync_node_graph(&self, ctx: &OpContext) -> Result<usize, NodeManagerError> {
        let ctx = self.op_context(ctx)?;
        let own = self.graph.node_id_own().await;
        let seeds: Vec<NodeId> = self
            .config
            .seed_nodes
            .iter()
            .map(|seed| seed.node_id.clone())
            .filter(|node_id| *node_id != own)
            .collect();
        if seeds.is_empty() {
            debug!("No seed nodes to sync with");
            return Ok(0);
        }
        let mut addresses: Vec<NodeAddress> = Vec::new();
        for seed in &self.config.seed_nodes {
            if !addresses.contains(&seed.address) {
                addresses.push(seed.address.clone());
            }
        }

        let connected = self
            .connections
            .establish_multi_connection(&seeds, &addresses, self.config.initial_closest_nodes, &ctx)
            .await?;
        for (node_id, address) in &connected {
            self.set_node(node_id, address, true, &ctx).await?;
        }
        if connected.is_empty() {
            info!(seeds = seeds.len(), "No seed node answered");
            return Ok(0);
        }

        let outcome = self
            .connections
            .get_closest_global_nodes(&own, true, &ctx)
            .await?;
        let closest = self
            .graph
            .get_closest_nodes(&own, 1)
            .await?
            .into_iter()
            .next()
            .map(|(node_id, _)| bucket_index(&own, &node_id))
            .transpose()?;
        if let Some(closest) = closest {
            for index in closest + 1..self.graph.node_id_bits() {
                self.update_refresh_bucket_delay(index, Duration::ZERO, false);
            }
        }
        info!(
            seeds = connected.len(),
            contacted = outcome.contacted,
            closest_bucket = ?closest,
            "Node graph synced"
        );
        Ok(connected.len())
    }

    /// Rebuild the routing table after the local node id changed.
    ///
    /// Every pooled connection was authenticated under the old id and is
    /// closed; pending candidates and garbage collections are dropped.
    pub async fn handle_node_id_change(
        &self,
        node_id_new: NodeId,
    ) -> Result<ResetReport, NodeManagerError> {
        self.lifecycle.ensure_running()?;
        for key in self.scheduler.keys() {
            if matches!(key, TaskKey::GarbageCollect(_)) {
                self.scheduler.cancel(key);
            }
        }
        self.pending.lock().clear();
        let report = self.graph.reset_buckets(node_id_new).await?;
        let closed = self.connections.destroy_all().await;
        info!(
            kept = report.kept,
            dropped = report.dropped,
            closed,
            "Node id changed"
        );
        self.events.emit(NodesEvent::BucketsReset {
            kept: report.kept,
            dropped: report.dropped,
        });
        Ok(report)
    }
}

#[async_trait]
impl NodeDiscoveryApi for NodeManager {
    async fn set_node(
        &self,
        node_id: &NodeId,
        address: &NodeAddress,
        force: bool,
        ctx: &OpContext,
    ) -> Result<SetNodeOutcome, NodeManagerError> {
        NodeManager::set_node(self, node_id, address, force, ctx).await
    }

    async fn unset_node(&self, node_id: &NodeId) -> Result<(), NodeManagerError> {
        NodeManager::unset_node(self, node_id).await
    }

    async fn find_node(
        &self,
        node_id: &NodeId,
        ctx: &OpContext,
    ) -> Result<Option<NodeAddress>, NodeManagerError> {
        NodeManager::find_node(self, node_id, ctx).await
    }

    async fn get_closest_nodes(
        &self,
        target: &NodeId,
        limit: usize,
    ) -> Result<Vec<(NodeId, NodeContact)>, NodeManagerError> {
        NodeManager::get_closest_nodes(self, target, limit).await
    }

    async fn ping_node(&self, node_id: &NodeId, ctx: &OpContext) -> Result<bool, NodeManagerError> {
        NodeManager::ping_node(self, node_id, ctx).await
    }

    async fn claim_node(&self, node_id: &NodeId, ctx: &OpContext) -> Result<(), NodeManagerError> {
        NodeManager::claim_node(self, node_id, ctx).await
    }
}
