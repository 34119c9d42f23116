//! The routing table.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use super::keys::{parse_address_key, parse_connected_time_key, Space, SPACES, SPACE_KEY};
use super::transaction::{decode_u64, GraphTransaction};
use crate::domain::{
    bucket_index, bucket_key, closest_to, parse_bucket_key, sort_by_distance, Lifecycle,
    LifecycleState, NodeAddress, NodeContact, NodeContactAddress, NodeContactAddressData,
    NodeGraphError, NodeId, NodesConfig, ResetReport, SortOrder, StoreError,
};
use crate::ports::{KvStore, KvTransaction, ScanOrder};

/// Sort key of [`NodeGraph::get_bucket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BucketSort {
    /// Node id order.
    #[default]
    NodeId,
    /// XOR distance to the local node.
    Distance,
    /// Most recent connected time of the node.
    ConnectedTime,
}

/// Stored metadata of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BucketMeta {
    /// Number of nodes in the bucket.
    pub count: usize,
}

/// Kademlia routing table persisted in a transactional key-value store.
///
/// Bucket `i` holds the nodes whose XOR distance `d` to the local node id
/// satisfies `2^i <= d < 2^(i+1)`, at most `node_bucket_limit` of them.
/// The table lives in one of two storage spaces; [`NodeGraph::reset_buckets`]
/// rebuilds it in the other space and swaps the active marker in the same
/// transaction, so readers see either the old or the new table.
///
/// Every mutation has an `_in` variant that runs inside a caller's
/// [`GraphTransaction`]; the plain variant opens and commits its own.
pub struct NodeGraph {
    store: Arc<dyn KvStore>,
    node_id_bits: usize,
    bucket_limit: usize,
    own: Arc<RwLock<NodeId>>,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for NodeGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeGraph")
            .field("node_id_bits", &self.node_id_bits)
            .field("bucket_limit", &self.bucket_limit)
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

impl NodeGraph {
    /// Create a stopped routing table for `node_id_own`.
    pub fn new(
        store: Arc<dyn KvStore>,
        node_id_own: NodeId,
        config: &NodesConfig,
    ) -> Result<Self, NodeGraphError> {
        if node_id_own.bits() != config.node_id_bits {
            return Err(NodeGraphError::InvalidNodeId {
                expected: config.node_id_bits,
                actual: node_id_own.bits(),
            });
        }
        Ok(Self {
            store,
            node_id_bits: config.node_id_bits,
            bucket_limit: config.node_bucket_limit,
            own: Arc::new(RwLock::new(node_id_own)),
            lifecycle: Lifecycle::new("NodeGraph"),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start serving. `fresh` wipes both storage spaces first.
    pub async fn start(&self, fresh: bool) -> Result<(), NodeGraphError> {
        let transition = self.lifecycle.transition().await;
        transition.ensure_not_destroyed()?;
        if transition.state() == LifecycleState::Running {
            return Ok(());
        }
        transition.set(LifecycleState::Starting);
        if fresh {
            if let Err(e) = self.clear_all().await {
                transition.set(LifecycleState::Stopped);
                return Err(e);
            }
        }
        transition.set(LifecycleState::Running);
        info!(node_id = %self.node_id_own().await, fresh, "NodeGraph started");
        Ok(())
    }

    /// Stop serving. Stored data is kept.
    pub async fn stop(&self) -> Result<(), NodeGraphError> {
        let transition = self.lifecycle.transition().await;
        if transition.state() != LifecycleState::Running {
            return Ok(());
        }
        transition.set(LifecycleState::Stopping);
        transition.set(LifecycleState::Stopped);
        info!("NodeGraph stopped");
        Ok(())
    }

    /// Stop and delete every stored entry. Terminal.
    pub async fn destroy(&self) -> Result<(), NodeGraphError> {
        let transition = self.lifecycle.transition().await;
        if transition.state() == LifecycleState::Destroyed {
            return Ok(());
        }
        transition.set(LifecycleState::Stopping);
        self.clear_all().await?;
        transition.set(LifecycleState::Destroyed);
        info!("NodeGraph destroyed");
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    async fn clear_all(&self) -> Result<(), NodeGraphError> {
        let _own = self.own.write().await;
        let mut tx = self.store.begin().await?;
        for space in SPACES {
            clear_prefix(tx.as_mut(), &space.prefix()).await?;
        }
        tx.del(SPACE_KEY).await?;
        tx.commit().await?;
        Ok(())
    }

    // =========================================================================
    // Identity and transactions
    // =========================================================================

    /// Local node id.
    pub async fn node_id_own(&self) -> NodeId {
        self.own.read().await.clone()
    }

    /// Configured id width.
    pub fn node_id_bits(&self) -> usize {
        self.node_id_bits
    }

    /// Configured bucket capacity.
    pub fn bucket_limit(&self) -> usize {
        self.bucket_limit
    }

    /// Bucket index and storage key of `node_id`.
    pub async fn bucket_index(&self, node_id: &NodeId) -> Result<(usize, String), NodeGraphError> {
        let own = self.own.read().await;
        let index = self.index_for(&own, node_id)?;
        Ok((index, bucket_key(index)))
    }

    /// Bucket index of `node_id` relative to the local id pinned by `tx`.
    pub fn bucket_index_in(
        &self,
        tx: &GraphTransaction,
        node_id: &NodeId,
    ) -> Result<usize, NodeGraphError> {
        self.index_for(tx.node_id_own(), node_id)
    }

    /// Open a transaction pinned to the active space.
    pub async fn transaction(&self) -> Result<GraphTransaction, NodeGraphError> {
        self.lifecycle.ensure_running()?;
        let own = Arc::clone(&self.own).read_owned().await;
        let mut tx = self.store.begin().await?;
        let space = read_space(tx.as_mut()).await?;
        Ok(GraphTransaction::new(tx, space, own))
    }

    /// Serialize check-then-act sequences on bucket `index` for the rest of
    /// the transaction.
    pub async fn lock_bucket(
        &self,
        tx: &mut GraphTransaction,
        index: usize,
    ) -> Result<(), NodeGraphError> {
        self.check_index(index)?;
        let key = tx.space.bucket_count(index);
        tx.tx.lock(&key).await?;
        Ok(())
    }

    fn index_for(&self, own: &NodeId, node_id: &NodeId) -> Result<usize, NodeGraphError> {
        if node_id.bits() != self.node_id_bits {
            return Err(NodeGraphError::InvalidNodeId {
                expected: self.node_id_bits,
                actual: node_id.bits(),
            });
        }
        bucket_index(own, node_id)
    }

    fn check_index(&self, index: usize) -> Result<(), NodeGraphError> {
        if index >= self.node_id_bits {
            return Err(NodeGraphError::BucketIndexOutOfRange {
                index,
                bits: self.node_id_bits,
            });
        }
        Ok(())
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert or update one address of a node.
    ///
    /// Returns `true` when the node was new. Fails with
    /// [`NodeGraphError::BucketFull`] when a new node does not fit; nothing is
    /// written in that case.
    pub async fn set_node_contact_address_data(
        &self,
        node_id: &NodeId,
        address: &NodeAddress,
        data: NodeContactAddressData,
    ) -> Result<bool, NodeGraphError> {
        let mut tx = self.transaction().await?;
        let inserted = self
            .set_node_contact_address_data_in(&mut tx, node_id, address, data)
            .await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// [`NodeGraph::set_node_contact_address_data`] inside `tx`.
    pub async fn set_node_contact_address_data_in(
        &self,
        tx: &mut GraphTransaction,
        node_id: &NodeId,
        address: &NodeAddress,
        data: NodeContactAddressData,
    ) -> Result<bool, NodeGraphError> {
        self.lifecycle.ensure_running()?;
        let index = self.index_for(tx.node_id_own(), node_id)?;
        self.lock_bucket(tx, index).await?;

        let mut contact = read_node(tx, index, node_id).await?;
        let inserted = contact.is_empty();
        if inserted {
            self.reserve_slot(tx, index).await?;
        }
        let address = NodeContactAddress::from(address);
        let key = tx.space.address(index, node_id, address.as_str());
        tx.tx.put(&key, encode_data(&key, &data)?).await?;
        contact.insert(address, data);
        write_connected(tx, index, node_id, Some(contact.connected_time())).await?;

        debug!(node_id = %node_id, bucket = index, inserted, "Node address stored");
        Ok(inserted)
    }

    /// Replace every address of a node with `contact`.
    ///
    /// An empty contact removes the node. Returns `true` when the node was new.
    pub async fn set_node_contact(
        &self,
        node_id: &NodeId,
        contact: &NodeContact,
    ) -> Result<bool, NodeGraphError> {
        let mut tx = self.transaction().await?;
        let inserted = self.set_node_contact_in(&mut tx, node_id, contact).await?;
        tx.commit().await?;
        Ok(inserted)
    }

    /// [`NodeGraph::set_node_contact`] inside `tx`.
    pub async fn set_node_contact_in(
        &self,
        tx: &mut GraphTransaction,
        node_id: &NodeId,
        contact: &NodeContact,
    ) -> Result<bool, NodeGraphError> {
        self.lifecycle.ensure_running()?;
        if contact.is_empty() {
            self.unset_node_contact_in(tx, node_id).await?;
            return Ok(false);
        }
        let index = self.index_for(tx.node_id_own(), node_id)?;
        self.lock_bucket(tx, index).await?;

        let existing = read_node(tx, index, node_id).await?;
        let inserted = existing.is_empty();
        if inserted {
            self.reserve_slot(tx, index).await?;
        }
        for (address, _) in existing.iter().filter(|(a, _)| contact.get(a).is_none()) {
            let key = tx.space.address(index, node_id, address.as_str());
            tx.tx.del(&key).await?;
        }
        for (address, data) in contact.iter() {
            let key = tx.space.address(index, node_id, address.as_str());
            tx.tx.put(&key, encode_data(&key, data)?).await?;
        }
        write_connected(tx, index, node_id, Some(contact.connected_time())).await?;
        Ok(inserted)
    }

    /// Remove one address of a node; the node goes with its last address.
    ///
    /// Returns whether the address was known.
    pub async fn unset_node_contact_address(
        &self,
        node_id: &NodeId,
        address: &NodeAddress,
    ) -> Result<bool, NodeGraphError> {
        let mut tx = self.transaction().await?;
        let removed = self
            .unset_node_contact_address_in(&mut tx, node_id, address)
            .await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// [`NodeGraph::unset_node_contact_address`] inside `tx`.
    pub async fn unset_node_contact_address_in(
        &self,
        tx: &mut GraphTransaction,
        node_id: &NodeId,
        address: &NodeAddress,
    ) -> Result<bool, NodeGraphError> {
        self.lifecycle.ensure_running()?;
        let index = self.index_for(tx.node_id_own(), node_id)?;
        self.lock_bucket(tx, index).await?;

        let mut contact = read_node(tx, index, node_id).await?;
        let address = NodeContactAddress::from(address);
        if contact.remove(&address).is_none() {
            return Ok(false);
        }
        let key = tx.space.address(index, node_id, address.as_str());
        tx.tx.del(&key).await?;
        if contact.is_empty() {
            self.release_slot(tx, index).await?;
            write_connected(tx, index, node_id, None).await?;
        } else {
            write_connected(tx, index, node_id, Some(contact.connected_time())).await?;
        }
        Ok(true)
    }

    /// Remove a node and all its addresses. Returns whether it was known.
    pub async fn unset_node_contact(&self, node_id: &NodeId) -> Result<bool, NodeGraphError> {
        let mut tx = self.transaction().await?;
        let removed = self.unset_node_contact_in(&mut tx, node_id).await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// [`NodeGraph::unset_node_contact`] inside `tx`.
    pub async fn unset_node_contact_in(
        &self,
        tx: &mut GraphTransaction,
        node_id: &NodeId,
    ) -> Result<bool, NodeGraphError> {
        self.lifecycle.ensure_running()?;
        let index = self.index_for(tx.node_id_own(), node_id)?;
        self.lock_bucket(tx, index).await?;

        let contact = read_node(tx, index, node_id).await?;
        if contact.is_empty() {
            return Ok(false);
        }
        for (address, _) in contact.iter() {
            let key = tx.space.address(index, node_id, address.as_str());
            tx.tx.del(&key).await?;
        }
        self.release_slot(tx, index).await?;
        write_connected(tx, index, node_id, None).await?;
        debug!(node_id = %node_id, bucket = index, "Node removed");
        Ok(true)
    }

    async fn reserve_slot(&self, tx: &mut GraphTransaction, index: usize) -> Result<(), NodeGraphError> {
        let key = tx.space.bucket_count(index);
        let count = tx.get_u64(&key).await?;
        if count as usize >= self.bucket_limit {
            debug!(bucket = index, limit = self.bucket_limit, "Bucket full");
            return Err(NodeGraphError::BucketFull {
                index,
                limit: self.bucket_limit,
            });
        }
        tx.put_u64(&key, count + 1).await?;
        Ok(())
    }

    async fn release_slot(&self, tx: &mut GraphTransaction, index: usize) -> Result<(), NodeGraphError> {
        let key = tx.space.bucket_count(index);
        match tx.get_u64(&key).await?.saturating_sub(1) {
            0 => tx.tx.del(&key).await?,
            count => tx.put_u64(&key, count).await?,
        }
        Ok(())
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Every known address of a node.
    pub async fn get_node_contact(
        &self,
        node_id: &NodeId,
    ) -> Result<Option<NodeContact>, NodeGraphError> {
        let mut tx = self.transaction().await?;
        self.get_node_contact_in(&mut tx, node_id).await
    }

    /// [`NodeGraph::get_node_contact`] inside `tx`.
    pub async fn get_node_contact_in(
        &self,
        tx: &mut GraphTransaction,
        node_id: &NodeId,
    ) -> Result<Option<NodeContact>, NodeGraphError> {
        self.lifecycle.ensure_running()?;
        let index = self.index_for(tx.node_id_own(), node_id)?;
        let contact = read_node(tx, index, node_id).await?;
        Ok((!contact.is_empty()).then_some(contact))
    }

    /// Metadata of one address of a node.
    pub async fn get_node_contact_address_data(
        &self,
        node_id: &NodeId,
        address: &NodeAddress,
    ) -> Result<Option<NodeContactAddressData>, NodeGraphError> {
        let contact = self.get_node_contact(node_id).await?;
        Ok(contact.and_then(|c| c.get(&NodeContactAddress::from(address)).cloned()))
    }

    /// Every stored node, bucket by bucket.
    pub async fn get_node_contacts(&self) -> Result<Vec<(NodeId, NodeContact)>, NodeGraphError> {
        Ok(self
            .get_buckets()
            .await?
            .into_iter()
            .flat_map(|(_, bucket)| bucket)
            .collect())
    }

    /// Nodes of bucket `index`, sorted.
    pub async fn get_bucket(
        &self,
        index: usize,
        sort: BucketSort,
        order: SortOrder,
    ) -> Result<Vec<(NodeId, NodeContact)>, NodeGraphError> {
        let mut tx = self.transaction().await?;
        self.get_bucket_in(&mut tx, index, sort, order).await
    }

    /// [`NodeGraph::get_bucket`] inside `tx`.
    pub async fn get_bucket_in(
        &self,
        tx: &mut GraphTransaction,
        index: usize,
        sort: BucketSort,
        order: SortOrder,
    ) -> Result<Vec<(NodeId, NodeContact)>, NodeGraphError> {
        self.lifecycle.ensure_running()?;
        self.check_index(index)?;
        let mut bucket = read_bucket(tx, index).await?;
        match sort {
            BucketSort::NodeId => {
                bucket.sort_by(|a, b| a.0.cmp(&b.0));
                if order == SortOrder::Desc {
                    bucket.reverse();
                }
            }
            BucketSort::Distance => {
                let own = tx.node_id_own().clone();
                sort_by_distance(&mut bucket, &own, order);
            }
            BucketSort::ConnectedTime => {
                bucket.sort_by_key(|(id, contact)| (contact.connected_time(), id.clone()));
                if order == SortOrder::Desc {
                    bucket.reverse();
                }
            }
        }
        Ok(bucket)
    }

    /// Every non-empty bucket, in index order.
    pub async fn get_buckets(
        &self,
    ) -> Result<Vec<(usize, Vec<(NodeId, NodeContact)>)>, NodeGraphError> {
        let mut tx = self.transaction().await?;
        let mut buckets = Vec::new();
        for (index, _) in populated_buckets(&mut tx).await? {
            buckets.push((index, read_bucket(&mut tx, index).await?));
        }
        Ok(buckets)
    }

    /// Stored metadata of bucket `index`.
    pub async fn get_bucket_meta(&self, index: usize) -> Result<BucketMeta, NodeGraphError> {
        let mut tx = self.transaction().await?;
        self.get_bucket_meta_in(&mut tx, index).await
    }

    /// [`NodeGraph::get_bucket_meta`] inside `tx`.
    pub async fn get_bucket_meta_in(
        &self,
        tx: &mut GraphTransaction,
        index: usize,
    ) -> Result<BucketMeta, NodeGraphError> {
        self.lifecycle.ensure_running()?;
        self.check_index(index)?;
        let key = tx.space.bucket_count(index);
        let count = tx.get_u64(&key).await? as usize;
        Ok(BucketMeta { count })
    }

    /// Total number of stored nodes.
    pub async fn nodes_total(&self) -> Result<usize, NodeGraphError> {
        let mut tx = self.transaction().await?;
        Ok(populated_buckets(&mut tx)
            .await?
            .into_iter()
            .map(|(_, count)| count)
            .sum())
    }

    /// Node count of every non-empty bucket, in index order.
    pub async fn get_bucket_counts(&self) -> Result<Vec<(usize, usize)>, NodeGraphError> {
        let mut tx = self.transaction().await?;
        Ok(populated_buckets(&mut tx).await?)
    }

    /// Up to `limit` nodes of bucket `index`, least recently connected first.
    pub async fn get_oldest_node(
        &self,
        index: usize,
        limit: usize,
    ) -> Result<Vec<NodeId>, NodeGraphError> {
        let mut tx = self.transaction().await?;
        self.get_oldest_node_in(&mut tx, index, limit).await
    }

    /// [`NodeGraph::get_oldest_node`] inside `tx`.
    pub async fn get_oldest_node_in(
        &self,
        tx: &mut GraphTransaction,
        index: usize,
        limit: usize,
    ) -> Result<Vec<NodeId>, NodeGraphError> {
        self.lifecycle.ensure_running()?;
        self.check_index(index)?;
        let prefix = tx.space.connected_time_prefix(index);
        let entries = tx.tx.scan(&prefix, ScanOrder::Forward, Some(limit)).await?;
        entries
            .into_iter()
            .map(|(key, _)| {
                parse_connected_time_key(&key).ok_or_else(|| {
                    NodeGraphError::from(corrupt(&key, "malformed connected-time key"))
                })
            })
            .collect()
    }

    /// Most recent connected time of a node.
    pub async fn get_connected_time(&self, node_id: &NodeId) -> Result<Option<u64>, NodeGraphError> {
        let mut tx = self.transaction().await?;
        let index = self.index_for(tx.node_id_own(), node_id)?;
        let key = tx.space.connected_node(index, node_id);
        match tx.tx.get(&key).await? {
            Some(raw) => Ok(Some(decode_u64(&key, &raw)?)),
            None => Ok(None),
        }
    }

    /// Up to `limit` stored nodes ordered by XOR distance to `target`.
    ///
    /// Whole buckets are pulled, starting with the target's own bucket, then
    /// the lower-indexed buckets downwards and the higher-indexed buckets
    /// upwards, until at least `limit` nodes are collected. The union is
    /// sorted and truncated, so no bucket is partially represented before
    /// the final sort. The target itself is included when stored.
    pub async fn get_closest_nodes(
        &self,
        target: &NodeId,
        limit: usize,
    ) -> Result<Vec<(NodeId, NodeContact)>, NodeGraphError> {
        let mut tx = self.transaction().await?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let order: Vec<usize> = match self.index_for(tx.node_id_own(), target) {
            Ok(start) => std::iter::once(start)
                .chain((0..start).rev())
                .chain(start + 1..self.node_id_bits)
                .collect(),
            Err(NodeGraphError::SameNodeId) => (0..self.node_id_bits).collect(),
            Err(e) => return Err(e),
        };
        let populated: BTreeSet<usize> = populated_buckets(&mut tx)
            .await?
            .into_iter()
            .map(|(index, _)| index)
            .collect();

        let mut nodes = Vec::new();
        for index in order {
            if nodes.len() >= limit {
                break;
            }
            if populated.contains(&index) {
                nodes.extend(read_bucket(&mut tx, index).await?);
            }
        }
        Ok(closest_to(nodes, target, limit))
    }

    // =========================================================================
    // Space swap
    // =========================================================================

    /// Rebuild the table for a new local node id.
    ///
    /// Every node is re-bucketed against `node_id_new` into the inactive
    /// space. A node whose new bucket is already full is dropped, as is a
    /// node equal to the new id. The active-space marker flips and the old
    /// space is cleared in the same transaction.
    pub async fn reset_buckets(&self, node_id_new: NodeId) -> Result<ResetReport, NodeGraphError> {
        self.lifecycle.ensure_running()?;
        if node_id_new.bits() != self.node_id_bits {
            return Err(NodeGraphError::InvalidNodeId {
                expected: self.node_id_bits,
                actual: node_id_new.bits(),
            });
        }
        let mut own = self.own.write().await;
        let mut tx = self.store.begin().await?;
        let old = read_space(tx.as_mut()).await?;
        let new = old.other();
        clear_prefix(tx.as_mut(), &new.prefix()).await?;

        let entries = tx
            .scan(&old.buckets_prefix(), ScanOrder::Forward, None)
            .await?;
        let contacts = group_contacts(old, entries)?;

        let mut report = ResetReport::default();
        let mut counts: HashMap<usize, u64> = HashMap::new();
        for (_, node_id, contact) in contacts {
            let index = match bucket_index(&node_id_new, &node_id) {
                Ok(index) => index,
                Err(NodeGraphError::SameNodeId) => {
                    report.dropped += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let count = counts.entry(index).or_default();
            if *count as usize >= self.bucket_limit {
                debug!(node_id = %node_id, bucket = index, "Dropping node, new bucket full");
                report.dropped += 1;
                continue;
            }
            *count += 1;
            for (address, data) in contact.iter() {
                let key = new.address(index, &node_id, address.as_str());
                tx.put(&key, encode_data(&key, data)?).await?;
            }
            let time = contact.connected_time();
            tx.put(&new.connected_node(index, &node_id), time.to_be_bytes().to_vec())
                .await?;
            tx.put(&new.connected_time(index, time, &node_id), Vec::new())
                .await?;
            report.kept += 1;
        }
        for (index, count) in counts {
            tx.put(&new.bucket_count(index), count.to_be_bytes().to_vec())
                .await?;
        }
        tx.put(SPACE_KEY, new.encode()).await?;
        clear_prefix(tx.as_mut(), &old.prefix()).await?;
        tx.commit().await?;

        *own = node_id_new;
        info!(
            node_id = %own.to_hex(),
            kept = report.kept,
            dropped = report.dropped,
            "Buckets reset"
        );
        Ok(report)
    }
}

// =============================================================================
// Storage helpers
// =============================================================================

fn corrupt(key: &str, reason: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt {
        key: key.to_owned(),
        reason: reason.to_string(),
    }
}

fn encode_data(key: &str, data: &NodeContactAddressData) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(data).map_err(|e| corrupt(key, e))
}

async fn read_space(tx: &mut dyn KvTransaction) -> Result<Space, StoreError> {
    let raw = tx.get(SPACE_KEY).await?;
    Space::decode(raw.as_deref()).ok_or_else(|| corrupt(SPACE_KEY, "unknown space marker"))
}

async fn clear_prefix(tx: &mut dyn KvTransaction, prefix: &str) -> Result<(), StoreError> {
    for (key, _) in tx.scan(prefix, ScanOrder::Forward, None).await? {
        tx.del(&key).await?;
    }
    Ok(())
}

/// Group address entries (scanned in key order) into contacts.
fn group_contacts(
    space: Space,
    entries: Vec<(String, Vec<u8>)>,
) -> Result<Vec<(usize, NodeId, NodeContact)>, StoreError> {
    let prefix = space.buckets_prefix();
    let mut contacts: Vec<(usize, NodeId, NodeContact)> = Vec::new();
    for (key, value) in entries {
        let parsed = key
            .strip_prefix(&prefix)
            .and_then(parse_address_key)
            .ok_or_else(|| corrupt(&key, "malformed address key"))?;
        let address: NodeAddress = parsed.address.parse().map_err(|e| corrupt(&key, e))?;
        let data: NodeContactAddressData =
            serde_json::from_slice(&value).map_err(|e| corrupt(&key, e))?;
        let continues_last = contacts
            .last()
            .is_some_and(|(_, id, _)| *id == parsed.node_id);
        if !continues_last {
            contacts.push((parsed.bucket, parsed.node_id, NodeContact::new()));
        }
        if let Some((_, _, contact)) = contacts.last_mut() {
            contact.insert(address.into(), data);
        }
    }
    Ok(contacts)
}

async fn read_node(
    tx: &mut GraphTransaction,
    index: usize,
    node_id: &NodeId,
) -> Result<NodeContact, StoreError> {
    let prefix = tx.space.node_prefix(index, node_id);
    let entries = tx.tx.scan(&prefix, ScanOrder::Forward, None).await?;
    Ok(group_contacts(tx.space, entries)?
        .into_iter()
        .next()
        .map(|(_, _, contact)| contact)
        .unwrap_or_default())
}

async fn read_bucket(
    tx: &mut GraphTransaction,
    index: usize,
) -> Result<Vec<(NodeId, NodeContact)>, StoreError> {
    let prefix = tx.space.bucket_prefix(index);
    let entries = tx.tx.scan(&prefix, ScanOrder::Forward, None).await?;
    Ok(group_contacts(tx.space, entries)?
        .into_iter()
        .map(|(_, id, contact)| (id, contact))
        .collect())
}

/// Non-empty buckets with their counts, in index order.
async fn populated_buckets(tx: &mut GraphTransaction) -> Result<Vec<(usize, usize)>, StoreError> {
    let prefix = tx.space.meta_prefix();
    let entries = tx.tx.scan(&prefix, ScanOrder::Forward, None).await?;
    let mut buckets = Vec::with_capacity(entries.len());
    for (key, value) in entries {
        let index = key
            .strip_prefix(&prefix)
            .and_then(|rest| rest.strip_suffix("/count"))
            .and_then(parse_bucket_key)
            .ok_or_else(|| corrupt(&key, "malformed bucket meta key"))?;
        let count = decode_u64(&key, &value)? as usize;
        if count > 0 {
            buckets.push((index, count));
        }
    }
    Ok(buckets)
}

/// Point the connected-time index of a node at `time`, or drop it.
async fn write_connected(
    tx: &mut GraphTransaction,
    index: usize,
    node_id: &NodeId,
    time: Option<u64>,
) -> Result<(), StoreError> {
    let space = tx.space;
    let node_key = space.connected_node(index, node_id);
    if let Some(raw) = tx.tx.get(&node_key).await? {
        let previous = decode_u64(&node_key, &raw)?;
        tx.tx.del(&space.connected_time(index, previous, node_id)).await?;
    }
    match time {
        Some(time) => {
            tx.put_u64(&node_key, time).await?;
            tx.tx.put(&space.connected_time(index, time, node_id), Vec::new())
                .await?;
        }
        None => tx.tx.del(&node_key).await?,
    }
    Ok(())
}
