//! # Driving Ports (Inbound API)
//!
//! The API the node fabric exposes to the rest of the application.

use async_trait::async_trait;

use crate::domain::{NodeAddress, NodeContact, NodeId, NodeManagerError, SetNodeOutcome};
use crate::service::OpContext;

/// Primary API for discovering and tracking peers.
///
/// # Example
///
/// ```rust,ignore
/// use node_fabric::ports::NodeDiscoveryApi;
///
/// async fn locate<T: NodeDiscoveryApi>(api: &T, target: NodeId) {
///     let ctx = OpContext::with_timeout(Duration::from_secs(10));
///     match api.find_node(&target, &ctx).await {
///         Ok(Some(address)) => println!("{target} is at {address}"),
///         Ok(None) => println!("{target} not found"),
///         Err(e) => println!("lookup failed: {e}"),
///     }
/// }
/// ```
#[async_trait]
pub trait NodeDiscoveryApi: Send + Sync {
    /// Record `address` for `node_id`, applying the bucket policy.
    ///
    /// # Returns
    ///
    /// - `Inserted` / `Updated` when the bucket had room or knew the node
    /// - `Evicted` when `force` replaced the oldest node of a full bucket
    /// - `Pending` when the node was queued for garbage collection
    async fn set_node(
        &self,
        node_id: &NodeId,
        address: &NodeAddress,
        force: bool,
        ctx: &OpContext,
    ) -> Result<SetNodeOutcome, NodeManagerError>;

    /// Forget a node entirely.
    async fn unset_node(&self, node_id: &NodeId) -> Result<(), NodeManagerError>;

    /// Locate a node, locally first and then through the network.
    ///
    /// `Ok(None)` means the lookup was exhausted.
    async fn find_node(
        &self,
        node_id: &NodeId,
        ctx: &OpContext,
    ) -> Result<Option<NodeAddress>, NodeManagerError>;

    /// Up to `limit` known nodes ordered by distance to `target`.
    async fn get_closest_nodes(
        &self,
        target: &NodeId,
        limit: usize,
    ) -> Result<Vec<(NodeId, NodeContact)>, NodeManagerError>;

    /// Whether the node answers within the ping timeout.
    async fn ping_node(&self, node_id: &NodeId, ctx: &OpContext) -> Result<bool, NodeManagerError>;

    /// Cross-sign a claim with the node.
    async fn claim_node(&self, node_id: &NodeId, ctx: &OpContext) -> Result<(), NodeManagerError>;
}
