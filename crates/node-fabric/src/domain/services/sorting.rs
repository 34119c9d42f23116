//! Node sorting and selection.

use super::distance::xor_distance;
use crate::domain::NodeId;

/// Direction of a sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Smallest first.
    #[default]
    Asc,
    /// Largest first.
    Desc,
}

/// Sort `(id, value)` pairs by XOR distance of the id to `target`.
///
/// Used for closest-node queries and the lookup shortlist.
pub fn sort_by_distance<T>(nodes: &mut [(NodeId, T)], target: &NodeId, order: SortOrder) {
    nodes.sort_by_cached_key(|(id, _)| xor_distance(id, target));
    if order == SortOrder::Desc {
        nodes.reverse();
    }
}

/// Keep the `limit` pairs closest to `target`, closest first.
pub fn closest_to<T>(mut nodes: Vec<(NodeId, T)>, target: &NodeId, limit: usize) -> Vec<(NodeId, T)> {
    sort_by_distance(&mut nodes, target, SortOrder::Asc);
    nodes.truncate(limit);
    nodes
}
