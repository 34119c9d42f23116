//! Result types of routing-table and policy operations.

use super::{NodeAddress, NodeId};

/// What `set_node` did with a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetNodeOutcome {
    /// New node stored in a bucket with room.
    Inserted,
    /// Existing node got its address refreshed.
    Updated,
    /// Bucket was full and `force` was set; the oldest node made room.
    Evicted {
        /// The node that was removed.
        evicted: NodeId,
    },
    /// Bucket was full; the candidate waits for garbage collection.
    Pending,
}

/// Outcome of rebuilding the routing table for a new local id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResetReport {
    /// Nodes carried into the new space.
    pub kept: usize,
    /// Nodes dropped because their new bucket was already full.
    pub dropped: usize,
}

/// Outcome of an iterative lookup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LookupOutcome {
    /// Address of the target when it answered a ping.
    pub found: Option<NodeAddress>,
    /// Distinct peers that answered along the way.
    pub contacted: usize,
}
