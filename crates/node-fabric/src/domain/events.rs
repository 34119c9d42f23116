//! Events emitted by the node fabric.

use super::{NodeAddress, NodeId};

/// Something observable happened in the routing table or connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodesEvent {
    /// A connection to a verified peer was established.
    ConnectionEstablished {
        /// Remote node.
        node_id: NodeId,
        /// Address that answered.
        address: NodeAddress,
    },
    /// A pooled connection was torn down.
    ConnectionDestroyed {
        /// Remote node.
        node_id: NodeId,
    },
    /// A new node entered a bucket.
    NodeAdded {
        /// Inserted node.
        node_id: NodeId,
        /// Its bucket.
        bucket: usize,
    },
    /// A known node got a new or refreshed address.
    NodeUpdated {
        /// Updated node.
        node_id: NodeId,
        /// Its bucket.
        bucket: usize,
    },
    /// A node left its bucket.
    NodeRemoved {
        /// Removed node.
        node_id: NodeId,
        /// Its former bucket.
        bucket: usize,
    },
    /// The oldest node of a full bucket was replaced.
    NodeEvicted {
        /// Node that was dropped.
        evicted: NodeId,
        /// Node that took its place.
        replacement: NodeId,
        /// Bucket index.
        bucket: usize,
    },
    /// A candidate was queued for a full bucket.
    NodePending {
        /// Queued node.
        node_id: NodeId,
        /// Full bucket.
        bucket: usize,
    },
    /// An iterative lookup ended without finding its target after
    /// contacting fewer peers than a bucket holds.
    LookupExhausted {
        /// Node that was searched for.
        target: NodeId,
        /// Peers that answered.
        contacted: usize,
    },
    /// The routing table was rebuilt for a new local id.
    BucketsReset {
        /// Nodes carried over.
        kept: usize,
        /// Nodes dropped because their new bucket was full.
        dropped: usize,
    },
}

/// Discriminant of [`NodesEvent`], used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionEstablished,
    ConnectionDestroyed,
    NodeAdded,
    NodeUpdated,
    NodeRemoved,
    NodeEvicted,
    NodePending,
    LookupExhausted,
    BucketsReset,
}

impl NodesEvent {
    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConnectionEstablished { .. } => EventKind::ConnectionEstablished,
            Self::ConnectionDestroyed { .. } => EventKind::ConnectionDestroyed,
            Self::NodeAdded { .. } => EventKind::NodeAdded,
            Self::NodeUpdated { .. } => EventKind::NodeUpdated,
            Self::NodeRemoved { .. } => EventKind::NodeRemoved,
            Self::NodeEvicted { .. } => EventKind::NodeEvicted,
            Self::NodePending { .. } => EventKind::NodePending,
            Self::LookupExhausted { .. } => EventKind::LookupExhausted,
            Self::BucketsReset { .. } => EventKind::BucketsReset,
        }
    }
}
