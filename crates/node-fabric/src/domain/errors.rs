//! Domain Errors for the Node Fabric
//!
//! Every component has its own error enum so callers can branch on the
//! failure class: lifecycle misuse, capacity, connection failure, interruption.
//! "Node not found" after an exhausted lookup is not an error and is
//! represented as `None` by the lookup operations.

use thiserror::Error;

use super::entities::{NodeAddress, NodeId};

/// A component was used outside of its running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// Component is stopped, starting or stopping.
    #[error("{0} is not running")]
    NotRunning(&'static str),
    /// Component was destroyed and cannot be restarted.
    #[error("{0} is destroyed")]
    Destroyed(&'static str),
}

/// An operation was cut short by its cancellation token or deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    /// The operation's token (or an ancestor token) was cancelled.
    #[error("operation cancelled")]
    Cancelled,
    /// The operation's deadline elapsed.
    #[error("operation timed out")]
    TimedOut,
}

/// Errors from the transactional key-value store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Store is closed.
    #[error("store is closed")]
    Closed,
    /// Transaction was already committed or rolled back.
    #[error("transaction already finished")]
    TransactionFinished,
    /// Stored value failed to decode.
    #[error("corrupt value at {key}: {reason}")]
    Corrupt {
        /// Key holding the value.
        key: String,
        /// Decoder message.
        reason: String,
    },
    /// Backend-specific failure.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Errors from the secure transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Remote refused or did not answer.
    #[error("connection to {address} refused")]
    Refused {
        /// Dialed address.
        address: String,
    },
    /// Remote presented a different node id than expected.
    #[error("peer at {address} presented node id {actual}, expected {expected}")]
    IdentityMismatch {
        /// Dialed address.
        address: String,
        /// Expected node id (hex).
        expected: String,
        /// Presented node id (hex).
        actual: String,
    },
    /// Connection already closed.
    #[error("connection closed: {0}")]
    Closed(String),
    /// Hole punch could not be performed.
    #[error("hole punch to {address} failed: {reason}")]
    HolePunch {
        /// Target address.
        address: String,
        /// Failure description.
        reason: String,
    },
    /// Host name resolution failed.
    #[error("failed to resolve {host}: {reason}")]
    Resolve {
        /// Host name.
        host: String,
        /// Failure description.
        reason: String,
    },
}

/// Errors from remote procedure calls over an established connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RpcError {
    /// The underlying connection failed; the pooled connection must be dropped.
    #[error("connection failed: {0}")]
    Connection(#[from] TransportError),
    /// The remote handler returned an error.
    #[error("remote error: {0}")]
    Remote(String),
    /// The response could not be interpreted.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// A duplex stream ended before the expected message.
    #[error("stream ended unexpectedly")]
    StreamEnded,
}

impl RpcError {
    /// Whether the failure invalidates the connection it ran on.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// Errors from the claim cross-signing exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClaimError {
    /// Peer sent a message out of sequence.
    #[error("unexpected claim message, expected {expected}")]
    UnexpectedMessage {
        /// Message kind that was expected.
        expected: &'static str,
    },
    /// Signature verification failed.
    #[error("claim verification failed: {0}")]
    Verification(String),
    /// Sigchain rejected the claim.
    #[error("sigchain error: {0}")]
    Sigchain(String),
    /// Transport of the exchange failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

/// Errors from the routing table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeGraphError {
    /// Lifecycle misuse.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// Node id equals the local node id.
    #[error("node id refers to the local node")]
    SameNodeId,
    /// Node id has the wrong width.
    #[error("node id has {actual} bits, expected {expected}")]
    InvalidNodeId {
        /// Configured width.
        expected: usize,
        /// Width of the offending id.
        actual: usize,
    },
    /// Bucket index outside `[0, bits)`.
    #[error("bucket index {index} out of range [0, {bits})")]
    BucketIndexOutOfRange {
        /// Offending index.
        index: usize,
        /// Configured id width.
        bits: usize,
    },
    /// Inserting a new node would exceed the bucket limit.
    #[error("bucket {index} is at capacity ({limit})")]
    BucketFull {
        /// Bucket index.
        index: usize,
        /// Configured limit.
        limit: usize,
    },
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the connection pool and lookup engine.
#[derive(Debug, Error)]
pub enum NodeConnectionError {
    /// Lifecycle misuse.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// No address is known or discoverable for the node.
    #[error("no address found for node {0}")]
    AddressNotFound(NodeId),
    /// A single dial attempt failed.
    #[error("failed to connect to {node_id} at {address}: {source}")]
    Connect {
        /// Target node.
        node_id: NodeId,
        /// Dialed address.
        address: NodeAddress,
        /// Transport failure.
        source: TransportError,
    },
    /// A single dial attempt hit its per-attempt timer.
    #[error("connecting to {node_id} at {address} timed out")]
    ConnectTimeout {
        /// Target node.
        node_id: NodeId,
        /// Dialed address.
        address: NodeAddress,
    },
    /// Every address failed.
    #[error("all {} connection attempts failed", .0.len())]
    Aggregate(Vec<NodeConnectionError>),
    /// Cancelled or timed out as a whole.
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
    /// Routing table failure.
    #[error(transparent)]
    Graph(#[from] NodeGraphError),
    /// Remote call failure.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl NodeConnectionError {
    /// Whether the error is a cancellation or deadline signal.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }

    /// Whether the error invalidates a pooled connection.
    pub fn is_connection_failure(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::ConnectTimeout { .. } => true,
            Self::Rpc(e) => e.is_connection_failure(),
            Self::Aggregate(errors) => errors.iter().all(Self::is_connection_failure),
            _ => false,
        }
    }
}

/// Errors from the bucket policy layer.
#[derive(Debug, Error)]
pub enum NodeManagerError {
    /// Lifecycle misuse.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    /// Routing table failure.
    #[error(transparent)]
    Graph(#[from] NodeGraphError),
    /// Connection pool failure.
    #[error(transparent)]
    Connection(#[from] NodeConnectionError),
    /// Claim exchange failure.
    #[error(transparent)]
    Claim(#[from] ClaimError),
    /// Cancelled or timed out.
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

impl NodeManagerError {
    /// Whether the error is a cancellation or deadline signal.
    pub fn is_interrupted(&self) -> bool {
        match self {
            Self::Interrupted(_) => true,
            Self::Connection(e) => e.is_interrupted(),
            _ => false,
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A value is out of its allowed range.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// The config file could not be read.
    #[error("failed to read config file {path}: {reason}")]
    Io {
        /// File path.
        path: String,
        /// I/O message.
        reason: String,
    },
    /// The config file could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_full_message() {
        let err = NodeGraphError::BucketFull { index: 7, limit: 20 };
        assert!(err.to_string().contains("bucket 7"));
        assert!(err.to_string().contains("20"));
    }

    #[test]
    fn test_aggregate_counts_causes() {
        let id = NodeId::new(vec![1u8]);
        let err = NodeConnectionError::Aggregate(vec![
            NodeConnectionError::ConnectTimeout {
                node_id: id.clone(),
                address: NodeAddress::new("10.0.0.1", 1),
            },
            NodeConnectionError::Connect {
                node_id: id,
                address: NodeAddress::new("10.0.0.2", 1),
                source: TransportError::Refused {
                    address: "10.0.0.2:1".into(),
                },
            },
        ]);
        assert!(err.to_string().contains("all 2"));
        assert!(err.is_connection_failure());
        assert!(!err.is_interrupted());
    }

    #[test]
    fn test_interrupted_is_distinguished() {
        let err = NodeConnectionError::from(Interrupted::TimedOut);
        assert!(err.is_interrupted());
        assert!(!err.is_connection_failure());
    }

    #[test]
    fn test_rpc_connection_failure() {
        let err = RpcError::from(TransportError::Closed("reset".into()));
        assert!(err.is_connection_failure());
        assert!(!RpcError::Remote("boom".into()).is_connection_failure());
    }
}
