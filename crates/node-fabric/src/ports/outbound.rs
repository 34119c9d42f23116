//! # Driven Ports (Outbound SPI)
//!
//! These are the interfaces the node fabric **requires** from its host:
//! a transactional key-value store, an authenticated transport, the remote
//! procedure calls peers answer, the sigchain, name resolution, a clock and
//! configuration.

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{
    ClaimError, ConfigError, NodeAddress, NodeId, NodesConfig, RpcError, StoreError, Timestamp,
    TransportError,
};

// ============================================================================
// Storage
// ============================================================================

/// Direction of a prefix scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanOrder {
    /// Ascending key order.
    #[default]
    Forward,
    /// Descending key order.
    Reverse,
}

/// Transactional key-value store.
///
/// Keys are `/`-separated strings so that prefix scans select whole levels.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn KvTransaction>, StoreError>;
}

/// A single ACID transaction.
///
/// Dropping a transaction without calling [`KvTransaction::commit`] rolls it
/// back and releases its locks. Any call after `commit` or `rollback` fails
/// with [`StoreError::TransactionFinished`].
#[async_trait]
pub trait KvTransaction: Send {
    /// Read a key, seeing this transaction's own writes.
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Write a key.
    async fn put(&mut self, key: &str, value: Vec<u8>) -> Result<(), StoreError>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn del(&mut self, key: &str) -> Result<(), StoreError>;

    /// All entries under `prefix`, in key order, at most `limit` of them.
    async fn scan(
        &mut self,
        prefix: &str,
        order: ScanOrder,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Take an exclusive lock on `key` until the transaction ends.
    ///
    /// Locking refreshes the transaction's view of committed data, so a
    /// read-then-write sequence started after `lock` sees every write
    /// committed by earlier holders of the same lock. Re-locking a key the
    /// transaction already holds is a no-op.
    async fn lock(&mut self, key: &str) -> Result<(), StoreError>;

    /// Apply every write atomically.
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard every write.
    async fn rollback(&mut self) -> Result<(), StoreError>;
}

// ============================================================================
// Transport
// ============================================================================

/// An authenticated connection to one peer.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Node id the peer proved during the handshake.
    fn remote_node_id(&self) -> NodeId;

    /// Address the connection was opened to.
    fn remote_address(&self) -> NodeAddress;

    /// Whether the connection has been closed by either side.
    fn is_closed(&self) -> bool;

    /// Close the connection. A non-forced close lets in-flight streams finish.
    async fn close(&self, force: bool);
}

impl fmt::Debug for dyn PeerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConnection")
            .field("node_id", &self.remote_node_id())
            .field("address", &self.remote_address())
            .finish()
    }
}

/// Secure transport.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the pool dials different peers
/// concurrently.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open an authenticated connection to `address`, expecting `node_id`.
    ///
    /// Returns [`TransportError::IdentityMismatch`] when the peer proves a
    /// different identity.
    async fn connect(
        &self,
        node_id: &NodeId,
        address: &NodeAddress,
    ) -> Result<Arc<dyn PeerConnection>, TransportError>;

    /// Emit hole-punch packets toward `address`.
    async fn hole_punch(&self, address: &NodeAddress) -> Result<(), TransportError>;
}

/// Host name resolution.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Every IP address `host` resolves to, in resolver order.
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, TransportError>;
}

// ============================================================================
// Remote procedure calls
// ============================================================================

/// Request to coordinate a hole punch between `source` and `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignallingRequest {
    /// Node that wants to connect.
    pub source: NodeId,
    /// Node that should punch back.
    pub target: NodeId,
    /// Address of `source` as observed by the relay. Filled in by the relay.
    pub proxy_address: Option<NodeAddress>,
}

/// One message of the claim cross-signing exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimMessage {
    /// Initiator's singly signed claim.
    Request(Claim),
    /// Responder's signature over the request, plus its own singly signed claim.
    Response {
        /// The initiator's claim, now signed by both parties.
        doubly_signed: Claim,
        /// Responder's claim awaiting the initiator's signature.
        intermediary: Claim,
    },
    /// The responder's claim counter-signed by the initiator.
    CounterSigned(Claim),
}

impl ClaimMessage {
    /// Short name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Response { .. } => "response",
            Self::CounterSigned(_) => "counter-signed",
        }
    }
}

/// Opaque signed claim produced by the sigchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim(pub Vec<u8>);

/// Duplex stream carrying a claim exchange.
#[async_trait]
pub trait ClaimChannel: Send {
    /// Write one message.
    async fn send(&mut self, message: ClaimMessage) -> Result<(), RpcError>;

    /// Read the next message. `None` when the peer closed its side.
    async fn recv(&mut self) -> Result<Option<ClaimMessage>, RpcError>;

    /// Close the local side.
    async fn close(&mut self) -> Result<(), RpcError>;
}

/// Remote calls issued over a pooled connection.
#[async_trait]
pub trait NodeRpc: Send + Sync {
    /// Ask the peer for its closest known nodes to `target`.
    ///
    /// Responses exclude the responder's own id.
    async fn closest_local_nodes(
        &self,
        conn: &dyn PeerConnection,
        target: &NodeId,
    ) -> Result<Vec<(NodeId, NodeAddress)>, RpcError>;

    /// Ask the peer to relay a hole-punch request. Fire-and-forget.
    async fn relay_signalling(
        &self,
        conn: &dyn PeerConnection,
        request: SignallingRequest,
    ) -> Result<(), RpcError>;

    /// Open a duplex claim stream.
    async fn open_claim_channel(
        &self,
        conn: &dyn PeerConnection,
    ) -> Result<Box<dyn ClaimChannel>, RpcError>;
}

/// Sigchain operations needed by the claim exchange.
#[async_trait]
pub trait Sigchain: Send + Sync {
    /// Singly signed claim linking the local node to `target`.
    async fn create_intermediary_claim(&self, target: &NodeId) -> Result<Claim, ClaimError>;

    /// Check that `claim` carries valid signatures of both nodes.
    async fn verify_doubly_signed(&self, claim: &Claim, peer: &NodeId) -> Result<(), ClaimError>;

    /// Add the local signature to the peer's claim.
    async fn counter_sign(&self, claim: &Claim) -> Result<Claim, ClaimError>;

    /// Append a doubly signed claim to the local sigchain.
    async fn add_claim(&self, claim: Claim) -> Result<(), ClaimError>;
}

// ============================================================================
// Environment
// ============================================================================

/// Abstract interface for time operations.
///
/// Allows injecting mock time for testing.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp.
    fn now(&self) -> Timestamp;
}

/// Abstract interface for configuration loading.
pub trait ConfigProvider: Send + Sync {
    /// Node fabric configuration, validated.
    fn nodes_config(&self) -> Result<NodesConfig, ConfigError>;
}
