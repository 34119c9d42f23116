//! # Node Fabric
//!
//! Peer discovery and connection management for a secrets-management node.
//!
//! The crate keeps a Kademlia routing table of other nodes in a
//! transactional key-value store, pools authenticated connections to them,
//! runs iterative lookups (with NAT hole punching through seed nodes) and
//! maintains the buckets in the background.
//!
//! ## Components
//!
//! - [`NodeGraph`] - persistent routing table with a two-space swap for
//!   node id changes
//! - [`NodeConnectionManager`] - refcounted connection pool with idle TTL,
//!   single-flight dialing, iterative lookup and exponential backoff
//! - [`NodeManager`] - insertion policy (update, evict, queue), garbage
//!   collection of full buckets, bucket refresh and claim exchange
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture with:
//! - **Domain Layer:** ids, XOR distance, bucket arithmetic, backoff, errors
//! - **Ports Layer:** traits for storage, transport, RPC, sigchain and time
//! - **Service Layer:** the three components and their shared plumbing
//! - **Adapters Layer:** in-memory store, config providers, resolver, clock
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use node_fabric::{
//!     InMemoryKvStore, NodeAddress, NodeContactAddressData, NodeGraph, NodeId, NodesConfig,
//! };
//!
//! let runtime = tokio::runtime::Builder::new_current_thread()
//!     .enable_all()
//!     .build()
//!     .unwrap();
//! runtime.block_on(async {
//!     let config = NodesConfig::for_testing();
//!     let graph = NodeGraph::new(Arc::new(InMemoryKvStore::new()), NodeId::new(vec![0x00]), &config)
//!         .unwrap();
//!     graph.start(true).await.unwrap();
//!
//!     let peer = NodeId::new(vec![0x80]);
//!     let address = NodeAddress::new("10.0.0.1", 1314);
//!     graph
//!         .set_node_contact_address_data(&peer, &address, NodeContactAddressData::direct(1000))
//!         .await
//!         .unwrap();
//!     assert_eq!(graph.bucket_index(&peer).await.unwrap().0, 7);
//!     assert_eq!(graph.nodes_total().await.unwrap(), 1);
//! });
//! ```

// =============================================================================
// CORE MODULES
// =============================================================================

pub mod domain;
pub mod ports;
pub mod service;

/// Adapters for storage, configuration, resolution and time.
pub mod adapters;

/// Test utilities (MockNetwork, MockSigchain, FixedTimeSource)
/// Requires feature: `test-utils`
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

// =============================================================================
// CORE RE-EXPORTS
// =============================================================================

// Domain entities
pub use domain::{
    AddressMode, AddressScope, NodeAddress, NodeContact, NodeContactAddress,
    NodeContactAddressData, NodeId, NodesConfig, SeedNode, Timestamp,
};

// Outcomes and events
pub use domain::{EventKind, LookupOutcome, NodesEvent, ResetReport, SetNodeOutcome};

// Errors
pub use domain::{
    ClaimError, ConfigError, Interrupted, LifecycleError, NodeConnectionError, NodeGraphError,
    NodeManagerError, RpcError, StoreError, TransportError,
};

// Domain services
pub use domain::{bucket_index, random_node_id_in_bucket, xor_distance, Distance};

// Port traits
pub use ports::{
    ConfigProvider, HostResolver, KvStore, KvTransaction, NodeDiscoveryApi, NodeRpc,
    PeerConnection, Sigchain, TimeSource, Transport,
};

// Service
pub use service::{
    ConnectionLease, EventHub, NetworkPorts, NodeConnectionManager, NodeGraph, NodeManager,
    OpContext,
};

// =============================================================================
// ADAPTER RE-EXPORTS
// =============================================================================

pub use adapters::{InMemoryKvStore, StaticConfigProvider, SystemTimeSource};

#[cfg(feature = "network")]
pub use adapters::{TokioHostResolver, TomlConfigProvider};
