//! Domain layer: pure types and rules of the node fabric.
//!
//! Nothing in here performs I/O. Storage, transport and time are reached
//! through the traits in [`crate::ports`].

pub mod backoff;
pub mod config;
pub mod entities;
pub mod errors;
pub mod events;
pub mod lifecycle;
pub mod outcomes;
pub mod services;

pub use backoff::{BackoffEntry, BackoffPolicy, BackoffTable};
pub use config::{NodesConfig, SeedNode};
pub use entities::{
    AddressMode, AddressParseError, AddressScope, NodeAddress, NodeContact, NodeContactAddress,
    NodeContactAddressData, NodeId, Timestamp,
};
pub use errors::{
    ClaimError, ConfigError, Interrupted, LifecycleError, NodeConnectionError, NodeGraphError,
    NodeManagerError, RpcError, StoreError, TransportError,
};
pub use events::{EventKind, NodesEvent};
pub use lifecycle::{Lifecycle, LifecycleState, Transition};
pub use outcomes::{LookupOutcome, ResetReport, SetNodeOutcome};
pub use services::{
    bucket_index, bucket_key, closest_to, jittered_delay, parse_bucket_key,
    random_node_id_in_bucket, sort_by_distance, xor_distance, Distance, SortOrder,
};
