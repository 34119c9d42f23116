//! # Service Layer
//!
//! Stateful components built on the domain rules and the outbound ports,
//! leaves first:
//!
//! - [`NodeGraph`] - routing table over a [`crate::ports::KvStore`]
//! - [`NodeConnectionManager`] - connection pool, lookup engine, NAT traversal
//! - [`NodeManager`] - bucket policy and background maintenance
//!
//! plus the plumbing they share: cancellation contexts, per-key locks,
//! event observers and the keyed task scheduler.

// Shared plumbing
mod context;
mod events;
mod lock_box;
mod scheduler;

// Components
mod connection;
mod node_graph;
mod node_manager;

pub use connection::{ConnectionInfo, ConnectionLease, NetworkPorts, NodeConnectionManager};
pub use context::OpContext;
pub use events::{EventHub, Subscription};
pub use lock_box::{LockBox, LockBoxGuard};
pub use node_graph::{BucketMeta, BucketSort, GraphTransaction, NodeGraph};
pub use node_manager::NodeManager;
pub use scheduler::{Scheduler, TaskKey};

#[cfg(test)]
mod tests;
