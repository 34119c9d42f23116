//! # Routing Table
//!
//! Kademlia buckets persisted in a transactional key-value store, with a
//! double-buffered storage space for whole-table remaps.
//!
//! ## Concurrency
//!
//! - Check-then-act sequences on one bucket hold that bucket's lock for the
//!   rest of their transaction ([`NodeGraph::lock_bucket`]).
//! - [`NodeGraph::reset_buckets`] waits for every open
//!   [`GraphTransaction`] before it swaps the space.

mod graph;
mod keys;
mod transaction;

pub use graph::{BucketMeta, BucketSort, NodeGraph};
pub use transaction::GraphTransaction;

#[cfg(test)]
mod tests;
