//! Domain Services - Pure functions for Kademlia operations
//!
//! All functions in this module are pure (no I/O, no shared state)
//! apart from the caller-supplied random source.

// Semantic submodules
mod distance;
mod jitter;
mod sorting;

// Re-export public API
pub use distance::{
    bucket_index, bucket_key, parse_bucket_key, random_node_id_in_bucket, xor_distance, Distance,
};
pub use jitter::jittered_delay;
pub use sorting::{closest_to, sort_by_distance, SortOrder};
