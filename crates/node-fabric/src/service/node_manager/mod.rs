//! BucketPolicy: insertion, eviction and background upkeep of the routing
//! table.

mod claim;
mod maintenance;
mod manager;

pub use manager::NodeManager;
