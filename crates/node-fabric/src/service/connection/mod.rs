//! Connection pool, iterative lookup and NAT traversal.

mod handle;
mod lookup;
mod manager;
mod multi;
mod nat;

pub use handle::{ConnectionInfo, ConnectionLease};
pub use manager::{NetworkPorts, NodeConnectionManager};

#[cfg(test)]
mod tests;
