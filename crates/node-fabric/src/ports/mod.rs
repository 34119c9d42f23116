//! # Ports Layer - Hexagonal Architecture Boundaries
//!
//! - **Driving Ports (Inbound):** APIs this crate exposes to the node
//! - **Driven Ports (Outbound):** SPIs this crate requires from adapters

pub mod inbound;
pub mod outbound;

pub use inbound::NodeDiscoveryApi;
pub use outbound::{
    Claim, ClaimChannel, ClaimMessage, ConfigProvider, HostResolver, KvStore, KvTransaction,
    NodeRpc, PeerConnection, ScanOrder, Sigchain, SignallingRequest, TimeSource, Transport,
};
