//! # Adapters
//!
//! Concrete implementations of the outbound ports.
//!
//! - `storage` - in-memory transactional key-value store
//! - `network` - configuration providers, DNS resolution, system clock
//!
//! Transports and remote-call codecs belong to the host node and are not
//! provided here.

pub mod network;
pub mod storage;

pub use network::{StaticConfigProvider, SystemTimeSource};
pub use storage::InMemoryKvStore;

#[cfg(feature = "network")]
pub use network::{TokioHostResolver, TomlConfigProvider};
