//! Storage adapters.

mod memory;

pub use memory::InMemoryKvStore;
