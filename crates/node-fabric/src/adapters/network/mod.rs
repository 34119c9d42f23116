//! # Network Adapters
//!
//! ## Adapters Provided
//!
//! - `SystemTimeSource` - wall clock
//! - `StaticConfigProvider` - configuration built in code
//! - `TomlConfigProvider` - configuration file loading (requires "network" feature)
//! - `TokioHostResolver` - DNS resolution through tokio (requires "network" feature)

// Semantic submodules
/// Configuration providers
pub mod config;
/// Host name resolution
#[cfg(feature = "network")]
pub mod resolver;
/// Time source adapters
pub mod time;

// Re-export public API
pub use config::StaticConfigProvider;
pub use time::SystemTimeSource;

#[cfg(feature = "network")]
pub use config::TomlConfigProvider;

#[cfg(feature = "network")]
pub use resolver::TokioHostResolver;

#[cfg(test)]
mod tests;
