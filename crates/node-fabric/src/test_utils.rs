//! Test utilities for the node fabric.
//!
//! In-process doubles of every outbound port, for deterministic tests.
//! Enable with the `test-utils` feature flag.
//!
//! # Example
//!
//! ```rust
//! use node_fabric::test_utils::FixedTimeSource;
//! use node_fabric::TimeSource;
//!
//! let time_source = FixedTimeSource::new(1000);
//! assert_eq!(time_source.now().as_secs(), 1000);
//! time_source.advance(5);
//! assert_eq!(time_source.now().as_secs(), 1005);
//! ```

mod network;
mod sigchain;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub use network::{ClaimBehaviour, MockConnection, MockNetwork};
pub use sigchain::MockSigchain;

use crate::domain::Timestamp;
use crate::ports::outbound::TimeSource;

/// A time source that returns a settable timestamp.
///
/// Clones share the same clock, so a test can advance the time seen by the
/// components it handed a clone to.
#[derive(Debug, Clone)]
pub struct FixedTimeSource {
    timestamp: Arc<AtomicU64>,
}

impl FixedTimeSource {
    /// Create a new fixed time source with the given timestamp (in seconds).
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp: Arc::new(AtomicU64::new(timestamp)),
        }
    }

    /// Get the configured timestamp value.
    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::SeqCst)
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: u64) {
        self.timestamp.fetch_add(secs, Ordering::SeqCst);
    }
}

impl TimeSource for FixedTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(self.timestamp())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_time_source_returns_configured_value() {
        let source = FixedTimeSource::new(1000);
        assert_eq!(source.now().as_secs(), 1000);
    }

    #[test]
    fn test_fixed_time_source_clones_share_clock() {
        let source = FixedTimeSource::new(500);
        let cloned = source.clone();
        cloned.advance(7);
        assert_eq!(source.now().as_secs(), 507);
    }
}
