use std::time::{SystemTime, UNIX_EPOCH};

use crate::domain::Timestamp;
use crate::ports::TimeSource;

/// Unix-seconds wall clock that stamps connected times in the routing table.
///
/// A clock set before the epoch reads as zero, so contacts stamped then
/// sort as the oldest of their bucket and are evicted first.
///
/// ```rust
/// use node_fabric::adapters::network::SystemTimeSource;
/// use node_fabric::ports::TimeSource;
///
/// assert!(SystemTimeSource.now().as_secs() > 0);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    /// The system clock.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Whole seconds between the Unix epoch and `at`.
    pub fn seconds_at(at: SystemTime) -> u64 {
        at.duration_since(UNIX_EPOCH)
            .map_or(0, |since| since.as_secs())
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::new(Self::seconds_at(SystemTime::now()))
    }
}
