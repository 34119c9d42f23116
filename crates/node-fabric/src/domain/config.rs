//! Tunables of the node fabric.
//!
//! All durations are wall-clock durations driven by the tokio timer, so
//! tests may run them under a paused clock.

use std::time::Duration;

use super::{BackoffPolicy, ConfigError, NodeAddress, NodeId};

/// A bootstrap peer known out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedNode {
    /// Expected node id of the seed.
    pub node_id: NodeId,
    /// Where the seed listens.
    pub address: NodeAddress,
}

/// Configuration of the routing table, connection pool and bucket policy.
///
/// # Notes
///
/// - `max_pending_per_bucket`: bounds the queue of candidates waiting for a
///   full bucket to be garbage collected. Candidates beyond it are dropped.
/// - `backoff_max`: caps the exponential backoff of unreachable peers.
#[derive(Debug, Clone, PartialEq)]
pub struct NodesConfig {
    /// Width of node ids in bits (default: 256)
    pub node_id_bits: usize,
    /// Bucket size `k` (default: 20)
    pub node_bucket_limit: usize,
    /// Lookup seed width `α` (default: 3)
    pub initial_closest_nodes: usize,
    /// Per-address dial timeout (default: 2 s)
    pub conn_connect_time: Duration,
    /// Idle TTL of a pooled connection (default: 60 s)
    pub conn_timeout_time: Duration,
    /// Grace period of a non-forced close (default: 5 s)
    pub conn_shutdown_time: Duration,
    /// Timeout of a liveness ping (default: 2 s)
    pub ping_timeout_time: Duration,
    /// Timeout of one hole-punch attempt (default: 4 s)
    pub hole_punch_timeout_time: Duration,
    /// Backoff after the first failure (default: 60 s)
    pub backoff_base: Duration,
    /// Backoff growth per consecutive failure (default: 2)
    pub backoff_multiplier: u32,
    /// Backoff cap (default: 24 h)
    pub backoff_max: Duration,
    /// Base interval between bucket refreshes (default: 1 h)
    pub refresh_bucket_delay: Duration,
    /// Jitter fraction applied to refresh delays (default: 0.5)
    pub refresh_bucket_delay_spread: f64,
    /// Parallel pings during garbage collection (default: 3)
    pub gc_concurrency: usize,
    /// Pending candidates kept per full bucket, oldest dropped first (default: 20)
    pub max_pending_per_bucket: usize,
    /// Bootstrap peers (default: none)
    pub seed_nodes: Vec<SeedNode>,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            node_id_bits: 256,
            node_bucket_limit: 20,
            initial_closest_nodes: 3,
            conn_connect_time: Duration::from_secs(2),
            conn_timeout_time: Duration::from_secs(60),
            conn_shutdown_time: Duration::from_secs(5),
            ping_timeout_time: Duration::from_secs(2),
            hole_punch_timeout_time: Duration::from_secs(4),
            backoff_base: Duration::from_secs(60),
            backoff_multiplier: 2,
            backoff_max: Duration::from_secs(24 * 60 * 60),
            refresh_bucket_delay: Duration::from_secs(60 * 60),
            refresh_bucket_delay_spread: 0.5,
            gc_concurrency: 3,
            max_pending_per_bucket: 20,
            seed_nodes: Vec::new(),
        }
    }
}

impl NodesConfig {
    /// Create a config suitable for testing (small ids and buckets)
    pub fn for_testing() -> Self {
        Self {
            node_id_bits: 8, // one-byte ids keep bucket arithmetic readable
            node_bucket_limit: 3,
            initial_closest_nodes: 2,
            conn_connect_time: Duration::from_millis(200),
            conn_timeout_time: Duration::from_secs(5),
            conn_shutdown_time: Duration::from_millis(100),
            ping_timeout_time: Duration::from_millis(200),
            hole_punch_timeout_time: Duration::from_millis(400),
            backoff_base: Duration::from_secs(1),
            backoff_multiplier: 2,
            backoff_max: Duration::from_secs(60),
            refresh_bucket_delay: Duration::from_secs(60),
            refresh_bucket_delay_spread: 0.0,
            gc_concurrency: 2,
            max_pending_per_bucket: 3,
            seed_nodes: Vec::new(),
        }
    }

    /// Builder-style replacement of the seed list.
    #[must_use]
    pub fn with_seed_nodes(mut self, seed_nodes: Vec<SeedNode>) -> Self {
        self.seed_nodes = seed_nodes;
        self
    }

    /// Backoff parameters derived from this config.
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.backoff_base,
            multiplier: self.backoff_multiplier,
            max: self.backoff_max,
        }
    }

    /// Reject values the components cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id_bits == 0 || self.node_id_bits % 8 != 0 {
            return Err(ConfigError::Invalid(format!(
                "node_id_bits must be a positive multiple of 8, got {}",
                self.node_id_bits
            )));
        }
        if self.node_id_bits > 0xffff {
            return Err(ConfigError::Invalid(format!(
                "node_id_bits {} does not fit a bucket key",
                self.node_id_bits
            )));
        }
        let positive = [
            ("node_bucket_limit", self.node_bucket_limit),
            ("initial_closest_nodes", self.initial_closest_nodes),
            ("gc_concurrency", self.gc_concurrency),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.conn_connect_time.is_zero() || self.ping_timeout_time.is_zero() {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.backoff_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "backoff_multiplier must be at least 1".into(),
            ));
        }
        if self.backoff_max < self.backoff_base {
            return Err(ConfigError::Invalid(
                "backoff_max must not be below backoff_base".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.refresh_bucket_delay_spread) {
            return Err(ConfigError::Invalid(format!(
                "refresh_bucket_delay_spread must be within [0, 1], got {}",
                self.refresh_bucket_delay_spread
            )));
        }
        if let Some(seed) = self
            .seed_nodes
            .iter()
            .find(|seed| seed.node_id.bits() != self.node_id_bits)
        {
            return Err(ConfigError::Invalid(format!(
                "seed node {} has {} bits, expected {}",
                seed.node_id,
                seed.node_id.bits(),
                self.node_id_bits
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nodes_config_defaults() {
        let config = NodesConfig::default();
        assert_eq!(config.node_id_bits, 256);
        assert_eq!(config.node_bucket_limit, 20);
        assert_eq!(config.initial_closest_nodes, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_for_testing_is_valid() {
        assert!(NodesConfig::for_testing().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_odd_widths() {
        let config = NodesConfig {
            node_id_bits: 12,
            ..NodesConfig::for_testing()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_seed_of_wrong_width() {
        let config = NodesConfig::for_testing().with_seed_nodes(vec![SeedNode {
            node_id: NodeId::new(vec![1, 2]),
            address: NodeAddress::new("127.0.0.1", 1),
        }]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_policy_follows_config() {
        let config = NodesConfig::for_testing();
        let policy = config.backoff_policy();
        assert_eq!(policy.base, config.backoff_base);
        assert_eq!(policy.max, config.backoff_max);
    }
}
