use crate::domain::{ConfigError, NodesConfig, SeedNode};
use crate::ports::ConfigProvider;

// ============================================================================
// StaticConfigProvider - Config built in code
// ============================================================================

/// Configuration provider over a value built in code.
///
/// Useful for embedding and tests. For deployments, use `TomlConfigProvider`.
#[derive(Debug, Clone, Default)]
pub struct StaticConfigProvider {
    config: NodesConfig,
}

impl StaticConfigProvider {
    /// Provider of the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn with_config(mut self, config: NodesConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the seed nodes.
    #[must_use]
    pub fn with_seed_nodes(mut self, seed_nodes: Vec<SeedNode>) -> Self {
        self.config.seed_nodes = seed_nodes;
        self
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn nodes_config(&self) -> Result<NodesConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config.clone())
    }
}

// ============================================================================
// TomlConfigProvider - Config file loading (requires "network" feature)
// ============================================================================

#[cfg(feature = "network")]
mod toml_config {
    use std::fs;
    use std::path::Path;
    use std::time::Duration;

    use serde::Deserialize;

    use super::*;
    use crate::domain::{NodeAddress, NodeId};

    /// Configuration file structure.
    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct ConfigFile {
        #[serde(default)]
        nodes: NodesSection,
        #[serde(default)]
        seed_nodes: Vec<SeedEntry>,
    }

    #[derive(Debug, Deserialize, Default)]
    #[serde(deny_unknown_fields)]
    struct NodesSection {
        node_id_bits: Option<usize>,
        node_bucket_limit: Option<usize>,
        initial_closest_nodes: Option<usize>,
        conn_connect_time_ms: Option<u64>,
        conn_timeout_time_ms: Option<u64>,
        conn_shutdown_time_ms: Option<u64>,
        ping_timeout_time_ms: Option<u64>,
        hole_punch_timeout_time_ms: Option<u64>,
        backoff_base_secs: Option<u64>,
        backoff_multiplier: Option<u32>,
        backoff_max_secs: Option<u64>,
        refresh_bucket_delay_secs: Option<u64>,
        refresh_bucket_delay_spread: Option<f64>,
        gc_concurrency: Option<usize>,
        max_pending_per_bucket: Option<usize>,
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct SeedEntry {
        node_id: String,
        address: String,
    }

    /// TOML-based configuration provider.
    ///
    /// Missing keys keep their defaults.
    ///
    /// # Config File Format
    ///
    /// ```toml
    /// [nodes]
    /// node_bucket_limit = 20
    /// initial_closest_nodes = 3
    /// conn_connect_time_ms = 2000
    /// ping_timeout_time_ms = 2000
    /// backoff_base_secs = 60
    /// refresh_bucket_delay_secs = 3600
    ///
    /// [[seed_nodes]]
    /// node_id = "9f2c...e1"
    /// address = "seed.example.net:1314"
    /// ```
    #[derive(Debug, Clone)]
    pub struct TomlConfigProvider {
        config: NodesConfig,
    }

    impl TomlConfigProvider {
        /// Load configuration from a TOML file.
        ///
        /// # Errors
        ///
        /// Returns error if the file cannot be read, parsed or validated.
        pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
            let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
                path: path.as_ref().display().to_string(),
                reason: e.to_string(),
            })?;

            Self::parse(&content)
        }

        /// Parse configuration from a TOML string.
        pub fn parse(content: &str) -> Result<Self, ConfigError> {
            let file: ConfigFile =
                toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;

            let mut config = NodesConfig::default();
            let section = file.nodes;
            macro_rules! apply {
                ($($field:ident),* $(,)?) => {
                    $(if let Some(value) = section.$field {
                        config.$field = value;
                    })*
                };
            }
            apply!(
                node_id_bits,
                node_bucket_limit,
                initial_closest_nodes,
                backoff_multiplier,
                refresh_bucket_delay_spread,
                gc_concurrency,
                max_pending_per_bucket,
            );
            let millis = |value: Option<u64>, default: Duration| {
                value.map_or(default, Duration::from_millis)
            };
            let secs = |value: Option<u64>, default: Duration| {
                value.map_or(default, Duration::from_secs)
            };
            config.conn_connect_time = millis(section.conn_connect_time_ms, config.conn_connect_time);
            config.conn_timeout_time = millis(section.conn_timeout_time_ms, config.conn_timeout_time);
            config.conn_shutdown_time =
                millis(section.conn_shutdown_time_ms, config.conn_shutdown_time);
            config.ping_timeout_time = millis(section.ping_timeout_time_ms, config.ping_timeout_time);
            config.hole_punch_timeout_time =
                millis(section.hole_punch_timeout_time_ms, config.hole_punch_timeout_time);
            config.backoff_base = secs(section.backoff_base_secs, config.backoff_base);
            config.backoff_max = secs(section.backoff_max_secs, config.backoff_max);
            config.refresh_bucket_delay =
                secs(section.refresh_bucket_delay_secs, config.refresh_bucket_delay);

            config.seed_nodes = file
                .seed_nodes
                .iter()
                .map(Self::parse_seed)
                .collect::<Result<_, _>>()?;

            config.validate()?;
            Ok(Self { config })
        }

        fn parse_seed(entry: &SeedEntry) -> Result<SeedNode, ConfigError> {
            let node_id = NodeId::from_hex(&entry.node_id).map_err(|e| {
                ConfigError::Invalid(format!("seed node id {:?}: {e}", entry.node_id))
            })?;
            let address: NodeAddress = entry
                .address
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("seed node address: {e}")))?;
            Ok(SeedNode { node_id, address })
        }
    }

    impl ConfigProvider for TomlConfigProvider {
        fn nodes_config(&self) -> Result<NodesConfig, ConfigError> {
            Ok(self.config.clone())
        }
    }
}

#[cfg(feature = "network")]
pub use toml_config::TomlConfigProvider;
