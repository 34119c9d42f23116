//! Tests for Network Adapters

use super::*;
use crate::domain::{ConfigError, NodeAddress, NodeId, NodesConfig, SeedNode};
use crate::ports::{ConfigProvider, TimeSource};

#[test]
fn test_system_time_source_returns_recent_time() {
    let source = SystemTimeSource::new();
    // After ~2024
    assert!(source.now().as_secs() > 1_700_000_000);
}

#[test]
fn test_clock_before_epoch_reads_zero() {
    use std::time::{Duration, UNIX_EPOCH};

    let before = UNIX_EPOCH - Duration::from_secs(30);
    assert_eq!(SystemTimeSource::seconds_at(before), 0);
    assert_eq!(
        SystemTimeSource::seconds_at(UNIX_EPOCH + Duration::from_secs(90)),
        90
    );
}

#[test]
fn test_static_config_provider_defaults() {
    let config = StaticConfigProvider::new().nodes_config().unwrap();
    assert_eq!(config, NodesConfig::default());
    assert!(config.seed_nodes.is_empty());
}

#[test]
fn test_static_config_provider_with_seed_nodes() {
    let seed = SeedNode {
        node_id: NodeId::new(vec![7u8]),
        address: NodeAddress::new("10.0.0.1", 1314),
    };
    let provider = StaticConfigProvider::new()
        .with_config(NodesConfig::for_testing())
        .with_seed_nodes(vec![seed.clone()]);

    assert_eq!(provider.nodes_config().unwrap().seed_nodes, vec![seed]);
}

#[test]
fn test_static_config_provider_validates() {
    let mut config = NodesConfig::for_testing();
    config.node_bucket_limit = 0;
    let provider = StaticConfigProvider::new().with_config(config);

    assert!(matches!(
        provider.nodes_config(),
        Err(ConfigError::Invalid(_))
    ));
}

#[cfg(feature = "network")]
mod toml {
    use super::*;

    #[test]
    fn test_toml_overrides_defaults() {
        let provider = TomlConfigProvider::parse(
            r#"
            [nodes]
            node_bucket_limit = 8
            ping_timeout_time_ms = 500
            backoff_base_secs = 5
            refresh_bucket_delay_spread = 0.25

            [[seed_nodes]]
            node_id = "0102030405060708091011121314151617181920212223242526272829303132"
            address = "seed.example.net:1314"
            "#,
        )
        .unwrap();
        let config = provider.nodes_config().unwrap();

        assert_eq!(config.node_bucket_limit, 8);
        assert_eq!(config.ping_timeout_time, std::time::Duration::from_millis(500));
        assert_eq!(config.backoff_base, std::time::Duration::from_secs(5));
        assert_eq!(config.refresh_bucket_delay_spread, 0.25);
        assert_eq!(config.initial_closest_nodes, 3);
        assert_eq!(config.seed_nodes.len(), 1);
        assert_eq!(
            config.seed_nodes[0].address,
            NodeAddress::new("seed.example.net", 1314)
        );
    }

    #[test]
    fn test_toml_empty_file_is_default() {
        let config = TomlConfigProvider::parse("").unwrap().nodes_config().unwrap();
        assert_eq!(config, NodesConfig::default());
    }

    #[test]
    fn test_toml_rejects_bad_seed() {
        let err = TomlConfigProvider::parse(
            r#"
            [[seed_nodes]]
            node_id = "zz"
            address = "seed.example.net:1314"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_toml_rejects_seed_of_wrong_width() {
        let err = TomlConfigProvider::parse(
            r#"
            [[seed_nodes]]
            node_id = "01"
            address = "10.0.0.1:1314"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_toml_rejects_unknown_keys() {
        let err = TomlConfigProvider::parse("[nodes]\nbucket_size = 4\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[tokio::test]
    async fn test_resolver_passes_ip_literals_through() {
        use crate::ports::HostResolver;

        let ips = TokioHostResolver::new().resolve("10.0.0.7").await.unwrap();
        assert_eq!(ips, vec!["10.0.0.7".parse::<std::net::IpAddr>().unwrap()]);
    }
}
