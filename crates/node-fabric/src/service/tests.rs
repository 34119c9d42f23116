//! End-to-end tests of a fully wired node: routing table, connection pool
//! and bucket policy sharing one simulated network.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tracing_subscriber::EnvFilter;

use super::*;
use crate::adapters::storage::InMemoryKvStore;
use crate::domain::{
    xor_distance, NodeAddress, NodeConnectionError, NodeContactAddressData, NodeGraphError, NodeId,
    NodesConfig, RpcError, SetNodeOutcome, TransportError,
};
use crate::ports::{KvStore, PeerConnection, Sigchain};
use crate::test_utils::{FixedTimeSource, MockNetwork, MockSigchain};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn id(byte: u8) -> NodeId {
    NodeId::new(vec![byte])
}

/// Two-byte id whose high byte picks the bucket.
fn wide_id(high: u8, low: u8) -> NodeId {
    NodeId::new(vec![high, low])
}

fn addr(port: u16) -> NodeAddress {
    NodeAddress::new("10.0.0.1", port)
}

struct Node {
    nodes: Arc<NodeManager>,
    connections: Arc<NodeConnectionManager>,
    graph: Arc<NodeGraph>,
    network: MockNetwork,
    clock: FixedTimeSource,
}

impl Node {
    async fn start(own: NodeId, config: NodesConfig) -> Self {
        init_tracing();
        let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let graph = Arc::new(NodeGraph::new(store, own.clone(), &config).unwrap());
        graph.start(true).await.unwrap();
        let network = MockNetwork::new();
        let clock = FixedTimeSource::new(1000);
        let connections = NodeConnectionManager::new(
            config,
            Arc::clone(&graph),
            network.ports(Arc::new(clock.clone())),
            EventHub::new(),
        );
        connections.start().await.unwrap();
        let sigchain: Arc<dyn Sigchain> = Arc::new(MockSigchain::new(own));
        let nodes = NodeManager::new(Arc::clone(&connections), sigchain);
        nodes.start().await.unwrap();
        Self {
            nodes,
            connections,
            graph,
            network,
            clock,
        }
    }

    async fn stop(&self) {
        self.nodes.stop().await.unwrap();
        self.connections.stop().await.unwrap();
        self.graph.stop().await.unwrap();
    }
}

// =============================================================================
// Bucket capacity
// =============================================================================

#[tokio::test]
async fn test_full_bucket_rejects_then_force_evicts_oldest() {
    let mut config = NodesConfig::for_testing();
    config.node_id_bits = 16;
    config.node_bucket_limit = 20;
    let node = Node::start(wide_id(0, 0), config).await;
    let ctx = OpContext::new();

    for low in 0..20u8 {
        node.clock.advance(1);
        let outcome = node
            .nodes
            .set_node(&wide_id(0x80, low), &addr(u16::from(low) + 1), false, &ctx)
            .await
            .unwrap();
        assert_eq!(outcome, SetNodeOutcome::Inserted);
    }
    assert_eq!(node.graph.get_bucket_meta(15).await.unwrap().count, 20);

    let newcomer = wide_id(0x80, 20);
    let err = node
        .graph
        .set_node_contact_address_data(&newcomer, &addr(100), NodeContactAddressData::direct(2000))
        .await
        .unwrap_err();
    assert!(matches!(err, NodeGraphError::BucketFull { index: 15, limit: 20 }));
    assert_eq!(node.graph.nodes_total().await.unwrap(), 20);

    node.clock.advance(1);
    let outcome = node
        .nodes
        .set_node(&newcomer, &addr(100), true, &ctx)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        SetNodeOutcome::Evicted {
            evicted: wide_id(0x80, 0)
        }
    );
    assert!(node.graph.get_node_contact(&newcomer).await.unwrap().is_some());
    assert!(node
        .graph
        .get_node_contact(&wide_id(0x80, 0))
        .await
        .unwrap()
        .is_none());
    assert_eq!(node.graph.nodes_total().await.unwrap(), 20);
    node.stop().await;
}

// =============================================================================
// Connection pool
// =============================================================================

#[tokio::test]
async fn test_concurrent_with_conn_f_shares_one_dial() {
    let node = Node::start(id(0x00), NodesConfig::for_testing()).await;
    node.network.add_peer(id(0x80), addr(1));
    node.nodes
        .set_node(&id(0x80), &addr(1), false, &OpContext::new())
        .await
        .unwrap();
    node.network.set_connect_delay(Duration::from_millis(50));

    let ctx = OpContext::new();
    let use_connection = |conn: Arc<dyn PeerConnection>| {
        async move { Ok::<_, RpcError>(conn) }.boxed()
    };
    let peer = id(0x80);
    let (a, b) = tokio::join!(
        node.connections.with_conn_f(&peer, &ctx, use_connection),
        node.connections.with_conn_f(&peer, &ctx, use_connection),
    );

    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(node.network.dial_count(&id(0x80)), 1);
    assert_eq!(node.connections.connection_count(), 1);
    assert_eq!(node.connections.list_connections()[0].usage, 0);
    node.stop().await;
}

#[tokio::test]
async fn test_connection_error_release_forces_fresh_dial() {
    let node = Node::start(id(0x00), NodesConfig::for_testing()).await;
    node.network.add_peer(id(0x80), addr(1));
    node.nodes
        .set_node(&id(0x80), &addr(1), false, &OpContext::new())
        .await
        .unwrap();
    let ctx = OpContext::new();

    let lease = node
        .connections
        .acquire_connection(&id(0x80), &ctx)
        .await
        .unwrap();
    let failure =
        NodeConnectionError::from(RpcError::from(TransportError::Closed("reset".into())));
    lease.release(Some(&failure)).await;
    assert!(!node.connections.has_connection(&id(0x80)));

    let lease = node
        .connections
        .acquire_connection(&id(0x80), &ctx)
        .await
        .unwrap();
    assert_eq!(node.network.dial_count(&id(0x80)), 2);
    lease.release(None).await;
    node.stop().await;
}

// =============================================================================
// Lookup and backoff
// =============================================================================

#[tokio::test]
async fn test_find_node_on_empty_table_stays_offline() {
    let node = Node::start(id(0x00), NodesConfig::for_testing()).await;

    let found = node
        .nodes
        .find_node(&id(0x42), &OpContext::new())
        .await
        .unwrap();

    assert_eq!(found, None);
    assert_eq!(node.network.total_dials(), 0);
    assert!(node.network.closest_queries().is_empty());
    node.stop().await;
}

#[tokio::test]
async fn test_lookup_failures_double_backoff_until_success() {
    let node = Node::start(id(0x00), NodesConfig::for_testing()).await;
    node.network.add_peer(id(0x80), addr(1));
    node.nodes
        .set_node(&id(0x80), &addr(1), false, &OpContext::new())
        .await
        .unwrap();
    node.network.set_online(&id(0x80), false);
    let base = node.connections.config().backoff_base;
    let ctx = OpContext::new();

    node.connections
        .get_closest_global_nodes(&id(0x42), false, &ctx)
        .await
        .unwrap();
    assert_eq!(node.connections.backoff_entry(&id(0x80)).unwrap().delay, base);

    node.connections
        .get_closest_global_nodes(&id(0x42), false, &ctx)
        .await
        .unwrap();
    assert_eq!(
        node.connections.backoff_entry(&id(0x80)).unwrap().delay,
        base * 2
    );

    node.network.set_online(&id(0x80), true);
    assert!(node.nodes.ping_node(&id(0x80), &ctx).await.unwrap());
    assert_eq!(node.connections.backoff_entry(&id(0x80)), None);
    node.stop().await;
}

#[tokio::test]
async fn test_closest_nodes_put_target_first() {
    let node = Node::start(id(0x00), NodesConfig::for_testing()).await;
    let ctx = OpContext::new();
    for (byte, port) in [(0x80, 1), (0x41, 2), (0x42, 3), (0x23, 4), (0x13, 5), (0x07, 6)] {
        node.nodes
            .set_node(&id(byte), &addr(port), false, &ctx)
            .await
            .unwrap();
    }

    let closest = node.nodes.get_closest_nodes(&id(0x42), 5).await.unwrap();

    assert_eq!(closest.len(), 5);
    assert_eq!(closest[0].0, id(0x42));
    let distances: Vec<_> = closest
        .iter()
        .map(|(node_id, _)| xor_distance(node_id, &id(0x42)))
        .collect();
    assert!(distances.windows(2).all(|pair| pair[0] <= pair[1]));
    node.stop().await;
}
