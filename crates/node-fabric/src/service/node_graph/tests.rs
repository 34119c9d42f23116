use std::sync::Arc;

use proptest::prelude::*;

use super::*;
use crate::adapters::storage::InMemoryKvStore;
use crate::domain::{
    xor_distance, LifecycleError, NodeAddress, NodeContact, NodeContactAddressData,
    NodeGraphError, NodeId, NodesConfig, SortOrder,
};
use crate::ports::KvStore;

// =============================================================================
// Helpers
// =============================================================================

fn id(byte: u8) -> NodeId {
    NodeId::new(vec![byte])
}

fn addr(port: u16) -> NodeAddress {
    NodeAddress::new("127.0.0.1", port)
}

async fn started_graph(own: u8) -> (NodeGraph, InMemoryKvStore) {
    let store = InMemoryKvStore::new();
    let graph = NodeGraph::new(
        Arc::new(store.clone()) as Arc<dyn KvStore>,
        id(own),
        &NodesConfig::for_testing(),
    )
    .unwrap();
    graph.start(false).await.unwrap();
    (graph, store)
}

async fn insert(graph: &NodeGraph, node: u8, port: u16, time: u64) -> Result<bool, NodeGraphError> {
    graph
        .set_node_contact_address_data(&id(node), &addr(port), NodeContactAddressData::direct(time))
        .await
}

// =============================================================================
// Insertion and capacity
// =============================================================================

#[tokio::test]
async fn test_set_and_get_node_contact() {
    let (graph, _) = started_graph(0x00).await;

    assert!(insert(&graph, 0x80, 1, 10).await.unwrap());
    assert!(!insert(&graph, 0x80, 2, 20).await.unwrap());

    let contact = graph.get_node_contact(&id(0x80)).await.unwrap().unwrap();
    assert_eq!(contact.len(), 2);
    assert_eq!(contact.connected_time(), 20);
    assert_eq!(graph.get_bucket_meta(7).await.unwrap().count, 1);
    assert_eq!(graph.get_connected_time(&id(0x80)).await.unwrap(), Some(20));
    assert_eq!(
        graph
            .get_node_contact_address_data(&id(0x80), &addr(1))
            .await
            .unwrap(),
        Some(NodeContactAddressData::direct(10))
    );
}

#[tokio::test]
async fn test_insert_beyond_limit_fails_without_mutation() {
    let (graph, _) = started_graph(0x00).await;
    for node in [0x80, 0x81, 0x82] {
        insert(&graph, node, 1, 1).await.unwrap();
    }

    let result = insert(&graph, 0x83, 1, 1).await;
    assert_eq!(result, Err(NodeGraphError::BucketFull { index: 7, limit: 3 }));
    assert_eq!(graph.nodes_total().await.unwrap(), 3);
    assert_eq!(graph.get_node_contact(&id(0x83)).await.unwrap(), None);

    // Known nodes can still gain addresses.
    assert!(!insert(&graph, 0x80, 2, 5).await.unwrap());
}

#[tokio::test]
async fn test_self_and_wrong_width_are_rejected() {
    let (graph, _) = started_graph(0x42).await;

    assert_eq!(insert(&graph, 0x42, 1, 1).await, Err(NodeGraphError::SameNodeId));
    assert_eq!(
        graph.bucket_index(&id(0x42)).await,
        Err(NodeGraphError::SameNodeId)
    );
    assert_eq!(
        graph.bucket_index(&NodeId::new(vec![1, 2])).await,
        Err(NodeGraphError::InvalidNodeId {
            expected: 8,
            actual: 16
        })
    );
    assert_eq!(
        graph.get_bucket(8, BucketSort::NodeId, SortOrder::Asc).await,
        Err(NodeGraphError::BucketIndexOutOfRange { index: 8, bits: 8 })
    );
}

#[tokio::test]
async fn test_bucket_index_returns_key() {
    let (graph, _) = started_graph(0x00).await;
    assert_eq!(
        graph.bucket_index(&id(0x01)).await.unwrap(),
        (0, "0000".to_string())
    );
    assert_eq!(
        graph.bucket_index(&id(0xff)).await.unwrap(),
        (7, "0007".to_string())
    );
}

// =============================================================================
// Removal
// =============================================================================

#[tokio::test]
async fn test_unset_last_address_removes_node() {
    let (graph, _) = started_graph(0x00).await;
    insert(&graph, 0x40, 1, 1).await.unwrap();
    insert(&graph, 0x40, 2, 2).await.unwrap();

    assert!(graph
        .unset_node_contact_address(&id(0x40), &addr(2))
        .await
        .unwrap());
    assert_eq!(graph.get_connected_time(&id(0x40)).await.unwrap(), Some(1));
    assert_eq!(graph.get_bucket_meta(6).await.unwrap().count, 1);

    assert!(graph
        .unset_node_contact_address(&id(0x40), &addr(1))
        .await
        .unwrap());
    assert_eq!(graph.get_node_contact(&id(0x40)).await.unwrap(), None);
    assert_eq!(graph.get_bucket_meta(6).await.unwrap().count, 0);
    assert_eq!(graph.get_oldest_node(6, 10).await.unwrap(), Vec::<NodeId>::new());
    assert!(!graph.unset_node_contact(&id(0x40)).await.unwrap());
}

#[tokio::test]
async fn test_set_node_contact_replaces_addresses() {
    let (graph, _) = started_graph(0x00).await;
    insert(&graph, 0x80, 1, 1).await.unwrap();

    let contact = NodeContact::single(&addr(9), NodeContactAddressData::direct(7));
    assert!(!graph.set_node_contact(&id(0x80), &contact).await.unwrap());
    assert_eq!(graph.get_node_contact(&id(0x80)).await.unwrap(), Some(contact));

    assert!(!graph
        .set_node_contact(&id(0x80), &NodeContact::new())
        .await
        .unwrap());
    assert_eq!(graph.nodes_total().await.unwrap(), 0);
}

// =============================================================================
// Reads
// =============================================================================

#[tokio::test]
async fn test_oldest_nodes_follow_connected_time() {
    let (graph, _) = started_graph(0x00).await;
    insert(&graph, 0x80, 1, 30).await.unwrap();
    insert(&graph, 0x81, 1, 10).await.unwrap();
    insert(&graph, 0x82, 1, 20).await.unwrap();

    assert_eq!(
        graph.get_oldest_node(7, 3).await.unwrap(),
        vec![id(0x81), id(0x82), id(0x80)]
    );

    insert(&graph, 0x81, 1, 40).await.unwrap();
    assert_eq!(graph.get_oldest_node(7, 1).await.unwrap(), vec![id(0x82)]);

    let newest_first: Vec<NodeId> = graph
        .get_bucket(7, BucketSort::ConnectedTime, SortOrder::Desc)
        .await
        .unwrap()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(newest_first, vec![id(0x81), id(0x80), id(0x82)]);
}

#[tokio::test]
async fn test_closest_nodes_put_known_target_first() {
    let (graph, _) = started_graph(0x00).await;
    for node in [0x80, 0x81, 0x40, 0x01] {
        insert(&graph, node, 1, 1).await.unwrap();
    }

    let closest: Vec<NodeId> = graph
        .get_closest_nodes(&id(0x81), 5)
        .await
        .unwrap()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(closest, vec![id(0x81), id(0x80), id(0x01), id(0x40)]);

    let limited = graph.get_closest_nodes(&id(0x81), 1).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].0, id(0x81));
}

#[tokio::test]
async fn test_closest_nodes_to_own_id() {
    let (graph, _) = started_graph(0x00).await;
    for node in [0x80, 0x02, 0x10] {
        insert(&graph, node, 1, 1).await.unwrap();
    }

    let closest: Vec<NodeId> = graph
        .get_closest_nodes(&id(0x00), 2)
        .await
        .unwrap()
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(closest, vec![id(0x02), id(0x10)]);
}

// =============================================================================
// Space swap
// =============================================================================

#[tokio::test]
async fn test_reset_buckets_drops_nodes_of_full_buckets() {
    let (graph, store) = started_graph(0x00).await;
    for node in [0x40, 0x41, 0x42, 0x20, 0x21] {
        insert(&graph, node, 1, 1).await.unwrap();
    }

    // Relative to 0x80 every stored node lands in bucket 7.
    let report = graph.reset_buckets(id(0x80)).await.unwrap();
    assert_eq!(report.kept, 3);
    assert_eq!(report.dropped, 2);
    assert_eq!(graph.node_id_own().await, id(0x80));
    assert_eq!(graph.nodes_total().await.unwrap(), 3);
    assert_eq!(graph.get_bucket_meta(7).await.unwrap().count, 3);
    assert!(store.committed_keys("nodes/0/").is_empty());
    assert!(!store.committed_keys("nodes/1/").is_empty());
}

#[tokio::test]
async fn test_reset_buckets_preserves_contacts_when_room() {
    let (graph, _) = started_graph(0x00).await;
    insert(&graph, 0x80, 1, 5).await.unwrap();
    insert(&graph, 0x80, 2, 9).await.unwrap();
    insert(&graph, 0x81, 1, 1).await.unwrap();
    insert(&graph, 0x40, 1, 1).await.unwrap();
    let before = graph.get_node_contact(&id(0x80)).await.unwrap();

    let report = graph.reset_buckets(id(0x01)).await.unwrap();
    assert_eq!(report.kept, 3);
    assert_eq!(report.dropped, 0);
    assert_eq!(graph.get_node_contact(&id(0x80)).await.unwrap(), before);
    assert_eq!(graph.get_connected_time(&id(0x80)).await.unwrap(), Some(9));

    // Swapping back lands in space 0 again.
    graph.reset_buckets(id(0x00)).await.unwrap();
    assert_eq!(graph.nodes_total().await.unwrap(), 3);
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_operations_require_running() {
    let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
    let graph = NodeGraph::new(store, id(0), &NodesConfig::for_testing()).unwrap();

    assert_eq!(
        graph.nodes_total().await,
        Err(NodeGraphError::Lifecycle(LifecycleError::NotRunning(
            "NodeGraph"
        )))
    );

    graph.start(false).await.unwrap();
    graph.destroy().await.unwrap();
    assert_eq!(
        graph.start(false).await,
        Err(NodeGraphError::Lifecycle(LifecycleError::Destroyed(
            "NodeGraph"
        )))
    );
}

#[tokio::test]
async fn test_fresh_start_wipes_table() {
    let (graph, store) = started_graph(0x00).await;
    insert(&graph, 0x80, 1, 1).await.unwrap();
    graph.stop().await.unwrap();

    graph.start(false).await.unwrap();
    assert_eq!(graph.nodes_total().await.unwrap(), 1);

    graph.stop().await.unwrap();
    graph.start(true).await.unwrap();
    assert_eq!(graph.nodes_total().await.unwrap(), 0);
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_transaction_groups_writes() {
    let (graph, _) = started_graph(0x00).await;
    let mut tx = graph.transaction().await.unwrap();
    graph.lock_bucket(&mut tx, 7).await.unwrap();
    graph
        .set_node_contact_address_data_in(&mut tx, &id(0x80), &addr(1), NodeContactAddressData::direct(1))
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert_eq!(graph.nodes_total().await.unwrap(), 0);
}

// =============================================================================
// Properties
// =============================================================================

fn block_on<F: std::future::Future>(fut: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(fut)
}

proptest! {
    #[test]
    fn prop_closest_nodes_are_sorted_and_bounded(
        own in any::<u8>(),
        nodes in proptest::collection::vec(any::<u8>(), 0..40),
        target in any::<u8>(),
        limit in 0usize..10,
    ) {
        let (closest, totals) = block_on(async {
            let (graph, _) = started_graph(own).await;
            for node in nodes.iter().copied().filter(|n| *n != own) {
                match insert(&graph, node, 1, 1).await {
                    Ok(_) | Err(NodeGraphError::BucketFull { .. }) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
            let closest = graph.get_closest_nodes(&id(target), limit).await.unwrap();
            let mut totals = Vec::new();
            for index in 0..8 {
                totals.push(graph.get_bucket_meta(index).await.unwrap().count);
            }
            (closest, totals)
        });

        prop_assert!(closest.len() <= limit);
        let distances: Vec<_> = closest.iter().map(|(n, _)| xor_distance(n, &id(target))).collect();
        prop_assert!(distances.windows(2).all(|w| w[0] <= w[1]));
        prop_assert!(totals.iter().all(|count| *count <= 3));
        prop_assert!(closest.iter().all(|(n, _)| *n != id(own)));
    }
}
