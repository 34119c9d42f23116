use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;

use super::*;
use crate::adapters::storage::InMemoryKvStore;
use crate::domain::{
    EventKind, Interrupted, LifecycleError, NodeAddress, NodeConnectionError,
    NodeContactAddressData, NodeGraphError, NodeId, NodesConfig, NodesEvent, RpcError, SeedNode,
    TransportError,
};
use crate::ports::{KvStore, PeerConnection, SignallingRequest};
use crate::service::{EventHub, NodeGraph, OpContext, Subscription};
use crate::test_utils::{FixedTimeSource, MockNetwork};

// =============================================================================
// Helpers
// =============================================================================

fn id(byte: u8) -> NodeId {
    NodeId::new(vec![byte])
}

fn addr(port: u16) -> NodeAddress {
    NodeAddress::new("10.0.0.1", port)
}

struct Harness {
    manager: Arc<NodeConnectionManager>,
    graph: Arc<NodeGraph>,
    network: MockNetwork,
    events: EventHub,
}

impl Harness {
    async fn new(own: u8) -> Self {
        Self::with_config(own, NodesConfig::for_testing()).await
    }

    async fn with_config(own: u8, config: NodesConfig) -> Self {
        let store: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let graph = Arc::new(NodeGraph::new(store, id(own), &config).unwrap());
        graph.start(true).await.unwrap();
        let network = MockNetwork::new();
        let events = EventHub::new();
        let manager = NodeConnectionManager::new(
            config,
            Arc::clone(&graph),
            network.ports(Arc::new(FixedTimeSource::new(1000))),
            events.clone(),
        );
        manager.start().await.unwrap();
        Self {
            manager,
            graph,
            network,
            events,
        }
    }

    /// Online peer that the routing table knows about.
    async fn known_peer(&self, node: u8, port: u16) {
        self.network.add_peer(id(node), addr(port));
        self.graph
            .set_node_contact_address_data(&id(node), &addr(port), NodeContactAddressData::direct(1))
            .await
            .unwrap();
    }

    fn record(&self, kind: EventKind) -> (Subscription, Arc<Mutex<Vec<NodesEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = self
            .events
            .subscribe(kind, move |event| sink.lock().push(event.clone()));
        (subscription, seen)
    }
}

// =============================================================================
// Pool
// =============================================================================

#[tokio::test]
async fn test_get_connection_records_address_and_emits_event() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;
    let (_sub, established) = h.record(EventKind::ConnectionEstablished);

    let conn = h.manager.get_connection(&id(0x80), &OpContext::new()).await.unwrap();

    assert_eq!(conn.remote_node_id(), id(0x80));
    assert!(h.manager.has_connection(&id(0x80)));
    assert_eq!(h.graph.get_connected_time(&id(0x80)).await.unwrap(), Some(1000));
    assert_eq!(
        established.lock().as_slice(),
        &[NodesEvent::ConnectionEstablished {
            node_id: id(0x80),
            address: addr(1),
        }]
    );
}

#[tokio::test]
async fn test_concurrent_get_connection_dials_once() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;
    h.network.set_connect_delay(Duration::from_millis(50));

    let peer = id(0x80);
    let ctx = OpContext::new();
    let (a, b, c) = tokio::join!(
        h.manager.get_connection(&peer, &ctx),
        h.manager.get_connection(&peer, &ctx),
        h.manager.get_connection(&peer, &ctx),
    );

    let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert!(Arc::ptr_eq(&b, &c));
    assert_eq!(h.network.dial_count(&id(0x80)), 1);
    assert_eq!(h.manager.connection_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_acquire_is_refcounted_and_idle_timer_arms_at_zero() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;
    let ttl = h.manager.config().conn_timeout_time;
    let ctx = OpContext::new();

    let first = h.manager.acquire_connection(&id(0x80), &ctx).await.unwrap();
    let second = h.manager.acquire_connection(&id(0x80), &ctx).await.unwrap();
    assert!(Arc::ptr_eq(&first.connection(), &second.connection()));
    assert_eq!(h.manager.list_connections()[0].usage, 2);

    first.release(None).await;
    tokio::time::sleep(ttl * 2).await;
    assert!(h.manager.has_connection(&id(0x80)));
    assert_eq!(h.manager.list_connections()[0].usage, 1);

    second.release(None).await;
    tokio::time::sleep(ttl + Duration::from_secs(1)).await;
    assert!(!h.manager.has_connection(&id(0x80)));
    assert_eq!(h.network.connections()[0].close_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reacquire_cancels_idle_timer() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;
    let ttl = h.manager.config().conn_timeout_time;
    let ctx = OpContext::new();

    h.manager.get_connection(&id(0x80), &ctx).await.unwrap();
    tokio::time::sleep(ttl / 2).await;
    let lease = h.manager.acquire_connection(&id(0x80), &ctx).await.unwrap();
    tokio::time::sleep(ttl * 2).await;

    assert!(h.manager.has_connection(&id(0x80)));
    drop(lease);
    assert_eq!(h.manager.list_connections()[0].usage, 0);
}

#[tokio::test]
async fn test_release_with_connection_error_destroys() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;
    let (_sub, destroyed) = h.record(EventKind::ConnectionDestroyed);
    let ctx = OpContext::new();

    let lease = h.manager.acquire_connection(&id(0x80), &ctx).await.unwrap();
    let failure =
        NodeConnectionError::from(RpcError::from(TransportError::Closed("reset".into())));
    lease.release(Some(&failure)).await;

    assert!(!h.manager.has_connection(&id(0x80)));
    assert_eq!(destroyed.lock().len(), 1);

    h.manager.acquire_connection(&id(0x80), &ctx).await.unwrap();
    assert_eq!(h.network.dial_count(&id(0x80)), 2);
}

#[tokio::test]
async fn test_release_with_remote_error_keeps_connection() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;

    let result = h
        .manager
        .with_conn_f(&id(0x80), &OpContext::new(), |_conn| {
            async { Err::<(), _>(RpcError::Remote("denied".into())) }.boxed()
        })
        .await;

    assert!(matches!(result, Err(NodeConnectionError::Rpc(RpcError::Remote(_)))));
    assert!(h.manager.has_connection(&id(0x80)));
    assert_eq!(h.manager.list_connections()[0].usage, 0);
}

#[tokio::test]
async fn test_remote_close_triggers_fresh_dial() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;
    let ctx = OpContext::new();

    h.manager.get_connection(&id(0x80), &ctx).await.unwrap();
    h.network.drop_connections(&id(0x80));
    assert!(!h.manager.has_connection(&id(0x80)));

    let conn = h.manager.get_connection(&id(0x80), &ctx).await.unwrap();
    assert!(!conn.is_closed());
    assert_eq!(h.network.dial_count(&id(0x80)), 2);
    assert_eq!(h.manager.connection_count(), 1);
}

#[tokio::test]
async fn test_destroy_connection() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;

    h.manager.get_connection(&id(0x80), &OpContext::new()).await.unwrap();
    assert!(h.manager.destroy_connection(&id(0x80)).await);
    assert!(!h.manager.destroy_connection(&id(0x80)).await);
    assert_eq!(h.manager.connection_count(), 0);
}

// =============================================================================
// Dial failures
// =============================================================================

#[tokio::test]
async fn test_single_failure_is_surfaced_directly() {
    let h = Harness::new(0x00).await;
    h.graph
        .set_node_contact_address_data(&id(0x80), &addr(1), NodeContactAddressData::direct(1))
        .await
        .unwrap();

    let err = h
        .manager
        .get_connection(&id(0x80), &OpContext::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        NodeConnectionError::Connect {
            source: TransportError::Refused { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn test_every_address_failure_is_aggregated() {
    let h = Harness::new(0x00).await;
    for port in [1, 2] {
        h.graph
            .set_node_contact_address_data(&id(0x80), &addr(port), NodeContactAddressData::direct(1))
            .await
            .unwrap();
    }

    let err = h
        .manager
        .get_connection(&id(0x80), &OpContext::new())
        .await
        .unwrap_err();

    match err {
        NodeConnectionError::Aggregate(causes) => assert_eq!(causes.len(), 2),
        other => panic!("expected aggregate error, got {other:?}"),
    }
    assert_eq!(h.network.dial_count(&id(0x80)), 2);
}

#[tokio::test]
async fn test_addresses_are_tried_in_order() {
    let h = Harness::new(0x00).await;
    h.network.add_peer(id(0x80), addr(2));
    h.graph
        .set_node_contact_address_data(&id(0x80), &addr(1), NodeContactAddressData::direct(20))
        .await
        .unwrap();
    h.graph
        .set_node_contact_address_data(&id(0x80), &addr(2), NodeContactAddressData::direct(10))
        .await
        .unwrap();

    h.manager.get_connection(&id(0x80), &OpContext::new()).await.unwrap();

    assert_eq!(h.network.dial_count(&id(0x80)), 2);
    assert_eq!(h.manager.list_connections()[0].address, addr(2));
}

#[tokio::test(start_paused = true)]
async fn test_slow_dial_times_out_per_attempt() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;
    h.network.set_connect_delay(Duration::from_secs(1));

    let err = h
        .manager
        .get_connection(&id(0x80), &OpContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, NodeConnectionError::ConnectTimeout { .. }));
    assert!(!err.is_interrupted());
}

#[tokio::test(start_paused = true)]
async fn test_parent_deadline_is_an_interruption() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;
    h.network.set_connect_delay(Duration::from_secs(1));

    let err = h
        .manager
        .get_connection(&id(0x80), &OpContext::with_timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        NodeConnectionError::Interrupted(Interrupted::TimedOut)
    ));
    assert_eq!(h.manager.connection_count(), 0);
}

#[tokio::test]
async fn test_cancelled_context_dials_nothing() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;
    let ctx = OpContext::new();
    ctx.cancel();

    let err = h.manager.get_connection(&id(0x80), &ctx).await.unwrap_err();

    assert!(err.is_interrupted());
    assert_eq!(h.network.dial_count(&id(0x80)), 0);
}

#[tokio::test]
async fn test_identity_mismatch_is_rejected() {
    let h = Harness::new(0x00).await;
    h.network.add_peer(id(0x81), addr(1));
    h.graph
        .set_node_contact_address_data(&id(0x80), &addr(1), NodeContactAddressData::direct(1))
        .await
        .unwrap();

    let err = h
        .manager
        .get_connection(&id(0x80), &OpContext::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        NodeConnectionError::Connect {
            source: TransportError::IdentityMismatch { .. },
            ..
        }
    ));
}

#[tokio::test]
async fn test_host_names_are_resolved() {
    let h = Harness::new(0x00).await;
    let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
    h.network.add_host("peer.example", vec![ip]);
    h.network.add_peer(id(0x80), NodeAddress::from_ip(ip, 7));
    h.graph
        .set_node_contact_address_data(
            &id(0x80),
            &NodeAddress::new("peer.example", 7),
            NodeContactAddressData::direct(1),
        )
        .await
        .unwrap();

    h.manager.get_connection(&id(0x80), &OpContext::new()).await.unwrap();

    assert_eq!(h.manager.list_connections()[0].address, addr(7));
}

#[tokio::test]
async fn test_own_id_is_rejected() {
    let h = Harness::new(0x00).await;

    let err = h
        .manager
        .get_connection(&id(0x00), &OpContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, NodeConnectionError::Graph(NodeGraphError::SameNodeId)));
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_operations_require_running() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;
    h.manager.get_connection(&id(0x80), &OpContext::new()).await.unwrap();

    h.manager.stop().await.unwrap();

    assert_eq!(h.manager.connection_count(), 0);
    assert!(h.network.connections()[0].is_closed());
    let err = h
        .manager
        .get_connection(&id(0x80), &OpContext::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        NodeConnectionError::Lifecycle(LifecycleError::NotRunning(_))
    ));

    h.manager.destroy().await.unwrap();
    assert!(matches!(
        h.manager.start().await,
        Err(NodeConnectionError::Lifecycle(LifecycleError::Destroyed(_)))
    ));
}

// =============================================================================
// Lookup and backoff
// =============================================================================

#[tokio::test]
async fn test_find_node_on_empty_table_makes_no_calls() {
    let h = Harness::new(0x00).await;

    let found = h
        .manager
        .find_node(&id(0x42), false, &OpContext::new())
        .await
        .unwrap();

    assert_eq!(found, None);
    assert_eq!(h.network.total_dials(), 0);
}

#[tokio::test]
async fn test_lookup_walks_toward_target() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;
    h.network.add_peer(id(0x41), addr(2));
    h.network.add_peer(id(0x42), addr(3));
    h.network.set_neighbours(&id(0x80), vec![(id(0x41), addr(2))]);
    h.network.set_neighbours(&id(0x41), vec![(id(0x42), addr(3))]);

    let outcome = h
        .manager
        .get_closest_global_nodes(&id(0x42), false, &OpContext::new())
        .await
        .unwrap();

    assert_eq!(outcome.found, Some(addr(3)));
    assert_eq!(outcome.contacted, 3);
    assert_eq!(h.network.closest_queries(), vec![id(0x80), id(0x41)]);
    assert!(h.graph.get_node_contact(&id(0x42)).await.unwrap().is_some());
}

#[tokio::test]
async fn test_lookup_ignores_own_id_in_responses() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;
    h.network
        .set_neighbours(&id(0x80), vec![(id(0x00), addr(9)), (id(0x01), addr(9))]);

    let outcome = h
        .manager
        .get_closest_global_nodes(&id(0x01), false, &OpContext::new())
        .await
        .unwrap();

    assert_eq!(outcome.found, None);
    assert_eq!(h.network.dial_count(&id(0x00)), 0);
    assert_eq!(h.network.dial_count(&id(0x01)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_ping_backs_off_and_exhausts_lookup() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;
    h.network.set_online(&id(0x80), false);
    let (_sub, exhausted) = h.record(EventKind::LookupExhausted);
    let base = h.manager.config().backoff_base;

    let found = h
        .manager
        .find_node(&id(0x42), false, &OpContext::new())
        .await
        .unwrap();

    assert_eq!(found, None);
    assert_eq!(h.manager.backoff_entry(&id(0x80)).unwrap().delay, base);
    assert!(h.manager.is_backed_off(&id(0x80)));
    assert_eq!(
        exhausted.lock().as_slice(),
        &[NodesEvent::LookupExhausted {
            target: id(0x42),
            contacted: 0,
        }]
    );

    h.manager
        .find_node(&id(0x42), true, &OpContext::new())
        .await
        .unwrap();
    assert_eq!(h.network.dial_count(&id(0x80)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_ping_updates_backoff() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;
    h.network.set_online(&id(0x80), false);
    let base = h.manager.config().backoff_base;
    let ctx = OpContext::new();

    assert!(!h.manager.ping_node(&id(0x80), &ctx).await.unwrap());
    assert_eq!(h.manager.backoff_entry(&id(0x80)).unwrap().delay, base);
    assert!(!h.manager.ping_node(&id(0x80), &ctx).await.unwrap());
    assert_eq!(h.manager.backoff_entry(&id(0x80)).unwrap().delay, base * 2);

    h.network.set_online(&id(0x80), true);
    assert!(h.manager.ping_node(&id(0x80), &ctx).await.unwrap());
    assert_eq!(h.manager.backoff_entry(&id(0x80)), None);
}

// =============================================================================
// NAT traversal and responder handlers
// =============================================================================

fn seeded_config() -> NodesConfig {
    NodesConfig::for_testing().with_seed_nodes(vec![SeedNode {
        node_id: id(0x10),
        address: addr(9),
    }])
}

#[tokio::test]
async fn test_ping_signals_through_connected_seeds() {
    let h = Harness::with_config(0x00, seeded_config()).await;
    h.known_peer(0x10, 9).await;
    h.known_peer(0x80, 1).await;
    let ctx = OpContext::new();
    h.manager.get_connection(&id(0x10), &ctx).await.unwrap();

    assert!(h.manager.ping_node(&id(0x80), &ctx).await.unwrap());

    assert_eq!(
        h.network.signalling(),
        vec![(
            id(0x10),
            SignallingRequest {
                source: id(0x00),
                target: id(0x80),
                proxy_address: None,
            }
        )]
    );
    assert_eq!(h.network.hole_punches(), vec![addr(1)]);
}

#[tokio::test]
async fn test_ping_of_seed_skips_signalling() {
    let h = Harness::with_config(0x00, seeded_config()).await;
    h.known_peer(0x10, 9).await;

    assert!(h.manager.ping_node(&id(0x10), &OpContext::new()).await.unwrap());

    assert!(h.network.signalling().is_empty());
    assert!(h.network.hole_punches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stalled_signalling_relay_leaves_dial_its_budget() {
    let h = Harness::with_config(0x00, seeded_config()).await;
    h.known_peer(0x10, 9).await;
    h.known_peer(0x80, 1).await;
    let (seed, peer) = (id(0x10), id(0x80));
    let ctx = OpContext::new();
    h.manager.get_connection(&seed, &ctx).await.unwrap();
    h.network.set_stall_traversal(true);

    assert!(h.manager.ping_node(&peer, &ctx).await.unwrap());

    assert_eq!(h.network.signalling().len(), 1);
    assert_eq!(h.network.dial_count(&peer), 1);
    assert_eq!(h.manager.backoff_entry(&peer), None);
    assert!(h.manager.has_connection(&peer));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_hole_punch_leaves_dial_its_budget() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;
    let peer = id(0x80);
    h.network.set_stall_traversal(true);

    assert!(h.manager.ping_node(&peer, &OpContext::new()).await.unwrap());

    assert_eq!(h.network.hole_punches(), vec![addr(1)]);
    assert_eq!(h.manager.backoff_entry(&peer), None);
}

#[tokio::test]
async fn test_relay_forwards_with_observed_address() {
    let h = Harness::new(0x00).await;
    h.known_peer(0x80, 1).await;
    let ctx = OpContext::new();
    let request = SignallingRequest {
        source: id(0x20),
        target: id(0x80),
        proxy_address: None,
    };

    assert!(!h
        .manager
        .handle_signalling_relay(request.clone(), addr(7), &ctx)
        .await
        .unwrap());

    h.manager.get_connection(&id(0x80), &ctx).await.unwrap();
    assert!(h
        .manager
        .handle_signalling_relay(request, addr(7), &ctx)
        .await
        .unwrap());
    assert_eq!(
        h.network.signalling(),
        vec![(
            id(0x80),
            SignallingRequest {
                source: id(0x20),
                target: id(0x80),
                proxy_address: Some(addr(7)),
            }
        )]
    );
}

#[tokio::test]
async fn test_signalling_request_punches_back() {
    let h = Harness::new(0x00).await;
    let request = SignallingRequest {
        source: id(0x20),
        target: id(0x00),
        proxy_address: Some(addr(7)),
    };

    h.manager
        .handle_signalling_request(request, &OpContext::new())
        .await
        .unwrap();

    assert_eq!(h.network.hole_punches(), vec![addr(7)]);
}

#[tokio::test]
async fn test_closest_local_nodes_answer() {
    let h = Harness::new(0x00).await;
    for (node, port) in [(0x80, 1), (0x40, 2), (0x41, 3), (0x01, 4)] {
        h.known_peer(node, port).await;
    }

    let answer = h.manager.handle_closest_local_nodes(&id(0x40)).await.unwrap();

    assert_eq!(
        answer,
        vec![(id(0x40), addr(2)), (id(0x41), addr(3)), (id(0x01), addr(4))]
    );
}

// =============================================================================
// Multi-connection
// =============================================================================

#[tokio::test]
async fn test_establish_multi_connection() {
    let h = Harness::new(0x00).await;
    h.network.add_peer(id(0x80), addr(1));
    h.network.add_peer(id(0x40), addr(2));

    let connected = h
        .manager
        .establish_multi_connection(
            &[id(0x80), id(0x40), id(0x20)],
            &[addr(1), addr(2), addr(3)],
            2,
            &OpContext::new(),
        )
        .await
        .unwrap();

    assert_eq!(connected.len(), 2);
    assert_eq!(connected.get(&id(0x80)), Some(&addr(1)));
    assert_eq!(connected.get(&id(0x40)), Some(&addr(2)));
    assert!(h.manager.has_connection(&id(0x80)));
}

#[tokio::test]
async fn test_multi_connection_stops_once_every_node_connected() {
    let h = Harness::new(0x00).await;
    h.network.add_peer(id(0x80), addr(1));

    let connected = h
        .manager
        .establish_multi_connection(&[id(0x80)], &[addr(1), addr(2), addr(3)], 1, &OpContext::new())
        .await
        .unwrap();

    assert_eq!(connected.get(&id(0x80)), Some(&addr(1)));
    assert_eq!(h.network.dial_count(&id(0x80)), 1);
}
