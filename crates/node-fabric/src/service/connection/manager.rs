//! # Connection Pool
//!
//! One authenticated connection per remote node, shared by every caller.
//!
//! ## Lifetime of a pooled connection
//!
//! ```text
//! dial ──► handle(usage 0, idle timer armed)
//!            │ acquire             ▲ release (usage → 0)
//!            ▼                     │
//!          handle(usage n, no timer)
//!            │ release with connection error / destroy / idle timer
//!            ▼
//!          closed, removed, ConnectionDestroyed emitted
//! ```
//!
//! Dials and teardowns of the same node are serialized by a per-node lock,
//! so concurrent callers coalesce onto a single dial. Address resolution
//! (routing table, then network lookup) happens before that lock is taken.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::{ConnectionHandle, ConnectionInfo, ConnectionLease, IdleTimer};
use crate::domain::{
    BackoffTable, Lifecycle, LifecycleError, LifecycleState, NodeAddress, NodeConnectionError,
    NodeContactAddressData, NodeGraphError, NodeId, NodesConfig, NodesEvent, RpcError,
    TransportError,
};
use crate::ports::{HostResolver, NodeRpc, PeerConnection, TimeSource, Transport};
use crate::service::{EventHub, LockBox, NodeGraph, OpContext};

const COMPONENT: &str = "NodeConnectionManager";

/// Network-facing collaborators of the connection pool.
#[derive(Clone)]
pub struct NetworkPorts {
    /// Secure transport used to dial and hole punch.
    pub transport: Arc<dyn Transport>,
    /// Remote calls issued over pooled connections.
    pub rpc: Arc<dyn NodeRpc>,
    /// Host name resolution.
    pub resolver: Arc<dyn HostResolver>,
    /// Wall clock used for connected times.
    pub time: Arc<dyn TimeSource>,
}

impl std::fmt::Debug for NetworkPorts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkPorts").finish_non_exhaustive()
    }
}

/// Connection pool, lookup engine and NAT traversal.
///
/// # Thread Safety
///
/// Always held in an `Arc`; every method takes `&self`.
pub struct NodeConnectionManager {
    pub(super) this: Weak<Self>,
    pub(super) config: NodesConfig,
    pub(super) graph: Arc<NodeGraph>,
    pub(super) ports: NetworkPorts,
    pub(super) events: EventHub,
    pub(super) backoff: Mutex<BackoffTable>,
    lifecycle: Lifecycle,
    stop: Mutex<CancellationToken>,
    connections: Mutex<HashMap<NodeId, ConnectionHandle>>,
    locks: LockBox<NodeId>,
    next_handle: AtomicU64,
    next_timer: AtomicU64,
}

impl std::fmt::Debug for NodeConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnectionManager")
            .field("state", &self.lifecycle.state())
            .field("connections", &self.connections.lock().len())
            .finish()
    }
}

impl NodeConnectionManager {
    /// Create a stopped pool.
    pub fn new(
        config: NodesConfig,
        graph: Arc<NodeGraph>,
        ports: NetworkPorts,
        events: EventHub,
    ) -> Arc<Self> {
        let backoff = BackoffTable::new(config.backoff_policy());
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            graph,
            ports,
            events,
            backoff: Mutex::new(backoff),
            lifecycle: Lifecycle::new(COMPONENT),
            stop: Mutex::new(CancellationToken::new()),
            connections: Mutex::new(HashMap::new()),
            locks: LockBox::new(),
            next_handle: AtomicU64::new(0),
            next_timer: AtomicU64::new(0),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start accepting operations.
    pub async fn start(&self) -> Result<(), NodeConnectionError> {
        let transition = self.lifecycle.transition().await;
        transition.ensure_not_destroyed()?;
        if transition.state() == LifecycleState::Running {
            return Ok(());
        }
        *self.stop.lock() = CancellationToken::new();
        transition.set(LifecycleState::Running);
        info!("NodeConnectionManager started");
        Ok(())
    }

    /// Interrupt in-flight operations and close every pooled connection.
    pub async fn stop(&self) -> Result<(), NodeConnectionError> {
        let transition = self.lifecycle.transition().await;
        if transition.state() != LifecycleState::Running {
            return Ok(());
        }
        transition.set(LifecycleState::Stopping);
        self.stop.lock().cancel();
        let destroyed = self.destroy_all().await;
        transition.set(LifecycleState::Stopped);
        info!(destroyed, "NodeConnectionManager stopped");
        Ok(())
    }

    /// Stop for good.
    pub async fn destroy(&self) -> Result<(), NodeConnectionError> {
        self.stop().await?;
        let transition = self.lifecycle.transition().await;
        transition.set(LifecycleState::Destroyed);
        self.backoff.lock().clear();
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// `ctx` additionally interrupted by [`NodeConnectionManager::stop`].
    pub(super) fn op_context(&self, ctx: &OpContext) -> Result<OpContext, NodeConnectionError> {
        self.lifecycle.ensure_running()?;
        Ok(ctx.linked_to(&self.stop.lock()))
    }

    fn stop_token(&self) -> CancellationToken {
        self.stop.lock().clone()
    }

    // =========================================================================
    // Acquisition
    // =========================================================================

    /// Pooled connection to `target`, dialing it if needed.
    ///
    /// The connection is not leased: its idle timer keeps running.
    pub async fn get_connection(
        &self,
        target: &NodeId,
        ctx: &OpContext,
    ) -> Result<Arc<dyn PeerConnection>, NodeConnectionError> {
        let ctx = self.op_context(ctx)?;
        let (_, conn) = self.resolve_and_connect(target, &ctx, false).await?;
        Ok(conn)
    }

    /// Lease the pooled connection to `target`, dialing it if needed.
    ///
    /// Every lease must be released before the idle timer is armed again.
    pub async fn acquire_connection(
        &self,
        target: &NodeId,
        ctx: &OpContext,
    ) -> Result<ConnectionLease, NodeConnectionError> {
        let ctx = self.op_context(ctx)?;
        let leased = self.resolve_and_connect(target, &ctx, true).await?;
        self.lease_from(target, leased)
    }

    /// Run `f` with a leased connection to `target`.
    ///
    /// A connection-level failure of `f` tears the connection down.
    pub async fn with_conn_f<T, F>(
        &self,
        target: &NodeId,
        ctx: &OpContext,
        f: F,
    ) -> Result<T, NodeConnectionError>
    where
        T: Send,
        F: FnOnce(Arc<dyn PeerConnection>) -> BoxFuture<'static, Result<T, RpcError>> + Send,
    {
        let ctx = self.op_context(ctx)?;
        let lease = self.acquire_connection(target, &ctx).await?;
        let result = match ctx.run(f(lease.connection())).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(NodeConnectionError::from(e)),
            Err(interrupted) => Err(interrupted.into()),
        };
        lease.release(result.as_ref().err()).await;
        result
    }

    async fn resolve_and_connect(
        &self,
        target: &NodeId,
        ctx: &OpContext,
        lease: bool,
    ) -> Result<(u64, Arc<dyn PeerConnection>), NodeConnectionError> {
        if let Some(existing) = self.existing(target, lease) {
            return Ok(existing);
        }
        let addresses = self.addresses_of(target, ctx).await?;
        self.connect_with_addresses(target, &addresses, ctx, lease)
            .await
    }

    /// Known addresses of `target`, most recent first, falling back to a
    /// network lookup.
    async fn addresses_of(
        &self,
        target: &NodeId,
        ctx: &OpContext,
    ) -> Result<Vec<NodeAddress>, NodeConnectionError> {
        let known = match self.graph.get_node_contact(target).await? {
            Some(contact) => contact.addresses_by_recency(),
            None => Vec::new(),
        };
        if !known.is_empty() {
            return Ok(known);
        }
        debug!(node_id = %target, "No known address, looking up");
        let outcome = self.get_closest_global_nodes(target, true, ctx).await?;
        outcome
            .found
            .map(|address| vec![address])
            .ok_or_else(|| NodeConnectionError::AddressNotFound(target.clone()))
    }

    /// Connect to `target` through the first of `addresses` that answers.
    ///
    /// Returns the handle id and connection, leased when `lease` is set.
    pub(super) async fn connect_with_addresses(
        &self,
        target: &NodeId,
        addresses: &[NodeAddress],
        ctx: &OpContext,
        lease: bool,
    ) -> Result<(u64, Arc<dyn PeerConnection>), NodeConnectionError> {
        if let Some(existing) = self.existing(target, lease) {
            return Ok(existing);
        }
        if *target == self.graph.node_id_own().await {
            return Err(NodeGraphError::SameNodeId.into());
        }
        let candidates = self.resolve_hostnames(addresses, ctx).await?;

        let guard = ctx.run(self.locks.lock(target.clone())).await?;
        if let Some(existing) = self.existing(target, lease) {
            return Ok(existing);
        }
        self.remove_and_close(target, None).await;

        let (address, conn) = self.dial(target, &candidates, ctx).await?;
        let handle_id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        {
            let mut connections = self.connections.lock();
            let mut handle = ConnectionHandle {
                id: handle_id,
                conn: Arc::clone(&conn),
                address: address.clone(),
                usage: usize::from(lease),
                ttl: None,
            };
            if !lease {
                self.arm_idle_timer(target, &mut handle);
            }
            connections.insert(target.clone(), handle);
        }
        drop(guard);

        debug!(node_id = %target, address = %address, "Connection established");
        self.record_address(target, &address).await;
        self.events.emit(NodesEvent::ConnectionEstablished {
            node_id: target.clone(),
            address,
        });
        Ok((handle_id, conn))
    }

    /// Live handle of `target`, leased when `lease` is set.
    fn existing(&self, target: &NodeId, lease: bool) -> Option<(u64, Arc<dyn PeerConnection>)> {
        let mut connections = self.connections.lock();
        let handle = connections.get_mut(target)?;
        if handle.conn.is_closed() {
            return None;
        }
        if lease {
            handle.usage += 1;
            handle.disarm();
        }
        Some((handle.id, Arc::clone(&handle.conn)))
    }

    pub(super) fn lease_from(
        &self,
        target: &NodeId,
        (handle_id, conn): (u64, Arc<dyn PeerConnection>),
    ) -> Result<ConnectionLease, NodeConnectionError> {
        let Some(manager) = self.this.upgrade() else {
            self.release_usage(target, handle_id);
            return Err(LifecycleError::Destroyed(COMPONENT).into());
        };
        Ok(ConnectionLease {
            manager,
            node_id: target.clone(),
            handle_id,
            conn,
            released: false,
        })
    }

    async fn resolve_hostnames(
        &self,
        addresses: &[NodeAddress],
        ctx: &OpContext,
    ) -> Result<Vec<NodeAddress>, NodeConnectionError> {
        let mut resolved: Vec<NodeAddress> = Vec::with_capacity(addresses.len());
        for address in addresses {
            if !address.is_hostname() {
                if !resolved.contains(address) {
                    resolved.push(address.clone());
                }
                continue;
            }
            match ctx.run(self.ports.resolver.resolve(&address.host)).await? {
                Ok(ips) => {
                    for ip in ips {
                        let concrete = NodeAddress::from_ip(ip, address.port);
                        if !resolved.contains(&concrete) {
                            resolved.push(concrete);
                        }
                    }
                }
                Err(e) => debug!(host = %address.host, error = %e, "Host resolution failed"),
            }
        }
        Ok(resolved)
    }

    /// Try each address in order under its own connect timer.
    async fn dial(
        &self,
        target: &NodeId,
        addresses: &[NodeAddress],
        ctx: &OpContext,
    ) -> Result<(NodeAddress, Arc<dyn PeerConnection>), NodeConnectionError> {
        let mut errors = Vec::new();
        for address in addresses {
            let attempt = ctx.child_with_timeout(self.config.conn_connect_time);
            match attempt
                .run(self.ports.transport.connect(target, address))
                .await
            {
                Ok(Ok(conn)) if conn.remote_node_id() == *target => {
                    return Ok((address.clone(), conn));
                }
                Ok(Ok(conn)) => {
                    let actual = conn.remote_node_id();
                    conn.close(true).await;
                    errors.push(NodeConnectionError::Connect {
                        node_id: target.clone(),
                        address: address.clone(),
                        source: TransportError::IdentityMismatch {
                            address: address.to_string(),
                            expected: target.to_hex(),
                            actual: actual.to_hex(),
                        },
                    });
                }
                Ok(Err(source)) => {
                    debug!(node_id = %target, address = %address, error = %source, "Dial failed");
                    errors.push(NodeConnectionError::Connect {
                        node_id: target.clone(),
                        address: address.clone(),
                        source,
                    });
                }
                Err(_) => {
                    ctx.check()?;
                    debug!(node_id = %target, address = %address, "Dial timed out");
                    errors.push(NodeConnectionError::ConnectTimeout {
                        node_id: target.clone(),
                        address: address.clone(),
                    });
                }
            }
        }
        Err(match errors.len() {
            0 => NodeConnectionError::AddressNotFound(target.clone()),
            1 => errors.remove(0),
            _ => NodeConnectionError::Aggregate(errors),
        })
    }

    async fn record_address(&self, target: &NodeId, address: &NodeAddress) {
        let data = NodeContactAddressData::direct(self.ports.time.now().as_secs());
        match self
            .graph
            .set_node_contact_address_data(target, address, data)
            .await
        {
            Ok(_) | Err(NodeGraphError::BucketFull { .. }) => {}
            Err(e) => warn!(node_id = %target, error = %e, "Failed to record connected address"),
        }
    }

    // =========================================================================
    // Release and teardown
    // =========================================================================

    /// Drop one lease of handle `handle_id`, arming the idle timer at zero.
    pub(super) fn release_usage(&self, node_id: &NodeId, handle_id: u64) {
        let mut connections = self.connections.lock();
        let Some(handle) = connections.get_mut(node_id) else {
            return;
        };
        if handle.id != handle_id {
            return;
        }
        handle.usage = handle.usage.saturating_sub(1);
        if handle.usage == 0 {
            self.arm_idle_timer(node_id, handle);
        }
    }

    fn arm_idle_timer(&self, node_id: &NodeId, handle: &mut ConnectionHandle) {
        handle.disarm();
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let generation = self.next_timer.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        handle.ttl = Some(IdleTimer {
            generation,
            cancel: cancel.clone(),
        });

        let stop = self.stop_token();
        let this = self.this.clone();
        let node_id = node_id.clone();
        let handle_id = handle.id;
        let ttl = self.config.conn_timeout_time;
        runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(ttl) => {
                    if let Some(manager) = this.upgrade() {
                        manager.expire(&node_id, handle_id, generation).await;
                    }
                }
            }
        });
    }

    async fn expire(&self, node_id: &NodeId, handle_id: u64, generation: u64) {
        let _guard = self.locks.lock(node_id.clone()).await;
        let idle = self.connections.lock().get(node_id).is_some_and(|handle| {
            handle.id == handle_id
                && handle.usage == 0
                && handle
                    .ttl
                    .as_ref()
                    .is_some_and(|timer| timer.generation == generation)
        });
        if idle {
            debug!(node_id = %node_id, "Idle connection expired");
            self.remove_and_close(node_id, Some(handle_id)).await;
        }
    }

    /// Close the pooled connection to `target`.
    ///
    /// Returns whether a connection existed.
    pub async fn destroy_connection(&self, target: &NodeId) -> bool {
        self.destroy_handle(target, None).await
    }

    pub(super) async fn destroy_handle(&self, target: &NodeId, handle_id: Option<u64>) -> bool {
        let _guard = self.locks.lock(target.clone()).await;
        self.remove_and_close(target, handle_id).await
    }

    /// Close every pooled connection. Returns how many were closed.
    pub async fn destroy_all(&self) -> usize {
        let targets: Vec<NodeId> = self.connections.lock().keys().cloned().collect();
        let mut destroyed = 0;
        for target in targets {
            if self.destroy_connection(&target).await {
                destroyed += 1;
            }
        }
        destroyed
    }

    /// Remove and close the handle of `target`. Caller holds the node lock.
    async fn remove_and_close(&self, target: &NodeId, handle_id: Option<u64>) -> bool {
        let removed = {
            let mut connections = self.connections.lock();
            match connections.get(target) {
                Some(handle) if handle_id.map_or(true, |id| id == handle.id) => {
                    connections.remove(target)
                }
                _ => None,
            }
        };
        let Some(mut handle) = removed else {
            return false;
        };
        handle.disarm();
        if !handle.conn.is_closed()
            && tokio::time::timeout(self.config.conn_shutdown_time, handle.conn.close(false))
                .await
                .is_err()
        {
            handle.conn.close(true).await;
        }
        debug!(node_id = %target, address = %handle.address, "Connection destroyed");
        self.events.emit(NodesEvent::ConnectionDestroyed {
            node_id: target.clone(),
        });
        true
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Snapshot of every pooled connection.
    pub fn list_connections(&self) -> Vec<ConnectionInfo> {
        let mut list: Vec<ConnectionInfo> = self
            .connections
            .lock()
            .iter()
            .map(|(node_id, handle)| ConnectionInfo {
                node_id: node_id.clone(),
                address: handle.address.clone(),
                usage: handle.usage,
            })
            .collect();
        list.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        list
    }

    /// Whether a live connection to `node_id` is pooled.
    pub fn has_connection(&self, node_id: &NodeId) -> bool {
        self.connections
            .lock()
            .get(node_id)
            .is_some_and(|handle| !handle.conn.is_closed())
    }

    /// Number of pooled connections.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
    }

    /// Pooled connection to `node_id` without dialing.
    pub(super) fn pooled(&self, node_id: &NodeId) -> Option<Arc<dyn PeerConnection>> {
        self.existing(node_id, false).map(|(_, conn)| conn)
    }

    /// Address of the pooled connection to `node_id`.
    pub(super) fn pooled_address(&self, node_id: &NodeId) -> Option<NodeAddress> {
        self.connections
            .lock()
            .get(node_id)
            .filter(|handle| !handle.conn.is_closed())
            .map(|handle| handle.address.clone())
    }

    /// Local routing table.
    pub fn graph(&self) -> &Arc<NodeGraph> {
        &self.graph
    }

    /// Event hub shared with the routing policy.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Configuration in effect.
    pub fn config(&self) -> &NodesConfig {
        &self.config
    }

    /// Network collaborators.
    pub fn ports(&self) -> &NetworkPorts {
        &self.ports
    }
}
