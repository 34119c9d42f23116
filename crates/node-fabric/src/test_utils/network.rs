//! Simulated peer-to-peer network.
//!
//! One [`MockNetwork`] stands in for the transport, the remote calls and the
//! resolver of the node under test. Remote peers are plain records: an id,
//! an address, an online flag and the neighbours they report when asked for
//! their closest nodes.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{NodeAddress, NodeId, RpcError, TransportError};
use crate::ports::{
    Claim, ClaimChannel, ClaimMessage, HostResolver, NodeRpc, PeerConnection, SignallingRequest,
    TimeSource, Transport,
};
use crate::service::NetworkPorts;

/// How a simulated peer answers a claim exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClaimBehaviour {
    /// Sign the request and send an intermediary claim back.
    #[default]
    Honest,
    /// Answer with a claim that lacks the peer's signature.
    Forged,
    /// Close the stream without answering.
    Silent,
}

#[derive(Debug, Clone)]
struct SimPeer {
    node_id: NodeId,
    online: bool,
    neighbours: Vec<(NodeId, NodeAddress)>,
    claims: ClaimBehaviour,
}

#[derive(Default)]
struct State {
    peers: HashMap<NodeAddress, SimPeer>,
    hosts: HashMap<String, Vec<IpAddr>>,
    connect_delay: Duration,
    node_delays: HashMap<NodeId, Duration>,
    stall_traversal: bool,
    dials: HashMap<NodeId, usize>,
    open: Vec<Arc<MockConnection>>,
    hole_punches: Vec<NodeAddress>,
    signalling: Vec<(NodeId, SignallingRequest)>,
    closest_queries: Vec<NodeId>,
    counter_signed: Vec<(NodeId, Claim)>,
}

/// In-process network of simulated peers.
///
/// Implements [`Transport`], [`NodeRpc`] and [`HostResolver`]. Clones share
/// the same network.
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for MockNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockNetwork")
            .field("peers", &self.state.lock().peers.len())
            .finish()
    }
}

impl MockNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ports of a node attached to this network.
    pub fn ports(&self, time: Arc<dyn TimeSource>) -> NetworkPorts {
        NetworkPorts {
            transport: Arc::new(self.clone()),
            rpc: Arc::new(self.clone()),
            resolver: Arc::new(self.clone()),
            time,
        }
    }

    // -------------------------------------------------------------------------
    // Topology
    // -------------------------------------------------------------------------

    /// Add an online peer listening on `address`.
    pub fn add_peer(&self, node_id: NodeId, address: NodeAddress) {
        self.state.lock().peers.insert(
            address,
            SimPeer {
                node_id,
                online: true,
                neighbours: Vec::new(),
                claims: ClaimBehaviour::Honest,
            },
        );
    }

    /// Take every peer with id `node_id` on or off line.
    ///
    /// Going offline also closes its open connections.
    pub fn set_online(&self, node_id: &NodeId, online: bool) {
        let mut state = self.state.lock();
        for peer in state.peers.values_mut() {
            if peer.node_id == *node_id {
                peer.online = online;
            }
        }
        if !online {
            for conn in &state.open {
                if conn.node_id == *node_id {
                    conn.closed.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    /// Nodes `node_id` reports when asked for its closest nodes.
    pub fn set_neighbours(&self, node_id: &NodeId, neighbours: Vec<(NodeId, NodeAddress)>) {
        let mut state = self.state.lock();
        for peer in state.peers.values_mut() {
            if peer.node_id == *node_id {
                peer.neighbours = neighbours.clone();
            }
        }
    }

    /// Claim exchange behaviour of `node_id`.
    pub fn set_claim_behaviour(&self, node_id: &NodeId, behaviour: ClaimBehaviour) {
        let mut state = self.state.lock();
        for peer in state.peers.values_mut() {
            if peer.node_id == *node_id {
                peer.claims = behaviour;
            }
        }
    }

    /// Delay of every dial.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = delay;
    }

    /// Delay of dials toward `node_id`, overriding the global delay.
    pub fn set_node_connect_delay(&self, node_id: &NodeId, delay: Duration) {
        self.state.lock().node_delays.insert(node_id.clone(), delay);
    }

    /// Make signalling relays and hole punches hang until cancelled.
    pub fn set_stall_traversal(&self, stall: bool) {
        self.state.lock().stall_traversal = stall;
    }

    /// Make `host` resolve to `ips`.
    pub fn add_host(&self, host: impl Into<String>, ips: Vec<IpAddr>) {
        self.state.lock().hosts.insert(host.into(), ips);
    }

    // -------------------------------------------------------------------------
    // Observations
    // -------------------------------------------------------------------------

    /// Dials made toward `node_id`.
    pub fn dial_count(&self, node_id: &NodeId) -> usize {
        self.state.lock().dials.get(node_id).copied().unwrap_or(0)
    }

    /// Dials made toward any node.
    pub fn total_dials(&self) -> usize {
        self.state.lock().dials.values().sum()
    }

    /// Connections handed out so far, oldest first.
    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.state.lock().open.clone()
    }

    /// Addresses hole punches were sent to.
    pub fn hole_punches(&self) -> Vec<NodeAddress> {
        self.state.lock().hole_punches.clone()
    }

    /// Signalling requests sent, with the node each was sent to.
    pub fn signalling(&self) -> Vec<(NodeId, SignallingRequest)> {
        self.state.lock().signalling.clone()
    }

    /// Nodes asked for their closest nodes.
    pub fn closest_queries(&self) -> Vec<NodeId> {
        self.state.lock().closest_queries.clone()
    }

    /// Counter-signed claims delivered, with the receiving node.
    pub fn counter_signed(&self) -> Vec<(NodeId, Claim)> {
        self.state.lock().counter_signed.clone()
    }

    /// Close every open connection to `node_id` from the remote side.
    pub fn drop_connections(&self, node_id: &NodeId) {
        for conn in self.state.lock().open.iter() {
            if conn.node_id == *node_id {
                conn.closed.store(true, Ordering::SeqCst);
            }
        }
    }

    fn peer_at(&self, address: &NodeAddress) -> Option<SimPeer> {
        self.state.lock().peers.get(address).cloned()
    }

    fn ensure_open(conn: &dyn PeerConnection) -> Result<(), RpcError> {
        if conn.is_closed() {
            return Err(TransportError::Closed(conn.remote_address().to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for MockNetwork {
    async fn connect(
        &self,
        node_id: &NodeId,
        address: &NodeAddress,
    ) -> Result<Arc<dyn PeerConnection>, TransportError> {
        let delay = {
            let mut state = self.state.lock();
            *state.dials.entry(node_id.clone()).or_insert(0) += 1;
            state
                .node_delays
                .get(node_id)
                .copied()
                .unwrap_or(state.connect_delay)
        };
        if delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(delay).await;
        }

        let peer = match self.peer_at(address) {
            Some(peer) if peer.online => peer,
            _ => {
                return Err(TransportError::Refused {
                    address: address.to_string(),
                })
            }
        };
        if peer.node_id != *node_id {
            return Err(TransportError::IdentityMismatch {
                address: address.to_string(),
                expected: node_id.to_hex(),
                actual: peer.node_id.to_hex(),
            });
        }
        let conn = Arc::new(MockConnection {
            node_id: peer.node_id,
            address: address.clone(),
            closed: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
        });
        self.state.lock().open.push(Arc::clone(&conn));
        Ok(conn)
    }

    async fn hole_punch(&self, address: &NodeAddress) -> Result<(), TransportError> {
        let stall = {
            let mut state = self.state.lock();
            state.hole_punches.push(address.clone());
            state.stall_traversal
        };
        if stall {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait]
impl NodeRpc for MockNetwork {
    async fn closest_local_nodes(
        &self,
        conn: &dyn PeerConnection,
        _target: &NodeId,
    ) -> Result<Vec<(NodeId, NodeAddress)>, RpcError> {
        Self::ensure_open(conn)?;
        let responder = conn.remote_node_id();
        let peer = self
            .peer_at(&conn.remote_address())
            .ok_or_else(|| RpcError::Remote("unknown peer".into()))?;
        self.state.lock().closest_queries.push(responder.clone());
        Ok(peer
            .neighbours
            .into_iter()
            .filter(|(node_id, _)| *node_id != responder)
            .collect())
    }

    async fn relay_signalling(
        &self,
        conn: &dyn PeerConnection,
        request: SignallingRequest,
    ) -> Result<(), RpcError> {
        Self::ensure_open(conn)?;
        let stall = {
            let mut state = self.state.lock();
            state.signalling.push((conn.remote_node_id(), request));
            state.stall_traversal
        };
        if stall {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn open_claim_channel(
        &self,
        conn: &dyn PeerConnection,
    ) -> Result<Box<dyn ClaimChannel>, RpcError> {
        Self::ensure_open(conn)?;
        let peer = self
            .peer_at(&conn.remote_address())
            .ok_or_else(|| RpcError::Remote("unknown peer".into()))?;
        Ok(Box::new(MockClaimChannel {
            network: self.clone(),
            peer: peer.node_id,
            behaviour: peer.claims,
            inbox: VecDeque::new(),
            closed: false,
        }))
    }
}

#[async_trait]
impl HostResolver for MockNetwork {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, TransportError> {
        self.state
            .lock()
            .hosts
            .get(host)
            .cloned()
            .ok_or_else(|| TransportError::Resolve {
                host: host.to_string(),
                reason: "unknown host".into(),
            })
    }
}

/// A simulated authenticated connection.
#[derive(Debug)]
pub struct MockConnection {
    node_id: NodeId,
    address: NodeAddress,
    closed: AtomicBool,
    closes: AtomicUsize,
}

impl MockConnection {
    /// How often `close` was called.
    pub fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    fn remote_node_id(&self) -> NodeId {
        self.node_id.clone()
    }

    fn remote_address(&self) -> NodeAddress {
        self.address.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self, _force: bool) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Responder side of a claim exchange, scripted by [`ClaimBehaviour`].
struct MockClaimChannel {
    network: MockNetwork,
    peer: NodeId,
    behaviour: ClaimBehaviour,
    inbox: VecDeque<ClaimMessage>,
    closed: bool,
}

impl MockClaimChannel {
    fn signed_by(claim: &Claim, signer: &NodeId) -> Claim {
        let mut bytes = claim.0.clone();
        bytes.extend_from_slice(format!("|{}", signer.to_hex()).as_bytes());
        Claim(bytes)
    }
}

#[async_trait]
impl ClaimChannel for MockClaimChannel {
    async fn send(&mut self, message: ClaimMessage) -> Result<(), RpcError> {
        if self.closed {
            return Err(RpcError::StreamEnded);
        }
        match (message, self.behaviour) {
            (ClaimMessage::Request(claim), ClaimBehaviour::Honest) => {
                self.inbox.push_back(ClaimMessage::Response {
                    doubly_signed: Self::signed_by(&claim, &self.peer),
                    intermediary: Claim(format!("{}->", self.peer.to_hex()).into_bytes()),
                });
            }
            (ClaimMessage::Request(claim), ClaimBehaviour::Forged) => {
                self.inbox.push_back(ClaimMessage::Response {
                    doubly_signed: claim,
                    intermediary: Claim(format!("{}->", self.peer.to_hex()).into_bytes()),
                });
            }
            (ClaimMessage::Request(_), ClaimBehaviour::Silent) => {}
            (ClaimMessage::CounterSigned(claim), _) => {
                self.network
                    .state
                    .lock()
                    .counter_signed
                    .push((self.peer.clone(), claim));
            }
            (ClaimMessage::Response { .. }, _) => {
                return Err(RpcError::Malformed("initiator sent a response".into()));
            }
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<ClaimMessage>, RpcError> {
        Ok(self.inbox.pop_front())
    }

    async fn close(&mut self) -> Result<(), RpcError> {
        self.closed = true;
        Ok(())
    }
}
