//! Pooled connection handles and the leases handed out to callers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::NodeConnectionManager;
use crate::domain::{NodeAddress, NodeConnectionError, NodeId};
use crate::ports::PeerConnection;

/// One live connection in the pool.
///
/// `ttl` is armed only while `usage == 0`.
pub(super) struct ConnectionHandle {
    pub(super) id: u64,
    pub(super) conn: Arc<dyn PeerConnection>,
    pub(super) address: NodeAddress,
    pub(super) usage: usize,
    pub(super) ttl: Option<IdleTimer>,
}

/// Armed idle timer of a handle.
pub(super) struct IdleTimer {
    pub(super) generation: u64,
    pub(super) cancel: CancellationToken,
}

impl ConnectionHandle {
    pub(super) fn disarm(&mut self) {
        if let Some(timer) = self.ttl.take() {
            timer.cancel.cancel();
        }
    }
}

/// Snapshot of a pooled connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Remote node.
    pub node_id: NodeId,
    /// Address the connection was opened to.
    pub address: NodeAddress,
    /// Active leases.
    pub usage: usize,
}

/// A counted use of a pooled connection.
///
/// Release it with [`ConnectionLease::release`]; dropping an unreleased
/// lease releases it without an error signal.
pub struct ConnectionLease {
    pub(super) manager: Arc<NodeConnectionManager>,
    pub(super) node_id: NodeId,
    pub(super) handle_id: u64,
    pub(super) conn: Arc<dyn PeerConnection>,
    pub(super) released: bool,
}

impl ConnectionLease {
    /// The pooled connection.
    pub fn connection(&self) -> Arc<dyn PeerConnection> {
        Arc::clone(&self.conn)
    }

    /// Remote node of the connection.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Return the connection to the pool.
    ///
    /// A connection-level `error` tears the connection down immediately
    /// instead of decrementing its usage.
    pub async fn release(mut self, error: Option<&NodeConnectionError>) {
        self.released = true;
        match error {
            Some(e) if e.is_connection_failure() => {
                self.manager
                    .destroy_handle(&self.node_id, Some(self.handle_id))
                    .await;
            }
            _ => self.manager.release_usage(&self.node_id, self.handle_id),
        }
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if !self.released {
            self.manager.release_usage(&self.node_id, self.handle_id);
        }
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("node_id", &self.node_id)
            .field("handle_id", &self.handle_id)
            .finish()
    }
}
