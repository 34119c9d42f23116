//! Transactions pinned to the active storage space.

use tokio::sync::OwnedRwLockReadGuard;

use super::keys::Space;
use crate::domain::{NodeGraphError, NodeId, StoreError};
use crate::ports::KvTransaction;

/// A store transaction bound to the routing table's active space.
///
/// Holding a `GraphTransaction` keeps the space and the local node id
/// stable: a bucket reset waits until every open transaction has ended.
/// Dropping it without [`GraphTransaction::commit`] rolls back.
pub struct GraphTransaction {
    pub(crate) tx: Box<dyn KvTransaction>,
    pub(crate) space: Space,
    own: OwnedRwLockReadGuard<NodeId>,
}

impl GraphTransaction {
    pub(crate) fn new(
        tx: Box<dyn KvTransaction>,
        space: Space,
        own: OwnedRwLockReadGuard<NodeId>,
    ) -> Self {
        Self { tx, space, own }
    }

    /// Local node id this transaction computes buckets against.
    pub fn node_id_own(&self) -> &NodeId {
        &self.own
    }

    /// Apply every write atomically.
    pub async fn commit(mut self) -> Result<(), NodeGraphError> {
        self.tx.commit().await?;
        Ok(())
    }

    /// Discard every write.
    pub async fn rollback(mut self) -> Result<(), NodeGraphError> {
        self.tx.rollback().await?;
        Ok(())
    }

    pub(crate) async fn get_u64(&mut self, key: &str) -> Result<u64, StoreError> {
        match self.tx.get(key).await? {
            None => Ok(0),
            Some(bytes) => decode_u64(key, &bytes),
        }
    }

    pub(crate) async fn put_u64(&mut self, key: &str, value: u64) -> Result<(), StoreError> {
        self.tx.put(key, value.to_be_bytes().to_vec()).await
    }
}

impl std::fmt::Debug for GraphTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphTransaction")
            .field("space", &self.space)
            .field("node_id_own", &*self.own)
            .finish()
    }
}

pub(crate) fn decode_u64(key: &str, bytes: &[u8]) -> Result<u64, StoreError> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| StoreError::Corrupt {
        key: key.to_owned(),
        reason: format!("expected 8 bytes, found {}", bytes.len()),
    })?;
    Ok(u64::from_be_bytes(array))
}
