//! In-memory transactional key-value store.
//!
//! Transactions read from a snapshot of the committed map and buffer their
//! writes; `commit` applies the buffer atomically. Per-key locks are held
//! until the transaction ends and refresh the snapshot when acquired.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::StoreError;
use crate::ports::{KvStore, KvTransaction, ScanOrder};
use crate::service::{LockBox, LockBoxGuard};

type Data = BTreeMap<String, Vec<u8>>;

#[derive(Default)]
struct Shared {
    data: RwLock<Arc<Data>>,
    locks: LockBox<String>,
    closed: AtomicBool,
}

/// In-memory store for tests and ephemeral nodes.
#[derive(Clone, Default)]
pub struct InMemoryKvStore {
    shared: Arc<Shared>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every further transaction.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }

    /// Whether [`InMemoryKvStore::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Committed keys under `prefix`, in order.
    pub fn committed_keys(&self, prefix: &str) -> Vec<String> {
        let data = Arc::clone(&self.shared.data.read());
        prefixed(&data, prefix).map(|(k, _)| k.clone()).collect()
    }

    /// Number of committed keys.
    pub fn len(&self) -> usize {
        self.shared.data.read().len()
    }

    /// Whether nothing is committed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for InMemoryKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryKvStore")
            .field("keys", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn begin(&self) -> Result<Box<dyn KvTransaction>, StoreError> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        Ok(Box::new(MemoryTransaction {
            snapshot: Arc::clone(&self.shared.data.read()),
            shared: Arc::clone(&self.shared),
            writes: BTreeMap::new(),
            locks: Vec::new(),
            finished: false,
        }))
    }
}

fn prefixed<'a>(data: &'a Data, prefix: &str) -> impl Iterator<Item = (&'a String, &'a Vec<u8>)> {
    let prefix = prefix.to_owned();
    data.range::<String, _>((Bound::Included(prefix.clone()), Bound::Unbounded))
        .take_while(move |(k, _)| k.starts_with(&prefix))
}

struct MemoryTransaction {
    shared: Arc<Shared>,
    snapshot: Arc<Data>,
    writes: BTreeMap<String, Option<Vec<u8>>>,
    locks: Vec<LockBoxGuard<String>>,
    finished: bool,
}

impl MemoryTransaction {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionFinished);
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn finish(&mut self) {
        self.finished = true;
        self.writes.clear();
        self.locks.clear();
    }
}

#[async_trait]
impl KvTransaction for MemoryTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_open()?;
        if let Some(write) = self.writes.get(key) {
            return Ok(write.clone());
        }
        Ok(self.snapshot.get(key).cloned())
    }

    async fn put(&mut self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.writes.insert(key.to_owned(), Some(value));
        Ok(())
    }

    async fn del(&mut self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.writes.insert(key.to_owned(), None);
        Ok(())
    }

    async fn scan(
        &mut self,
        prefix: &str,
        order: ScanOrder,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.ensure_open()?;
        let mut merged: Data = prefixed(&self.snapshot, prefix)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, write) in self.writes.iter().filter(|(k, _)| k.starts_with(prefix)) {
            match write {
                Some(value) => merged.insert(key.clone(), value.clone()),
                None => merged.remove(key),
            };
        }
        let limit = limit.unwrap_or(usize::MAX);
        let entries = match order {
            ScanOrder::Forward => merged.into_iter().take(limit).collect(),
            ScanOrder::Reverse => merged.into_iter().rev().take(limit).collect(),
        };
        Ok(entries)
    }

    async fn lock(&mut self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        if self.locks.iter().any(|guard| guard.key() == key) {
            return Ok(());
        }
        let guard = self.shared.locks.lock(key.to_owned()).await;
        self.locks.push(guard);
        self.snapshot = Arc::clone(&self.shared.data.read());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        {
            let mut data = self.shared.data.write();
            let next = Arc::make_mut(&mut data);
            for (key, write) in std::mem::take(&mut self.writes) {
                match write {
                    Some(value) => next.insert(key, value),
                    None => next.remove(&key),
                };
            }
        }
        self.finish();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionFinished);
        }
        self.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_is_atomic_and_visible() {
        let store = InMemoryKvStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.put("a/1", b"x".to_vec()).await.unwrap();
        tx.put("a/2", b"y".to_vec()).await.unwrap();
        assert!(store.is_empty());

        tx.commit().await.unwrap();
        assert_eq!(store.committed_keys("a/"), vec!["a/1", "a/2"]);
        assert_eq!(tx.get("a/1").await, Err(StoreError::TransactionFinished));
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = InMemoryKvStore::new();
        {
            let mut tx = store.begin().await.unwrap();
            tx.put("k", b"v".to_vec()).await.unwrap();
        }
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_scan_merges_own_writes() {
        let store = InMemoryKvStore::new();
        let mut tx = store.begin().await.unwrap();
        for key in ["p/1", "p/2", "p/3", "q/1"] {
            tx.put(key, Vec::new()).await.unwrap();
        }
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.del("p/2").await.unwrap();
        tx.put("p/4", Vec::new()).await.unwrap();

        let keys: Vec<String> = tx
            .scan("p/", ScanOrder::Reverse, Some(2))
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["p/4", "p/3"]);
    }

    #[tokio::test]
    async fn test_lock_refreshes_snapshot() {
        let store = InMemoryKvStore::new();
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();

        first.lock("count").await.unwrap();
        first.put("count", vec![1]).await.unwrap();
        let waiter = tokio::spawn(async move {
            second.lock("count").await.unwrap();
            second.get("count").await.unwrap()
        });
        first.commit().await.unwrap();

        assert_eq!(waiter.await.unwrap(), Some(vec![1]));
    }

    #[tokio::test]
    async fn test_closed_store_rejects_transactions() {
        let store = InMemoryKvStore::new();
        store.close();
        assert!(matches!(store.begin().await, Err(StoreError::Closed)));
    }
}
