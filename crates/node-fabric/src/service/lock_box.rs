//! Per-key async mutexes.
//!
//! Locks are created on first use and removed once no holder or waiter
//! references them, so the box only ever contains keys that are in use.
//! Callers must never hold two keys of the same box at once.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// A mutex and the number of holders and waiters registered on it.
#[derive(Default)]
struct Slot {
    mutex: Arc<AsyncMutex<()>>,
    users: usize,
}

type LockMap<K> = HashMap<K, Slot>;

/// Map from key to lazily created, self-cleaning mutex.
pub struct LockBox<K> {
    locks: Arc<Mutex<LockMap<K>>>,
}

impl<K> Clone for LockBox<K> {
    fn clone(&self) -> Self {
        Self {
            locks: Arc::clone(&self.locks),
        }
    }
}

impl<K> Default for LockBox<K> {
    fn default() -> Self {
        Self {
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K> fmt::Debug for LockBox<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockBox")
            .field("keys", &self.locks.lock().len())
            .finish()
    }
}

impl<K: Eq + Hash + Clone> LockBox<K> {
    /// Empty box.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    ///
    /// Dropping the returned future before it resolves gives up the wait
    /// and releases the key's entry if nobody else uses it.
    pub async fn lock(&self, key: K) -> LockBoxGuard<K> {
        let (registration, mutex) = {
            let mut locks = self.locks.lock();
            let slot = locks.entry(key.clone()).or_default();
            slot.users += 1;
            let mutex = Arc::clone(&slot.mutex);
            (
                Registration {
                    locks: Arc::clone(&self.locks),
                    key,
                },
                mutex,
            )
        };
        let guard = mutex.lock_owned().await;
        LockBoxGuard {
            _guard: guard,
            registration,
        }
    }

    /// Whether `key` is currently held or awaited.
    pub fn is_locked(&self, key: &K) -> bool {
        self.locks
            .lock()
            .get(key)
            .is_some_and(|slot| slot.mutex.try_lock().is_err())
    }

    /// Number of keys with a live mutex.
    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    /// Whether no key is in use.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One holder or waiter of a key. Unregisters on drop.
struct Registration<K: Eq + Hash> {
    locks: Arc<Mutex<LockMap<K>>>,
    key: K,
}

impl<K: Eq + Hash> Drop for Registration<K> {
    fn drop(&mut self) {
        let mut locks = self.locks.lock();
        if let Some(slot) = locks.get_mut(&self.key) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                locks.remove(&self.key);
            }
        }
    }
}

/// Exclusive access to one key of a [`LockBox`]. Released on drop.
pub struct LockBoxGuard<K: Eq + Hash> {
    // Declared first: the mutex is released before the key unregisters.
    _guard: OwnedMutexGuard<()>,
    registration: Registration<K>,
}

impl<K: Eq + Hash> LockBoxGuard<K> {
    /// Key this guard holds.
    pub fn key(&self) -> &K {
        &self.registration.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_lock_is_removed_after_release() {
        let locks = LockBox::new();
        let guard = locks.lock("a").await;
        assert!(locks.is_locked(&"a"));
        assert_eq!(locks.len(), 1);
        drop(guard);
        assert!(locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_is_exclusive() {
        let locks = LockBox::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let guard = locks.lock(1u8).await;
        let waiter = {
            let locks = locks.clone();
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                let _guard = locks.lock(1u8).await;
                order.lock().push("second");
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        order.lock().push("first");
        drop(guard);
        waiter.await.ok();

        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert!(locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_leaves_no_entry() {
        let locks = LockBox::new();
        let guard = locks.lock(1u8).await;

        let timed_out =
            tokio::time::timeout(Duration::from_millis(10), locks.lock(1u8)).await;
        assert!(timed_out.is_err());
        assert_eq!(locks.len(), 1);

        drop(guard);
        assert!(locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_abandoned_after_release_leaves_no_entry() {
        let locks = LockBox::new();
        let guard = locks.lock(1u8).await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(1u8).await;
                std::future::pending::<()>().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        drop(guard);
        assert_eq!(locks.len(), 1);
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = LockBox::new();
        let _a = locks.lock(1u8).await;
        let _b = locks.lock(2u8).await;
        assert_eq!(locks.len(), 2);
    }
}
