//! Keyed delayed tasks.
//!
//! At most one pending task exists per [`TaskKey`]. A pending task can be
//! moved in time, replaced or cancelled; once it starts running it is only
//! reachable through its cancellation token.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::OpContext;

/// Identity of a background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKey {
    /// Periodic lookup of a random id in a bucket.
    RefreshBucket(usize),
    /// Liveness sweep of a full bucket with pending candidates.
    GarbageCollect(usize),
}

type TaskFn = Box<dyn FnOnce(OpContext) -> BoxFuture<'static, ()> + Send>;

struct Slot {
    id: u64,
    deadline: watch::Sender<Instant>,
    cancel: CancellationToken,
    running: bool,
}

#[derive(Default)]
struct Slots {
    next_id: u64,
    tasks: HashMap<TaskKey, Slot>,
}

/// Delayed task scheduler keyed by [`TaskKey`].
#[derive(Clone, Default)]
pub struct Scheduler {
    slots: Arc<Mutex<Slots>>,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.slots.lock().tasks.len())
            .finish()
    }
}

impl Scheduler {
    /// Empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, replacing a pending task with the same key.
    ///
    /// A task of the same key that is already running is left alone.
    pub fn schedule<F, Fut>(&self, key: TaskKey, delay: Duration, task: F)
    where
        F: FnOnce(OpContext) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slots = self.slots.lock();
        self.insert(&mut slots, key, delay, Box::new(move |ctx| Box::pin(task(ctx))));
    }

    /// Like [`Scheduler::schedule`], but keeps an existing pending task.
    ///
    /// Returns whether a new task was scheduled.
    pub fn schedule_if_absent<F, Fut>(&self, key: TaskKey, delay: Duration, task: F) -> bool
    where
        F: FnOnce(OpContext) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slots = self.slots.lock();
        if slots.tasks.get(&key).is_some_and(|slot| !slot.running) {
            return false;
        }
        self.insert(&mut slots, key, delay, Box::new(move |ctx| Box::pin(task(ctx))));
        true
    }

    /// Move a pending task to fire `delay` from now.
    ///
    /// Returns `false` when no task of that key is pending.
    pub fn reschedule(&self, key: TaskKey, delay: Duration) -> bool {
        let slots = self.slots.lock();
        match slots.tasks.get(&key) {
            Some(slot) if !slot.running => {
                slot.deadline.send_replace(Instant::now() + delay);
                true
            }
            _ => false,
        }
    }

    /// Cancel the task of `key`, pending or running.
    pub fn cancel(&self, key: TaskKey) -> bool {
        match self.slots.lock().tasks.remove(&key) {
            Some(slot) => {
                slot.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every task.
    pub fn cancel_all(&self) {
        let drained: Vec<Slot> = self.slots.lock().tasks.drain().map(|(_, s)| s).collect();
        for slot in drained {
            slot.cancel.cancel();
        }
    }

    /// Whether a task of `key` waits for its deadline.
    pub fn is_scheduled(&self, key: TaskKey) -> bool {
        self.slots
            .lock()
            .tasks
            .get(&key)
            .is_some_and(|slot| !slot.running)
    }

    /// Whether a task of `key` is executing.
    pub fn is_running(&self, key: TaskKey) -> bool {
        self.slots
            .lock()
            .tasks
            .get(&key)
            .is_some_and(|slot| slot.running)
    }

    /// Deadline of the pending task of `key`.
    pub fn deadline(&self, key: TaskKey) -> Option<Instant> {
        self.slots
            .lock()
            .tasks
            .get(&key)
            .filter(|slot| !slot.running)
            .map(|slot| *slot.deadline.borrow())
    }

    /// Keys with a pending or running task.
    pub fn keys(&self) -> Vec<TaskKey> {
        let mut keys: Vec<TaskKey> = self.slots.lock().tasks.keys().copied().collect();
        keys.sort();
        keys
    }

    fn insert(&self, slots: &mut Slots, key: TaskKey, delay: Duration, task: TaskFn) {
        let id = slots.next_id;
        slots.next_id += 1;
        let (deadline_tx, deadline_rx) = watch::channel(Instant::now() + delay);
        let cancel = CancellationToken::new();
        let replaced = slots.tasks.insert(
            key,
            Slot {
                id,
                deadline: deadline_tx,
                cancel: cancel.clone(),
                running: false,
            },
        );
        if let Some(old) = replaced.filter(|old| !old.running) {
            old.cancel.cancel();
        }
        trace!(?key, ?delay, "Task scheduled");
        tokio::spawn(Self::drive(Arc::clone(&self.slots), key, id, deadline_rx, cancel, task));
    }

    async fn drive(
        slots: Arc<Mutex<Slots>>,
        key: TaskKey,
        id: u64,
        mut deadline: watch::Receiver<Instant>,
        cancel: CancellationToken,
        task: TaskFn,
    ) {
        loop {
            let at = *deadline.borrow_and_update();
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep_until(at) => break,
                changed = deadline.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        match slots.lock().tasks.get_mut(&key) {
            Some(slot) if slot.id == id => slot.running = true,
            _ => return,
        }
        trace!(?key, "Task started");
        task(OpContext::from_token(cancel)).await;

        let mut slots = slots.lock();
        if slots.tasks.get(&key).is_some_and(|slot| slot.id == id) {
            slots.tasks.remove(&key);
        }
    }
}
