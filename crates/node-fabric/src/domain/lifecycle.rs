//! Explicit lifecycle states shared by the long-lived components.
//!
//! Every public operation checks [`Lifecycle::ensure_running`] first.
//! Transitions (start, stop, destroy) are serialized by a single async mutex.

use parking_lot::RwLock;
use tokio::sync::{Mutex, MutexGuard};

use super::LifecycleError;

/// Lifecycle state of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Constructed or stopped; may be started.
    Stopped,
    /// `start` in progress.
    Starting,
    /// Serving requests.
    Running,
    /// `stop` in progress.
    Stopping,
    /// Terminal.
    Destroyed,
}

/// Lifecycle tracker of one component.
#[derive(Debug)]
pub struct Lifecycle {
    component: &'static str,
    state: RwLock<LifecycleState>,
    transitions: Mutex<()>,
}

impl Lifecycle {
    /// New tracker in the `Stopped` state.
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            state: RwLock::new(LifecycleState::Stopped),
            transitions: Mutex::new(()),
        }
    }

    /// Current state.
    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    /// Whether the component is running.
    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    /// Fail with a typed error unless running.
    pub fn ensure_running(&self) -> Result<(), LifecycleError> {
        match self.state() {
            LifecycleState::Running => Ok(()),
            LifecycleState::Destroyed => Err(LifecycleError::Destroyed(self.component)),
            _ => Err(LifecycleError::NotRunning(self.component)),
        }
    }

    /// Acquire the transition lock.
    pub async fn transition(&self) -> Transition<'_> {
        Transition {
            lifecycle: self,
            _guard: self.transitions.lock().await,
        }
    }
}

/// Exclusive right to change the lifecycle state.
pub struct Transition<'a> {
    lifecycle: &'a Lifecycle,
    _guard: MutexGuard<'a, ()>,
}

impl Transition<'_> {
    /// Current state.
    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Move to `state`.
    pub fn set(&self, state: LifecycleState) {
        *self.lifecycle.state.write() = state;
    }

    /// Fail if the component was destroyed.
    pub fn ensure_not_destroyed(&self) -> Result<(), LifecycleError> {
        if self.state() == LifecycleState::Destroyed {
            return Err(LifecycleError::Destroyed(self.lifecycle.component));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_running_reports_state() {
        let lifecycle = Lifecycle::new("NodeGraph");
        assert_eq!(
            lifecycle.ensure_running(),
            Err(LifecycleError::NotRunning("NodeGraph"))
        );

        lifecycle.transition().await.set(LifecycleState::Running);
        assert!(lifecycle.ensure_running().is_ok());

        lifecycle.transition().await.set(LifecycleState::Destroyed);
        assert_eq!(
            lifecycle.ensure_running(),
            Err(LifecycleError::Destroyed("NodeGraph"))
        );
    }
}
