//! Cancellation and deadline context passed down every call chain.
//!
//! An [`OpContext`] combines a cancellation token, any number of linked
//! component stop tokens and an optional deadline. Children derived from a
//! context are cancelled with it and never outlive its deadline.

use std::future::Future;
use std::time::Duration;

use futures::future::select_all;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::domain::Interrupted;

/// Cancellation token plus optional deadline.
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    linked: Vec<CancellationToken>,
    deadline: Option<Instant>,
}

impl OpContext {
    /// Context without deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context that times out after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            ..Self::default()
        }
    }

    /// Context driven by an existing token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            ..Self::default()
        }
    }

    /// Child that is cancelled with `self`.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            linked: self.linked.clone(),
            deadline: self.deadline,
        }
    }

    /// Child whose deadline is the earlier of the parent's and `now + timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let mut child = self.child();
        let deadline = Instant::now() + timeout;
        child.deadline = Some(match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        });
        child
    }

    /// Same context that is additionally interrupted by `stop`.
    pub fn linked_to(&self, stop: &CancellationToken) -> Self {
        let mut linked = self.clone();
        linked.linked.push(stop.clone());
        linked
    }

    /// Own cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Cancel this context and its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether this context or a linked token was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.linked.iter().any(CancellationToken::is_cancelled)
    }

    /// Fail if cancelled or past the deadline.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_cancelled() {
            return Err(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(Interrupted::TimedOut),
            _ => Ok(()),
        }
    }

    /// Drive `fut` until it completes, the context is cancelled or the
    /// deadline passes. An interrupted future is dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Interrupted> {
        self.check()?;
        let deadline = self.deadline;
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Interrupted::Cancelled),
            _ = async move {
                match deadline {
                    Some(deadline) => sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            } => Err(Interrupted::TimedOut),
            out = fut => Ok(out),
        }
    }

    /// Sleep for `duration` unless interrupted first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Interrupted> {
        self.run(tokio::time::sleep(duration)).await
    }

    /// Resolves once this context or any linked token is cancelled.
    pub async fn cancelled(&self) {
        let waits = std::iter::once(&self.token)
            .chain(self.linked.iter())
            .map(|token| Box::pin(token.cancelled()));
        select_all(waits).await;
    }
}
