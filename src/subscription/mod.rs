//! Subscriptions to chain events and the supervisor that keeps them alive
//!
//! This module provides:
//! - A `Subscription` handle abstraction over any long-lived event stream
//! - `TaskSubscription`, a subscription backed by a spawned tokio task
//! - `with_resubscription`, which re-establishes a subscription with backoff

mod resubscribe;

pub use resubscribe::{with_resubscription, ResubscribeOptions, ResubscribedSubscription};

use crate::error::{ChainError, ChainResult};

use async_trait::async_trait;
use std::future::Future;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A live event subscription
#[async_trait]
pub trait Subscription: Send + 'static {
    /// Resolves once the subscription has ended.
    ///
    /// Returns the failure that ended it, or `None` when it ended cleanly or was
    /// unsubscribed. Subsequent calls return `None` immediately.
    async fn err(&mut self) -> Option<ChainError>;

    /// Stop delivering events and release the underlying resources
    fn unsubscribe(&mut self);
}

/// Subscription whose lifetime is a spawned task
#[derive(Debug)]
pub struct TaskSubscription {
    cancel: CancellationToken,
    task: Option<JoinHandle<ChainResult<()>>>,
}

impl TaskSubscription {
    /// Spawn `f` with a cancellation token that fires on `unsubscribe`
    pub fn spawn<F, Fut>(f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ChainResult<()>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(f(cancel.clone()));
        Self {
            cancel,
            task: Some(task),
        }
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[async_trait]
impl Subscription for TaskSubscription {
    async fn err(&mut self) -> Option<ChainError> {
        let task = self.task.as_mut()?;
        let result = task.await;
        self.task = None;

        match result {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(e) if e.is_cancelled() => None,
            Err(e) => Some(ChainError::Internal(format!("Subscription task panicked: {}", e))),
        }
    }

    fn unsubscribe(&mut self) {
        self.cancel.cancel();
    }
}

impl Drop for TaskSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_subscription_reports_failure_once() {
        let mut sub = TaskSubscription::spawn(|_| async { Err(ChainError::SubscriptionClosed) });

        assert!(matches!(sub.err().await, Some(ChainError::SubscriptionClosed)));
        assert!(sub.err().await.is_none());
    }

    #[tokio::test]
    async fn test_unsubscribe_ends_task_cleanly() {
        let mut sub = TaskSubscription::spawn(|cancel| async move {
            cancel.cancelled().await;
            Ok(())
        });

        sub.unsubscribe();
        assert!(sub.is_unsubscribed());
        assert!(sub.err().await.is_none());
    }
}
