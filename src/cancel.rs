//! Cooperative cancellation flag shared between an owner and running work.

use tokio_util::sync::CancellationToken;

/// A cooperative cancellation token.
///
/// Clone-cheap. Cancel once, observe many. Cancellation never preempts
/// anything: work has to poll [`is_cancelled`](Self::is_cancelled) or await
/// [`cancelled`](Self::cancelled) at its own checkpoints.
///
/// Tokens form a tree: cancelling a token cancels every [`child`](Self::child)
/// derived from it, never the other way round.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive a token that is cancelled whenever this one is.
    ///
    /// A child of an already cancelled token starts out cancelled.
    pub fn child(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Check whether cancellation has been requested (non-blocking).
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Wait until cancellation is requested.
    ///
    /// Returns immediately if `cancel()` was already called.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_token_not_cancelled() {
        assert!(!CancelToken::new().is_cancelled());
    }

    #[test]
    fn test_cancel_idempotent_and_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_parent_cancels_child_only_downwards() {
        let parent = CancelToken::new();
        let child = parent.child();
        let sibling = parent.child();

        child.cancel();
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());

        parent.cancel();
        assert!(sibling.is_cancelled());
        assert!(parent.child().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                true
            })
        };

        tokio::task::yield_now().await;
        token.cancel();

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_child_waiter_woken_by_parent() {
        let parent = CancelToken::new();
        let child = parent.child();
        let waiter = tokio::spawn(async move { child.cancelled().await });

        tokio::task::yield_now().await;
        parent.cancel();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("child should observe parent cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_immediate_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();

        tokio::time::timeout(Duration::from_millis(10), token.cancelled())
            .await
            .expect("cancelled() should resolve immediately");
    }
}
