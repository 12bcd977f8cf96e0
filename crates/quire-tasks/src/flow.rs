//! Drop-fired completion guards.
//!
//! A [`FlowToken`] joins the independent asynchronous branches of one
//! operation: every branch holds a clone, any branch may stage a result, and
//! when the last clone is dropped the completion callback fires exactly once
//! with whatever result is staged at that point. Because firing is tied to
//! `Drop`, the guarantee also covers early returns and cancelled branches.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

struct FlowState<T> {
    result: T,
    on_done: Box<dyn FnOnce(T) + Send>,
}

struct FlowInner<T: Send + 'static> {
    state: Mutex<Option<FlowState<T>>>,
}

impl<T: Send + 'static> Drop for FlowInner<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.lock().take() {
            (state.on_done)(state.result);
        }
    }
}

/// Clonable completion marker for one operation's async branches.
pub struct FlowToken<T: Send + 'static> {
    inner: Arc<FlowInner<T>>,
}

impl<T: Send + 'static> Clone for FlowToken<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> FlowToken<T> {
    /// Create a token with an initial result and a completion callback.
    ///
    /// The callback fires exactly once, when the last clone is dropped.
    pub fn new(initial: T, on_done: impl FnOnce(T) + Send + 'static) -> Self {
        Self {
            inner: Arc::new(FlowInner {
                state: Mutex::new(Some(FlowState {
                    result: initial,
                    on_done: Box::new(on_done),
                })),
            }),
        }
    }

    /// Create a token whose completion resolves the returned waiter.
    ///
    /// The issuing operation typically clones the token into each branch,
    /// drops its own copy, and awaits the waiter.
    pub fn with_waiter(initial: T) -> (Self, FlowWaiter<T>) {
        let (tx, rx) = oneshot::channel();
        let token = Self::new(initial, move |value| {
            let _ = tx.send(value);
        });
        (token, FlowWaiter { rx })
    }

    /// Replace the staged result. The last staged value is what the
    /// completion callback receives.
    pub fn set_result(&self, value: T) {
        let mut state = self.inner.state.lock();
        if let Some(state) = state.as_mut() {
            state.result = value;
        }
    }
}

/// Future half of [`FlowToken::with_waiter`].
pub struct FlowWaiter<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> FlowWaiter<T> {
    /// Wait until every token clone is dropped; yields the staged result.
    ///
    /// Returns `None` only if the token side disappeared without firing,
    /// which cannot happen through the public API.
    pub async fn wait(self) -> Option<T> {
        self.rx.await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn fires_exactly_once_when_last_clone_drops() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let token = FlowToken::new(7usize, move |value| {
            assert_eq!(value, 7);
            f.fetch_add(1, Ordering::SeqCst);
        });

        let a = token.clone();
        let b = token.clone();
        drop(token);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(a);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        drop(b);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiter_sees_last_staged_result() {
        let (token, waiter) = FlowToken::with_waiter(0u32);
        token.set_result(1);
        let branch = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            branch.set_result(42);
        });
        drop(token);

        assert_eq!(waiter.wait().await, Some(42));
    }

    #[tokio::test]
    async fn early_return_still_completes_with_initial() {
        async fn branch_that_bails(_token: FlowToken<&'static str>) {
            // Drops the token without staging anything.
        }

        let (token, waiter) = FlowToken::with_waiter("initial");
        let fut = branch_that_bails(token.clone());
        drop(token);
        fut.await;

        assert_eq!(waiter.wait().await, Some("initial"));
    }
}
