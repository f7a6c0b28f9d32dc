//! Cooperative Cancellation
//!
//! A shared handle that every suspending operation in the engine accepts.
//! Cancellation is cooperative: nothing is preempted, but every await point
//! races the token so a stop request is observed within one scheduling step
//! instead of at the next natural completion of a read or delay.
//!
//! # Example
//!
//! ```ignore
//! let token = CancelToken::new();
//! token.on_cancel(|| tracing::info!("reply stopped"));
//!
//! // In the streaming loop
//! match token.run_until_cancelled(stream.next()).await {
//!     Some(Some(event)) => { /* apply event */ }
//!     Some(None) => { /* stream ended */ }
//!     None => { /* cancelled while the read was in flight */ }
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Inner {
    token: CancellationToken,
    /// Pending callbacks; `None` once cancellation has fired
    callbacks: Mutex<Option<Vec<Callback>>>,
}

/// Cloneable cooperative-cancellation handle
///
/// All clones observe the same state. Cancelling any clone cancels them all.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Create a fresh, uncancelled token
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: CancellationToken::new(),
                callbacks: Mutex::new(Some(Vec::new())),
            }),
        }
    }

    /// Mark the token cancelled
    ///
    /// Idempotent: only the first call fires callbacks. Returns `true` if this
    /// call performed the cancellation.
    pub fn cancel(&self) -> bool {
        let callbacks = {
            let mut guard = self.inner.callbacks.lock();
            match guard.take() {
                Some(callbacks) => {
                    self.inner.token.cancel();
                    callbacks
                }
                None => return false,
            }
        };

        tracing::debug!(callbacks = callbacks.len(), "Cancellation requested");
        for callback in callbacks {
            callback();
        }
        true
    }

    /// Cheap synchronous check
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Register a callback invoked at most once
    ///
    /// Runs at the moment of cancellation, or immediately (on the calling
    /// thread) if the token is already cancelled.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut guard = self.inner.callbacks.lock();
        match guard.as_mut() {
            Some(callbacks) => callbacks.push(Box::new(callback)),
            None => {
                drop(guard);
                callback();
            }
        }
    }

    /// Resolves once the token is cancelled
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await;
    }

    /// Drive `fut` unless the token is cancelled first
    ///
    /// Returns `None` when cancellation won the race. Cancellation is checked
    /// first, so an already-cancelled token never polls `fut`.
    pub async fn run_until_cancelled<F>(&self, fut: F) -> Option<F::Output>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            () = self.inner.token.cancelled() => None,
            output = fut => Some(output),
        }
    }

    /// Cancellable delay
    ///
    /// Returns `true` if the full duration elapsed, `false` if cancelled.
    pub async fn sleep(&self, duration: Duration) -> bool {
        self.run_until_cancelled(tokio::time::sleep(duration))
            .await
            .is_some()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
