//! Invocation cancellation.
//!
//! A [`Canceller`] is held by whoever may abandon an invocation (a client
//! connection, a timeout); the matching [`CancelHandle`] travels in the
//! invocation context and is raced against every suspension point.

use crate::core::error::{CacheError, CacheResult};
use std::future::Future;
use tokio::sync::watch;

/// Cancels the invocations observing the paired [`CancelHandle`].
#[derive(Debug)]
pub struct Canceller {
    tx: watch::Sender<bool>,
}

impl Canceller {
    /// Create a canceller and the handle it controls.
    pub fn new() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelHandle { rx: Some(rx) })
    }

    pub fn cancel(&self) {
        // No receivers left means nothing is running.
        let _ = self.tx.send(true);
    }
}

/// Observes cancellation at suspension points.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    rx: Option<watch::Receiver<bool>>,
}

impl CancelHandle {
    /// A handle that is never cancelled.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Await `fut` unless the invocation is cancelled first.
    pub async fn run<T, F>(&self, fut: F) -> CacheResult<T>
    where
        F: Future<Output = CacheResult<T>>,
    {
        let Some(rx) = self.rx.clone() else {
            return fut.await;
        };

        tokio::select! {
            biased;
            _ = cancelled(rx) => Err(CacheError::Cancelled),
            result = fut => result,
        }
    }
}

async fn cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        let cancelled = *rx.borrow_and_update();
        if cancelled {
            return;
        }
        if rx.changed().await.is_err() {
            // Canceller dropped without cancelling.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_uncancelled_run_completes() {
        let (_canceller, handle) = Canceller::new();
        let value = handle.run(async { Ok::<_, CacheError>(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(!handle.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_future() {
        let (canceller, handle) = Canceller::new();
        let task = tokio::spawn(async move {
            handle
                .run(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok::<_, CacheError>(())
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
        assert_eq!(task.await.unwrap(), Err(CacheError::Cancelled));
    }

    #[tokio::test]
    async fn test_already_cancelled_fails_fast() {
        let (canceller, handle) = Canceller::new();
        canceller.cancel();
        assert!(handle.is_cancelled());
        let result = handle.run(async { Ok::<_, CacheError>(1) }).await;
        assert_eq!(result, Err(CacheError::Cancelled));
    }

    #[tokio::test]
    async fn test_none_never_cancels() {
        let handle = CancelHandle::none();
        assert!(!handle.is_cancelled());
        assert_eq!(handle.run(async { Ok::<_, CacheError>(3) }).await, Ok(3));
    }
}
