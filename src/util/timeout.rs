//! Bounded waits and cooperative cancellation.
//!
//! Every RPC call, MPC wait and HTTP fetch in the crank flows through these
//! primitives so that no await point is unbounded.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Notify;

/// Typed timeout error carrying the operation label for classification
/// and log output.
#[derive(Debug, Clone, Error)]
#[error("operation '{operation}' timed out after {timeout_ms}ms")]
pub struct TimeoutError {
    pub operation: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Error)]
#[error("operation '{operation}' cancelled")]
pub struct Cancelled {
    pub operation: String,
}

/// Cooperative cancellation flag shared between the service and its
/// background tasks. Cancellation is observed at the next wait point.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Runs `fut` with a deadline. On expiry the future is dropped and a typed
/// [`TimeoutError`] is returned.
pub async fn with_timeout<T, F>(operation: &str, timeout_ms: u64, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(Duration::from_millis(timeout_ms), fut).await {
        Ok(result) => result,
        Err(_) => Err(TimeoutError {
            operation: operation.to_string(),
            timeout_ms,
        }
        .into()),
    }
}

/// Like [`with_timeout`] but also honours a cancellation token. A token that
/// is already cancelled rejects immediately without polling `fut`.
pub async fn with_timeout_cancellable<T, F>(
    operation: &str,
    timeout_ms: u64,
    cancel: &CancelToken,
    fut: F,
) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(Cancelled {
            operation: operation.to_string(),
        }
        .into());
    }

    tokio::select! {
        result = with_timeout(operation, timeout_ms, fut) => result,
        _ = cancel.cancelled() => Err(Cancelled {
            operation: operation.to_string(),
        }
        .into()),
    }
}

/// Cancellable sleep. Returns `true` if the full duration elapsed, `false`
/// if the token fired first.
pub async fn delay(ms: u64, cancel: Option<&CancelToken>) -> bool {
    match cancel {
        None => {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            true
        }
        Some(token) => {
            if token.is_cancelled() {
                return false;
            }
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(ms)) => true,
                _ = token.cancelled() => false,
            }
        }
    }
}

/// Standalone rejecting timer: resolves to a [`TimeoutError`] after `ms`.
/// Intended for use inside `select!` arms.
pub async fn deadline(ms: u64, label: &str) -> TimeoutError {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    TimeoutError {
        operation: label.to_string(),
        timeout_ms: ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn with_timeout_passes_through_fast_results() {
        let out = with_timeout("fast", 1_000, async { Ok(42u32) }).await;
        assert_eq!(out.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn with_timeout_rejects_with_typed_error() {
        let out: anyhow::Result<()> = with_timeout("slow", 50, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .await;

        let err = out.unwrap_err();
        let timeout = err.downcast_ref::<TimeoutError>().expect("TimeoutError");
        assert_eq!(timeout.operation, "slow");
        assert_eq!(timeout.timeout_ms, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_token_rejects_immediately() {
        let token = CancelToken::new();
        token.cancel();

        let out: anyhow::Result<()> =
            with_timeout_cancellable("op", 60_000, &token, async { Ok(()) }).await;
        assert!(out.unwrap_err().downcast_ref::<Cancelled>().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn delay_is_interrupted_by_cancel() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { delay(60_000, Some(&token)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        assert!(!waiter.await.unwrap());
    }
}
