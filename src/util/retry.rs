//! Exponential backoff retry with jitter and a total-time budget.

use std::future::Future;
use std::time::Instant;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{classify, ErrorClass};
use crate::util::timeout::{delay, CancelToken};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Delay is multiplied by a draw from `[1 - jitter, 1 + jitter]`.
    pub jitter_factor: f64,
    /// Overall budget. When it elapses mid-sleep the last error is returned
    /// without another attempt.
    pub max_time_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.25,
            max_time_ms: None,
        }
    }
}

impl RetryPolicy {
    /// Policy used for chain RPC submissions.
    pub fn rpc() -> Self {
        Self {
            max_attempts: 4,
            initial_delay_ms: 1_000,
            max_delay_ms: 8_000,
            ..Self::default()
        }
    }

    /// Un-jittered delay before attempt `k + 1` (`k` is 0-indexed).
    pub fn base_delay_ms(&self, k: u32) -> u64 {
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(k as i32);
        raw.min(self.max_delay_ms as f64) as u64
    }

    fn jittered_delay_ms(&self, k: u32) -> u64 {
        let base = self.base_delay_ms(k) as f64;
        if self.jitter_factor <= 0.0 {
            return base as u64;
        }
        let factor = rand::thread_rng()
            .gen_range(1.0 - self.jitter_factor..=1.0 + self.jitter_factor);
        (base * factor) as u64
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: Option<T>,
    pub error: Option<anyhow::Error>,
    pub attempts: u32,
    pub total_time_ms: u64,
}

impl<T> RetryOutcome<T> {
    pub fn success(&self) -> bool {
        self.value.is_some()
    }

    pub fn into_result(self) -> anyhow::Result<T> {
        match self.value {
            Some(v) => Ok(v),
            None => Err(self
                .error
                .unwrap_or_else(|| anyhow::anyhow!("retry exhausted without error detail"))),
        }
    }
}

/// Default retry predicate: transient errors always retry, unknown errors
/// retry once, fatal errors never.
fn default_should_retry(err: &anyhow::Error, failures_so_far: u32) -> bool {
    match classify(err) {
        ErrorClass::Retryable => true,
        ErrorClass::Fatal => false,
        ErrorClass::Unknown => failures_so_far <= 1,
    }
}

/// Runs `op` until it succeeds, the attempt budget is spent, the time budget
/// elapses, or a non-retryable error is observed.
pub async fn with_retry<T, F, Fut>(name: &str, policy: &RetryPolicy, op: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    with_retry_classified(name, policy, None, op, default_should_retry, |_, _, _| {}).await
}

/// Full-control variant: custom retry predicate (receives the error and the
/// number of failures so far) and an `on_retry` hook invoked before each
/// sleep with `(error, attempt, delay_ms)`.
pub async fn with_retry_classified<T, F, Fut, P, H>(
    name: &str,
    policy: &RetryPolicy,
    cancel: Option<&CancelToken>,
    mut op: F,
    should_retry: P,
    mut on_retry: H,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
    P: Fn(&anyhow::Error, u32) -> bool,
    H: FnMut(&anyhow::Error, u32, u64),
{
    let started = Instant::now();
    let mut attempts = 0u32;
    let mut last_error: Option<anyhow::Error> = None;

    while attempts < policy.max_attempts {
        attempts += 1;
        match op().await {
            Ok(value) => {
                return RetryOutcome {
                    value: Some(value),
                    error: None,
                    attempts,
                    total_time_ms: started.elapsed().as_millis() as u64,
                };
            }
            Err(err) => {
                let retry = attempts < policy.max_attempts && should_retry(&err, attempts);
                if !retry {
                    debug!(op = name, attempts, err = %err, "giving up");
                    last_error = Some(err);
                    break;
                }

                let delay_ms = policy.jittered_delay_ms(attempts - 1);

                // Time budget: never start a sleep that outlives it.
                if let Some(budget) = policy.max_time_ms {
                    let elapsed = started.elapsed().as_millis() as u64;
                    let remaining = budget.saturating_sub(elapsed);
                    if remaining == 0 || delay_ms >= remaining {
                        warn!(op = name, attempts, budget, "retry budget exhausted");
                        delay(remaining.min(delay_ms), cancel).await;
                        last_error = Some(err);
                        break;
                    }
                }

                warn!(op = name, attempt = attempts, delay_ms, err = %err, "retrying");
                on_retry(&err, attempts, delay_ms);
                if !delay(delay_ms, cancel).await {
                    last_error = Some(err);
                    break;
                }
                last_error = Some(err);
            }
        }
    }

    RetryOutcome {
        value: None,
        error: last_error,
        attempts,
        total_time_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn zero_jitter(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            max_time_ms: None,
        }
    }

    #[test]
    fn backoff_sequence_is_capped() {
        // initial=1000, mult=2, max=2000 -> 1000, 2000, 2000, 2000
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 1_000,
            max_delay_ms: 2_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            max_time_ms: None,
        };
        let delays: Vec<u64> = (0..4).map(|k| policy.base_delay_ms(k)).collect();
        assert_eq!(delays, vec![1_000, 2_000, 2_000, 2_000]);
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_success_needs_no_retry() {
        let out = with_retry("ok", &zero_jitter(3), || async { Ok(7u64) }).await;
        assert!(out.success());
        assert_eq!(out.attempts, 1);
        assert_eq!(out.value.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let out: RetryOutcome<()> = with_retry("fatal", &zero_jitter(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow!("custom program error: 0x0")) }
        })
        .await;
        assert!(!out.success());
        assert_eq!(out.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_use_every_attempt() {
        let calls = AtomicU32::new(0);
        let out: RetryOutcome<()> = with_retry("transient", &zero_jitter(4), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow!("429 too many requests")) }
        })
        .await;
        assert!(!out.success());
        assert_eq!(out.attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_errors_retry_exactly_once() {
        let calls = AtomicU32::new(0);
        let out: RetryOutcome<()> = with_retry("unknown", &zero_jitter(5), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow!("novel failure mode")) }
        })
        .await;
        assert!(!out.success());
        assert_eq!(out.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn time_budget_bounds_the_run() {
        let policy = RetryPolicy {
            max_attempts: 100,
            initial_delay_ms: 50,
            max_delay_ms: 50,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
            max_time_ms: Some(120),
        };
        let out: RetryOutcome<()> =
            with_retry("budget", &policy, || async { Err(anyhow!("timed out")) }).await;
        assert!(!out.success());
        // 100 attempts were allowed but the 120ms budget cuts it off early.
        assert!(out.attempts < 100, "attempts = {}", out.attempts);
        assert!(out.error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn on_retry_hook_sees_each_sleep() {
        let hook_calls = AtomicU32::new(0);
        let _: RetryOutcome<()> = with_retry_classified(
            "hook",
            &zero_jitter(3),
            None,
            || async { Err(anyhow!("node is behind")) },
            |_, _| true,
            |_, _, _| {
                hook_calls.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;
        // 3 attempts -> 2 sleeps between them.
        assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
    }
}
