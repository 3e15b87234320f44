//! Retry policy: decides backoff delays and drives bounded retries.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::app::budget::InvocationBudget;
use crate::domain::Retryable;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `base_delay * attempt`
    Linear,
    /// `base_delay * multiplier^(attempt - 1)`
    Exponential { multiplier: f64 },
}

/// Retry policy for remote and store calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,

    /// Base delay for the first retry.
    pub base_delay: Duration,

    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Dispatch retries: 3 attempts, 2s / 4s between them.
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Linear,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff: Backoff::Exponential { multiplier },
        }
    }

    /// Delay before the retry that follows failed attempt `attempts` (1-indexed).
    ///
    /// Example with base_delay=2s:
    /// - Linear: 2s, 4s, 6s
    /// - Exponential (x2): 2s, 4s, 8s
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let attempts = attempts.max(1);
        match self.backoff {
            Backoff::Linear => self.base_delay.saturating_mul(attempts),
            Backoff::Exponential { multiplier } => {
                let base_secs = self.base_delay.as_secs_f64();
                let delay_secs = base_secs * multiplier.powi((attempts - 1) as i32);
                Duration::try_from_secs_f64(delay_secs).unwrap_or(Duration::MAX)
            }
        }
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-indexed attempt number. The last error is returned.
    pub async fn run<T, E, F, Fut>(&self, what: &str, op: F) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.drive(what, None, op).await
    }

    /// Like [`run`](Self::run), but never sleeps past what is left of `budget`.
    pub async fn run_within<T, E, F, Fut>(
        &self,
        what: &str,
        budget: &InvocationBudget,
        op: F,
    ) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.drive(what, Some(budget), op).await
    }

    async fn drive<T, E, F, Fut>(
        &self,
        what: &str,
        budget: Option<&InvocationBudget>,
        mut op: F,
    ) -> Result<T, E>
    where
        E: Retryable + std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let delay = self.next_delay(attempt);
                    if let Some(budget) = budget
                        && budget.remaining() <= delay
                    {
                        warn!(
                            op = what,
                            attempt,
                            remaining_ms = budget.remaining().as_millis() as u64,
                            error = %err,
                            "budget exhausted, giving up"
                        );
                        return Err(err);
                    }
                    warn!(
                        op = what,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(3, Duration::from_secs(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RemoteError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn linear_backoff_grows_by_base() {
        let policy = RetryPolicy::linear(3, Duration::from_secs(2));
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(6));
    }

    #[test]
    fn exponential_backoff_increases() {
        let policy = RetryPolicy::exponential(5, Duration::from_secs(2), 2.0);
        assert_eq!(policy.next_delay(1), Duration::from_secs(2));
        assert_eq!(policy.next_delay(2), Duration::from_secs(4));
        assert_eq!(policy.next_delay(3), Duration::from_secs(8));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::linear(3, Duration::from_secs(1));

        let result: Result<u32, RemoteError> = policy
            .run("test", |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(RemoteError::from_status(503, "busy"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::linear(5, Duration::from_secs(1));

        let result: Result<(), RemoteError> = policy
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RemoteError::from_status(401, "bad token")) }
            })
            .await;

        assert!(matches!(result, Err(RemoteError::Unauthorized(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::linear(3, Duration::from_secs(1));

        let result: Result<(), RemoteError> = policy
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RemoteError::Transport("reset".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_stop_when_the_budget_cannot_cover_the_delay() {
        use crate::ports::FixedClock;
        use chrono::{TimeZone, Utc};
        use std::sync::Arc;

        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let budget = InvocationBudget::start(
            clock.clone(),
            Duration::from_secs(60),
            Duration::from_secs(10),
        );
        clock.advance(Duration::from_secs(49));
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::linear(3, Duration::from_secs(2));
        let started = tokio::time::Instant::now();

        let result: Result<(), RemoteError> = policy
            .run_within("test", &budget, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(RemoteError::Transport("reset".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
