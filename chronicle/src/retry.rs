//! Bounded retry for commands that lose an optimistic-concurrency race.
//!
//! A conflicted command is expected to reload its write model and try again;
//! this module owns the policy side: how often, with what backoff, and which
//! errors qualify. Jitter keeps two writers that collided once from
//! colliding again on the same schedule.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::{CommandError, CommandResult};

/// Backoff policy for [`retry_command`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    /// Total attempts, including the first. At least one attempt is always
    /// made.
    pub max_attempts: u32,
    /// Delay before the first retry, before jitter.
    pub base_delay: Duration,
    /// Upper bound on the delay, before jitter.
    pub max_delay: Duration,
    /// Growth factor applied per retry.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before the retry following attempt number `attempt` (1-based),
    /// jittered by up to a quarter in either direction.
    fn delay_after(&self, attempt: u32) -> Duration {
        let mut delay = self.base_delay;
        for _ in 1..attempt {
            if delay >= self.max_delay {
                break;
            }
            delay = delay.mul_f64(self.multiplier);
        }
        let jitter = rand::rng().random_range(0.75..=1.25);
        delay.min(self.max_delay).mul_f64(jitter)
    }
}

/// Runs `operation` until it succeeds, fails terminally, or the attempt
/// budget runs out.
///
/// `operation` is called fresh for every attempt and must rebuild its view
/// of the world each time; retrying with a stale write model would only
/// conflict again. Only errors whose [`CommandError::is_retryable`] is true
/// are retried.
///
/// # Errors
///
/// The terminal error as-is, or [`CommandError::RetriesExhausted`] wrapping
/// the last retryable error once the budget is spent.
pub async fn retry_command<T, F, Fut>(config: &RetryConfig, mut operation: F) -> CommandResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CommandResult<T>>,
{
    let mut attempt: u32 = 1;
    loop {
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        if !error.is_retryable() {
            return Err(error);
        }
        if attempt >= config.max_attempts {
            return Err(CommandError::RetriesExhausted {
                attempts: attempt,
                last: Box::new(error),
            });
        }
        let delay = config.delay_after(attempt);
        debug!(attempt, ?delay, %error, "command conflicted, retrying");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::EventStoreError;

    fn conflict() -> CommandError {
        CommandError::EventStore(EventStoreError::Storage("connection reset".to_owned()))
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_needs_no_retry() {
        let calls = AtomicU32::new(0);
        let result = retry_command(&RetryConfig::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, CommandError>("done") }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_error_is_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = retry_command(&RetryConfig::default(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(conflict())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_error_short_circuits() {
        let calls = AtomicU32::new(0);
        let result: CommandResult<()> = retry_command(&RetryConfig::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CommandError::NotFound("user u-1".to_owned())) }
        })
        .await;
        assert!(matches!(result, Err(CommandError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_reports_attempt_count() {
        let calls = AtomicU32::new(0);
        let result: CommandResult<()> = retry_command(&RetryConfig::default(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(conflict()) }
        })
        .await;
        match result {
            Err(CommandError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert!(last.is_retryable());
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn backoff_grows_and_is_capped() {
        let config = RetryConfig::default();

        let first = config.delay_after(1);
        assert!(first >= Duration::from_millis(75), "got {first:?}");
        assert!(first <= Duration::from_millis(125), "got {first:?}");

        let tenth = config.delay_after(10);
        assert!(tenth <= Duration::from_millis(1250), "got {tenth:?}");
        assert!(tenth >= Duration::from_millis(750), "got {tenth:?}");
    }
}
