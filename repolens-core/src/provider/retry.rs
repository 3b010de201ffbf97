//! Backoff-retry combinator for provider calls
//!
//! One policy applied uniformly to both provider implementations: a fixed
//! attempt ceiling with exponential delays capped at 30 seconds, so a single
//! job's AI call path is bounded at roughly 1-2 minutes worst case before
//! the last error propagates.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;

/// Retry policy: attempt ceiling and delay curve.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failure; doubles each subsequent failure
    pub base_delay: Duration,
    /// Delay ceiling
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay after a failure of the given zero-based attempt:
    /// `min(base * 2^attempt, max)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2_u32.saturating_pow(attempt))
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds, a non-retryable error surfaces, or the
/// attempt ceiling is reached (in which case the last error propagates).
///
/// `retryable` decides which errors are worth another attempt; pass
/// [`Error::is_retryable`] unless a caller needs something stricter.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    retryable: impl Fn(&Error) -> bool,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;

    for attempt in 0..policy.max_attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !retryable(&e) => return Err(e),
            Err(e) => {
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "Provider call failed"
                );
                let delay = policy.delay_for(attempt);
                last_error = Some(e);
                if attempt + 1 < policy.max_attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    Err(last_error.expect("with_backoff ran at least one attempt"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(4_000));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limits_then_succeeds() {
        let attempts = Cell::new(0_u32);
        let start = tokio::time::Instant::now();

        let result = with_backoff(&RetryPolicy::default(), Error::is_retryable, || {
            attempts.set(attempts.get() + 1);
            let n = attempts.get();
            async move {
                if n <= 2 {
                    Err(Error::ProviderRateLimited("429".to_string()))
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, "done");
        assert_eq!(attempts.get(), 3);
        // Paused clock: elapsed is exactly the backoff sleeps (1s + 2s)
        assert_eq!(start.elapsed(), Duration::from_millis(3_000));
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_propagates_last_error() {
        let attempts = Cell::new(0_u32);

        let result: Result<()> = with_backoff(&RetryPolicy::default(), Error::is_retryable, || {
            attempts.set(attempts.get() + 1);
            async {
                Err(Error::Provider {
                    status: Some(503),
                    message: "overloaded".to_string(),
                })
            }
        })
        .await;

        assert_eq!(attempts.get(), 3);
        assert!(matches!(
            result,
            Err(Error::Provider {
                status: Some(503),
                ..
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_surface_immediately() {
        let attempts = Cell::new(0_u32);
        let start = tokio::time::Instant::now();

        let result: Result<()> = with_backoff(&RetryPolicy::default(), Error::is_retryable, || {
            attempts.set(attempts.get() + 1);
            async { Err(Error::PaymentRequired("out of credits".to_string())) }
        })
        .await;

        assert_eq!(attempts.get(), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(matches!(result, Err(Error::PaymentRequired(_))));
    }
}
