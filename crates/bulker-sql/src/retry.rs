//! Retry with exponential backoff for transient backend failures.
//!
//! Only errors whose classification recommends a retry are re-attempted
//! here; everything else surfaces immediately to the state machine. Backoff
//! uses full jitter: a random delay between zero and the capped exponential
//! bound, which spreads concurrent retries instead of synchronizing them.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use bulker_core::error::{Recommendation, Result};

/// Retry policy for adapter I/O.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Base delay doubled per attempt.
    pub base: Duration,
    /// Upper bound on the computed delay.
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Returns the full-jitter delay for a zero-based attempt index.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap);
        let millis = u64::try_from(exp.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
    }
}

/// Runs `op` until it succeeds, its error stops recommending a retry, or the
/// policy's attempts are exhausted.
///
/// # Errors
///
/// Returns the final error once retries are exhausted or the error is not
/// retryable.
pub async fn with_retries<T, F, Fut>(policy: RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                let retryable = err.recommendation() == Recommendation::Retry;
                if !retryable || attempt >= policy.max_attempts {
                    return Err(err);
                }
                let delay = policy.delay(attempt - 1);
                tracing::debug!(
                    op = op_name,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "retrying transient failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulker_core::error::{Error, ErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
            cap: Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let result = with_retries(fast_policy(), "test", move || async move {
            if calls_ref.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::backend(ErrorKind::Transient, "flaky"))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn surfaces_non_retryable_immediately() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let result: Result<()> = with_retries(fast_policy(), "test", move || async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            Err(Error::backend(ErrorKind::Syntax, "bad statement"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let calls_ref = &calls;
        let result: Result<()> = with_retries(fast_policy(), "test", move || async move {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            Err(Error::backend(ErrorKind::Connection, "down"))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base: Duration::from_secs(10),
            cap: Duration::from_secs(1),
        };
        for attempt in 0..10 {
            assert!(policy.delay(attempt) <= Duration::from_secs(1));
        }
    }
}
