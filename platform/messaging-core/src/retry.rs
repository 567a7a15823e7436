//! Redelivery backoff and application-level retry
//!
//! [`RetryConfig`] paces the subscriber between redeliveries of a message
//! whose handler failed. [`retry_with_backoff`] is offered to applications
//! that decide to retry an operation themselves (connecting, or re-sending
//! an already built envelope); this crate never retries a send on its own.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Capped exponential backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts for [`retry_with_backoff`]
    pub max_attempts: u32,
    /// Delay after the first failure (doubles on each further failure)
    pub initial_backoff: Duration,
    /// Upper bound for the delay
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after `failures` consecutive failures (1-based).
    pub fn backoff_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .map_or(self.max_backoff, |delay| delay.min(self.max_backoff))
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` is used up,
/// sleeping [`RetryConfig::backoff_for`] between attempts.
///
/// The last error is returned unchanged. `context` only labels the log lines.
///
/// ```rust
/// use messaging_core::retry::{retry_with_backoff, RetryConfig};
///
/// # async fn connect_with_retry(publisher: &messaging_core::Publisher)
/// #     -> messaging_core::MessagingResult<()> {
/// retry_with_backoff(|| publisher.connect(), &RetryConfig::default(), "publisher_connect").await
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(context = %context, attempt, "Recovered after retry");
                }
                return Ok(result);
            }
            Err(e) if attempt >= config.max_attempts => {
                warn!(
                    context = %context,
                    attempts = attempt,
                    error = %e,
                    "Giving up"
                );
                return Err(e);
            }
            Err(e) => {
                let backoff = config.backoff_for(attempt);
                warn!(
                    context = %context,
                    attempt,
                    of = config.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Attempt failed, backing off"
                );
                sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = fast_config(5);
        assert_eq!(config.backoff_for(0), Duration::ZERO);
        assert_eq!(config.backoff_for(1), Duration::from_millis(10));
        assert_eq!(config.backoff_for(2), Duration::from_millis(20));
        assert_eq!(config.backoff_for(3), Duration::from_millis(40));
        assert_eq!(config.backoff_for(4), Duration::from_millis(50));
        assert_eq!(config.backoff_for(200), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_success_needs_no_backoff() {
        let start = tokio::time::Instant::now();
        let value = retry_with_backoff(|| async { Ok::<_, String>(7) }, &fast_config(3), "test").await;
        assert_eq!(value, Ok(7));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_third_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));

        let result = retry_with_backoff(
            || {
                let attempts = attempts.clone();
                async move {
                    let count = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if count < 3 {
                        Err(format!("attempt {count}"))
                    } else {
                        Ok(count)
                    }
                }
            },
            &fast_config(5),
            "test",
        )
        .await;

        assert_eq!(result, Ok(3));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_attempts_return_last_error() {
        let attempts = Arc::new(AtomicU32::new(0));
        let start = tokio::time::Instant::now();

        let result = retry_with_backoff(
            || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("broker unreachable")
                }
            },
            &fast_config(4),
            "test",
        )
        .await;

        assert_eq!(result, Err("broker unreachable"));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        // 10ms + 20ms + 40ms between the four attempts
        assert!(start.elapsed() >= Duration::from_millis(70));
    }
}
