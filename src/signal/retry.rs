//! Retry with exponential backoff.
//!
//! Used for idempotent HTTP calls to the chat service (pre-key upload).
//! Only transient failures are retried; the caller decides which those are.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Bounded exponential backoff: `base * 2^n`, capped at `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Retry `operation` under `policy`.
///
/// Returns the first success, the first non-retryable error, or the last
/// error once retries are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: RetryPolicy,
    mut operation: F,
    is_retryable: fn(&E) -> bool,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !is_retryable(&err) || attempt >= policy.max_retries {
                    return Err(err);
                }

                let backoff = policy.backoff(attempt);
                warn!(
                    "Attempt {} failed ({}), retrying in {:?}",
                    attempt + 1,
                    err,
                    backoff
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Network failures and 5xx responses are transient.
pub fn is_signal_error_retryable(err: &crate::signal::traits::SignalError) -> bool {
    use crate::signal::traits::SignalError;
    match err {
        SignalError::Network(_) => true,
        SignalError::Http { status, .. } => *status >= 500 || *status == 429,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::traits::SignalError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_immediately() {
        let result = retry_with_backoff(
            fast(),
            || async { Ok::<_, SignalError>(42) },
            is_signal_error_retryable,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt_clone = attempt.clone();

        let result = retry_with_backoff(
            fast(),
            move || {
                let attempt = attempt_clone.clone();
                async move {
                    let count = attempt.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err(SignalError::Network("transient".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            },
            is_signal_error_retryable,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_non_retryable_error_fails_immediately() {
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt_clone = attempt.clone();

        let result = retry_with_backoff(
            fast(),
            move || {
                let attempt = attempt_clone.clone();
                async move {
                    attempt.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>(SignalError::Protocol("bad request".to_string()))
                }
            },
            is_signal_error_retryable,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(attempt.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_max_retries() {
        let attempt = Arc::new(AtomicU32::new(0));
        let attempt_clone = attempt.clone();

        let result = retry_with_backoff(
            fast(),
            move || {
                let attempt = attempt_clone.clone();
                async move {
                    attempt.fetch_add(1, Ordering::SeqCst);
                    Err::<i32, _>(SignalError::Network("down".to_string()))
                }
            },
            is_signal_error_retryable,
        )
        .await;

        assert_eq!(result, Err(SignalError::Network("down".to_string())));
        assert_eq!(attempt.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_backoff_calculation() {
        let policy = RetryPolicy {
            max_retries: 12,
            base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(3600),
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(10), Duration::from_secs(1024));
        assert_eq!(policy.backoff(12), Duration::from_secs(3600));
        assert_eq!(policy.backoff(40), Duration::from_secs(3600));
    }

    #[test]
    fn test_is_signal_error_retryable() {
        assert!(is_signal_error_retryable(&SignalError::Network(
            "timeout".to_string()
        )));
        assert!(is_signal_error_retryable(&SignalError::Http {
            status: 503,
            message: "Service Unavailable".to_string()
        }));
        assert!(!is_signal_error_retryable(&SignalError::Http {
            status: 401,
            message: "Unauthorized".to_string()
        }));
        assert!(!is_signal_error_retryable(&SignalError::Protocol(
            "bad request".to_string()
        )));
        assert!(!is_signal_error_retryable(&SignalError::Unauthorized));
    }
}
