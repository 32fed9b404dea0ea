//! Retry logic with exponential backoff
//!
//! Every stage that talks to the network goes through [`with_retry`]. It
//! implements exponential backoff with optional jitter, stops as soon as an
//! error is classified as permanent, and gives up early when shutdown is
//! requested instead of sleeping through the backoff.
//!
//! # Example
//!
//! ```no_run
//! use media_relay::retry::{IsRetryable, with_retry};
//! use media_relay::config::RetryConfig;
//! use tokio_util::sync::CancellationToken;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Transient,
//!     Permanent,
//! }
//!
//! impl std::fmt::Display for MyError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for MyError {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, MyError::Transient)
//!     }
//! }
//!
//! # async fn example() {
//! let config = RetryConfig::default();
//! let cancel = CancellationToken::new();
//! let result = with_retry(&config, &cancel, |_attempt, _err: &MyError| {}, || async {
//!     Ok::<_, MyError>(())
//! })
//! .await;
//! assert!(result.is_ok());
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{FetchError, UploadError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, server busy, connection reset) should return `true`.
/// Permanent failures (authentication failed, not found, corrupt data) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Network { .. } => true,
            FetchError::Io { source, .. } => is_transient_io(source),
            // Not found, integrity, client errors, space and tool failures
            // will not change on a second attempt
            FetchError::NotFound { .. }
            | FetchError::IntegrityMismatch { .. }
            | FetchError::HttpStatus { .. }
            | FetchError::InsufficientSpace { .. }
            | FetchError::Tool { .. } => false,
        }
    }
}

impl IsRetryable for UploadError {
    fn is_retryable(&self) -> bool {
        match self {
            UploadError::Network { .. } | UploadError::Unconfirmed { .. } => true,
            UploadError::Io { source, .. } => is_transient_io(source),
            UploadError::Auth { .. }
            | UploadError::QuotaExceeded { .. }
            | UploadError::Rejected { .. } => false,
        }
    }
}

fn is_transient_io(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::Interrupted
    )
}

/// Successful result together with the number of attempts it took
#[derive(Debug)]
pub struct Retried<T> {
    /// The operation's value
    pub value: T,
    /// Attempts made, including the successful one
    pub attempts: u32,
}

/// Why [`with_retry`] gave up
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// Permanent error, or the attempt budget ran out
    Failed {
        /// Last error returned by the operation
        error: E,
        /// Attempts made
        attempts: u32,
    },
    /// Shutdown was requested while a retry was pending
    Interrupted {
        /// Error that would have been retried
        last_error: E,
        /// Attempts made
        attempts: u32,
    },
}

impl<E> RetryFailure<E> {
    /// Attempts made before giving up
    pub fn attempts(&self) -> u32 {
        match self {
            RetryFailure::Failed { attempts, .. } | RetryFailure::Interrupted { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// # Arguments
///
/// * `config` - Retry configuration; `max_attempts` counts the first attempt
/// * `cancel` - Once tripped, no further attempt is started and a pending backoff ends early
/// * `on_retry` - Called with the failed attempt number (1-based) before each backoff
/// * `operation` - Async closure that returns `Result<T, E>` where `E` implements [`IsRetryable`]
pub async fn with_retry<F, Fut, T, E, R>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut on_retry: R,
    mut operation: F,
) -> Result<Retried<T>, RetryFailure<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
    R: FnMut(u32, &E),
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempts = attempt, "Operation succeeded after retry");
                }
                return Ok(Retried {
                    value,
                    attempts: attempt,
                });
            }
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                if cancel.is_cancelled() {
                    tracing::warn!(error = %e, attempt, "Shutdown requested, not retrying");
                    return Err(RetryFailure::Interrupted {
                        last_error: e,
                        attempts: attempt,
                    });
                }

                tracing::warn!(
                    error = %e,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );
                on_retry(attempt, &e);

                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };

                tokio::select! {
                    _ = tokio::time::sleep(jittered_delay) => {}
                    _ = cancel.cancelled() => {
                        tracing::warn!(error = %e, attempt, "Shutdown requested during backoff");
                        return Err(RetryFailure::Interrupted {
                            last_error: e,
                            attempts: attempt,
                        });
                    }
                }

                // Overflowing or NaN products saturate at the cap
                let next_delay =
                    Duration::try_from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier)
                        .unwrap_or(config.max_delay);
                delay = next_delay.min(config.max_delay);
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(RetryFailure::Failed {
                    error: e,
                    attempts: attempt,
                });
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// actual delay lands between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Transient => write!(f, "transient error"),
                TestError::Permanent => write!(f, "permanent error"),
            }
        }
    }

    impl IsRetryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_success_no_retry() {
        let config = RetryConfig::default();
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&config, &cancel, |_, _: &TestError| {}, || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(42)
            }
        })
        .await
        .unwrap();

        assert_eq!(result.value, 42);
        assert_eq!(result.attempts, 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1, "should only call once");
    }

    #[tokio::test]
    async fn test_overflowing_multiplier_saturates_at_max_delay() {
        let config = RetryConfig {
            max_attempts: 4,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 1e300,
            jitter: false,
        };
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&config, &cancel, |_, _: &TestError| {}, || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(TestError::Transient)
            }
        })
        .await;

        match result {
            Err(RetryFailure::Failed { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("expected exhausted retries, got {other:?}"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_transient_then_succeed() {
        let config = fast_config(3);
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let mut retried = Vec::new();

        let result = with_retry(
            &config,
            &cancel,
            |attempt, _: &TestError| retried.push(attempt),
            || {
                let counter = counter_clone.clone();
                async move {
                    let count = counter.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err(TestError::Transient)
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result.value, 42);
        assert_eq!(result.attempts, 3);
        assert_eq!(retried, vec![1, 2], "observer sees each failed attempt");
    }

    #[tokio::test]
    async fn test_max_attempts_counts_the_first_attempt() {
        let config = fast_config(2);
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&config, &cancel, |_, _: &TestError| {}, || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError::Transient)
            }
        })
        .await;

        match result {
            Err(RetryFailure::Failed { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected exhausted failure, got {other:?}"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_no_retry() {
        let config = RetryConfig::default();
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&config, &cancel, |_, _: &TestError| {}, || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError::Permanent)
            }
        })
        .await;

        assert!(matches!(result, Err(RetryFailure::Failed { attempts: 1, .. })));
        assert_eq!(
            counter.load(Ordering::SeqCst),
            1,
            "should not retry permanent error"
        );
    }

    #[tokio::test]
    async fn test_exponential_backoff() {
        let config = fast_config(4);
        let cancel = CancellationToken::new();
        let start = std::time::Instant::now();

        let _ = with_retry(&config, &cancel, |_, _: &TestError| {}, || async {
            Err::<i32, _>(TestError::Transient)
        })
        .await;

        let elapsed = start.elapsed();

        // 10ms + 20ms + 40ms between four attempts
        assert!(
            elapsed >= Duration::from_millis(70),
            "should wait at least 70ms, waited {elapsed:?}"
        );
        assert!(
            elapsed < Duration::from_secs(2),
            "should not wait too long, waited {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let config = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = std::time::Instant::now();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&config, &cancel, |_, _: &TestError| {}, || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError::Transient)
            }
        })
        .await;

        assert!(matches!(
            result,
            Err(RetryFailure::Interrupted { attempts: 1, .. })
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 1, "no attempt after cancel");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_already_cancelled_token_stops_before_second_attempt() {
        let config = fast_config(5);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = with_retry(&config, &cancel, |_, _: &TestError| {}, || async {
            Err::<i32, _>(TestError::Transient)
        })
        .await;

        assert_eq!(result.unwrap_err().attempts(), 1);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let delay = Duration::from_millis(100);
        for _ in 0..20 {
            let jittered = add_jitter(delay);
            assert!(jittered >= delay);
            assert!(jittered <= delay * 2);
        }
    }

    #[test]
    fn fetch_errors_are_classified() {
        let network = FetchError::Network {
            url: "https://example.com/a".into(),
            reason: "connection reset".into(),
        };
        let not_found = FetchError::NotFound {
            url: "https://example.com/a".into(),
            reason: "HTTP 404".into(),
        };
        let integrity = FetchError::IntegrityMismatch {
            url: "https://example.com/a".into(),
            expected: "1".into(),
            actual: "2".into(),
        };
        let client = FetchError::HttpStatus {
            url: "https://example.com/a".into(),
            status: 400,
        };

        assert!(network.is_retryable());
        assert!(!not_found.is_retryable());
        assert!(!integrity.is_retryable());
        assert!(!client.is_retryable());
    }

    #[test]
    fn upload_errors_are_classified() {
        let key = "pdfs/a.pdf".to_string();
        assert!(
            UploadError::Network {
                key: key.clone(),
                reason: "503".into()
            }
            .is_retryable()
        );
        assert!(
            UploadError::Unconfirmed {
                key: key.clone(),
                reason: "size".into()
            }
            .is_retryable()
        );
        assert!(
            !UploadError::Auth {
                key: key.clone(),
                reason: "AccessDenied".into()
            }
            .is_retryable()
        );
        assert!(
            !UploadError::QuotaExceeded {
                key,
                reason: "507".into()
            }
            .is_retryable()
        );
    }
}
