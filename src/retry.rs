//! Failure classification and retry with exponential backoff
//!
//! Per-file failures are classified through [`IsRetryable`]: transient
//! failures (backend down, timeouts, connection resets) are eligible for
//! `retry_failed_files`, permanent ones (unsupported type, size limit,
//! validation) are not. [`with_retry`] wraps internal operations that should
//! be retried automatically, such as flushing queued notifications.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::{Error, StorageError, TransportError};

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (backend unavailable, timeout, connection reset) should
/// return `true`. Permanent failures (unsupported type, size limit exceeded,
/// validation) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

/// Whether an unclassified error message looks transient
///
/// Used for `StorageError::Other` where the backend gave us only a string.
pub(crate) fn message_looks_transient(msg: &str) -> bool {
    let msg = msg.to_ascii_lowercase();
    msg.contains("timeout")
        || msg.contains("timed out")
        || msg.contains("network")
        || msg.contains("connection")
        || msg.contains("temporar")
        || msg.contains("unavailable")
        || msg.contains("503")
}

impl IsRetryable for StorageError {
    fn is_retryable(&self) -> bool {
        match self {
            // Backend down, timeouts, and I/O failures are transient
            StorageError::Unavailable(_) | StorageError::Timeout(_) | StorageError::Io(_) => true,
            // Rejections by the backend are permanent
            StorageError::UnsupportedType(_)
            | StorageError::TooLarge { .. }
            | StorageError::Validation(_) => false,
            // Unclassified errors fall back to message patterns
            StorageError::Other(msg) => message_looks_transient(msg),
        }
    }
}

impl IsRetryable for TransportError {
    fn is_retryable(&self) -> bool {
        match self {
            TransportError::Unavailable(_) => true,
            TransportError::SendFailed { .. } => true,
            // Membership changes are caller-driven, not retried automatically
            TransportError::Membership(_) => false,
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Storage(e) => e.is_retryable(),
            Error::Transport(e) => e.is_retryable(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // State, config, and not-found errors are permanent
            Error::Batch(_)
            | Error::Subscription(_)
            | Error::Persistence(_)
            | Error::Config { .. }
            | Error::Serialization(_)
            | Error::ShuttingDown
            | Error::Other(_) => false,
        }
    }
}

/// Exponential backoff parameters for [`with_retry`]
#[derive(Clone, Debug)]
pub struct Backoff {
    /// Maximum number of retry attempts (default: 5)
    pub max_attempts: u32,

    /// Delay before the first retry (default: 1 second)
    pub initial_delay: Duration,

    /// Ceiling for the delay between retries (default: 60 seconds)
    pub max_delay: Duration,

    /// Multiplier applied after each attempt (default: 2.0)
    pub multiplier: f64,

    /// Add random jitter to delays (default: true)
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// Retries only while the error reports itself as retryable and attempts
/// remain; returns the last error otherwise.
pub async fn with_retry<F, Fut, T, E>(backoff: &Backoff, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = backoff.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < backoff.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = backoff.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                let jittered = if backoff.jitter { add_jitter(delay) } else { delay };
                tokio::time::sleep(jittered).await;

                let next = Duration::from_secs_f64(delay.as_secs_f64() * backoff.multiplier);
                delay = next.min(backoff.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// actual delay falls between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64);
    delay + Duration::from_millis(jitter_ms)
}
