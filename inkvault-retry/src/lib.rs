//! Unified retry and backoff logic for Inkvault row store adapters
//!
//! Network adapters classify each failure as transient or permanent and hand
//! the operation to [`with_backoff`], which replays transient failures on an
//! exponential schedule until the policy's elapsed-time budget runs out.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Hard ceiling on attempts, independent of the elapsed-time budget
pub const MAX_ATTEMPTS: usize = 5;

/// Common retry error types
#[derive(Error, Debug)]
pub enum RetryError {
    #[error("Operation '{operation}' exceeded maximum retry attempts ({attempts}): {source}")]
    MaxRetriesExceeded {
        operation: &'static str,
        attempts: usize,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Transient error in '{operation}': {source}")]
    Transient {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Permanent error in '{operation}': {source}")]
    Permanent {
        operation: &'static str,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RetryError {
    /// Unwrap the underlying error regardless of classification
    pub fn into_source(self) -> Box<dyn std::error::Error + Send + Sync> {
        match self {
            RetryError::MaxRetriesExceeded { source, .. }
            | RetryError::Transient { source, .. }
            | RetryError::Permanent { source, .. } => source,
        }
    }
}

/// Result type for retry operations
pub type RetryResult<T> = std::result::Result<T, RetryError>;

/// Boxed future for retry operations
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = RetryResult<T>> + Send + 'a>>;

/// Execute an operation with exponential backoff retry logic
pub async fn with_backoff<F, T>(op_name: &'static str, f: F) -> RetryResult<T>
where
    F: FnMut(usize) -> BoxFuture<'static, T>,
{
    let policy = default_backoff_policy();
    with_custom_backoff(op_name, policy, f).await
}

/// Execute an operation with custom backoff policy
///
/// The closure receives the 1-based attempt number. Permanent errors are
/// returned immediately; transient errors are retried until the policy stops
/// yielding delays or [`MAX_ATTEMPTS`] is reached.
pub async fn with_custom_backoff<F, T>(
    op_name: &'static str,
    mut policy: ExponentialBackoff,
    mut f: F,
) -> RetryResult<T>
where
    F: FnMut(usize) -> BoxFuture<'static, T>,
{
    policy.reset();
    let mut attempt = 1;

    loop {
        debug!(operation = op_name, attempt, "Attempting operation");

        match f(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        operation = op_name,
                        attempts = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(result);
            }
            Err(err @ RetryError::Permanent { .. }) => {
                warn!(
                    operation = op_name,
                    attempt,
                    error = %err,
                    "Operation failed permanently"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = if attempt >= MAX_ATTEMPTS {
                    None
                } else {
                    policy.next_backoff()
                };

                let Some(delay) = delay else {
                    warn!(
                        operation = op_name,
                        attempts = attempt,
                        error = %err,
                        "Giving up on operation"
                    );
                    return Err(RetryError::MaxRetriesExceeded {
                        operation: op_name,
                        attempts: attempt,
                        source: err.into_source(),
                    });
                };

                warn!(
                    operation = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation failed, retrying"
                );

                attempt += 1;
                sleep(delay).await;
            }
        }
    }
}

#[cfg(feature = "async-rt")]
async fn sleep(delay: Duration) {
    tokio::time::sleep(delay).await;
}

#[cfg(not(feature = "async-rt"))]
async fn sleep(delay: Duration) {
    std::thread::sleep(delay);
}

/// Default backoff policy for general operations
pub fn default_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(100))
        .with_max_interval(Duration::from_secs(5))
        .with_max_elapsed_time(Some(Duration::from_secs(30)))
        .with_multiplier(2.0)
        .build()
}

/// Backoff policy for remote row store requests
pub fn row_store_backoff_policy() -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(500))
        .with_max_interval(Duration::from_secs(10))
        .with_max_elapsed_time(Some(Duration::from_secs(60)))
        .with_multiplier(1.5)
        .build()
}

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Wrap an error as transient or permanent according to its classification
pub fn classify<E>(operation: &'static str, err: E) -> RetryError
where
    E: RetryableError + std::error::Error + Send + Sync + 'static,
{
    if err.is_transient() {
        RetryError::Transient {
            operation,
            source: Box::new(err),
        }
    } else {
        RetryError::Permanent {
            operation,
            source: Box::new(err),
        }
    }
}

/// Helper macro for creating transient errors
#[macro_export]
macro_rules! transient_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Transient {
            operation: $op,
            source: Box::new($err),
        }
    };
}

/// Helper macro for creating permanent errors
#[macro_export]
macro_rules! permanent_error {
    ($op:expr, $err:expr) => {
        $crate::RetryError::Permanent {
            operation: $op,
            source: Box::new($err),
        }
    };
}
