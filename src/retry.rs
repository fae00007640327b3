//! Bounded retry for durable-storage and upstream operations
//!
//! Every backend call passes through [`retry_n`]. Transient failure classes
//! (HTTP 429/5xx, transport timeouts) are retried after a fixed nap; terminal
//! errors such as not-found surface on the first attempt.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Default number of attempts per operation
pub const DEFAULT_MAX_ATTEMPTS: usize = 5;

/// Default nap between attempts
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Configuration
// =============================================================================

/// Retry policy applied to backend operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one
    pub max_attempts: usize,

    /// Nap before each retry
    pub interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

impl RetryPolicy {
    /// Run `f` under this policy, classifying errors with
    /// [`Error::is_retryable`].
    pub async fn run<T, F, Fut>(&self, cx: &CancellationToken, operation: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        retry_n(
            cx,
            operation,
            f,
            Error::is_retryable,
            self.interval,
            self.max_attempts,
        )
        .await
    }
}

// =============================================================================
// Retry Loop
// =============================================================================

/// Execute `f` up to `max_attempts` times.
///
/// Cancellation is observed before each attempt, while an attempt is in
/// flight, and during the nap between attempts. Returns the last error when
/// attempts are exhausted or the token fires mid-wait.
pub async fn retry_n<T, F, Fut, R>(
    cx: &CancellationToken,
    operation: &str,
    mut f: F,
    is_retryable: R,
    interval: Duration,
    max_attempts: usize,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: Fn(&Error) -> bool,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if cx.is_cancelled() {
            return Err(Error::Cancelled);
        }
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cx.cancelled() => return Err(Error::Cancelled),
            outcome = f() => outcome,
        };

        let err = match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err,
        };

        if !is_retryable(&err) {
            return Err(err);
        }
        if attempt >= max_attempts {
            warn!(operation, attempt, error = %err, "Operation failed after maximum retries");
            return Err(err);
        }

        debug!(
            operation,
            attempt,
            error = %err,
            retry_in_ms = interval.as_millis() as u64,
            "Operation failed, retrying"
        );

        tokio::select! {
            _ = cx.cancelled() => return Err(err),
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
