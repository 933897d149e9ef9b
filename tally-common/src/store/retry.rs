//! Retry with exponential backoff for transient store failures
//!
//! Only errors classified by [`Error::is_transient`] are retried. Anything else
//! (missing records, bad input) fails on the first attempt.

use std::future::Future;
use std::time::{Duration, Instant};

use crate::{Error, Result};

/// Retry `operation` until it succeeds, fails permanently, or `max_wait_ms`
/// has elapsed.
///
/// Backoff starts at 10ms, doubles per attempt and is capped at 1000ms. When
/// the budget runs out the last transient error is returned unchanged, so the
/// caller can still classify it.
pub async fn retry_transient<F, Fut, T>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start_time = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt = 0u32;
    let mut backoff_ms = 10u64;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Store operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                let elapsed = start_time.elapsed();
                if elapsed >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = elapsed.as_millis() as u64,
                        max_wait_ms,
                        error = %err,
                        "Store operation failed: retry budget exhausted"
                    );
                    return Err(err);
                }

                let remaining = max_duration.saturating_sub(elapsed);
                let sleep_for = Duration::from_millis(backoff_ms.min(1000)).min(remaining);

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms = sleep_for.as_millis() as u64,
                    error = %err,
                    "Transient store failure, will retry after backoff"
                );

                tokio::time::sleep(sleep_for).await;
                backoff_ms = (backoff_ms * 2).min(1000);
            }
        }
    }
}

/// Convenience for building a transient error in tests and fakes
pub fn transient(operation: &'static str) -> Error {
    Error::Timeout {
        operation,
        timeout_ms: 0,
    }
}
