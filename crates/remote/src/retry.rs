//! Retry with exponential backoff for transient remote failures

use crate::config::RetryConfig;
use crate::error::{RemoteError, Result};
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder, backoff::Backoff};
use std::time::Duration;
use tracing::{debug, warn};

/// Retry a fallible async operation with exponential backoff.
///
/// Only errors for which [`RemoteError::is_retryable`] holds are retried.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut backoff = create_backoff(config);
    let mut attempts = 0;

    loop {
        attempts += 1;

        let err = match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => err,
        };

        if !err.is_retryable() {
            debug!(operation = operation_name, error = %err, "Error is not retryable");
            return Err(err);
        }

        if attempts >= config.max_attempts {
            warn!(
                operation = operation_name,
                attempts,
                error = %err,
                "Operation failed after maximum retries"
            );
            return Err(RemoteError::retry_exhausted(operation_name, attempts, err));
        }

        let Some(delay) = backoff.next_backoff() else {
            return Err(RemoteError::retry_exhausted(operation_name, attempts, err));
        };
        warn!(
            operation = operation_name,
            attempts,
            error = %err,
            retry_in_ms = delay.as_millis(),
            "Operation failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

fn create_backoff(config: &RetryConfig) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(config.initial_backoff_ms))
        .with_max_interval(Duration::from_millis(config.max_backoff_ms))
        .with_multiplier(config.backoff_multiplier)
        .with_max_elapsed_time(None)
        .build()
}
