use std::time::Duration;

use config::shared::RetryConfig;
use rand::Rng;
use tracing::warn;

use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::sync_error;

/// How a failed operation is handled.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryDirective {
    /// The failure is transient and the operation is retried with backoff.
    Retry,
    /// The target rejected the data, the row becomes a conflict.
    Conflict,
    /// Retrying cannot help.
    Fatal,
}

/// Decides in one place how an error raised while reading or writing rows is handled.
pub fn build_error_handling_policy(error: &SyncError) -> RetryDirective {
    match error.kind() {
        ErrorKind::SourceConnectionFailed
        | ErrorKind::TargetConnectionFailed
        | ErrorKind::StateStoreConnectionFailed
        | ErrorKind::SourceQueryFailed
        | ErrorKind::TargetQueryFailed
        | ErrorKind::StateStoreQueryFailed => RetryDirective::Retry,

        ErrorKind::ConstraintViolation => RetryDirective::Conflict,

        _ => RetryDirective::Fatal,
    }
}

/// Exponential backoff with jitter bounded by a [`RetryConfig`].
#[derive(Debug)]
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
    delay: Duration,
    max_delay: Duration,
}

impl Backoff {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            attempt: 1,
            max_attempts: config.max_attempts,
            delay: config.initial_delay(),
            max_delay: config.max_delay(),
        }
    }

    /// Sleeps before the next attempt if `error` is transient and attempts remain, otherwise
    /// returns the error that ends the operation.
    ///
    /// Transient failures that run out of attempts surface as [`ErrorKind::RetryExhausted`],
    /// except connection failures which keep their kind so callers can tell an unreachable
    /// database from a failing row.
    pub async fn retry_or_fail(&mut self, error: SyncError) -> SyncResult<()> {
        if build_error_handling_policy(&error) != RetryDirective::Retry {
            return Err(error);
        }

        if self.attempt >= self.max_attempts {
            if error.kind().is_connection_error() {
                return Err(error);
            }

            return Err(sync_error!(
                ErrorKind::RetryExhausted,
                "Operation failed after all retries",
                format!("{} attempts failed, last error: {}", self.attempt, error.summary()),
                source: error
            ));
        }

        let delay = self.next_delay();
        warn!(
            attempt = self.attempt,
            max_attempts = self.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error.summary(),
            "retrying failed operation"
        );
        tokio::time::sleep(delay).await;
        self.attempt += 1;

        Ok(())
    }

    fn next_delay(&mut self) -> Duration {
        let base = self.delay.min(self.max_delay);
        self.delay = self.delay.saturating_mul(2);

        let base_ms = base.as_millis() as u64;
        let jitter_ms = if base_ms > 1 {
            rand::thread_rng().gen_range(0..=base_ms / 2)
        } else {
            0
        };

        Duration::from_millis(base_ms.saturating_add(jitter_ms)).min(self.max_delay)
    }
}
