//! Retry Logic with Exponential Backoff
//!
//! Queue fetches can fail transiently (broker restarting, network blip). The consumer
//! wraps every fetch in [`retry_with_backoff`]; only errors for which
//! [`IngestError::is_retryable`] holds are retried.
//!
//! ```text
//! Attempt 1: immediate
//! Attempt 2: wait initial_backoff
//! Attempt 3: wait initial_backoff * multiplier
//! ...        capped at max_backoff
//! ```
//!
//! After `max_retries` the last error is returned to the caller, which backs off
//! itself and keeps the partition assigned.

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy for exponential backoff.
///
/// ```text
/// backoff = min(initial_backoff * multiplier^attempt, max_backoff)
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (default: 5)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial backoff in milliseconds (default: 100)
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff ceiling in milliseconds (default: 30s)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Growth factor between attempts (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> usize {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff_ms: initial_backoff.as_millis() as u64,
            max_backoff_ms: max_backoff.as_millis() as u64,
            backoff_multiplier,
        }
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    /// Backoff before retry number `attempt` (0-indexed).
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        backoff.min(self.max_backoff())
    }
}

/// Run `operation` until it succeeds, fails permanently, or retries run out.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        error = %err,
                        "Max retries exhausted, giving up"
                    );
                    return Err(err);
                }

                let backoff = policy.backoff(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Retryable error, backing off"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

/// Shorthand for a transient queue failure.
pub fn unavailable(reason: impl Into<String>) -> IngestError {
    IngestError::QueueUnavailable(reason.into())
}
