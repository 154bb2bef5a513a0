//! Retry utilities
//!
//! [`RetryConfig`] describes a bounded retry count with exponential
//! backoff. The task manager uses it for requeueing jobs whose worker was
//! lost; the producer client uses [`with_retry_if`] around HTTP calls.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,

    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds (caps exponential growth)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with custom max retries
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Create a retry configuration with custom delays
    pub fn with_delays(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            backoff_multiplier: 2.0,
        }
    }

    /// Whether retry number `attempt` (1-based) is still allowed
    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Delay before retry number `attempt`; zero for the first try
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay_ms = if attempt == 0 || self.base_delay_ms == 0 {
            0
        } else {
            let exponential =
                self.base_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
            (exponential as u64).min(self.max_delay_ms)
        };

        Duration::from_millis(delay_ms)
    }
}

/// Execute an operation with exponential backoff, retrying only errors the
/// predicate accepts.
///
/// Returns the first success, or the last error once `max_retries`
/// retries have failed.
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    operation: F,
    should_retry: P,
) -> Result<T, E>
where
    E: Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = config.delay_for(attempt);
            debug!(
                attempt = attempt,
                delay_ms = delay.as_millis(),
                "Retrying operation after delay"
            );
            tokio::time::sleep(delay).await;
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if !should_retry(&e) {
                    warn!(error = %e, "Non-retryable error encountered");
                    return Err(e);
                }
                if attempt >= config.max_retries {
                    warn!(
                        attempts = attempt + 1,
                        error = %e,
                        "Operation failed, retries exhausted"
                    );
                    return Err(e);
                }

                warn!(
                    attempt = attempt,
                    max_retries = config.max_retries,
                    error = %e,
                    "Operation failed, will retry"
                );
                attempt += 1;
            }
        }
    }
}
