//! Retry with exponential backoff for transient LLM failures.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::LlmError;

/// Exponential-backoff retry policy.
///
/// With the defaults a failing call is retried three times, waiting
/// 1s, 2s, then 4s, and gives up after the fourth attempt. Only
/// retryable errors (5xx, transport) are retried; 4xx and malformed
/// responses fail immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retrying after the given (1-based) failed attempt:
    /// base, 2*base, 4*base, ...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    /// Run `operation` until it succeeds, a non-retryable error occurs,
    /// or attempts are exhausted.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, LlmError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, LlmError>>,
    {
        let mut last_delay = Duration::ZERO;
        for attempt in 1..=self.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    last_delay = self.delay_after(attempt);
                    warn!(
                        %label,
                        attempt,
                        wait_ms = last_delay.as_millis() as u64,
                        error = %err,
                        "transient LLM failure, retrying"
                    );
                    tokio::time::sleep(last_delay).await;
                }
                Err(err) if err.is_retryable() => {
                    warn!(%label, attempt, error = %err, "retries exhausted");
                    return Err(LlmError::RetriesExhausted {
                        attempts: self.max_attempts,
                        last_delay,
                    });
                }
                Err(err) => return Err(err),
            }
        }
        Err(LlmError::RetriesExhausted {
            attempts: self.max_attempts,
            last_delay,
        })
    }
}
