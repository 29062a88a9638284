//! Retry dispatcher for journal appends.
//!
//! Wraps an async operation with exponential backoff. Only results the
//! engine classifies as retryable are retried; validation and durability
//! faults surface immediately. Backoff doubles per attempt from the base
//! delay (default 31 ms over 12 attempts).

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use crate::domain::error::BudgetResult;

#[derive(Debug, Clone)]
pub struct OperationDispatcher {
    base_delay: Duration,
    max_attempts: u32,
}

impl Default for OperationDispatcher {
    fn default() -> Self {
        Self { base_delay: Duration::from_millis(31), max_attempts: 12 }
    }
}

impl OperationDispatcher {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self { base_delay, max_attempts }
    }

    /// Executes the operation, retrying retryable failures with exponential
    /// backoff until `max_attempts` is exhausted.
    pub async fn dispatch<F, Fut, T>(&self, mut operation: F) -> BudgetResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BudgetResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !err.is_retryable() || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = self.backoff_delay(attempt - 1);
                    debug!(attempt, ?delay, error = %err, "retrying dispatched operation");
                    sleep(delay).await;
                }
            }
        }
    }

    /// Backoff for a 0-indexed attempt: `base * 2^attempt`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(attempt))
    }
}
