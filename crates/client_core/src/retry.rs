use std::{future::Future, time::Duration};

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt (0 = single attempt).
    pub retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Wall-clock budget for all attempts and backoff waits together.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            base_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(2000),
            timeout: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),
    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },
    #[error("operation failed without retry: {0}")]
    Rejected(E),
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `on_retry` receives the 1-based retry number before each backoff wait.
    pub async fn run<T, E, Op, Fut, R, N>(
        &self,
        cancel: &CancellationToken,
        mut should_retry: R,
        mut on_retry: N,
        mut operation: Op,
    ) -> Result<T, RetryError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: FnMut(&E) -> bool,
        N: FnMut(u32),
    {
        let deadline = Instant::now() + self.timeout;
        let attempts = async {
            let mut attempt = 0u32;
            loop {
                let err = match operation().await {
                    Ok(value) => return Ok(value),
                    Err(err) => err,
                };
                if cancel.is_cancelled() {
                    return Err(RetryError::Cancelled);
                }
                if !should_retry(&err) {
                    return Err(RetryError::Rejected(err));
                }
                if attempt >= self.retries {
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        source: err,
                    });
                }

                let delay = self.delay_for_attempt(attempt);
                attempt += 1;
                debug!(
                    attempt,
                    max_retries = self.retries,
                    delay_ms = delay.as_millis() as u64,
                    "retry: backing off"
                );
                on_retry(attempt);
                tokio::time::sleep(delay).await;
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RetryError::Cancelled),
            outcome = tokio::time::timeout_at(deadline, attempts) => {
                outcome.unwrap_or(Err(RetryError::TimedOut(self.timeout)))
            }
        }
    }
}
