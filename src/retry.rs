//! Per-transfer retries with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng as _;

/// Retry decision returned by the error classifier callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    Abort,
}

/// Exponential backoff configuration. Jitter spreads retries of concurrent
/// mirrors hitting the same transient failure.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Compute the delay for a given retry attempt (0-indexed).
    ///
    /// Formula: `min(base_delay * 2^retry, max_delay) + random_jitter(0..base_delay)`
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX));
        let capped = exp_ms.min(self.max_delay.as_millis() as u64);
        let jitter = if base_ms > 0 {
            rand::thread_rng().gen_range(0..base_ms)
        } else {
            0
        };
        Duration::from_millis(capped.saturating_add(jitter))
    }
}

/// Retry an async operation with exponential backoff and jitter.
///
/// Returns the first `Ok` result, or the last error once retries are
/// exhausted or the classifier returns `Abort`.
pub async fn retry_with_backoff<F, Fut, T, E, C>(
    config: &RetryConfig,
    classifier: C,
    operation: F,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> RetryAction,
    E: std::fmt::Display,
{
    let total_attempts = config.max_retries + 1;
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                if classifier(&e) == RetryAction::Abort || attempt + 1 >= total_attempts {
                    return Err(e);
                }
                let delay = config.delay_for_retry(attempt);
                tracing::warn!(
                    "Retryable error (attempt {}/{}), retrying in {}ms: {}",
                    attempt + 1,
                    total_attempts,
                    delay.as_millis(),
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
