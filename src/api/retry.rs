//! Bounded retry with exponential backoff.
//!
//! One utility instead of a hand-rolled sleep loop at every call site that
//! polls or gets rate limited.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds.
/// 1 second is polite to the server while not making users wait too long.
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: Duration::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
        }
    }
}

/// Run `op` until it succeeds, the error stops being retryable, or the retry
/// budget runs out. The delay doubles after every attempt.
pub async fn retry_with_backoff<T, E, Fut>(
    policy: &RetryPolicy,
    mut op: impl FnMut() -> Fut,
    mut retryable: impl FnMut(&E) -> bool,
) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    let mut delay = policy.initial_backoff;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries && retryable(&e) => {
                attempt += 1;
                warn!(
                    attempt,
                    backoff_ms = delay.as_millis() as u64,
                    "Retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}
