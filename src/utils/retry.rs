use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::errors::{AppError, Result};

/// Fixed-delay retry policy used for remote uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Runs `op` until it succeeds, the error is not retryable, or the policy's
/// attempts are exhausted. `op` receives the 1-based attempt number.
///
/// The error of the last attempt is returned.
pub async fn retry_async<T, F, Fut, P>(policy: &RetryPolicy, mut op: F, retryable: P) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&AppError) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && retryable(&e) => {
                warn!("Attempt {}/{} failed: {}", attempt, max_attempts, e);
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
