// Transport retry shared by manifest and segment requests.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::HarvestError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub max_retries: u32,
    /// Wait before the first retry; doubled for every further one.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Spread retries by up to half of `base_delay`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `retry + 1`, never above `max_delay`.
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        let backoff = self
            .base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay));
        if !self.jitter {
            return backoff;
        }

        let headroom = self.max_delay.saturating_sub(backoff).min(self.base_delay / 2);
        let headroom_ms = u64::try_from(headroom.as_millis()).unwrap_or(u64::MAX);
        if headroom_ms == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::rng().random_range(0..headroom_ms))
    }
}

/// What one attempt came back with.
pub enum RetryAction<T> {
    Success(T),
    Retry(HarvestError),
    Fail(HarvestError),
}

impl<T> RetryAction<T> {
    /// Uses [`HarvestError::is_retryable`] to split failures.
    pub fn from_result(result: Result<T, HarvestError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) if err.is_retryable() => Self::Retry(err),
            Err(err) => Self::Fail(err),
        }
    }
}

/// Runs `operation` (given the 0-based attempt number) until it succeeds, fails
/// permanently, runs out of retries, or `token` is cancelled.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, HarvestError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) if attempt >= policy.max_retries => return Err(err),
            RetryAction::Retry(err) => err,
        };

        let wait = policy.backoff(attempt);
        attempt += 1;
        warn!(
            attempt,
            max_retries = policy.max_retries,
            wait_ms = wait.as_millis() as u64,
            error = %err,
            "Transient request failure, retrying"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(HarvestError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
