use std::future::{self, Future};
use std::time::Duration;
use tokio::time::sleep;

/// Decides whether a batch with unprocessed sub-requests is attempted again
///
/// Called after every attempt, including the first, with the number of
/// attempts made so far and the number of sub-requests still pending. Any
/// backoff delay happens inside `should_retry`; the reconciler itself never
/// sleeps.
///
/// Closures `FnMut(attempts, pending) -> bool` are policies without delay.
pub trait RetryPolicy {
    /// Return `true` to submit the pending sub-requests again
    fn should_retry(&mut self, attempts: usize, pending: usize) -> impl Future<Output = bool> + Send;
}

impl<F> RetryPolicy for F
where
    F: FnMut(usize, usize) -> bool,
{
    fn should_retry(&mut self, attempts: usize, pending: usize) -> impl Future<Output = bool> + Send {
        future::ready(self(attempts, pending))
    }
}

/// Calculate retry delay with exponential backoff
///
/// `retry` is 0-based: the first retry waits `initial`.
pub(crate) fn retry_delay(retry: usize, initial: Duration, max: Duration) -> Duration {
    let factor = u32::try_from(retry)
        .ok()
        .and_then(|retry| 2u32.checked_pow(retry))
        .unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}

/// Allow a fixed number of attempts, without delay
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxAttempts(pub usize);

impl RetryPolicy for MaxAttempts {
    fn should_retry(&mut self, attempts: usize, _pending: usize) -> impl Future<Output = bool> + Send {
        future::ready(attempts < self.0)
    }
}

/// Retry for as long as anything is pending
///
/// Only useful together with cancellation, or against a service that is
/// known to eventually process everything.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Unlimited;

impl RetryPolicy for Unlimited {
    fn should_retry(&mut self, _attempts: usize, _pending: usize) -> impl Future<Output = bool> + Send {
        future::ready(true)
    }
}

/// Retry with exponential backoff, up to a maximum number of attempts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Maximum number of attempts, the first one included
    pub max_attempts: usize,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl ExponentialBackoff {
    /// 3 attempts, 100ms initial delay, 2s cap
    pub const DEFAULT: Self = Self::new(3, Duration::from_millis(100), Duration::from_millis(2000));

    /// Create a backoff policy
    pub const fn new(max_attempts: usize, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// DynamoDB's recommended client policy: 10 retries, 25ms base delay, 20s cap
    pub const fn dynamodb_default() -> Self {
        Self::new(11, Duration::from_millis(25), Duration::from_secs(20))
    }

    /// Delay slept after `attempts` attempts, before the next one
    pub fn delay_after(&self, attempts: usize) -> Duration {
        retry_delay(
            attempts.saturating_sub(1),
            self.initial_delay,
            self.max_delay,
        )
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl RetryPolicy for ExponentialBackoff {
    async fn should_retry(&mut self, attempts: usize, pending: usize) -> bool {
        if attempts >= self.max_attempts {
            return false;
        }

        let delay = self.delay_after(attempts);
        tracing::debug!(
            attempts,
            pending,
            delay_ms = delay.as_millis() as u64,
            "backing off before resubmitting unprocessed sub-requests"
        );
        sleep(delay).await;
        true
    }
}
