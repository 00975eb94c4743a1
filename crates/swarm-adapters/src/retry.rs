//! Retry with exponential backoff for transient adapter failures.

use std::future::Future;
use std::time::Duration;

use swarm_core::Classified;

/// Backoff policy applied to retriable adapter calls.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Multiplier applied after each retry.
    pub factor: u32,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
    /// Retry budget; the call runs at most `max_retries + 1` times.
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            factor: 2,
            max_delay: Duration::from_secs(10),
            max_retries: 4,
        }
    }
}

impl BackoffPolicy {
    /// A policy that never retries, for tests and fail-fast paths.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            initial: Duration::ZERO,
            factor: 1,
            max_delay: Duration::ZERO,
            max_retries: 0,
        }
    }
}

/// Run `op`, retrying retriable failures per the policy.
///
/// Non-retriable errors return immediately; on budget exhaustion the last
/// error is returned.
///
/// # Errors
///
/// Returns the final error once the budget is spent or a non-retriable
/// failure occurs.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &BackoffPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classified + std::fmt::Display,
{
    let mut delay = policy.initial;
    let mut retries = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && retries < policy.max_retries => {
                retries += 1;
                tracing::debug!(retries, error = %err, "Retrying transient failure");
                tokio::time::sleep(delay).await;
                delay = (delay * policy.factor).min(policy.max_delay);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Backoff applied when a failed attempt requeues a ticket to `ready`.
///
/// Doubles per consumed attempt from a 30 second base, capped at 10
/// minutes.
#[must_use]
pub fn requeue_backoff(attempt: u32) -> Duration {
    let base = Duration::from_secs(30);
    let shift = attempt.saturating_sub(1).min(5);
    (base * 2u32.pow(shift)).min(Duration::from_secs(600))
}
