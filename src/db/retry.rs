use futures_util::future::BoxFuture;
use rand::Rng;
use std::fmt::Display;
use std::time::Duration;

use crate::config::Config;
use crate::constants::TX_RETRY_MAX_DELAY_MS;
use crate::error::AppError;

/// Errors that may succeed when the whole unit of work is re-run.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for AppError {
    fn is_retryable(&self) -> bool {
        AppError::is_retryable(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.tx_max_attempts.max(1),
            base_delay: Duration::from_millis(config.tx_retry_base_ms),
        }
    }

    /// Exponential backoff with equal jitter (delay in [exp/2, exp]), capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as u64;
        if base == 0 {
            return Duration::ZERO;
        }
        let exp = base
            .saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
            .min(TX_RETRY_MAX_DELAY_MS);
        let jittered = rand::rng().random_range(exp / 2..=exp);
        Duration::from_millis(jittered)
    }
}

/// Runs `attempt` until it succeeds, fails with a non-retryable error, or the
/// policy runs out of attempts. `state` is handed to every attempt so the
/// future may borrow it.
pub async fn retrying<S, T, E, F>(
    policy: RetryPolicy,
    label: &str,
    state: &mut S,
    mut attempt: F,
) -> Result<T, E>
where
    E: Retryable + Display,
    F: for<'s> FnMut(&'s mut S, u32) -> BoxFuture<'s, Result<T, E>>,
{
    let mut n = 1;
    loop {
        match attempt(state, n).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && n < policy.max_attempts => {
                let delay = policy.delay_for(n);
                tracing::warn!(
                    "{} failed with {} (attempt {}/{}), retrying in {:?}",
                    label,
                    err,
                    n,
                    policy.max_attempts,
                    delay
                );
                tokio::time::sleep(delay).await;
                n += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    tracing::error!("{} gave up after {} attempts: {}", label, n, err);
                }
                return Err(err);
            }
        }
    }
}
