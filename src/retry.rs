//! Bounded retries around transient collaborator failures.
//!
//! Only errors reporting [`RotationError::is_retryable`] are retried. Everything
//! else (malformed secrets, verification failures, configuration errors) is
//! returned on the first attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::{Result, RotationError};

/// Exponential backoff policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt (0-10)
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Cap on the delay, in milliseconds
    pub max_delay_ms: u64,

    /// Backoff growth factor (1.0-10.0)
    pub multiplier: f64,

    /// Adds +/-25% randomness to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Validates the policy parameters.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_retries > 10 {
            return Err(format!(
                "max_retries must be <= 10, got {}",
                self.max_retries
            ));
        }

        if self.max_delay_ms < self.base_delay_ms {
            return Err(format!(
                "max_delay_ms ({}) must be >= base_delay_ms ({})",
                self.max_delay_ms, self.base_delay_ms
            ));
        }

        if !(1.0..=10.0).contains(&self.multiplier) {
            return Err(format!(
                "multiplier must be between 1.0 and 10.0, got {}",
                self.multiplier
            ));
        }

        Ok(())
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay_ms = self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(delay_ms.min(self.max_delay_ms as f64) as u64)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter || delay.is_zero() {
            return delay;
        }

        let delay_ms = delay.as_millis() as f64;
        let spread = delay_ms * 0.25;
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }
}

/// Runs `operation`, retrying retryable errors according to `policy`.
///
/// # Example
///
/// ```
/// use slotmux::retry::{retry, RetryPolicy};
/// use slotmux::RotationError;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let mut calls = 0;
/// let result: slotmux::Result<u32> = retry(&RetryPolicy::none(), "read-slot-secret", || {
///     calls += 1;
///     async { Err(RotationError::secret_malformed("slots", "bad json")) }
/// })
/// .await;
///
/// assert!(result.is_err());
/// assert_eq!(calls, 1);
/// # }
/// ```
pub async fn retry<F, Fut, T>(policy: &RetryPolicy, operation_name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(operation = operation_name, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.jittered(policy.delay_for(attempt));
                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
