//! Exponential backoff with jitter for retryable failures.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::{DispatchError, PipelineError};

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Retries after the first attempt. 0 disables retrying.
    pub max_retries: u32,
    pub jitter_enabled: bool,
    /// Fraction of the delay used as jitter range (0.0..=1.0).
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_retries: 2,
            jitter_enabled: true,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn without_jitter(mut self) -> Self {
        self.jitter_enabled = false;
        self
    }

    /// delay = initial * multiplier^attempt, capped at `max_delay_ms`.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_wrap,
        clippy::cast_sign_loss,
        clippy::cast_possible_truncation
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = (self.initial_delay_ms as f64) * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);

        let delay = if self.jitter_enabled && capped > 0.0 {
            let range = capped * self.jitter_factor;
            let jitter = rand::thread_rng().gen_range(-range..=range);
            (capped + jitter).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(delay as u64)
    }
}

/// Errors that can say whether another attempt makes sense.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for PipelineError {
    fn is_retryable(&self) -> bool {
        PipelineError::is_retryable(self)
    }
}

impl Retryable for DispatchError {
    fn is_retryable(&self) -> bool {
        DispatchError::is_retryable(self)
    }
}

/// Run `operation`, retrying retryable errors per `config`.
///
/// Returns the final result and the number of attempts made.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> (Result<T, E>, u32)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return (Ok(value), attempt + 1),
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                debug!(attempts = attempt + 1, error = %e, "Giving up");
                return (Err(e), attempt + 1);
            }
        }
    }
}
