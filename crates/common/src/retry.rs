//! Bounded exponential backoff for backend calls.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{FsError, Result};

/// Retries transient backend failures with exponential backoff and ±20% jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl RetryPolicy {
    /// Policy that tries once and never waits.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let initial_us = self.initial_delay.as_micros() as f64;
        let max_us = self.max_delay.as_micros() as f64;
        let mut delay_us = (initial_us * exp).min(max_us);
        if self.jitter {
            delay_us += delay_us * 0.2 * (rand::random::<f64>() * 2.0 - 1.0);
        }
        Duration::from_micros(delay_us.max(0.0).round() as u64)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(FsError::BackendUnavailable(msg)) if attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt);
                    debug!(
                        op = what,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %msg,
                        "backend call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        warn!(op = what, attempts = attempt, error = %err, "giving up on backend call");
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: if config.multiplier > 0.0 {
                config.multiplier
            } else {
                2.0
            },
            jitter: config.jitter,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}
