//! Retry and Timeout Helpers
//!
//! Chain RPC calls and storage calls are the only suspension points of the
//! engine; every one of them goes through [`with_timeout`]. External-service
//! failures are retried a bounded number of times with [`retry_external`].

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::config::RetryConfig;
use crate::error::{ErrorClass, PoolError, PoolResult};

/// Retry strategy
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// No retry
    None,
    /// Fixed delay between retries
    Fixed { delay_ms: u64 },
    /// Exponential backoff
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// Build the external-service strategy from configuration
    pub fn from_config(config: &RetryConfig) -> Self {
        if config.max_attempts <= 1 {
            return Self::None;
        }
        Self::Exponential {
            initial_delay_ms: config.initial_delay_ms,
            max_delay_ms: config.max_delay_ms,
            multiplier: config.multiplier,
        }
    }

    /// Calculate delay for attempt number (1-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::None => Duration::ZERO,
            RetryStrategy::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
            RetryStrategy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exponent = attempt.saturating_sub(1) as i32;
                let delay = (*initial_delay_ms as f64) * multiplier.powi(exponent);
                let delay = delay.min(*max_delay_ms as f64);
                Duration::from_millis(delay as u64)
            }
        }
    }
}

/// Run a suspension point under a deadline
pub async fn with_timeout<T, F>(operation: &str, limit: Duration, fut: F) -> PoolResult<T>
where
    F: Future<Output = PoolResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(PoolError::Timeout {
            operation: operation.to_string(),
            millis: limit.as_millis() as u64,
        }),
    }
}

/// Retry an operation while it fails with a retryable external-service error
///
/// Other errors are returned immediately. After `max_attempts` the last
/// error is wrapped in [`PoolError::RetryExhausted`].
pub async fn retry_external<T, F, Fut>(
    operation: &str,
    strategy: &RetryStrategy,
    max_attempts: u32,
    mut call: F,
) -> PoolResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PoolResult<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.class() == ErrorClass::ExternalService && e.is_retryable() => {
                if attempt >= max_attempts || *strategy == RetryStrategy::None {
                    return Err(PoolError::RetryExhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                let delay = strategy.delay_for_attempt(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "External call failed, retrying: {}",
                    e
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
