//! Retry with exponential backoff and jitter.
//!
//! The delay before retry `n` is `base * factor^n`, capped at `max_delay`,
//! then spread by a random jitter recomputed on every attempt so clients
//! that failed together do not retry together.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::Result;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    /// Total jitter span as a fraction of the delay (0.2 = ±10 %)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::sync()
    }
}

impl RetryConfig {
    /// Transmission of queued changes: 5 attempts from a 1 s base.
    #[must_use]
    pub const fn sync() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            factor: 2.0,
            jitter: 0.2,
        }
    }

    /// Quick retry for individual reads.
    #[must_use]
    pub const fn query() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            factor: 2.0,
            jitter: 0.2,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub const fn test() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 10,
            factor: 2.0,
            jitter: 0.0,
        }
    }

    /// Same policy with a different base delay.
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay_ms = u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Backoff before retrying after failed attempt `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.factor.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        let spread = capped * self.jitter * (rand::random::<f64>() - 0.5);
        Duration::from_secs_f64((capped + spread).max(0.0) / 1_000.0)
    }
}

/// Runs fallible async operations under a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct SmartRetry {
    config: RetryConfig,
}

impl SmartRetry {
    pub const fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the attempts are exhausted. The last error is returned unchanged.
    pub async fn run<F, Fut, T>(&self, operation_name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        info!("Operation '{operation_name}' succeeded after {attempt} retries");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    attempt += 1;
                    if attempt >= max_attempts || !error.is_retryable() {
                        return Err(error);
                    }

                    let delay = self.config.delay_for_attempt(attempt - 1);
                    warn!(
                        "Operation '{operation_name}' failed (attempt {attempt}/{max_attempts}): {error}. Retrying in {delay:?}..."
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

/// Convenience wrapper around [`SmartRetry::run`].
pub async fn retry<F, Fut, T>(operation_name: &str, config: &RetryConfig, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    SmartRetry::new(config.clone()).run(operation_name, operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn delay_grows_geometrically_and_caps() {
        let config = RetryConfig {
            jitter: 0.0,
            ..RetryConfig::sync()
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let config = RetryConfig::sync();
        let delays: Vec<Duration> = (0..200).map(|_| config.delay_for_attempt(2)).collect();
        for delay in &delays {
            let millis = delay.as_secs_f64() * 1_000.0;
            assert!((3_600.0..=4_400.0).contains(&millis), "{millis}");
        }
        // Recomputed per call rather than fixed.
        assert!(delays.iter().any(|delay| *delay != delays[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = SmartRetry::new(RetryConfig::sync())
            .run("flaky", || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Network("timeout".to_string()))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_returns_final_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = retry("down", &RetryConfig::test(), || {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            async move { Err(Error::Network(format!("attempt {attempt}"))) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err().to_string(), "Network error: attempt 2");
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<()> = retry("invalid", &RetryConfig::test(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::InvalidInput("bad".to_string())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
