//! Bounded retry with exponential backoff.

use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Retry tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt, so `max_retries + 1` total attempts.
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub initial_delay: Duration,
    /// Backoff factor applied per failed attempt.
    pub multiplier: f64,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Lower-cased substrings; an error is retried only when its message
    /// contains one of them.
    pub retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            retryable_errors: vec![
                "timeout".to_string(),
                "network".to_string(),
                "connection refused".to_string(),
                "timed out".to_string(),
                "not found".to_string(),
            ],
        }
    }
}

/// Retries a fallible async operation with exponential backoff.
///
/// Only errors whose message matches the configured allow-list are retried;
/// validation errors are never retried regardless of message. Everything
/// else propagates on first failure.
#[derive(Debug, Clone)]
pub struct RetryMechanism {
    config: RetryConfig,
}

impl RetryMechanism {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation`, retrying transient failures.
    ///
    /// `operation` is a factory invoked once per attempt so each retry gets
    /// a fresh future.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt > self.config.max_retries || !self.is_retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        "retrying: attempt={} delay_ms={} error={}",
                        attempt,
                        delay.as_millis(),
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Backoff before the retry that follows failed attempt `attempt`
    /// (1-based): `min(initial_delay * multiplier^(attempt-1), max_delay)`.
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = self.config.multiplier.powi(exponent as i32);
        let raw = self.config.initial_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(raw.min(self.config.max_delay.as_secs_f64()))
    }

    /// Substring check against the lower-cased error message.
    pub fn is_retryable(&self, err: &Error) -> bool {
        if matches!(err, Error::Validation(_)) {
            return false;
        }
        let message = err.to_string().to_lowercase();
        self.config
            .retryable_errors
            .iter()
            .any(|needle| message.contains(needle.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn counting_failure(
        counter: &Arc<AtomicU32>,
        err: fn() -> Error,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<()>> + Send>> + '_ {
        move || {
            let counter = Arc::clone(counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(err())
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_failure_performs_all_attempts() {
        let retry = RetryMechanism::new(RetryConfig::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result = retry
            .execute(counting_failure(&attempts, || Error::timeout("backend")))
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        // Backoff schedule: 1000ms + 2000ms + 4000ms.
        assert_eq!(started.elapsed(), Duration::from_millis(7000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_fails_immediately() {
        let retry = RetryMechanism::new(RetryConfig::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let result = retry
            .execute(counting_failure(&attempts, || {
                Error::execution("division by zero")
            }))
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_errors_never_retried() {
        let retry = RetryMechanism::new(RetryConfig::default());
        let attempts = Arc::new(AtomicU32::new(0));

        // The message matches the allow-list but the kind wins.
        let result = retry
            .execute(counting_failure(&attempts, || {
                Error::validation("agent not found in parameters")
            }))
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let retry = RetryMechanism::new(RetryConfig::default());
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let value = retry
            .execute(move || {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::timeout("slow backend"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_delay_schedule_caps_at_max() {
        let retry = RetryMechanism::new(RetryConfig {
            initial_delay: Duration::from_secs(10),
            multiplier: 10.0,
            max_delay: Duration::from_secs(15),
            ..Default::default()
        });

        assert_eq!(retry.delay_for(1), Duration::from_secs(10));
        assert_eq!(retry.delay_for(2), Duration::from_secs(15));
        assert_eq!(retry.delay_for(3), Duration::from_secs(15));
    }

    #[test]
    fn test_default_allow_list_classification() {
        let retry = RetryMechanism::new(RetryConfig::default());

        assert!(retry.is_retryable(&Error::timeout("call")));
        assert!(retry.is_retryable(&Error::execution("Network unreachable")));
        assert!(retry.is_retryable(&Error::not_found("agent 'builder'")));
        assert!(retry.is_retryable(&Error::execution("connection refused by host")));
        assert!(!retry.is_retryable(&Error::execution("bad response shape")));
        assert!(!retry.is_retryable(&Error::circuit_open("'execution' rejecting calls")));
    }

    #[test]
    fn test_config_serde_fills_defaults() {
        let config: RetryConfig = serde_json::from_str(r#"{"max_retries": 1}"#).unwrap();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.retryable_errors.len(), 5);
    }
}
