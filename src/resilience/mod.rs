//! Resilience primitives: circuit breaking and retry.
//!
//! The two are independent and compose with the retry on the outside, so
//! each retry attempt passes the breaker's admission check and each outcome
//! feeds the breaker's counters. A freshly opened circuit turns the
//! remaining retries into immediate circuit-open rejections, which are not
//! retryable and propagate at once.

mod breaker;
mod retry;

pub use breaker::{
    BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker,
};
pub use retry::{RetryConfig, RetryMechanism};

use crate::types::Result;
use std::future::Future;
use std::sync::Arc;

/// A named circuit breaker plus retry policy guarding one operation.
///
/// The pipeline keeps one guard per stage and one per agent; guards sharing
/// a breaker (via [`BreakerRegistry`]) share its state.
#[derive(Debug, Clone)]
pub struct StageGuard {
    breaker: Arc<CircuitBreaker>,
    retry: RetryMechanism,
}

impl StageGuard {
    pub fn new(breaker: Arc<CircuitBreaker>, retry: RetryMechanism) -> Self {
        Self { breaker, retry }
    }

    /// Run one attempt factory under retry-around-breaker.
    pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = Arc::clone(&self.breaker);
        self.retry
            .execute(move || {
                let breaker = Arc::clone(&breaker);
                let attempt = operation();
                async move { breaker.call(attempt).await }
            })
            .await
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}
