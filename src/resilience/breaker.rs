//! Circuit breaker state machine.
//!
//! One breaker guards one key (a pipeline stage name or an agent id) and
//! trips after a run of consecutive failures, shedding load from a backend
//! that is already down instead of hammering it.

use crate::types::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures in `closed` that trip the circuit.
    pub failure_threshold: u32,
    /// How long an open circuit rejects calls before probing again.
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Consecutive successes in `half_open` that close the circuit.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

/// The three breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    last_failure: Option<Instant>,
}

/// Point-in-time breaker state for stats surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub half_open_successes: u32,
}

/// Failure-isolation state machine around an async operation.
///
/// `closed` counts consecutive failures and trips to `open` at the
/// threshold. `open` rejects every call until `reset_timeout` has elapsed
/// since the last failure, then admits probes in `half_open`. Two probe
/// successes close the circuit again; any probe failure reopens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                last_failure: None,
            }),
        }
    }

    /// Run `operation` through the breaker.
    ///
    /// When the circuit is open the future is dropped unpolled, so the
    /// wrapped work is never started. Callers pass a freshly built future
    /// per call (async blocks are inert until polled).
    pub async fn call<T, Fut>(&self, operation: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        self.acquire()?;

        match operation.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }

    /// Admission check; transitions `open` to `half_open` once the reset
    /// window has elapsed.
    fn acquire(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let window_elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);

                if window_elapsed {
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                    tracing::info!("circuit_half_open: name={}", self.name);
                    Ok(())
                } else {
                    Err(Error::circuit_open(format!(
                        "'{}' rejecting calls",
                        self.name
                    )))
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.lock_inner();
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.last_failure = None;
                    tracing::info!("circuit_closed: name={}", self.name);
                }
            }
            // A success in closed clears the consecutive-failure run. Late
            // successes from calls admitted before a trip are ignored state-wise.
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.lock_inner();
        inner.last_failure = Some(Instant::now());
        match inner.state {
            BreakerState::HalfOpen => {
                inner.state = BreakerState::Open;
                inner.half_open_successes = 0;
                tracing::warn!("circuit_reopened: name={}", self.name);
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = BreakerState::Open;
                    tracing::warn!(
                        "circuit_opened: name={} failures={}",
                        self.name,
                        inner.consecutive_failures
                    );
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.lock_inner().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock_inner();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            half_open_successes: inner.half_open_successes,
        }
    }

    // A poisoned lock means some caller panicked mid-update; the counters
    // are still coherent enough to keep serving admission decisions.
    fn lock_inner(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// =============================================================================
// BreakerRegistry
// =============================================================================

/// Per-key circuit breakers, created lazily on first use.
///
/// Keys are pipeline stage names and agent ids. Breakers live for the
/// process lifetime; a tripped breaker stays tripped across inputs.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Fetch the breaker for `key`, creating it on first use.
    pub fn breaker(&self, key: &str) -> Arc<CircuitBreaker> {
        {
            let breakers = self
                .breakers
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = breakers.get(key) {
                return Arc::clone(existing);
            }
        }

        let mut breakers = self
            .breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            breakers
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(CircuitBreaker::new(key, self.config.clone()))),
        )
    }

    /// Snapshot every known breaker for stats reporting.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let breakers = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<BreakerSnapshot> =
            breakers.values().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
