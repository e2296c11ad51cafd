use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

pub const DEFAULT_THRESHOLD: u32 = 5;
pub const DEFAULT_RECOVERY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakerState {
    Closed,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub last_failure_at: Option<Instant>,
}

impl Default for CircuitBreakerState {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
        }
    }
}

/// Returned instead of running guarded work while the breaker is open.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("circuit breaker is open, retry in {retry_in:?}")]
pub struct CircuitOpen {
    pub retry_in: Duration,
}

struct Inner {
    name: String,
    threshold: u32,
    recovery: Duration,
    state: Mutex<CircuitBreakerState>,
}

/// A breaker shared by every chunk a worker processes. Clones share state.
///
/// Once `threshold` consecutive guarded calls fail the breaker opens and rejects calls until
/// `recovery` has passed since the last failure. The first call after that runs normally:
/// success closes the breaker, failure stamps a new failure time and keeps it open.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &str, threshold: u32, recovery: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.to_owned(),
                threshold: threshold.max(1),
                recovery,
                state: Mutex::new(CircuitBreakerState::default()),
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, CircuitBreakerState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        *self.lock_state()
    }

    /// Fail fast if the breaker is open, without taking a guard.
    pub fn check(&self) -> Result<(), CircuitOpen> {
        self.open_for(&self.lock_state())
    }

    /// Enter a guarded section. The guard must be settled with `success` or `failure`;
    /// dropping it unsettled records a failure.
    pub fn acquire(&self) -> Result<BreakerGuard, CircuitOpen> {
        self.check()?;

        Ok(BreakerGuard {
            breaker: self.clone(),
            settled: false,
        })
    }

    /// Run `work` under a guard, recording its outcome.
    pub async fn call<F, T, E>(&self, work: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<CircuitOpen>,
    {
        let guard = self.acquire()?;

        match work.await {
            Ok(value) => {
                guard.success();
                Ok(value)
            }
            Err(error) => {
                guard.failure();
                Err(error)
            }
        }
    }

    fn open_for(&self, state: &CircuitBreakerState) -> Result<(), CircuitOpen> {
        if state.state != BreakerState::Open {
            return Ok(());
        }
        let Some(last_failure_at) = state.last_failure_at else {
            return Ok(());
        };

        let elapsed = last_failure_at.elapsed();
        if elapsed < self.inner.recovery {
            return Err(CircuitOpen {
                retry_in: self.inner.recovery - elapsed,
            });
        }

        Ok(())
    }

    fn record_success(&self) {
        let mut state = self.lock_state();
        if state.state == BreakerState::Open {
            info!(breaker = %self.inner.name, "circuit breaker closed");
            metrics::gauge!("reprocess_circuit_breaker_open", "name" => self.inner.name.clone())
                .set(0.0);
        }
        state.state = BreakerState::Closed;
        state.consecutive_failures = 0;
    }

    fn record_failure(&self) {
        let mut state = self.lock_state();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        state.last_failure_at = Some(Instant::now());

        if state.state == BreakerState::Closed && state.consecutive_failures >= self.inner.threshold
        {
            state.state = BreakerState::Open;
            warn!(
                breaker = %self.inner.name,
                consecutive_failures = state.consecutive_failures,
                recovery_s = self.inner.recovery.as_secs_f64(),
                "circuit breaker opened"
            );
            metrics::counter!("reprocess_circuit_breaker_opened_total", "name" => self.inner.name.clone())
                .increment(1);
            metrics::gauge!("reprocess_circuit_breaker_open", "name" => self.inner.name.clone())
                .set(1.0);
        }
    }
}

#[must_use = "an unsettled guard records a failure when dropped"]
pub struct BreakerGuard {
    breaker: CircuitBreaker,
    settled: bool,
}

impl BreakerGuard {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for BreakerGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_failure();
        }
    }
}
