//! Per-tier circuit breaker
//!
//! Isolates a consistently failing backend for a cooldown period so calls
//! fail fast instead of paying the backend's latency.
//!
//! ```text
//! CLOSED    --failure_threshold consecutive failures-->  OPEN
//! OPEN      --open_duration elapsed, next call------->  HALF_OPEN
//! HALF_OPEN --success_threshold consecutive successes->  CLOSED
//! HALF_OPEN --any failure---------------------------->  OPEN (timer restarts)
//! ```
//!
//! All state lives behind one mutex per breaker. Critical sections are O(1)
//! and never span I/O. State is process-local: each instance forms its own
//! view of backend health.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{AppError, AppResult};

use super::{config::CircuitBreakerConfig, Tier};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding (0=closed, 1=half-open, 2=open)
    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Point-in-time view of a breaker for health reporting
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Seconds until an OPEN breaker admits trial calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_seconds: Option<u64>,
    /// Number of CLOSED/HALF_OPEN -> OPEN transitions since creation or reset
    pub times_opened: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_transition: Instant,
    /// Trial calls currently admitted in HALF_OPEN
    trials_in_flight: u32,
    times_opened: u64,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_transition: Instant::now(),
            trials_in_flight: 0,
            times_opened: 0,
        }
    }
}

/// Fault isolator for a single tier
pub struct CircuitBreaker {
    tier: Tier,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(tier: Tier, config: CircuitBreakerConfig) -> Self {
        metrics::gauge!("crm_circuit_state", "tier" => tier.as_str()).set(0.0);
        Self {
            tier,
            config,
            inner: Mutex::new(BreakerInner::new()),
        }
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // Every update leaves the state consistent, so a poisoned lock is safe to reuse
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask permission to call the backend
    ///
    /// Moves OPEN to HALF_OPEN once `open_duration` has elapsed, then admits
    /// up to `success_threshold` concurrent trial calls. Rejections cost no
    /// backend call.
    pub fn check(&self) -> AppResult<()> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open
            && inner.last_transition.elapsed() >= self.config.open_duration
        {
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(AppError::CircuitOpen { tier: self.tier }),
            CircuitState::HalfOpen => {
                if inner.trials_in_flight >= self.config.success_threshold
                    && inner.last_transition.elapsed() >= self.config.open_duration
                {
                    // Trials admitted a full cooldown ago never reported back
                    debug!(tier = %self.tier, "Reclaiming stale half-open trial permits");
                    inner.trials_in_flight = 0;
                }
                if inner.trials_in_flight < self.config.success_threshold {
                    inner.trials_in_flight += 1;
                    Ok(())
                } else {
                    Err(AppError::CircuitOpen { tier: self.tier })
                }
            }
        }
    }

    /// Record a successful backend call
    pub fn record_success(&self) {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                inner.success_count += 1;
                debug!(
                    tier = %self.tier,
                    successes = inner.success_count,
                    threshold = self.config.success_threshold,
                    "Half-open trial call succeeded"
                );
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, CircuitState::Closed);
                }
            }
            // Late result from a call admitted before the breaker opened
            CircuitState::Open => {}
        }
    }

    /// Record a failed backend call
    pub fn record_failure(&self) {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
                inner.failure_count += 1;
                self.transition(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state without triggering any transition
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let retry_in_seconds = (inner.state == CircuitState::Open).then(|| {
            self.config
                .open_duration
                .saturating_sub(inner.last_transition.elapsed())
                .as_secs()
        });

        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            retry_in_seconds,
            times_opened: inner.times_opened,
        }
    }

    /// Operator override: force CLOSED and clear all counters
    pub fn reset(&self) {
        let mut inner = self.lock();
        let previous = inner.state;
        *inner = BreakerInner::new();
        metrics::gauge!("crm_circuit_state", "tier" => self.tier.as_str()).set(0.0);
        info!(tier = %self.tier, previous = %previous, "Circuit breaker manually reset");
    }

    /// Give back a HALF_OPEN trial permit without recording an outcome
    pub fn release_trial(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        inner.state = to;
        inner.last_transition = Instant::now();
        inner.success_count = 0;
        inner.trials_in_flight = 0;

        match to {
            CircuitState::Open => {
                inner.times_opened += 1;
                warn!(
                    tier = %self.tier,
                    from = %from,
                    consecutive_failures = inner.failure_count,
                    open_seconds = self.config.open_duration.as_secs(),
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(tier = %self.tier, "Circuit breaker half-open, admitting trial calls");
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
                info!(tier = %self.tier, from = %from, "Circuit breaker closed");
            }
        }

        metrics::gauge!("crm_circuit_state", "tier" => self.tier.as_str()).set(to.gauge_value());
    }
}
