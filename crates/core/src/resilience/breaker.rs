//! Consecutive-failure circuit breaker.
//!
//! ```text
//! Closed --[failure_threshold consecutive failures]--> Open
//! Open --[cooldown elapsed]--> HalfOpen (one probe admitted)
//! HalfOpen --[probe succeeds]--> Closed
//! HalfOpen --[probe fails]--> Open (cooldown restarts)
//! ```

use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::resilience::Dependency;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 3, cooldown: Duration::seconds(60), enabled: true }
    }
}

/// What `try_acquire` admitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallPermit {
    Normal,
    Probe,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CircuitOpen {
    pub retry_after: Duration,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerMetrics {
    pub consecutive_failures: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    pub times_opened: u64,
    pub short_circuited: u64,
}

#[derive(Debug, Default)]
struct BreakerInner {
    consecutive_failures: u32,
    last_failure: Option<DateTime<Utc>>,
    probe_started: Option<DateTime<Utc>>,
    metrics: CircuitBreakerMetrics,
}

pub struct CircuitBreaker {
    dependency: Dependency,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(dependency: Dependency, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self { dependency, config, clock, inner: Mutex::new(BreakerInner::default()) }
    }

    pub fn dependency(&self) -> Dependency {
        self.dependency
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tripped(&self, inner: &BreakerInner) -> bool {
        self.config.enabled && inner.consecutive_failures >= self.config.failure_threshold
    }

    fn state_of(&self, inner: &BreakerInner, now: DateTime<Utc>) -> CircuitState {
        if !self.tripped(inner) {
            return CircuitState::Closed;
        }
        match inner.last_failure {
            Some(last_failure) if now - last_failure < self.config.cooldown => CircuitState::Open,
            _ => CircuitState::HalfOpen,
        }
    }

    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        self.state_of(&inner, self.clock.now())
    }

    /// `consecutiveFailures ≥ threshold ∧ now - lastFailure < cooldown`
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Time until a probe is admitted again. `None` unless open.
    pub fn retry_after(&self) -> Option<Duration> {
        let now = self.clock.now();
        let inner = self.lock();
        match self.state_of(&inner, now) {
            CircuitState::Open => {
                let elapsed = inner.last_failure.map_or(Duration::zero(), |last| now - last);
                Some(self.config.cooldown - elapsed)
            }
            CircuitState::Closed | CircuitState::HalfOpen => None,
        }
    }

    /// Admits a call, or reports how long until the next probe is allowed.
    /// While half-open only one probe is admitted at a time.
    pub fn try_acquire(&self) -> Result<CallPermit, CircuitOpen> {
        let now = self.clock.now();
        let mut inner = self.lock();

        match self.state_of(&inner, now) {
            CircuitState::Closed => Ok(CallPermit::Normal),
            CircuitState::Open => {
                inner.metrics.short_circuited += 1;
                let elapsed = inner.last_failure.map_or(Duration::zero(), |last| now - last);
                Err(CircuitOpen { retry_after: self.config.cooldown - elapsed })
            }
            CircuitState::HalfOpen => {
                // A probe abandoned mid-flight must not wedge the breaker forever.
                let probe_live = inner
                    .probe_started
                    .is_some_and(|started| now - started < self.config.cooldown);
                if probe_live {
                    inner.metrics.short_circuited += 1;
                    return Err(CircuitOpen { retry_after: Duration::seconds(1) });
                }
                inner.probe_started = Some(now);
                info!(
                    event_name = "core.circuit_breaker.half_open_probe",
                    correlation_id = "circuit_breaker",
                    dependency = self.dependency.as_str(),
                    "admitting half-open probe"
                );
                Ok(CallPermit::Probe)
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        let was_tripped = self.tripped(&inner);
        inner.consecutive_failures = 0;
        inner.probe_started = None;
        inner.metrics.total_successes += 1;
        inner.metrics.consecutive_failures = 0;
        if was_tripped {
            info!(
                event_name = "core.circuit_breaker.closed",
                correlation_id = "circuit_breaker",
                dependency = self.dependency.as_str(),
                "circuit closed after successful probe"
            );
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.lock();
        let was_tripped = self.tripped(&inner);
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(now);
        inner.probe_started = None;
        inner.metrics.total_failures += 1;
        inner.metrics.consecutive_failures = inner.consecutive_failures;

        if !was_tripped && self.tripped(&inner) {
            inner.metrics.times_opened += 1;
            warn!(
                event_name = "core.circuit_breaker.opened",
                correlation_id = "circuit_breaker",
                dependency = self.dependency.as_str(),
                consecutive_failures = inner.consecutive_failures,
                cooldown_secs = self.config.cooldown.num_seconds(),
                "circuit opened"
            );
        }
    }

    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        inner.probe_started = None;
        inner.metrics.consecutive_failures = 0;
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        self.lock().metrics
    }
}
