//! Three-state circuit breaker guarding calls to a fallible dependency.
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                               │  cooldown elapsed, next call
//!     │ probe succeeds                ▼
//!     └──────────────────────────── HalfOpen ──probe fails──▶ Open
//! ```
//!
//! Open → HalfOpen is lazy: it happens on the first call attempt after the
//! cooldown, never on a timer. While HalfOpen exactly one probe call is in
//! flight; every other caller is rejected with [`CircuitOpenError`] until the
//! probe resolves.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::metrics::StreamingMetrics;
use crate::ConfigError;

/// Runtime circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: 0=closed, 1=open, 2=half_open.
    pub const fn gauge_value(self) -> u64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    fn validate(self) -> Result<Self, ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold);
        }
        if self.cooldown.is_zero() {
            return Err(ConfigError::InvalidCooldown);
        }
        Ok(self)
    }
}

/// Returned when the breaker rejects a call without attempting it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit breaker '{name}' is open")]
pub struct CircuitOpenError {
    name: String,
}

impl CircuitOpenError {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Outcome of [`CircuitBreaker::call`] when it does not return a value.
#[derive(Debug, Error)]
pub enum CallError<E> {
    #[error(transparent)]
    Open(CircuitOpenError),
    #[error(transparent)]
    Failed(E),
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            probe_in_flight: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Normal,
    Probe,
}

/// Thread-safe circuit breaker with lazy recovery probing.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<CircuitInner>,
    metrics: Option<Arc<StreamingMetrics>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            name: String::from("default"),
            config: CircuitBreakerConfig::default(),
            clock: Arc::new(SystemClock),
            inner: Mutex::new(CircuitInner::default()),
            metrics: None,
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            name: name.into(),
            config: config.validate()?,
            ..Self::default()
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(self, metrics: Arc<StreamingMetrics>) -> Self {
        metrics.set_breaker_state(self.state());
        Self {
            metrics: Some(metrics),
            ..self
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Runs `operation` under breaker protection.
    ///
    /// # Errors
    ///
    /// - [`CallError::Open`] when the call was rejected without running.
    /// - [`CallError::Failed`] with the operation's own error, after the
    ///   failure has been counted.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let admission = self.admit().map_err(CallError::Open)?;
        let guard = ProbeGuard {
            breaker: self,
            armed: admission == Admission::Probe,
        };

        let result = operation().await;
        guard.disarm();

        match result {
            Ok(value) => {
                self.on_success(admission);
                Ok(value)
            }
            Err(err) => {
                self.on_failure(admission, &err);
                Err(CallError::Failed(err))
            }
        }
    }

    /// Forces the breaker back to Closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = CircuitInner::default();
        drop(inner);
        info!(breaker = %self.name, "circuit breaker manually reset to closed");
        self.publish_state(CircuitState::Closed);
    }

    fn admit(&self) -> Result<Admission, CircuitOpenError> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure_at
                    .map(|at| self.clock.now().saturating_duration_since(at) >= self.config.cooldown)
                    .unwrap_or(true);

                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    drop(inner);
                    info!(
                        breaker = %self.name,
                        cooldown_secs = self.config.cooldown.as_secs_f64(),
                        "circuit breaker half-open, admitting probe call"
                    );
                    self.publish_state(CircuitState::HalfOpen);
                    Ok(Admission::Probe)
                } else {
                    drop(inner);
                    Err(self.reject())
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    drop(inner);
                    Err(self.reject())
                } else {
                    inner.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    fn reject(&self) -> CircuitOpenError {
        warn!(breaker = %self.name, "circuit breaker is open, rejecting call");
        if let Some(metrics) = &self.metrics {
            metrics.record_breaker_rejection();
        }
        CircuitOpenError {
            name: self.name.clone(),
        }
    }

    fn on_success(&self, admission: Admission) {
        let mut inner = self.lock();
        if admission == Admission::Probe {
            inner.probe_in_flight = false;
        }

        // A late success from a call admitted before the breaker tripped must
        // not close it; only the probe or a closed breaker resets.
        let closes = admission == Admission::Probe || inner.state == CircuitState::Closed;
        if !closes {
            return;
        }

        let previous = inner.state;
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        drop(inner);

        if previous != CircuitState::Closed {
            info!(breaker = %self.name, "circuit breaker closed after successful probe");
            self.publish_state(CircuitState::Closed);
        }
    }

    fn on_failure(&self, admission: Admission, err: &dyn Display) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let failures = inner.consecutive_failures;

        let trips = match admission {
            Admission::Probe => true,
            Admission::Normal => {
                inner.state == CircuitState::Closed && failures >= self.config.failure_threshold
            }
        };
        if admission == Admission::Probe {
            inner.probe_in_flight = false;
        }
        if trips {
            inner.state = CircuitState::Open;
            inner.last_failure_at = Some(self.clock.now());
        }
        drop(inner);

        error!(
            breaker = %self.name,
            failures,
            threshold = self.config.failure_threshold,
            error = %err,
            "circuit breaker call failed"
        );
        if trips {
            error!(breaker = %self.name, failures, "circuit breaker opened");
            self.publish_state(CircuitState::Open);
        }
    }

    fn publish_state(&self, state: CircuitState) {
        if let Some(metrics) = &self.metrics {
            metrics.set_breaker_state(state);
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the half-open permit if a probe future is dropped mid-flight.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl ProbeGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}
