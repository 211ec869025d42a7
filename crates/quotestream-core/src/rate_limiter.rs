//! Request budget for the upstream source, backed by `governor`.
//!
//! A budget of `max_requests` per `period` becomes a GCRA quota that
//! replenishes one cell every `period / max_requests` and allows a burst of
//! `max_requests`, so a fresh limiter behaves like a full token bucket.
//! Callers are never denied: [`RateLimiter::acquire`] sleeps on the injected
//! [`Clock`] until `governor` admits the request. Waiters take turns through a
//! `tokio::sync::Mutex`, so they are served in FIFO order.

use std::fmt::{Debug, Formatter};
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use governor::middleware::{StateInformationMiddleware, StateSnapshot};
use governor::nanos::Nanos;
use governor::state::{InMemoryState, NotKeyed};
use governor::{NotUntil, Quota, RateLimiter as GovernorRateLimiter};
use tokio::time::Instant;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::metrics::StreamingMetrics;
use crate::ConfigError;

/// Request budget over a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub period: Duration,
}

impl RateLimitConfig {
    pub const fn per_hour(max_requests: u32) -> Self {
        Self {
            max_requests,
            period: Duration::from_secs(3600),
        }
    }

    fn quota(self) -> Result<Quota, ConfigError> {
        let burst = NonZeroU32::new(self.max_requests).ok_or(ConfigError::ZeroCapacity)?;
        let cell = self.period / self.max_requests;
        let quota = Quota::with_period(cell).ok_or(ConfigError::ZeroPeriod)?;
        Ok(quota.allow_burst(burst))
    }
}

/// Adapts a [`Clock`] to `governor`'s clock, measuring from construction.
#[derive(Debug, Clone)]
struct LimiterClock {
    clock: Arc<dyn Clock>,
    origin: Instant,
}

impl LimiterClock {
    fn new(clock: Arc<dyn Clock>) -> Self {
        let origin = clock.now();
        Self { clock, origin }
    }

    fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.origin)
    }
}

impl governor::clock::Clock for LimiterClock {
    type Instant = Nanos;

    fn now(&self) -> Nanos {
        Nanos::from(self.elapsed())
    }
}

type Gcra = GovernorRateLimiter<NotKeyed, InMemoryState, LimiterClock, StateInformationMiddleware>;

/// Last observation of the quota: the cells left at `seen_at`, both measured
/// on the limiter clock.
#[derive(Debug, Clone, Copy)]
struct Reading {
    remaining: u32,
    seen_at: Duration,
}

/// Async request limiter with an injected clock.
pub struct RateLimiter {
    capacity: u32,
    cell: Duration,
    gcra: Gcra,
    clock: LimiterClock,
    turn: tokio::sync::Mutex<()>,
    reading: Mutex<Option<Reading>>,
    metrics: Option<Arc<StreamingMetrics>>,
}

impl Debug for RateLimiter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("cell", &self.cell)
            .field("reading", &*self.last_reading_guard())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Fails fast on a zero capacity or zero period.
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        let quota = config.quota()?;
        let clock = LimiterClock::new(clock);
        let gcra = GovernorRateLimiter::direct_with_clock(quota, &clock)
            .with_middleware::<StateInformationMiddleware>();

        Ok(Self {
            capacity: config.max_requests,
            cell: quota.replenish_interval(),
            gcra,
            clock,
            turn: tokio::sync::Mutex::new(()),
            reading: Mutex::new(None),
            metrics: None,
        })
    }

    pub fn per_hour(max_requests: u32) -> Result<Self, ConfigError> {
        Self::new(RateLimitConfig::per_hour(max_requests), Arc::new(SystemClock))
    }

    pub fn with_metrics(mut self, metrics: Arc<StreamingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        1.0 / self.cell.as_secs_f64()
    }

    /// Waits for a token and consumes it.
    pub async fn acquire(&self) {
        let _turn = self.turn.lock().await;
        let mut waited = false;

        while let Err(wait) = self.check() {
            if !waited {
                waited = true;
                self.note_wait(wait);
            }
            self.clock.clock.sleep(wait).await;
        }
    }

    /// Like [`acquire`](Self::acquire) but gives up after `timeout`.
    /// Returns whether a token was consumed.
    pub async fn acquire_timeout(&self, timeout: Duration) -> bool {
        let started = self.clock.elapsed();
        let _turn = self.turn.lock().await;
        let mut waited = false;

        loop {
            let wait = match self.check() {
                Ok(()) => return true,
                Err(wait) => wait,
            };
            let spent = self.clock.elapsed().saturating_sub(started);
            let Some(left) = timeout.checked_sub(spent).filter(|left| !left.is_zero()) else {
                return false;
            };
            if !waited {
                waited = true;
                self.note_wait(wait);
            }
            self.clock.clock.sleep(wait.min(left)).await;
        }
    }

    /// Consumes a token only if one is available right now and nobody is
    /// queued ahead.
    pub fn try_acquire(&self) -> bool {
        match self.turn.try_lock() {
            Ok(_turn) => self.check().is_ok(),
            Err(_) => false,
        }
    }

    /// Whole tokens available now. Refills since the last check are counted
    /// in whole cells, so this never overstates the budget.
    pub async fn available_tokens(&self) -> u32 {
        let Some(reading) = self.last_reading() else {
            return self.capacity;
        };
        let refilled = self.cells_since(reading.seen_at);
        reading
            .remaining
            .saturating_add(refilled)
            .min(self.capacity)
    }

    /// Time until the next token becomes available (zero if one is ready).
    pub async fn wait_time(&self) -> Duration {
        if self.available_tokens().await > 0 {
            return Duration::ZERO;
        }
        match self.last_reading() {
            Some(reading) => (reading.seen_at + self.cell).saturating_sub(self.clock.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Consumes one cell, or returns how long until one is free.
    fn check(&self) -> Result<(), Duration> {
        let now = self.clock.elapsed();
        match self.gcra.check() {
            Ok(snapshot) => {
                self.record(snapshot_reading(&snapshot, now));
                Ok(())
            }
            Err(refusal) => {
                let wait = wait_from(&refusal, now);
                // An empty bucket that frees its next cell after `wait`.
                self.record(Reading {
                    remaining: 0,
                    seen_at: (now + wait).saturating_sub(self.cell),
                });
                Err(wait)
            }
        }
    }

    fn cells_since(&self, seen_at: Duration) -> u32 {
        let elapsed = self.clock.elapsed().saturating_sub(seen_at);
        let cells = elapsed.as_nanos() / self.cell.as_nanos().max(1);
        u32::try_from(cells).unwrap_or(u32::MAX)
    }

    fn record(&self, reading: Reading) {
        *self.last_reading_guard() = Some(reading);
    }

    fn last_reading(&self) -> Option<Reading> {
        *self.last_reading_guard()
    }

    fn last_reading_guard(&self) -> std::sync::MutexGuard<'_, Option<Reading>> {
        self.reading.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn note_wait(&self, wait: Duration) {
        debug!(wait_ms = wait.as_millis() as u64, "rate limiter waiting for token");
        if let Some(metrics) = &self.metrics {
            metrics.record_rate_limit_wait();
        }
    }
}

fn snapshot_reading(snapshot: &StateSnapshot, now: Duration) -> Reading {
    Reading {
        remaining: snapshot.remaining_burst_capacity(),
        seen_at: now,
    }
}

fn wait_from(refusal: &NotUntil<Nanos>, now: Duration) -> Duration {
    refusal.wait_time_from(Nanos::from(now))
}
