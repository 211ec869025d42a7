//! Bounded retries with capped exponential backoff.

use std::time::Duration;

/// Delay schedule `initial * multiplier^attempt`, capped at `max`.
///
/// With `jitter` set, each delay is scaled by a random factor in
/// `[0.5, 1.5)` so that callers failing together do not retry together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub multiplier: u32,
    pub max: Duration,
    pub jitter: bool,
}

impl Default for Backoff {
    /// 1s, 2s, 4s, 4s, ...
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            multiplier: 2,
            max: Duration::from_secs(4),
            jitter: false,
        }
    }
}

impl Backoff {
    /// The same delay before every retry.
    pub const fn constant(delay: Duration) -> Self {
        Self {
            initial: delay,
            multiplier: 1,
            max: delay,
            jitter: false,
        }
    }

    pub fn with_jitter(self, jitter: bool) -> Self {
        Self { jitter, ..self }
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self
            .multiplier
            .checked_pow(attempt)
            .and_then(|scale| self.initial.checked_mul(scale))
            .map_or(self.max, |delay| delay.min(self.max));

        if self.jitter {
            scaled.mul_f64(0.5 + fastrand::f64())
        } else {
            scaled
        }
    }
}

/// How many times a failed call is repeated, and how long to wait between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryConfig {
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::constant(delay),
            ..Self::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.backoff = self.backoff.with_jitter(jitter);
        self
    }

    /// Whether another attempt is allowed after `retries_done` retries.
    pub fn allows_retry(&self, retries_done: u32) -> bool {
        self.enabled && retries_done < self.max_retries
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}
