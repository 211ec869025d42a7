//! Static streamer configuration, read once at startup.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::adapters::default_source_retry;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::redis_publisher::{DEFAULT_REDIS_CHANNEL, DEFAULT_REDIS_URL, REDIS_BREAKER_COOLDOWN};
use crate::retry::RetryConfig;
use crate::{ConfigError, Ticker, MAX_BATCH};

pub const MIN_POLLING_INTERVAL: Duration = Duration::from_secs(1);
pub const MAX_POLLING_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_TICKERS: [&str; 5] = ["AAPL", "MSFT", "GOOGL", "AMZN", "TSLA"];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamerConfig {
    pub tickers: Vec<Ticker>,
    #[serde(serialize_with = "as_secs")]
    pub polling_interval: Duration,
    pub max_requests_per_hour: u32,
    pub source_url: String,
    pub symbols_per_request: usize,
    pub storage_url: String,
    #[serde(serialize_with = "as_secs")]
    pub storage_timeout: Duration,
    pub circuit_breaker_threshold: u32,
    #[serde(serialize_with = "as_secs")]
    pub circuit_breaker_timeout: Duration,
    pub max_batch_size: usize,
    #[serde(serialize_with = "as_secs")]
    pub shutdown_timeout: Duration,
    /// Deliver batches to the storage service.
    pub publisher_enabled: bool,
    /// Also send each quote as a CloudEvent on a Redis channel.
    pub redis_publisher_enabled: bool,
    pub redis_url: String,
    pub redis_channel: String,
    /// Randomise retry backoff delays.
    pub retry_jitter: bool,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            tickers: DEFAULT_TICKERS
                .iter()
                .filter_map(|t| Ticker::parse(t).ok())
                .collect(),
            polling_interval: Duration::from_secs(5),
            max_requests_per_hour: 2000,
            source_url: String::from(crate::adapters::DEFAULT_YAHOO_BASE_URL),
            symbols_per_request: 50,
            storage_url: String::from("http://localhost:8000"),
            storage_timeout: Duration::from_secs(30),
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: Duration::from_secs(60),
            max_batch_size: MAX_BATCH,
            shutdown_timeout: Duration::from_secs(10),
            publisher_enabled: true,
            redis_publisher_enabled: false,
            redis_url: String::from(DEFAULT_REDIS_URL),
            redis_channel: String::from(DEFAULT_REDIS_CHANNEL),
            retry_jitter: false,
        }
    }
}

impl StreamerConfig {
    /// Parses a comma-separated ticker list, dropping duplicates but keeping
    /// first-seen order.
    pub fn parse_tickers(input: &str) -> Result<Vec<Ticker>, ConfigError> {
        let mut seen = HashSet::new();
        let mut tickers = Vec::new();
        for raw in input.split(',').filter(|s| !s.trim().is_empty()) {
            let ticker = Ticker::parse(raw)?;
            if seen.insert(ticker.clone()) {
                tickers.push(ticker);
            }
        }
        if tickers.is_empty() {
            return Err(ConfigError::EmptyTickers);
        }
        Ok(tickers)
    }

    pub fn with_tickers(mut self, tickers: Vec<Ticker>) -> Self {
        let mut seen = HashSet::new();
        self.tickers = tickers
            .into_iter()
            .filter(|t| seen.insert(t.clone()))
            .collect();
        self
    }

    /// Checks every startup rule; the first violation wins.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tickers.is_empty() {
            return Err(ConfigError::EmptyTickers);
        }
        if !(MIN_POLLING_INTERVAL..=MAX_POLLING_INTERVAL).contains(&self.polling_interval) {
            return Err(ConfigError::InvalidPollingInterval {
                min: MIN_POLLING_INTERVAL.as_secs(),
                max: MAX_POLLING_INTERVAL.as_secs(),
                actual_ms: self.polling_interval.as_millis(),
            });
        }
        if self.max_requests_per_hour == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.symbols_per_request == 0 {
            return Err(ConfigError::InvalidSymbolsPerRequest);
        }
        validate_url("source_url", &self.source_url)?;
        validate_url("storage_url", &self.storage_url)?;
        if self.circuit_breaker_threshold == 0 {
            return Err(ConfigError::InvalidFailureThreshold);
        }
        if self.circuit_breaker_timeout.is_zero() {
            return Err(ConfigError::InvalidCooldown);
        }
        if !(1..=MAX_BATCH).contains(&self.max_batch_size) {
            return Err(ConfigError::InvalidBatchSize {
                actual: self.max_batch_size,
                max: MAX_BATCH,
            });
        }
        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::InvalidShutdownTimeout);
        }
        if !self.publisher_enabled && !self.redis_publisher_enabled {
            return Err(ConfigError::NoPublisherEnabled);
        }
        if self.redis_publisher_enabled {
            validate_redis_url(&self.redis_url)?;
            if self.redis_channel.trim().is_empty() {
                return Err(ConfigError::InvalidRedisChannel);
            }
        }
        Ok(())
    }

    pub fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig::per_hour(self.max_requests_per_hour)
    }

    pub fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_threshold,
            cooldown: self.circuit_breaker_timeout,
        }
    }

    /// Same failure threshold as storage, shorter cooldown.
    pub fn redis_circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker_threshold,
            cooldown: REDIS_BREAKER_COOLDOWN,
        }
    }

    pub fn storage_retry(&self) -> RetryConfig {
        RetryConfig::default().with_jitter(self.retry_jitter)
    }

    pub fn source_retry(&self) -> RetryConfig {
        default_source_retry().with_jitter(self.retry_jitter)
    }
}

fn validate_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    let has_host = trimmed
        .strip_prefix("http://")
        .or_else(|| trimmed.strip_prefix("https://"))
        .is_some_and(|rest| !rest.is_empty());
    if has_host {
        Ok(())
    } else {
        Err(ConfigError::InvalidUrl {
            field,
            value: value.to_owned(),
        })
    }
}

fn validate_redis_url(value: &str) -> Result<(), ConfigError> {
    let trimmed = value.trim();
    let has_host = trimmed
        .strip_prefix("redis://")
        .or_else(|| trimmed.strip_prefix("rediss://"))
        .is_some_and(|rest| !rest.is_empty());
    if has_host {
        Ok(())
    } else {
        Err(ConfigError::InvalidRedisUrl(value.to_owned()))
    }
}

fn as_secs<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(value.as_secs_f64())
}
