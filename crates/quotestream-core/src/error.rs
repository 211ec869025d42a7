use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Data-quality errors raised when a quote or batch violates an invariant.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("ticker cannot be empty")]
    EmptyTicker,
    #[error("ticker '{value}' must be 1-5 uppercase ASCII letters")]
    InvalidTicker { value: String },

    #[error("close for '{ticker}' must be positive, got {value}")]
    NonPositiveClose { ticker: String, value: f64 },
    #[error("field '{field}' must be finite")]
    NonFiniteValue { field: &'static str },
    #[error("field '{field}' must be positive when present")]
    NonPositiveValue { field: &'static str },

    #[error("timestamp must be RFC3339 UTC (suffix Z): '{value}'")]
    TimestampNotUtc { value: String },
    #[error("invalid source '{value}', expected one of yfinance, iexcloud, polygon, alphavantage")]
    InvalidSource { value: String },

    #[error("batch must contain at least one quote")]
    EmptyBatch,
    #[error("batch size {len} exceeds max {max}")]
    BatchTooLarge { len: usize, max: usize },
    #[error("quote at index {index} is invalid: {reason}")]
    InvalidQuoteInBatch {
        index: usize,
        reason: Box<ValidationError>,
    },
}

/// Startup configuration errors. These are the only fatal errors in the pipeline.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("rate limiter capacity must be greater than zero")]
    ZeroCapacity,
    #[error("rate limiter period must be greater than zero")]
    ZeroPeriod,
    #[error("ticker list must contain at least one symbol")]
    EmptyTickers,
    #[error(transparent)]
    InvalidTicker(#[from] ValidationError),
    #[error("polling interval must be within {min}s..={max}s, got {actual_ms}ms")]
    InvalidPollingInterval { min: u64, max: u64, actual_ms: u128 },
    #[error("circuit breaker failure threshold must be at least 1")]
    InvalidFailureThreshold,
    #[error("circuit breaker cooldown must be greater than zero")]
    InvalidCooldown,
    #[error("max batch size must be within 1..={max}, got {actual}")]
    InvalidBatchSize { actual: usize, max: usize },
    #[error("{field} must be an http:// or https:// url, got '{value}'")]
    InvalidUrl { field: &'static str, value: String },
    #[error("shutdown timeout must be greater than zero")]
    InvalidShutdownTimeout,
    #[error("symbols per request must be greater than zero")]
    InvalidSymbolsPerRequest,
    #[error("at least one of the storage and redis publishers must be enabled")]
    NoPublisherEnabled,
    #[error("redis url must be a redis:// or rediss:// url, got '{0}'")]
    InvalidRedisUrl(String),
    #[error("redis channel must not be empty")]
    InvalidRedisChannel,
}

/// Error classification shared by cycle records and the error counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceUnavailable,
    Validation,
    CircuitOpen,
    Transient,
    Permanent,
}

impl ErrorKind {
    pub const ALL: [Self; 5] = [
        Self::SourceUnavailable,
        Self::Validation,
        Self::CircuitOpen,
        Self::Transient,
        Self::Permanent,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SourceUnavailable => "source_unavailable",
            Self::Validation => "validation",
            Self::CircuitOpen => "circuit_open",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Self::SourceUnavailable => 0,
            Self::Validation => 1,
            Self::CircuitOpen => 2,
            Self::Transient => 3,
            Self::Permanent => 4,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_indexes_are_dense_and_unique() {
        let mut seen = [false; ErrorKind::ALL.len()];
        for kind in ErrorKind::ALL {
            assert!(!seen[kind.index()], "duplicate index for {kind}");
            seen[kind.index()] = true;
        }
        assert!(seen.iter().all(|flag| *flag));
    }

    #[test]
    fn nested_batch_error_mentions_index_and_reason() {
        let error = ValidationError::InvalidQuoteInBatch {
            index: 3,
            reason: Box::new(ValidationError::NonPositiveClose {
                ticker: String::from("TSLA"),
                value: 0.0,
            }),
        };
        let message = error.to_string();
        assert!(message.contains("index 3"));
        assert!(message.contains("TSLA"));
    }
}
