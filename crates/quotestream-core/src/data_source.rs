//! Upstream capability: fetch a best-effort quote batch for a ticker set.
//!
//! Implementations must acquire a rate-limiter token before every physical
//! request they issue. Tickers that yield no data are reported through
//! [`FetchOutcome::omitted`], not as errors. Only a total failure of the
//! upstream surfaces as [`SourceError`].

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use crate::{ErrorKind, Quote, Ticker};

/// Source error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorKind {
    Unavailable,
    InvalidRequest,
    Internal,
}

/// Structured upstream error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    kind: SourceErrorKind,
    message: String,
    retryable: bool,
}

impl SourceError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Unavailable,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::InvalidRequest,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: SourceErrorKind::Internal,
            message: message.into(),
            retryable: false,
        }
    }

    /// Overrides whether repeating the request may help.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub const fn kind(&self) -> SourceErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            SourceErrorKind::Unavailable => "source.unavailable",
            SourceErrorKind::InvalidRequest => "source.invalid_request",
            SourceErrorKind::Internal => "source.internal",
        }
    }

    /// Every source failure aborts the cycle's fetch, so all kinds count as
    /// `source_unavailable`.
    pub const fn error_kind(&self) -> ErrorKind {
        ErrorKind::SourceUnavailable
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code())
    }
}

impl std::error::Error for SourceError {}

/// Result of a fetch that reached the upstream at least once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchOutcome {
    /// Quotes in fetch order.
    pub quotes: Vec<Quote>,
    /// Requested tickers that produced no quote.
    pub omitted: Vec<Ticker>,
}

impl FetchOutcome {
    pub fn new(quotes: Vec<Quote>, omitted: Vec<Ticker>) -> Self {
        Self { quotes, omitted }
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}

/// Upstream quote provider contract.
pub trait DataSource: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    fn fetch<'a>(
        &'a self,
        tickers: &'a [Ticker],
    ) -> Pin<Box<dyn Future<Output = Result<FetchOutcome, SourceError>> + Send + 'a>>;
}
