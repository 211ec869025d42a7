use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ticker::validate_ticker;
use crate::{UtcDateTime, ValidationError};

/// Allow-list of quote origin identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuoteSource {
    Yfinance,
    Iexcloud,
    Polygon,
    Alphavantage,
}

impl QuoteSource {
    pub const ALL: [Self; 4] = [Self::Yfinance, Self::Iexcloud, Self::Polygon, Self::Alphavantage];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Yfinance => "yfinance",
            Self::Iexcloud => "iexcloud",
            Self::Polygon => "polygon",
            Self::Alphavantage => "alphavantage",
        }
    }
}

impl Display for QuoteSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuoteSource {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "yfinance" => Ok(Self::Yfinance),
            "iexcloud" => Ok(Self::Iexcloud),
            "polygon" => Ok(Self::Polygon),
            "alphavantage" => Ok(Self::Alphavantage),
            other => Err(ValidationError::InvalidSource {
                value: other.to_owned(),
            }),
        }
    }
}

/// Point-in-time price observation.
///
/// A `Quote` is immutable once built: the `with_*` helpers consume and return
/// a new value. Construction does not validate, so data sources can hand over
/// whatever the upstream reported and the pipeline decides what to drop via
/// [`Quote::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    ticker: String,
    timestamp: UtcDateTime,
    close: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    open: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    high: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    low: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    volume: Option<u64>,
    source: QuoteSource,
}

impl Quote {
    pub fn new(
        ticker: impl Into<String>,
        timestamp: UtcDateTime,
        close: f64,
        source: QuoteSource,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            timestamp,
            close,
            open: None,
            high: None,
            low: None,
            volume: None,
            source,
        }
    }

    pub fn with_open(self, open: Option<f64>) -> Self {
        Self { open, ..self }
    }

    pub fn with_high(self, high: Option<f64>) -> Self {
        Self { high, ..self }
    }

    pub fn with_low(self, low: Option<f64>) -> Self {
        Self { low, ..self }
    }

    pub fn with_volume(self, volume: Option<u64>) -> Self {
        Self { volume, ..self }
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn timestamp(&self) -> UtcDateTime {
        self.timestamp
    }

    pub fn close(&self) -> f64 {
        self.close
    }

    pub fn open(&self) -> Option<f64> {
        self.open
    }

    pub fn high(&self) -> Option<f64> {
        self.high
    }

    pub fn low(&self) -> Option<f64> {
        self.low
    }

    pub fn volume(&self) -> Option<u64> {
        self.volume
    }

    pub fn source(&self) -> QuoteSource {
        self.source
    }

    /// Checks the storage invariants. `timestamp` and `source` hold by type.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_ticker(&self.ticker)?;

        if !self.close.is_finite() {
            return Err(ValidationError::NonFiniteValue { field: "close" });
        }
        if self.close <= 0.0 {
            return Err(ValidationError::NonPositiveClose {
                ticker: self.ticker.clone(),
                value: self.close,
            });
        }

        validate_optional_positive("open", self.open)?;
        validate_optional_positive("high", self.high)?;
        validate_optional_positive("low", self.low)?;

        Ok(())
    }
}

fn validate_optional_positive(
    field: &'static str,
    value: Option<f64>,
) -> Result<(), ValidationError> {
    if let Some(value) = value {
        if !value.is_finite() {
            return Err(ValidationError::NonFiniteValue { field });
        }
        if value <= 0.0 {
            return Err(ValidationError::NonPositiveValue { field });
        }
    }
    Ok(())
}

/// Request body accepted by the storage batch endpoint: `{"quotes": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireBatch {
    pub quotes: Vec<Quote>,
}

#[derive(Serialize)]
struct WireBatchRef<'a> {
    quotes: &'a [Quote],
}

/// Serializes a chunk into the storage wire format without cloning it.
pub fn encode_wire_batch(quotes: &[Quote]) -> Result<String, serde_json::Error> {
    serde_json::to_string(&WireBatchRef { quotes })
}

pub fn decode_wire_batch(body: &str) -> Result<Vec<Quote>, serde_json::Error> {
    serde_json::from_str::<WireBatch>(body).map(|batch| batch.quotes)
}
