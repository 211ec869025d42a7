//! # Quotestream Core
//!
//! Resilient polling ingestion: pull quotes from a rate-limited upstream,
//! validate them, and deliver them in bounded batches to a storage service
//! that may fail. Quotes can also be fanned out as CloudEvents on a Redis
//! pub/sub channel.
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapters`] | Concrete upstream adapters (Yahoo quote endpoint) |
//! | [`circuit_breaker`] | Closed/Open/HalfOpen breaker with single-flight probing |
//! | [`clock`] | Injectable time source |
//! | [`config`] | Static startup configuration and validation |
//! | [`data_source`] | Upstream capability trait |
//! | [`domain`] | Quote, Batch, Ticker, timestamps |
//! | [`error`] | Validation and configuration errors, error kinds |
//! | [`http_client`] | HTTP transport abstraction |
//! | [`metrics`] | Prometheus collectors and snapshots |
//! | [`publisher`] | Batch splitting, validation, breaker and retry |
//! | [`rate_limiter`] | Token bucket for upstream requests |
//! | [`redis_publisher`] | CloudEvents over Redis pub/sub |
//! | [`retry`] | Backoff policy |
//! | [`service`] | Poll loop and lifecycle |
//! | [`storage`] | Downstream capability trait and HTTP sink |
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   fetch    ┌──────────────┐    ┌──────────────┐
//! │ StreamingService │──────────▶│  DataSource  │──▶│ RateLimiter  │
//! └────────┬─────────┘            └──────────────┘    └──────────────┘
//!          │ validate + publish
//!          ▼
//! ┌──────────────────┐   call     ┌──────────────┐    ┌──────────────┐
//! │ FanoutPublisher  │──────────▶│CircuitBreaker│──▶│ StorageSink  │
//! └────────┬─────────┘            └──────────────┘    └──────────────┘
//!          │ per quote
//!          ▼
//! ┌──────────────────┐   call     ┌──────────────┐    ┌──────────────┐
//! │  RedisPublisher  │──────────▶│CircuitBreaker│──▶│MessageChannel│
//! └──────────────────┘            └──────────────┘    └──────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Only [`ConfigError`] is fatal, and only at construction. Everything that
//! goes wrong inside a cycle is classified as an [`ErrorKind`], recorded on the
//! [`CycleReport`] and in [`StreamingMetrics`], and the loop carries on.
//!
//! ```rust
//! use quotestream_core::{ConfigError, RateLimiter};
//!
//! assert_eq!(RateLimiter::per_hour(0).err(), Some(ConfigError::ZeroCapacity));
//! ```

pub mod adapters;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod data_source;
pub mod domain;
pub mod error;
pub mod http_client;
pub mod metrics;
pub mod publisher;
pub mod rate_limiter;
pub mod redis_publisher;
pub mod retry;
pub mod service;
pub mod storage;

// Adapters
pub use adapters::{default_source_retry, YahooQuoteSource};

// Circuit breaker
pub use circuit_breaker::{
    CallError, CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitState,
};

// Time
pub use clock::{Clock, ManualClock, SystemClock};

// Configuration
pub use config::StreamerConfig;

// Data source trait and types
pub use data_source::{DataSource, FetchOutcome, SourceError, SourceErrorKind};

// Domain models
pub use domain::{
    decode_wire_batch, encode_wire_batch, Batch, Quote, QuoteSource, Ticker, UtcDateTime,
    WireBatch, MAX_BATCH,
};

// Error types
pub use error::{ConfigError, ErrorKind, ValidationError};

// HTTP client types
pub use http_client::{HttpClient, HttpError, HttpMethod, HttpRequest, HttpResponse, ReqwestHttpClient};

// Metrics
pub use metrics::{HistogramSnapshot, MetricsSnapshot, StreamingMetrics};

// Publishing
pub use publisher::{
    ChunkError, ChunkFailure, FanoutPublisher, PublishError, PublishReport, Publisher,
    StoragePublisher,
};
pub use redis_publisher::{
    ChannelError, MessageChannel, QuoteEvent, RedisChannel, RedisPublisher,
    DEFAULT_REDIS_CHANNEL, DEFAULT_REDIS_URL,
};

// Rate limiting and retry
pub use rate_limiter::{RateLimitConfig, RateLimiter};
pub use retry::{Backoff, RetryConfig};

// Service
pub use service::{CycleReport, ServiceError, ServiceState, StopOutcome, StreamingService};

// Storage
pub use storage::{HttpStorageSink, InsertReport, StorageError, StorageErrorKind, StorageSink};
