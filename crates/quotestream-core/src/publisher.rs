//! Storage publisher: split, validate, and deliver quotes behind a breaker.
//! [`FanoutPublisher`] chains it with other publishers.
//!
//! `publish` never fails as a whole once it has something to send. Each chunk
//! succeeds or fails on its own and failures are reported per chunk in
//! [`PublishReport::failures`]:
//!
//! | Failure | Retried | Counts against the breaker |
//! |---------|---------|----------------------------|
//! | validation | no | no |
//! | breaker open | no (dropped for this cycle) | no |
//! | transient storage error | yes, with backoff | once, after retries are exhausted |
//! | permanent storage error | no | once |

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use crate::circuit_breaker::{CallError, CircuitBreaker, CircuitOpenError, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::metrics::StreamingMetrics;
use crate::redis_publisher::ChannelError;
use crate::retry::RetryConfig;
use crate::storage::{InsertReport, StorageError, StorageSink};
use crate::{Batch, ErrorKind, Quote, ValidationError, MAX_BATCH};

/// Rejection of a publish call before any chunk was attempted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PublishError {
    #[error("invalid publish input: {0}")]
    Validation(#[from] ValidationError),
}

impl PublishError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
        }
    }
}

/// Why one chunk was not delivered.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChunkError {
    #[error(transparent)]
    Validation(ValidationError),
    #[error(transparent)]
    CircuitOpen(CircuitOpenError),
    #[error(transparent)]
    Storage(StorageError),
    #[error(transparent)]
    Channel(ChannelError),
}

impl ChunkError {
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::Storage(error) => error.error_kind(),
            Self::Channel(error) => error.error_kind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkFailure {
    /// Position of the chunk in split order.
    pub index: usize,
    pub size: usize,
    pub error: ChunkError,
}

/// Outcome of one `publish` call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishReport {
    pub chunks: usize,
    pub chunks_sent: usize,
    /// Quotes storage reported as inserted.
    pub published: usize,
    /// Row-level errors storage reported inside accepted chunks.
    pub storage_errors: u64,
    pub failures: Vec<ChunkFailure>,
}

impl PublishReport {
    pub fn error_kinds(&self) -> Vec<ErrorKind> {
        self.failures.iter().map(|f| f.error.kind()).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Downstream capability used by the streaming service.
pub trait Publisher: Send + Sync {
    fn publish<'a>(
        &'a self,
        quotes: Vec<Quote>,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReport, PublishError>> + Send + 'a>>;
}

/// Publisher that owns the storage circuit breaker.
pub struct StoragePublisher {
    sink: Arc<dyn StorageSink>,
    breaker: CircuitBreaker,
    retry: RetryConfig,
    max_batch: usize,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<StreamingMetrics>>,
}

impl std::fmt::Debug for StoragePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoragePublisher")
            .field("breaker", &self.breaker)
            .field("retry", &self.retry)
            .field("max_batch", &self.max_batch)
            .finish_non_exhaustive()
    }
}

impl StoragePublisher {
    pub fn new(sink: Arc<dyn StorageSink>, breaker: CircuitBreaker) -> Self {
        Self {
            sink,
            breaker,
            retry: RetryConfig::default(),
            max_batch: MAX_BATCH,
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Clamped to `1..=MAX_BATCH`.
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.clamp(1, MAX_BATCH);
        self
    }

    /// Clock used for retry backoff sleeps and publish timing.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<StreamingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn max_batch(&self) -> usize {
        self.max_batch
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn reset_circuit(&self) {
        info!(breaker = %self.breaker.name(), "manually resetting circuit breaker");
        self.breaker.reset();
    }

    async fn send_with_retry(&self, chunk: &[Quote]) -> Result<InsertReport, StorageError> {
        let mut retries = 0;
        loop {
            match self.sink.send_to_storage(chunk).await {
                Ok(ack) => return Ok(ack),
                Err(err) if err.retryable() && self.retry.allows_retry(retries) => {
                    let delay = self.retry.delay_for_attempt(retries);
                    retries += 1;
                    warn!(
                        attempt = retries,
                        max_retries = self.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient storage error, retrying"
                    );
                    self.clock.sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn publish_chunks(&self, quotes: Vec<Quote>) -> Result<PublishReport, PublishError> {
        if quotes.is_empty() {
            return Err(ValidationError::EmptyBatch.into());
        }

        let started = self.clock.now();
        let batches = Batch::split(quotes, self.max_batch)?;
        let mut report = PublishReport {
            chunks: batches.len(),
            ..PublishReport::default()
        };

        for (index, batch) in batches.iter().enumerate() {
            if let Err(err) = batch.validate() {
                warn!(chunk = index, size = batch.len(), error = %err, "chunk failed validation, dropping");
                report.failures.push(ChunkFailure {
                    index,
                    size: batch.len(),
                    error: ChunkError::Validation(err),
                });
                continue;
            }

            match self.breaker.call(|| self.send_with_retry(batch)).await {
                Ok(ack) => {
                    report.chunks_sent += 1;
                    report.published += usize::try_from(ack.inserted).unwrap_or(usize::MAX);
                    report.storage_errors += ack.errors;
                    if ack.errors > 0 {
                        warn!(
                            chunk = index,
                            inserted = ack.inserted,
                            errors = ack.errors,
                            "storage rejected some quotes in chunk"
                        );
                    }
                }
                Err(CallError::Open(err)) => {
                    report.failures.push(ChunkFailure {
                        index,
                        size: batch.len(),
                        error: ChunkError::CircuitOpen(err),
                    });
                }
                Err(CallError::Failed(err)) => {
                    error!(chunk = index, size = batch.len(), error = %err, "chunk delivery failed");
                    report.failures.push(ChunkFailure {
                        index,
                        size: batch.len(),
                        error: ChunkError::Storage(err),
                    });
                }
            }
        }

        let elapsed = self.clock.now().saturating_duration_since(started);
        if let Some(metrics) = &self.metrics {
            metrics.record_publish(report.published, elapsed);
        }
        info!(
            chunks = report.chunks,
            chunks_sent = report.chunks_sent,
            published = report.published,
            failed_chunks = report.failures.len(),
            "publish complete"
        );

        Ok(report)
    }
}

impl Publisher for StoragePublisher {
    fn publish<'a>(
        &'a self,
        quotes: Vec<Quote>,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReport, PublishError>> + Send + 'a>> {
        Box::pin(self.publish_chunks(quotes))
    }
}

/// Hands every batch to a primary publisher, then to each secondary in turn.
///
/// The report is the primary's: `published` counts what the primary
/// delivered. Secondary failures are appended to it so they show up in the
/// cycle's error accounting, and a secondary never blocks the primary.
pub struct FanoutPublisher {
    primary: Arc<dyn Publisher>,
    secondaries: Vec<Arc<dyn Publisher>>,
}

impl std::fmt::Debug for FanoutPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutPublisher")
            .field("publishers", &(1 + self.secondaries.len()))
            .finish_non_exhaustive()
    }
}

impl FanoutPublisher {
    pub fn new(primary: Arc<dyn Publisher>) -> Self {
        Self {
            primary,
            secondaries: Vec::new(),
        }
    }

    /// The first publisher becomes the primary; `None` when the list is empty.
    pub fn from_publishers(publishers: Vec<Arc<dyn Publisher>>) -> Option<Self> {
        let mut publishers = publishers.into_iter();
        let primary = publishers.next()?;
        Some(Self {
            primary,
            secondaries: publishers.collect(),
        })
    }

    pub fn with_secondary(mut self, publisher: Arc<dyn Publisher>) -> Self {
        self.secondaries.push(publisher);
        self
    }

    pub fn len(&self) -> usize {
        1 + self.secondaries.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    async fn publish_all(&self, quotes: Vec<Quote>) -> Result<PublishReport, PublishError> {
        let mut report = self.primary.publish(quotes.clone()).await?;

        for secondary in &self.secondaries {
            match secondary.publish(quotes.clone()).await {
                Ok(extra) => report.failures.extend(extra.failures),
                Err(err) => {
                    warn!(error = %err, "secondary publisher rejected batch");
                    report.failures.push(ChunkFailure {
                        index: 0,
                        size: quotes.len(),
                        error: match err {
                            PublishError::Validation(reason) => ChunkError::Validation(reason),
                        },
                    });
                }
            }
        }

        Ok(report)
    }
}

impl Publisher for FanoutPublisher {
    fn publish<'a>(
        &'a self,
        quotes: Vec<Quote>,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReport, PublishError>> + Send + 'a>> {
        Box::pin(self.publish_all(quotes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitBreakerConfig;
    use crate::clock::ManualClock;
    use crate::{QuoteSource, UtcDateTime};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct FlakySink {
        transient_failures_left: Mutex<u32>,
        calls: Mutex<u32>,
    }

    impl StorageSink for FlakySink {
        fn send_to_storage<'a>(
            &'a self,
            chunk: &'a [Quote],
        ) -> Pin<Box<dyn Future<Output = Result<InsertReport, StorageError>> + Send + 'a>> {
            Box::pin(async move {
                *self.calls.lock().expect("calls") += 1;
                let mut left = self.transient_failures_left.lock().expect("failures");
                if *left > 0 {
                    *left -= 1;
                    return Err(StorageError::from_status(503, "busy"));
                }
                Ok(InsertReport {
                    inserted: chunk.len() as u64,
                    errors: 0,
                })
            })
        }
    }

    fn quote() -> Quote {
        let ts = UtcDateTime::parse("2025-12-22T15:30:00Z").expect("timestamp");
        Quote::new("AAPL", ts, 178.45, QuoteSource::Yfinance)
    }

    fn publisher(sink: Arc<FlakySink>, clock: &ManualClock) -> StoragePublisher {
        let breaker = CircuitBreaker::new("storage", CircuitBreakerConfig::default())
            .expect("breaker")
            .with_clock(Arc::new(clock.clone()));
        StoragePublisher::new(sink, breaker).with_clock(Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn transient_errors_are_retried_with_one_two_four_second_backoff() {
        let clock = ManualClock::new();
        let sink = Arc::new(FlakySink {
            transient_failures_left: Mutex::new(3),
            ..FlakySink::default()
        });
        let publisher = publisher(Arc::clone(&sink), &clock);
        let start = clock.now();

        let report = publisher.publish(vec![quote()]).await.expect("publish");

        assert_eq!(report.published, 1);
        assert_eq!(*sink.calls.lock().expect("calls"), 4);
        assert_eq!(clock.now() - start, Duration::from_secs(7));
        assert_eq!(publisher.breaker().consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_count_as_one_breaker_failure() {
        let clock = ManualClock::new();
        let sink = Arc::new(FlakySink {
            transient_failures_left: Mutex::new(10),
            ..FlakySink::default()
        });
        let publisher = publisher(Arc::clone(&sink), &clock);

        let report = publisher.publish(vec![quote()]).await.expect("publish");

        assert_eq!(report.error_kinds(), vec![ErrorKind::Transient]);
        assert_eq!(*sink.calls.lock().expect("calls"), 4);
        assert_eq!(publisher.breaker().consecutive_failures(), 1);
    }

    #[tokio::test]
    async fn empty_input_is_a_validation_error() {
        let clock = ManualClock::new();
        let publisher = publisher(Arc::new(FlakySink::default()), &clock);

        let err = publisher.publish(Vec::new()).await.expect_err("empty input");

        assert_eq!(err, PublishError::Validation(ValidationError::EmptyBatch));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
