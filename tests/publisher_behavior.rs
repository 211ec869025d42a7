//! Behavior-driven tests for Publisher behavior
//!
//! These tests verify HOW quotes are split into bounded chunks, validated,
//! retried, and guarded by the storage circuit breaker.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use quotestream_core::{
    ChunkError, CircuitBreaker, CircuitBreakerConfig, CircuitState, Clock, ErrorKind,
    InsertReport, ManualClock, PublishError, Publisher, Quote, QuoteSource, RetryConfig,
    StorageError, StoragePublisher, StorageSink, StreamingMetrics, UtcDateTime, ValidationError,
};

/// Scripted storage double: pops one response per call, then accepts.
#[derive(Debug, Default)]
struct RecordingSink {
    script: Mutex<Vec<StorageError>>,
    always_fail: Option<StorageError>,
    chunks: Mutex<Vec<Vec<Quote>>>,
}

impl RecordingSink {
    fn failing_with(error: StorageError) -> Self {
        Self {
            always_fail: Some(error),
            ..Self::default()
        }
    }

    fn failing_first(errors: Vec<StorageError>) -> Self {
        let mut script = errors;
        script.reverse();
        Self {
            script: Mutex::new(script),
            ..Self::default()
        }
    }

    fn calls(&self) -> usize {
        self.chunks.lock().expect("chunks").len()
    }

    fn chunk_sizes(&self) -> Vec<usize> {
        self.chunks
            .lock()
            .expect("chunks")
            .iter()
            .map(Vec::len)
            .collect()
    }
}

impl StorageSink for RecordingSink {
    fn send_to_storage<'a>(
        &'a self,
        chunk: &'a [Quote],
    ) -> Pin<Box<dyn Future<Output = Result<InsertReport, StorageError>> + Send + 'a>> {
        Box::pin(async move {
            self.chunks.lock().expect("chunks").push(chunk.to_vec());
            if let Some(error) = &self.always_fail {
                return Err(error.clone());
            }
            if let Some(error) = self.script.lock().expect("script").pop() {
                return Err(error);
            }
            Ok(InsertReport {
                inserted: chunk.len() as u64,
                errors: 0,
            })
        })
    }
}

fn quote(ticker: &str, close: f64) -> Quote {
    let ts = UtcDateTime::parse("2025-12-22T15:30:00Z").expect("timestamp");
    Quote::new(ticker, ts, close, QuoteSource::Yfinance)
}

fn numbered_quotes(count: usize) -> Vec<Quote> {
    (1..=count).map(|n| quote("AAPL", n as f64)).collect()
}

fn publisher(sink: Arc<RecordingSink>, threshold: u32, clock: &ManualClock) -> StoragePublisher {
    let breaker = CircuitBreaker::new(
        "storage-publisher",
        CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(60),
        },
    )
    .expect("valid breaker")
    .with_clock(Arc::new(clock.clone()));
    StoragePublisher::new(sink, breaker).with_clock(Arc::new(clock.clone()))
}

// =============================================================================
// Publisher: Chunking
// =============================================================================

#[tokio::test]
async fn when_1500_quotes_are_published_storage_receives_1000_then_500_in_order() {
    // Given: A healthy storage sink
    let clock = ManualClock::new();
    let sink = Arc::new(RecordingSink::default());
    let publisher = publisher(Arc::clone(&sink), 5, &clock);

    // When: 1500 valid quotes are published
    let report = publisher
        .publish(numbered_quotes(1500))
        .await
        .expect("publish accepted");

    // Then: Two chunks were sent, in input order
    assert_eq!(sink.chunk_sizes(), vec![1000, 500]);
    let chunks = sink.chunks.lock().expect("chunks");
    assert_eq!(chunks[0][0].close(), 1.0);
    assert_eq!(chunks[0][999].close(), 1000.0);
    assert_eq!(chunks[1][0].close(), 1001.0);
    assert_eq!(chunks[1][499].close(), 1500.0);

    // And: Everything was reported as published
    assert_eq!(report.chunks, 2);
    assert_eq!(report.chunks_sent, 2);
    assert_eq!(report.published, 1500);
    assert!(report.is_complete());
}

#[tokio::test]
async fn a_smaller_configured_batch_size_produces_more_chunks() {
    // Given: A publisher capped at 400 quotes per chunk
    let clock = ManualClock::new();
    let sink = Arc::new(RecordingSink::default());
    let publisher = publisher(Arc::clone(&sink), 5, &clock).with_max_batch(400);

    // When: 1000 quotes are published
    publisher
        .publish(numbered_quotes(1000))
        .await
        .expect("publish accepted");

    // Then: Chunks never exceed the cap
    assert_eq!(sink.chunk_sizes(), vec![400, 400, 200]);
}

#[tokio::test]
async fn when_input_is_empty_publish_is_rejected_and_nothing_is_sent() {
    // Given: A publisher
    let clock = ManualClock::new();
    let sink = Arc::new(RecordingSink::default());
    let publisher = publisher(Arc::clone(&sink), 5, &clock);

    // When: An empty list is published
    let result = publisher.publish(Vec::new()).await;

    // Then: It is a validation error and storage was never called
    assert_eq!(
        result,
        Err(PublishError::Validation(ValidationError::EmptyBatch))
    );
    assert_eq!(sink.calls(), 0);
}

// =============================================================================
// Publisher: Chunk Validation
// =============================================================================

#[tokio::test]
async fn when_one_quote_in_a_chunk_is_invalid_the_whole_chunk_is_dropped() {
    // Given: Ten quotes where the fourth has a zero close
    let clock = ManualClock::new();
    let sink = Arc::new(RecordingSink::default());
    let publisher = publisher(Arc::clone(&sink), 1, &clock);
    let mut quotes = numbered_quotes(10);
    quotes[3] = quote("TSLA", 0.0);

    // When: They are published as one chunk
    let report = publisher.publish(quotes).await.expect("publish accepted");

    // Then: Nothing was sent
    assert_eq!(sink.calls(), 0);
    assert_eq!(report.published, 0);

    // And: The failure names the offending quote
    assert_eq!(report.failures.len(), 1);
    match &report.failures[0].error {
        ChunkError::Validation(ValidationError::InvalidQuoteInBatch { index, .. }) => {
            assert_eq!(*index, 3);
        }
        other => panic!("expected chunk validation failure, got {other:?}"),
    }

    // And: The breaker is untouched even with threshold 1
    assert_eq!(publisher.circuit_state(), CircuitState::Closed);
    assert_eq!(publisher.breaker().consecutive_failures(), 0);
}

#[tokio::test]
async fn an_invalid_chunk_does_not_stop_later_chunks() {
    // Given: 2500 quotes with a bad one in the middle chunk
    let clock = ManualClock::new();
    let sink = Arc::new(RecordingSink::default());
    let publisher = publisher(Arc::clone(&sink), 5, &clock);
    let mut quotes = numbered_quotes(2500);
    quotes[1200] = quote("AAPL", f64::NAN);

    // When: They are published
    let report = publisher.publish(quotes).await.expect("publish accepted");

    // Then: The first and last chunks were sent, the middle one dropped
    assert_eq!(sink.chunk_sizes(), vec![1000, 500]);
    assert_eq!(report.chunks, 3);
    assert_eq!(report.chunks_sent, 2);
    assert_eq!(report.published, 1500);
    assert_eq!(report.failures[0].index, 1);
    assert_eq!(report.error_kinds(), vec![ErrorKind::Validation]);
}

// =============================================================================
// Publisher: Retry and Circuit Breaker
// =============================================================================

#[tokio::test]
async fn transient_failures_are_retried_until_storage_recovers() {
    // Given: Storage that times out twice then accepts
    let clock = ManualClock::new();
    let sink = Arc::new(RecordingSink::failing_first(vec![
        StorageError::from_status(503, "unavailable"),
        StorageError::transient("timeout"),
    ]));
    let publisher = publisher(Arc::clone(&sink), 5, &clock);
    let start = clock.now();

    // When: A chunk is published
    let report = publisher
        .publish(numbered_quotes(3))
        .await
        .expect("publish accepted");

    // Then: The third attempt succeeded after 1s + 2s of backoff
    assert_eq!(sink.calls(), 3);
    assert_eq!(report.published, 3);
    assert_eq!(clock.now() - start, Duration::from_secs(3));
    assert_eq!(publisher.breaker().consecutive_failures(), 0);
}

#[tokio::test]
async fn permanent_storage_errors_are_not_retried() {
    // Given: Storage that rejects the payload
    let clock = ManualClock::new();
    let sink = Arc::new(RecordingSink::failing_with(StorageError::from_status(
        422,
        "bad payload",
    )));
    let publisher = publisher(Arc::clone(&sink), 5, &clock);
    let start = clock.now();

    // When: A chunk is published
    let report = publisher
        .publish(numbered_quotes(2))
        .await
        .expect("publish accepted");

    // Then: Exactly one attempt was made, with no backoff
    assert_eq!(sink.calls(), 1);
    assert_eq!(clock.now(), start);
    assert_eq!(report.error_kinds(), vec![ErrorKind::Permanent]);
    assert_eq!(publisher.breaker().consecutive_failures(), 1);
}

#[tokio::test]
async fn when_breaker_is_open_chunks_are_dropped_without_calling_storage() {
    // Given: A publisher whose breaker trips after 2 failures, no retries
    let clock = ManualClock::new();
    let sink = Arc::new(RecordingSink::failing_with(StorageError::permanent(
        "schema mismatch",
    )));
    let publisher = publisher(Arc::clone(&sink), 2, &clock).with_retry(RetryConfig::no_retry());

    // When: Two publishes fail
    publisher.publish(numbered_quotes(1)).await.expect("publish accepted");
    publisher.publish(numbered_quotes(1)).await.expect("publish accepted");

    // Then: The breaker is open
    assert_eq!(publisher.circuit_state(), CircuitState::Open);
    assert_eq!(sink.calls(), 2);

    // When: The next cycle publishes 1500 quotes
    let report = publisher
        .publish(numbered_quotes(1500))
        .await
        .expect("publish accepted");

    // Then: Both chunks are dropped as circuit-open and storage is untouched
    assert_eq!(sink.calls(), 2);
    assert_eq!(
        report.error_kinds(),
        vec![ErrorKind::CircuitOpen, ErrorKind::CircuitOpen]
    );
    assert_eq!(report.published, 0);
}

#[tokio::test]
async fn after_cooldown_a_successful_probe_resumes_delivery() {
    // Given: Storage that fails once, behind a threshold-1 breaker
    let clock = ManualClock::new();
    let sink = Arc::new(RecordingSink::failing_first(vec![StorageError::permanent(
        "maintenance",
    )]));
    let publisher = publisher(Arc::clone(&sink), 1, &clock);
    publisher.publish(numbered_quotes(1)).await.expect("publish accepted");
    assert_eq!(publisher.circuit_state(), CircuitState::Open);

    // When: The cooldown elapses and another chunk is published
    clock.advance(Duration::from_secs(60));
    let report = publisher
        .publish(numbered_quotes(5))
        .await
        .expect("publish accepted");

    // Then: The probe went through and the breaker closed
    assert_eq!(report.published, 5);
    assert_eq!(publisher.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn publish_outcome_is_recorded_in_metrics() {
    // Given: A metrics-enabled publisher
    let clock = ManualClock::new();
    let metrics = Arc::new(StreamingMetrics::new().expect("metrics"));
    let sink = Arc::new(RecordingSink::default());
    let publisher = publisher(Arc::clone(&sink), 5, &clock).with_metrics(Arc::clone(&metrics));

    // When: 1200 quotes are published
    publisher
        .publish(numbered_quotes(1200))
        .await
        .expect("publish accepted");

    // Then: The published counter and publish histogram moved
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.quotes_published_total, 1200);
    assert_eq!(snapshot.publish_duration.count, 1);
}
