//! Real-time quote events over Redis pub/sub.
//!
//! Each valid quote becomes one CloudEvents 1.0 JSON message on a channel.
//! Sends go through the publisher's own [`CircuitBreaker`], separate from the
//! storage breaker, and a failed message never stops the rest of the batch.
//!
//! ```json
//! {
//!   "specversion": "1.0",
//!   "type": "com.quotestream.quotes.price-updated",
//!   "source": "quotestream",
//!   "id": "5f0c...",
//!   "time": "2025-12-22T15:30:01Z",
//!   "datacontenttype": "application/json",
//!   "data": { "ticker": "AAPL", "timestamp": "2025-12-22T15:30:00Z", "close": 178.45, "source": "yfinance" }
//! }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::circuit_breaker::{CallError, CircuitBreaker, CircuitState};
use crate::clock::{Clock, SystemClock};
use crate::metrics::StreamingMetrics;
use crate::publisher::{ChunkError, ChunkFailure, PublishError, PublishReport, Publisher};
use crate::{ErrorKind, Quote, UtcDateTime, ValidationError};

pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6381";
pub const DEFAULT_REDIS_CHANNEL: &str = "quotes-stream";
pub const QUOTE_EVENT_TYPE: &str = "com.quotestream.quotes.price-updated";
pub const QUOTE_EVENT_SOURCE: &str = "quotestream";
/// Cooldown of the Redis breaker; failures to trip it follow the storage one.
pub const REDIS_BREAKER_COOLDOWN: Duration = Duration::from_secs(30);

/// A message that did not reach the channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("redis publish failed: {message}")]
pub struct ChannelError {
    message: String,
}

impl ChannelError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Channel outages are expected to clear on their own.
    pub const fn error_kind(&self) -> ErrorKind {
        ErrorKind::Transient
    }
}

impl From<redis::RedisError> for ChannelError {
    fn from(error: redis::RedisError) -> Self {
        Self::new(error.to_string())
    }
}

/// Pub/sub transport: deliver one payload to one channel.
pub trait MessageChannel: Send + Sync {
    fn publish_message<'a>(
        &'a self,
        channel: &'a str,
        payload: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send + 'a>>;
}

/// [`MessageChannel`] over a lazily opened multiplexed Redis connection.
///
/// The connection is opened on first use and dropped after a failed publish,
/// so the next message reconnects.
pub struct RedisChannel {
    client: redis::Client,
    connection: tokio::sync::Mutex<Option<MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisChannel")
            .field("server", &self.client.get_connection_info().addr)
            .finish_non_exhaustive()
    }
}

impl RedisChannel {
    /// Parses `url`; no connection is made yet.
    pub fn open(url: &str) -> Result<Self, ChannelError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            connection: tokio::sync::Mutex::new(None),
        })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, ChannelError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(connection.clone());
        }

        let connection = self.client.get_multiplexed_async_connection().await?;
        info!(server = ?self.client.get_connection_info().addr, "redis connection established");
        *slot = Some(connection.clone());
        Ok(connection)
    }

    async fn forget_connection(&self) {
        self.connection.lock().await.take();
    }
}

impl MessageChannel for RedisChannel {
    fn publish_message<'a>(
        &'a self,
        channel: &'a str,
        payload: String,
    ) -> Pin<Box<dyn Future<Output = Result<(), ChannelError>> + Send + 'a>> {
        Box::pin(async move {
            let mut connection = self.connection().await?;
            let published: redis::RedisResult<i64> = connection.publish(channel, payload).await;
            match published {
                Ok(receivers) => {
                    debug!(channel, receivers, "quote event published");
                    Ok(())
                }
                Err(error) => {
                    self.forget_connection().await;
                    Err(error.into())
                }
            }
        })
    }
}

/// CloudEvents 1.0 envelope around one quote.
#[derive(Debug, Clone, Serialize)]
pub struct QuoteEvent<'a> {
    pub specversion: &'static str,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub source: &'a str,
    pub id: Uuid,
    pub time: UtcDateTime,
    pub datacontenttype: &'static str,
    pub data: &'a Quote,
}

impl<'a> QuoteEvent<'a> {
    pub fn new(quote: &'a Quote, source: &'a str) -> Self {
        Self {
            specversion: "1.0",
            event_type: QUOTE_EVENT_TYPE,
            source,
            id: Uuid::new_v4(),
            time: UtcDateTime::now(),
            datacontenttype: "application/json",
            data: quote,
        }
    }
}

/// Publisher that fans each quote out as an event on a Redis channel.
pub struct RedisPublisher {
    transport: Arc<dyn MessageChannel>,
    channel: String,
    event_source: String,
    breaker: CircuitBreaker,
    clock: Arc<dyn Clock>,
    metrics: Option<Arc<StreamingMetrics>>,
}

impl std::fmt::Debug for RedisPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisPublisher")
            .field("channel", &self.channel)
            .field("breaker", &self.breaker)
            .finish_non_exhaustive()
    }
}

impl RedisPublisher {
    pub fn new(
        transport: Arc<dyn MessageChannel>,
        channel: impl Into<String>,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            transport,
            channel: channel.into(),
            event_source: String::from(QUOTE_EVENT_SOURCE),
            breaker,
            clock: Arc::new(SystemClock),
            metrics: None,
        }
    }

    /// Value of the CloudEvents `source` attribute.
    pub fn with_event_source(mut self, source: impl Into<String>) -> Self {
        self.event_source = source.into();
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<StreamingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn send_event(&self, quote: &Quote) -> Result<(), ChunkError> {
        quote.validate().map_err(ChunkError::Validation)?;
        let payload = serde_json::to_string(&QuoteEvent::new(quote, &self.event_source))
            .map_err(|e| ChunkError::Channel(ChannelError::new(format!("encode event: {e}"))))?;

        match self
            .breaker
            .call(|| self.transport.publish_message(&self.channel, payload))
            .await
        {
            Ok(()) => Ok(()),
            Err(CallError::Open(err)) => Err(ChunkError::CircuitOpen(err)),
            Err(CallError::Failed(err)) => Err(ChunkError::Channel(err)),
        }
    }

    async fn publish_events(&self, quotes: Vec<Quote>) -> Result<PublishReport, PublishError> {
        if quotes.is_empty() {
            return Err(ValidationError::EmptyBatch.into());
        }

        let mut report = PublishReport {
            chunks: quotes.len(),
            ..PublishReport::default()
        };

        for (index, quote) in quotes.iter().enumerate() {
            let started = self.clock.now();
            let sent = self.send_event(quote).await;
            let elapsed = self.clock.now().saturating_duration_since(started);
            if let Some(metrics) = &self.metrics {
                metrics.record_redis_publish(sent.is_ok(), elapsed);
            }

            match sent {
                Ok(()) => {
                    report.chunks_sent += 1;
                    report.published += 1;
                }
                Err(error) => {
                    warn!(ticker = quote.ticker(), channel = %self.channel, error = %error, "quote event not published");
                    report.failures.push(ChunkFailure {
                        index,
                        size: 1,
                        error,
                    });
                }
            }
        }

        info!(
            channel = %self.channel,
            published = report.published,
            total = report.chunks,
            "published quote events to redis"
        );
        Ok(report)
    }
}

impl Publisher for RedisPublisher {
    fn publish<'a>(
        &'a self,
        quotes: Vec<Quote>,
    ) -> Pin<Box<dyn Future<Output = Result<PublishReport, PublishError>> + Send + 'a>> {
        Box::pin(self.publish_events(quotes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::QuoteSource;

    #[test]
    fn event_envelope_carries_cloudevents_attributes() {
        let ts = UtcDateTime::parse("2025-12-22T15:30:00Z").expect("timestamp");
        let quote = Quote::new("AAPL", ts, 178.45, QuoteSource::Yfinance);

        let value = serde_json::to_value(QuoteEvent::new(&quote, "quotestream")).expect("encodes");

        assert_eq!(value["specversion"], "1.0");
        assert_eq!(value["type"], QUOTE_EVENT_TYPE);
        assert_eq!(value["source"], "quotestream");
        assert_eq!(value["datacontenttype"], "application/json");
        assert!(Uuid::parse_str(value["id"].as_str().expect("id")).is_ok());
        assert!(value["time"].as_str().expect("time").ends_with('Z'));
        assert_eq!(value["data"]["ticker"], "AAPL");
        assert_eq!(value["data"]["close"], 178.45);
    }

    #[test]
    fn every_event_gets_a_fresh_id() {
        let ts = UtcDateTime::parse("2025-12-22T15:30:00Z").expect("timestamp");
        let quote = Quote::new("MSFT", ts, 301.2, QuoteSource::Yfinance);

        let first = QuoteEvent::new(&quote, "quotestream");
        let second = QuoteEvent::new(&quote, "quotestream");

        assert_ne!(first.id, second.id);
    }

    #[test]
    fn malformed_redis_url_is_rejected_at_open() {
        assert!(RedisChannel::open("not a url").is_err());
        assert!(RedisChannel::open(DEFAULT_REDIS_URL).is_ok());
    }
}
