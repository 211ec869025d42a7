use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::data_source::{DataSource, FetchOutcome, SourceError};
use crate::http_client::{HttpClient, HttpRequest};
use crate::rate_limiter::RateLimiter;
use crate::retry::{Backoff, RetryConfig};
use crate::{Quote, QuoteSource, Ticker, UtcDateTime};

pub const DEFAULT_YAHOO_BASE_URL: &str = "https://query1.finance.yahoo.com";
const DEFAULT_SYMBOLS_PER_REQUEST: usize = 50;
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Three attempts per request, 1s then 2s apart, never more than 10s.
pub fn default_source_retry() -> RetryConfig {
    RetryConfig::exponential(2).with_backoff(Backoff {
        initial: Duration::from_secs(1),
        multiplier: 2,
        max: Duration::from_secs(10),
        jitter: false,
    })
}

/// Polls the Yahoo Finance quote endpoint, one rate-limiter token per
/// physical request, retries included.
#[derive(Clone)]
pub struct YahooQuoteSource {
    http_client: Arc<dyn HttpClient>,
    rate_limiter: Arc<RateLimiter>,
    retry: RetryConfig,
    clock: Arc<dyn Clock>,
    base_url: String,
    symbols_per_request: usize,
    request_timeout: Duration,
}

impl std::fmt::Debug for YahooQuoteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YahooQuoteSource")
            .field("base_url", &self.base_url)
            .field("symbols_per_request", &self.symbols_per_request)
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl YahooQuoteSource {
    pub fn new(http_client: Arc<dyn HttpClient>, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            http_client,
            rate_limiter,
            retry: default_source_retry(),
            clock: Arc::new(SystemClock),
            base_url: String::from(DEFAULT_YAHOO_BASE_URL),
            symbols_per_request: DEFAULT_SYMBOLS_PER_REQUEST,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_owned();
        self
    }

    /// Values below 1 are treated as 1.
    pub fn with_symbols_per_request(mut self, symbols_per_request: usize) -> Self {
        self.symbols_per_request = symbols_per_request.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Clock used for the pause between retries.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn symbols_per_request(&self) -> usize {
        self.symbols_per_request
    }

    fn endpoint(&self, tickers: &[Ticker]) -> String {
        let symbols = tickers
            .iter()
            .map(Ticker::as_str)
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "{}/v7/finance/quote?symbols={}",
            self.base_url,
            urlencoding::encode(&symbols)
        )
    }

    async fn fetch_chunk(&self, tickers: &[Ticker]) -> Result<HashMap<String, YahooQuoteData>, SourceError> {
        let mut retries = 0;
        loop {
            let error = match self.request_chunk(tickers).await {
                Ok(by_symbol) => return Ok(by_symbol),
                Err(error) => error,
            };
            if !error.retryable() || !self.retry.allows_retry(retries) {
                return Err(error);
            }

            let delay = self.retry.delay_for_attempt(retries);
            retries += 1;
            warn!(
                tickers = tickers.len(),
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "yahoo request failed, retrying"
            );
            self.clock.sleep(delay).await;
        }
    }

    async fn request_chunk(&self, tickers: &[Ticker]) -> Result<HashMap<String, YahooQuoteData>, SourceError> {
        self.rate_limiter.acquire().await;

        let request = HttpRequest::get(self.endpoint(tickers))
            .with_header("accept", "application/json")
            .with_timeout(self.request_timeout);
        let response = self.http_client.execute(request).await.map_err(|e| {
            SourceError::unavailable(format!("yahoo transport error: {}", e.message()))
                .with_retryable(e.retryable())
        })?;

        if !response.is_success() {
            let status = response.status;
            return Err(SourceError::unavailable(format!("yahoo returned status {status}"))
                .with_retryable(status >= 500 || status == 429));
        }

        parse_quote_response(&response.body)
    }
}

impl DataSource for YahooQuoteSource {
    fn name(&self) -> &str {
        "yahoo"
    }

    fn fetch<'a>(
        &'a self,
        tickers: &'a [Ticker],
    ) -> Pin<Box<dyn Future<Output = Result<FetchOutcome, SourceError>> + Send + 'a>> {
        Box::pin(async move {
            if tickers.is_empty() {
                return Err(SourceError::invalid_request(
                    "yahoo fetch requires at least one ticker",
                ));
            }

            let mut outcome = FetchOutcome::default();
            let mut requests = 0_usize;
            let mut failed_requests = 0_usize;
            let mut last_error = None;

            for chunk in tickers.chunks(self.symbols_per_request) {
                requests += 1;
                match self.fetch_chunk(chunk).await {
                    Ok(mut by_symbol) => {
                        for ticker in chunk {
                            match by_symbol.remove(ticker.as_str()).and_then(|data| data.into_quote(ticker)) {
                                Some(quote) => outcome.quotes.push(quote),
                                None => outcome.omitted.push(ticker.clone()),
                            }
                        }
                    }
                    Err(error) => {
                        warn!(
                            tickers = chunk.len(),
                            error = %error,
                            "yahoo request failed, omitting its tickers"
                        );
                        failed_requests += 1;
                        outcome.omitted.extend(chunk.iter().cloned());
                        last_error = Some(error);
                    }
                }
            }

            if failed_requests == requests {
                let detail = last_error
                    .map(|error| error.message().to_owned())
                    .unwrap_or_default();
                return Err(SourceError::unavailable(format!(
                    "all {requests} yahoo requests failed: {detail}"
                )));
            }

            debug!(
                requests,
                fetched = outcome.quotes.len(),
                omitted = outcome.omitted.len(),
                "yahoo fetch complete"
            );
            Ok(outcome)
        })
    }
}

fn parse_quote_response(body: &str) -> Result<HashMap<String, YahooQuoteData>, SourceError> {
    let response: YahooQuoteResponse = serde_json::from_str(body)
        .map_err(|e| SourceError::internal(format!("failed to parse yahoo response: {e}")))?;

    if let Some(error) = response.quote_response.error.filter(|e| !e.is_null()) {
        return Err(SourceError::unavailable(format!("yahoo API error: {error}")).with_retryable(false));
    }

    Ok(response
        .quote_response
        .result
        .into_iter()
        .map(|data| (data.symbol.trim().to_ascii_uppercase(), data))
        .collect())
}

#[derive(Debug, Clone, Deserialize)]
struct YahooQuoteResponse {
    #[serde(rename = "quoteResponse")]
    quote_response: YahooQuoteResponseData,
}

#[derive(Debug, Clone, Deserialize)]
struct YahooQuoteResponseData {
    #[serde(default)]
    result: Vec<YahooQuoteData>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct YahooQuoteData {
    symbol: String,
    #[serde(rename = "regularMarketPrice")]
    regular_market_price: Option<f64>,
    #[serde(rename = "regularMarketOpen")]
    regular_market_open: Option<f64>,
    #[serde(rename = "regularMarketDayHigh")]
    regular_market_day_high: Option<f64>,
    #[serde(rename = "regularMarketDayLow")]
    regular_market_day_low: Option<f64>,
    #[serde(rename = "regularMarketVolume")]
    regular_market_volume: Option<f64>,
    #[serde(rename = "regularMarketTime")]
    regular_market_time: Option<i64>,
}

impl YahooQuoteData {
    /// `None` when the upstream has no price for the symbol.
    fn into_quote(self, ticker: &Ticker) -> Option<Quote> {
        let close = self.regular_market_price?;
        let timestamp = self
            .regular_market_time
            .and_then(|seconds| UtcDateTime::from_unix_seconds(seconds).ok())
            .unwrap_or_else(UtcDateTime::now);
        let volume = self
            .regular_market_volume
            .filter(|v| v.is_finite() && *v >= 0.0)
            .map(|v| v as u64);

        Some(
            Quote::new(ticker.as_str(), timestamp, close, QuoteSource::Yfinance)
                .with_open(self.regular_market_open)
                .with_high(self.regular_market_day_high)
                .with_low(self.regular_market_day_low)
                .with_volume(volume),
        )
    }
}
