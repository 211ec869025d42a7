//! # Streaming Metrics
//!
//! Prometheus collectors for the polling pipeline, held in a per-instance
//! [`Registry`] rather than a process-global one.
//!
//! | Metric | Type | Meaning |
//! |--------|------|---------|
//! | `streamer_quotes_fetched_total` | counter | quotes returned by the source |
//! | `streamer_quotes_published_total` | counter | quotes acknowledged by storage |
//! | `streamer_tickers_omitted_total` | counter | requested tickers without data |
//! | `streamer_errors_total{error_type}` | counter | errors by [`ErrorKind`] |
//! | `streamer_rate_limit_waits_total` | counter | acquisitions that had to wait |
//! | `streamer_circuit_breaker_rejections_total` | counter | calls rejected while open |
//! | `streamer_cycles_total` | counter | completed poll cycles |
//! | `streamer_cycle_overruns_total` | counter | cycles longer than the interval |
//! | `streamer_fetch_duration_seconds` | histogram | fetch latency |
//! | `streamer_publish_duration_seconds` | histogram | publish latency |
//! | `streamer_loop_duration_seconds` | histogram | full cycle latency |
//! | `streamer_active_tickers` | gauge | configured ticker count |
//! | `streamer_circuit_breaker_state` | gauge | 0=closed, 1=open, 2=half_open |
//! | `streamer_redis_publishes_total{status}` | counter | quote events sent to Redis, `success` or `error` |
//! | `streamer_redis_publish_duration_seconds` | histogram | per-event Redis publish latency |
//!
//! No HTTP exporter lives here; [`StreamingMetrics::encode_prometheus`]
//! renders the text exposition format for whoever wants to serve it.

use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;

use crate::{CircuitState, ErrorKind};

const REQUEST_BUCKETS: [f64; 7] = [0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0];
const LOOP_BUCKETS: [f64; 6] = [1.0, 5.0, 10.0, 30.0, 60.0, 120.0];
const REDIS_BUCKETS: [f64; 9] = [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];
const REDIS_STATUSES: [&str; 2] = ["success", "error"];

pub struct StreamingMetrics {
    registry: Registry,
    quotes_fetched_total: IntCounter,
    quotes_published_total: IntCounter,
    tickers_omitted_total: IntCounter,
    errors_total: IntCounterVec,
    rate_limit_waits_total: IntCounter,
    breaker_rejections_total: IntCounter,
    cycles_total: IntCounter,
    cycle_overruns_total: IntCounter,
    fetch_duration_seconds: Histogram,
    publish_duration_seconds: Histogram,
    loop_duration_seconds: Histogram,
    active_tickers: IntGauge,
    circuit_breaker_state: IntGauge,
    redis_publishes_total: IntCounterVec,
    redis_publish_duration_seconds: Histogram,
}

impl Debug for StreamingMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingMetrics")
            .field("snapshot", &self.snapshot())
            .finish_non_exhaustive()
    }
}

impl StreamingMetrics {
    /// Creates and registers every collector in a fresh registry.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let metrics = Self {
            quotes_fetched_total: counter(
                &registry,
                "streamer_quotes_fetched_total",
                "Total number of quotes successfully fetched",
            )?,
            quotes_published_total: counter(
                &registry,
                "streamer_quotes_published_total",
                "Total number of quotes successfully published to storage",
            )?,
            tickers_omitted_total: counter(
                &registry,
                "streamer_tickers_omitted_total",
                "Total number of requested tickers the source returned no data for",
            )?,
            errors_total: {
                let vec = IntCounterVec::new(
                    Opts::new("streamer_errors_total", "Total number of errors by type"),
                    &["error_type"],
                )?;
                registry.register(Box::new(vec.clone()))?;
                for kind in ErrorKind::ALL {
                    vec.with_label_values(&[kind.as_str()]);
                }
                vec
            },
            rate_limit_waits_total: counter(
                &registry,
                "streamer_rate_limit_waits_total",
                "Total number of rate limiter acquisitions that had to wait",
            )?,
            breaker_rejections_total: counter(
                &registry,
                "streamer_circuit_breaker_rejections_total",
                "Total number of calls rejected by an open circuit breaker",
            )?,
            cycles_total: counter(
                &registry,
                "streamer_cycles_total",
                "Total number of completed poll cycles",
            )?,
            cycle_overruns_total: counter(
                &registry,
                "streamer_cycle_overruns_total",
                "Total number of cycles that exceeded the polling interval",
            )?,
            fetch_duration_seconds: histogram(
                &registry,
                "streamer_fetch_duration_seconds",
                "Duration of quote fetch operations in seconds",
                &REQUEST_BUCKETS,
            )?,
            publish_duration_seconds: histogram(
                &registry,
                "streamer_publish_duration_seconds",
                "Duration of quote publish operations in seconds",
                &REQUEST_BUCKETS,
            )?,
            loop_duration_seconds: histogram(
                &registry,
                "streamer_loop_duration_seconds",
                "Duration of full streaming loop cycle in seconds",
                &LOOP_BUCKETS,
            )?,
            active_tickers: gauge(
                &registry,
                "streamer_active_tickers",
                "Number of tickers currently being tracked",
            )?,
            circuit_breaker_state: gauge(
                &registry,
                "streamer_circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half_open)",
            )?,
            redis_publishes_total: {
                let vec = IntCounterVec::new(
                    Opts::new(
                        "streamer_redis_publishes_total",
                        "Total number of quote events published to Redis by status",
                    ),
                    &["status"],
                )?;
                registry.register(Box::new(vec.clone()))?;
                for status in REDIS_STATUSES {
                    vec.with_label_values(&[status]);
                }
                vec
            },
            redis_publish_duration_seconds: histogram(
                &registry,
                "streamer_redis_publish_duration_seconds",
                "Duration of a single Redis publish in seconds",
                &REDIS_BUCKETS,
            )?,
            registry,
        };

        Ok(metrics)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_fetch(&self, count: usize, duration: Duration) {
        self.quotes_fetched_total.inc_by(count as u64);
        self.fetch_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_publish(&self, count: usize, duration: Duration) {
        self.quotes_published_total.inc_by(count as u64);
        self.publish_duration_seconds.observe(duration.as_secs_f64());
    }

    /// One quote event sent to Redis, successfully or not.
    pub fn record_redis_publish(&self, success: bool, duration: Duration) {
        let status = if success { "success" } else { "error" };
        self.redis_publishes_total.with_label_values(&[status]).inc();
        self.redis_publish_duration_seconds
            .observe(duration.as_secs_f64());
    }

    pub fn record_cycle(&self, duration: Duration, overrun: bool) {
        self.cycles_total.inc();
        if overrun {
            self.cycle_overruns_total.inc();
        }
        self.loop_duration_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_error(&self, kind: ErrorKind) {
        self.errors_total.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn record_omitted(&self, count: usize) {
        self.tickers_omitted_total.inc_by(count as u64);
    }

    pub fn record_rate_limit_wait(&self) {
        self.rate_limit_waits_total.inc();
    }

    pub fn record_breaker_rejection(&self) {
        self.breaker_rejections_total.inc();
    }

    pub fn set_active_tickers(&self, count: usize) {
        self.active_tickers
            .set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn set_breaker_state(&self, state: CircuitState) {
        self.circuit_breaker_state.set(state.gauge_value() as i64);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let errors_total = ErrorKind::ALL
            .into_iter()
            .map(|kind| {
                let value = self.errors_total.with_label_values(&[kind.as_str()]).get();
                (kind.as_str(), value)
            })
            .collect();

        MetricsSnapshot {
            quotes_fetched_total: self.quotes_fetched_total.get(),
            quotes_published_total: self.quotes_published_total.get(),
            tickers_omitted_total: self.tickers_omitted_total.get(),
            errors_total,
            rate_limit_waits_total: self.rate_limit_waits_total.get(),
            breaker_rejections_total: self.breaker_rejections_total.get(),
            cycles_total: self.cycles_total.get(),
            cycle_overruns_total: self.cycle_overruns_total.get(),
            fetch_duration: HistogramSnapshot::of(&self.fetch_duration_seconds),
            publish_duration: HistogramSnapshot::of(&self.publish_duration_seconds),
            loop_duration: HistogramSnapshot::of(&self.loop_duration_seconds),
            active_tickers: self.active_tickers.get(),
            circuit_breaker_state: self.circuit_breaker_state.get(),
            redis_published_total: self.redis_publishes_total.with_label_values(&["success"]).get(),
            redis_failed_total: self.redis_publishes_total.with_label_values(&["error"]).get(),
            redis_publish_duration: HistogramSnapshot::of(&self.redis_publish_duration_seconds),
        }
    }

    /// Renders every collector in the Prometheus text exposition format.
    pub fn encode_prometheus(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter, prometheus::Error> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> Result<IntGauge, prometheus::Error> {
    let gauge = IntGauge::new(name, help)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn histogram(
    registry: &Registry,
    name: &str,
    help: &str,
    buckets: &[f64],
) -> Result<Histogram, prometheus::Error> {
    let histogram = Histogram::with_opts(HistogramOpts::new(name, help).buckets(buckets.to_vec()))?;
    registry.register(Box::new(histogram.clone()))?;
    Ok(histogram)
}

/// Count and sum of a duration histogram.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HistogramSnapshot {
    pub count: u64,
    pub sum_seconds: f64,
}

impl HistogramSnapshot {
    fn of(histogram: &Histogram) -> Self {
        Self {
            count: histogram.get_sample_count(),
            sum_seconds: histogram.get_sample_sum(),
        }
    }
}

/// Point-in-time copy of every collector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub quotes_fetched_total: u64,
    pub quotes_published_total: u64,
    pub tickers_omitted_total: u64,
    pub errors_total: BTreeMap<&'static str, u64>,
    pub rate_limit_waits_total: u64,
    pub breaker_rejections_total: u64,
    pub cycles_total: u64,
    pub cycle_overruns_total: u64,
    pub fetch_duration: HistogramSnapshot,
    pub publish_duration: HistogramSnapshot,
    pub loop_duration: HistogramSnapshot,
    pub active_tickers: i64,
    pub circuit_breaker_state: i64,
    pub redis_published_total: u64,
    pub redis_failed_total: u64,
    pub redis_publish_duration: HistogramSnapshot,
}

impl MetricsSnapshot {
    pub fn errors(&self, kind: ErrorKind) -> u64 {
        self.errors_total.get(kind.as_str()).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_histograms_accumulate() {
        let metrics = StreamingMetrics::new().expect("metrics");

        metrics.record_fetch(3, Duration::from_millis(250));
        metrics.record_fetch(2, Duration::from_millis(750));
        metrics.record_publish(5, Duration::from_secs(1));
        metrics.record_error(ErrorKind::Validation);
        metrics.record_error(ErrorKind::Validation);
        metrics.record_error(ErrorKind::CircuitOpen);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.quotes_fetched_total, 5);
        assert_eq!(snapshot.quotes_published_total, 5);
        assert_eq!(snapshot.fetch_duration.count, 2);
        assert!((snapshot.fetch_duration.sum_seconds - 1.0).abs() < 1e-9);
        assert_eq!(snapshot.errors(ErrorKind::Validation), 2);
        assert_eq!(snapshot.errors(ErrorKind::CircuitOpen), 1);
        assert_eq!(snapshot.errors(ErrorKind::Permanent), 0);
    }

    #[test]
    fn gauges_reflect_latest_value() {
        let metrics = StreamingMetrics::new().expect("metrics");

        metrics.set_active_tickers(5);
        metrics.set_breaker_state(CircuitState::HalfOpen);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.active_tickers, 5);
        assert_eq!(snapshot.circuit_breaker_state, 2);
    }

    #[test]
    fn exposition_lists_every_error_label() {
        let metrics = StreamingMetrics::new().expect("metrics");
        metrics.record_cycle(Duration::from_secs(2), true);

        let text = metrics.encode_prometheus().expect("encodes");

        for kind in ErrorKind::ALL {
            let line = format!("streamer_errors_total{{error_type=\"{}\"}} 0", kind.as_str());
            assert!(text.contains(&line), "missing {line}");
        }
        assert!(text.contains("streamer_cycle_overruns_total 1"));
        assert!(text.contains("streamer_loop_duration_seconds_bucket{le=\"5\"} 1"));
    }

    #[test]
    fn redis_publishes_are_counted_by_status() {
        let metrics = StreamingMetrics::new().expect("metrics");

        metrics.record_redis_publish(true, Duration::from_millis(2));
        metrics.record_redis_publish(true, Duration::from_millis(3));
        metrics.record_redis_publish(false, Duration::from_millis(5));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.redis_published_total, 2);
        assert_eq!(snapshot.redis_failed_total, 1);
        assert_eq!(snapshot.redis_publish_duration.count, 3);

        let text = metrics.encode_prometheus().expect("encodes");
        assert!(text.contains("streamer_redis_publishes_total{status=\"error\"} 1"));
        assert!(text.contains("streamer_redis_publish_duration_seconds_bucket{le=\"0.005\"} 2"));
    }

    #[test]
    fn separate_instances_do_not_share_state() {
        let first = StreamingMetrics::new().expect("metrics");
        let second = StreamingMetrics::new().expect("metrics");

        first.record_rate_limit_wait();

        assert_eq!(first.snapshot().rate_limit_waits_total, 1);
        assert_eq!(second.snapshot().rate_limit_waits_total, 0);
    }
}
