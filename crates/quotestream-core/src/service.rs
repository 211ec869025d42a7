//! Poll loop orchestration: fetch, validate, publish, account, sleep.
//!
//! ```text
//!  Stopped ──start()──▶ Running ──stop()──▶ Stopping ──loop exits──▶ Stopped
//! ```
//!
//! Cycles never overlap: the loop and [`StreamingService::run_cycle`] both
//! take the same cycle lock. The next cycle starts `polling_interval` after
//! the previous one *started*; an overrunning cycle is followed immediately by
//! the next one. Fetch and publish failures are recorded on the cycle and never
//! end the loop. `stop()` interrupts the inter-cycle wait at once, lets an
//! in-flight cycle finish within `shutdown_timeout`, and aborts it otherwise.

use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::StreamerConfig;
use crate::data_source::DataSource;
use crate::metrics::StreamingMetrics;
use crate::publisher::Publisher;
use crate::{ConfigError, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Stopped,
    Running,
    Stopping,
}

impl Display for ServiceState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
            Self::Stopping => "stopping",
        })
    }
}

/// How `stop()` ended the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The loop exited on its own, finishing any in-flight cycle.
    Graceful,
    /// The in-flight cycle outlived the shutdown timeout and was aborted.
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("cannot start service while {0}")]
    NotStopped(ServiceState),
    #[error("cannot stop service while {0}")]
    NotRunning(ServiceState),
}

/// Per-cycle accounting, kept until the next cycle replaces it.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle_id: u64,
    pub requested_tickers: usize,
    pub fetched_count: usize,
    pub omitted_count: usize,
    pub published_count: usize,
    pub errors: Vec<ErrorKind>,
    pub duration: Duration,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error_count(&self, kind: ErrorKind) -> usize {
        self.errors.iter().filter(|k| **k == kind).count()
    }
}

struct LoopHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct ServiceInner {
    config: StreamerConfig,
    source: Arc<dyn DataSource>,
    publisher: Arc<dyn Publisher>,
    metrics: Arc<StreamingMetrics>,
    clock: Arc<dyn Clock>,
    cycle_lock: tokio::sync::Mutex<()>,
    state: Mutex<ServiceState>,
    next_cycle_id: AtomicU64,
    cycles_completed: AtomicU64,
    last_cycle: Mutex<Option<CycleReport>>,
}

pub struct StreamingService {
    inner: Arc<ServiceInner>,
    handle: Mutex<Option<LoopHandle>>,
}

impl std::fmt::Debug for StreamingService {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingService")
            .field("state", &self.state())
            .field("source", &self.inner.source.name())
            .field("tickers", &self.inner.config.tickers.len())
            .field("cycles_completed", &self.cycles_completed())
            .finish_non_exhaustive()
    }
}

impl StreamingService {
    /// Validates `config`; a bad configuration is the only fatal error.
    pub fn new(
        config: StreamerConfig,
        source: Arc<dyn DataSource>,
        publisher: Arc<dyn Publisher>,
        metrics: Arc<StreamingMetrics>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                source,
                publisher,
                metrics,
                clock: Arc::new(SystemClock),
                cycle_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(ServiceState::Stopped),
                next_cycle_id: AtomicU64::new(0),
                cycles_completed: AtomicU64::new(0),
                last_cycle: Mutex::new(None),
            }),
            handle: Mutex::new(None),
        })
    }

    /// Replaces the clock used for cadence and timing. Only valid before the
    /// first `start()`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.clock = clock;
        }
        self
    }

    pub fn state(&self) -> ServiceState {
        *lock(&self.inner.state)
    }

    pub fn config(&self) -> &StreamerConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<StreamingMetrics> {
        &self.inner.metrics
    }

    pub fn cycles_completed(&self) -> u64 {
        self.inner.cycles_completed.load(Ordering::Acquire)
    }

    pub fn last_cycle(&self) -> Option<CycleReport> {
        lock(&self.inner.last_cycle).clone()
    }

    /// Spawns the poll loop on the current tokio runtime.
    pub fn start(&self) -> Result<(), ServiceError> {
        {
            let mut state = lock(&self.inner.state);
            if *state != ServiceState::Stopped {
                return Err(ServiceError::NotStopped(*state));
            }
            *state = ServiceState::Running;
        }

        let tickers = self.inner.config.tickers.len();
        self.inner.metrics.set_active_tickers(tickers);
        info!(
            source = self.inner.source.name(),
            tickers,
            polling_interval_secs = self.inner.config.polling_interval.as_secs_f64(),
            "streaming service started"
        );

        let (shutdown, receiver) = watch::channel(false);
        let task = tokio::spawn(run_loop(Arc::clone(&self.inner), receiver));
        *lock(&self.handle) = Some(LoopHandle { shutdown, task });
        Ok(())
    }

    /// Signals shutdown and waits up to `shutdown_timeout` for the loop.
    pub async fn stop(&self) -> Result<StopOutcome, ServiceError> {
        {
            let mut state = lock(&self.inner.state);
            if *state != ServiceState::Running {
                return Err(ServiceError::NotRunning(*state));
            }
            *state = ServiceState::Stopping;
        }
        info!("stopping streaming service");

        let handle = lock(&self.handle).take();
        let outcome = match handle {
            Some(LoopHandle { shutdown, mut task }) => {
                let _ = shutdown.send(true);
                let timeout = self.inner.config.shutdown_timeout;
                match tokio::time::timeout(timeout, &mut task).await {
                    Ok(Ok(())) => StopOutcome::Graceful,
                    Ok(Err(join_error)) => {
                        error!(error = %join_error, "poll loop ended abnormally");
                        StopOutcome::Graceful
                    }
                    Err(_) => {
                        task.abort();
                        let _ = task.await;
                        error!(
                            timeout_secs = timeout.as_secs_f64(),
                            "in-flight cycle exceeded shutdown timeout, aborted"
                        );
                        StopOutcome::TimedOut
                    }
                }
            }
            None => StopOutcome::Graceful,
        };

        *lock(&self.inner.state) = ServiceState::Stopped;
        info!(
            cycles_completed = self.cycles_completed(),
            ?outcome,
            "streaming service stopped"
        );
        Ok(outcome)
    }

    /// Runs one fetch/validate/publish cycle outside the loop. While the loop
    /// is running this waits for its in-flight cycle to finish first.
    pub async fn run_cycle(&self) -> CycleReport {
        self.inner.run_cycle().await
    }
}

impl Drop for StreamingService {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.handle).take() {
            handle.task.abort();
        }
    }
}

async fn run_loop(inner: Arc<ServiceInner>, mut shutdown: watch::Receiver<bool>) {
    let interval = inner.config.polling_interval;

    loop {
        let stopping = *shutdown.borrow();
        if stopping {
            break;
        }

        let started = inner.clock.now();
        let report = inner.run_cycle().await;
        let elapsed = inner.clock.now().saturating_duration_since(started);

        let Some(wait) = interval.checked_sub(elapsed).filter(|w| !w.is_zero()) else {
            warn!(
                cycle_id = report.cycle_id,
                elapsed_ms = elapsed.as_millis() as u64,
                interval_ms = interval.as_millis() as u64,
                "cycle overran polling interval, starting next cycle immediately"
            );
            continue;
        };

        tokio::select! {
            () = inner.clock.sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    debug!("poll loop exited");
}

impl ServiceInner {
    async fn run_cycle(&self) -> CycleReport {
        let _cycle = self.cycle_lock.lock().await;
        let cycle_id = self.next_cycle_id.fetch_add(1, Ordering::AcqRel) + 1;
        let started = self.clock.now();
        let tickers = &self.config.tickers;

        let mut report = CycleReport {
            cycle_id,
            requested_tickers: tickers.len(),
            fetched_count: 0,
            omitted_count: 0,
            published_count: 0,
            errors: Vec::new(),
            duration: Duration::ZERO,
        };

        let fetched = self.source.fetch(tickers).await;
        let fetch_elapsed = self.clock.now().saturating_duration_since(started);

        match fetched {
            Err(err) => {
                warn!(cycle_id, error = %err, "fetch failed, skipping publish");
                self.metrics.record_fetch(0, fetch_elapsed);
                report.errors.push(err.error_kind());
            }
            Ok(outcome) => {
                report.fetched_count = outcome.quotes.len();
                report.omitted_count = outcome.omitted.len();
                self.metrics.record_fetch(report.fetched_count, fetch_elapsed);
                self.metrics.record_omitted(report.omitted_count);
                if !outcome.omitted.is_empty() {
                    debug!(cycle_id, omitted = ?outcome.omitted, "tickers without data");
                }

                let mut valid = Vec::with_capacity(outcome.quotes.len());
                for quote in outcome.quotes {
                    match quote.validate() {
                        Ok(()) => valid.push(quote),
                        Err(err) => {
                            warn!(cycle_id, ticker = quote.ticker(), error = %err, "dropping invalid quote");
                            report.errors.push(ErrorKind::Validation);
                        }
                    }
                }

                if !valid.is_empty() {
                    match self.publisher.publish(valid).await {
                        Ok(published) => {
                            report.published_count = published.published;
                            report.errors.extend(published.error_kinds());
                        }
                        Err(err) => {
                            warn!(cycle_id, error = %err, "publish rejected");
                            report.errors.push(err.kind());
                        }
                    }
                }
            }
        }

        report.duration = self.clock.now().saturating_duration_since(started);
        let overrun = report.duration > self.config.polling_interval;
        for kind in &report.errors {
            self.metrics.record_error(*kind);
        }
        self.metrics.record_cycle(report.duration, overrun);

        info!(
            cycle_id,
            requested = report.requested_tickers,
            fetched = report.fetched_count,
            omitted = report.omitted_count,
            published = report.published_count,
            errors = report.errors.len(),
            duration_ms = report.duration.as_millis() as u64,
            "cycle complete"
        );

        *lock(&self.last_cycle) = Some(report.clone());
        self.cycles_completed.fetch_add(1, Ordering::AcqRel);
        report
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_source::{FetchOutcome, SourceError};
    use crate::publisher::{PublishError, PublishReport};
    use crate::{Quote, Ticker};
    use std::future::Future;
    use std::pin::Pin;

    #[derive(Debug)]
    struct EmptySource;

    impl DataSource for EmptySource {
        fn name(&self) -> &str {
            "empty"
        }

        fn fetch<'a>(
            &'a self,
            _tickers: &'a [Ticker],
        ) -> Pin<Box<dyn Future<Output = Result<FetchOutcome, SourceError>> + Send + 'a>> {
            Box::pin(async { Ok(FetchOutcome::default()) })
        }
    }

    struct NullPublisher;

    impl Publisher for NullPublisher {
        fn publish<'a>(
            &'a self,
            _quotes: Vec<Quote>,
        ) -> Pin<Box<dyn Future<Output = Result<PublishReport, PublishError>> + Send + 'a>> {
            Box::pin(async { Ok(PublishReport::default()) })
        }
    }

    fn service() -> StreamingService {
        StreamingService::new(
            StreamerConfig::default(),
            Arc::new(EmptySource),
            Arc::new(NullPublisher),
            Arc::new(StreamingMetrics::new().expect("metrics")),
        )
        .expect("valid config")
    }

    #[test]
    fn invalid_config_fails_construction() {
        let config = StreamerConfig {
            tickers: Vec::new(),
            ..StreamerConfig::default()
        };
        let result = StreamingService::new(
            config,
            Arc::new(EmptySource),
            Arc::new(NullPublisher),
            Arc::new(StreamingMetrics::new().expect("metrics")),
        );
        assert_eq!(result.err(), Some(ConfigError::EmptyTickers));
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_rejects_out_of_order_calls() {
        let service = service();
        assert_eq!(
            service.stop().await,
            Err(ServiceError::NotRunning(ServiceState::Stopped))
        );

        service.start().expect("first start");
        assert_eq!(service.state(), ServiceState::Running);
        assert_eq!(
            service.start(),
            Err(ServiceError::NotStopped(ServiceState::Running))
        );

        assert_eq!(service.stop().await, Ok(StopOutcome::Graceful));
        assert_eq!(service.state(), ServiceState::Stopped);

        service.start().expect("restart after stop");
        assert_eq!(service.stop().await, Ok(StopOutcome::Graceful));
    }

    #[tokio::test]
    async fn empty_fetch_skips_publish_and_counts_cycle() {
        let service = service();

        let report = service.run_cycle().await;

        assert_eq!(report.cycle_id, 1);
        assert_eq!(report.requested_tickers, 5);
        assert_eq!(report.fetched_count, 0);
        assert!(report.is_clean());
        assert_eq!(service.cycles_completed(), 1);
        assert_eq!(service.last_cycle(), Some(report));
    }
}
