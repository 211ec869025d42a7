use std::sync::Arc;

use quotestream_core::{
    CircuitBreaker, ConfigError, FanoutPublisher, HttpClient, HttpStorageSink, Publisher,
    RateLimiter, RedisChannel, RedisPublisher, ReqwestHttpClient, StopOutcome, StoragePublisher,
    StreamerConfig, StreamingMetrics, StreamingService, SystemClock, YahooQuoteSource,
};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cli::Command;
use crate::error::CliError;

pub async fn run(command: Option<Command>, config: StreamerConfig) -> Result<(), CliError> {
    match command.unwrap_or(Command::Run) {
        Command::Run => {
            let run_id = Uuid::new_v4();
            stream(config)
                .instrument(info_span!("quotestream", %run_id))
                .await
        }
        Command::Config { pretty } => print_config(&config, pretty),
    }
}

fn print_config(config: &StreamerConfig, pretty: bool) -> Result<(), CliError> {
    let rendered = if pretty {
        serde_json::to_string_pretty(config)?
    } else {
        serde_json::to_string(config)?
    };
    println!("{rendered}");
    Ok(())
}

async fn stream(config: StreamerConfig) -> Result<(), CliError> {
    let metrics =
        Arc::new(StreamingMetrics::new().map_err(|error| CliError::Metrics(error.to_string()))?);
    let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new());

    let limiter = RateLimiter::new(config.rate_limit(), Arc::new(SystemClock))?
        .with_metrics(Arc::clone(&metrics));
    let source = YahooQuoteSource::new(Arc::clone(&http), Arc::new(limiter))
        .with_base_url(config.source_url.clone())
        .with_symbols_per_request(config.symbols_per_request)
        .with_retry(config.source_retry());

    let publisher = publishers(&config, http, &metrics)?;

    let shutdown_timeout = config.shutdown_timeout;
    let service = StreamingService::new(
        config,
        Arc::new(source),
        Arc::new(publisher),
        Arc::clone(&metrics),
    )?;

    service.start()?;
    wait_for_shutdown_signal().await?;
    let outcome = service.stop().await?;

    let snapshot = serde_json::to_string(&metrics.snapshot())?;
    info!(metrics = %snapshot, "final metrics");

    match outcome {
        StopOutcome::Graceful => Ok(()),
        StopOutcome::TimedOut => Err(CliError::ShutdownTimedOut(shutdown_timeout)),
    }
}

/// Storage first when enabled, so its inserted count is what the cycle reports.
fn publishers(
    config: &StreamerConfig,
    http: Arc<dyn HttpClient>,
    metrics: &Arc<StreamingMetrics>,
) -> Result<FanoutPublisher, CliError> {
    let mut publishers: Vec<Arc<dyn Publisher>> = Vec::new();

    if config.publisher_enabled {
        let sink = HttpStorageSink::new(http, &config.storage_url, config.storage_timeout);
        let breaker = CircuitBreaker::new("storage-publisher", config.circuit_breaker())?
            .with_metrics(Arc::clone(metrics));
        let storage = StoragePublisher::new(Arc::new(sink), breaker)
            .with_max_batch(config.max_batch_size)
            .with_retry(config.storage_retry())
            .with_metrics(Arc::clone(metrics));
        publishers.push(Arc::new(storage));
    }

    if config.redis_publisher_enabled {
        let channel = RedisChannel::open(&config.redis_url)?;
        let breaker = CircuitBreaker::new("redis-publisher", config.redis_circuit_breaker())?;
        let redis = RedisPublisher::new(Arc::new(channel), config.redis_channel.clone(), breaker)
            .with_metrics(Arc::clone(metrics));
        info!(channel = %config.redis_channel, "redis publisher enabled");
        publishers.push(Arc::new(redis));
    }

    FanoutPublisher::from_publishers(publishers)
        .ok_or(CliError::Config(ConfigError::NoPublisherEnabled))
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<(), CliError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    warn!("shutdown signal received");
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<(), CliError> {
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received");
    Ok(())
}
