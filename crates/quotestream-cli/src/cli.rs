//! CLI argument definitions for quotestream.
//!
//! Every setting can come from a flag or from its `STREAMER_*` environment
//! variable; flags win.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `run` | Start the poll loop until Ctrl-C or SIGTERM (default) |
//! | `config` | Validate and print the resolved configuration |
//!
//! # Examples
//!
//! ```bash
//! STREAMER_TICKERS=AAPL,MSFT quotestream run --polling-interval 10
//! quotestream config --pretty
//! quotestream run --redis-publisher-enabled true --redis-channel quotes-stream
//! ```

use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};
use quotestream_core::{ConfigError, StreamerConfig};

#[derive(Debug, Parser)]
#[command(
    name = "quotestream",
    author,
    version,
    about = "Rate-limited quote polling with resilient batch delivery to storage"
)]
pub struct Cli {
    /// Log level for quotestream crates. `RUST_LOG` overrides it.
    #[arg(long, global = true, env = "STREAMER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start the streaming service.
    Run,
    /// Print the validated configuration as JSON and exit.
    Config {
        #[arg(long, default_value_t = false)]
        pretty: bool,
    },
}

#[derive(Debug, Args)]
pub struct Settings {
    /// Comma-separated ticker symbols.
    #[arg(long, global = true, env = "STREAMER_TICKERS", default_value = "AAPL,MSFT,GOOGL,AMZN,TSLA")]
    pub tickers: String,

    /// Seconds between cycle starts (1-300).
    #[arg(long, global = true, env = "STREAMER_POLLING_INTERVAL", default_value_t = 5)]
    pub polling_interval: u64,

    #[arg(long, global = true, env = "STREAMER_MAX_REQUESTS_PER_HOUR", default_value_t = 2000)]
    pub max_requests_per_hour: u32,

    #[arg(long, global = true, env = "STREAMER_SOURCE_URL", default_value = quotestream_core::adapters::DEFAULT_YAHOO_BASE_URL)]
    pub source_url: String,

    #[arg(long, global = true, env = "STREAMER_SYMBOLS_PER_REQUEST", default_value_t = 50)]
    pub symbols_per_request: usize,

    #[arg(long, global = true, env = "STREAMER_STORAGE_URL", default_value = "http://localhost:8000")]
    pub storage_url: String,

    /// Storage request timeout in seconds.
    #[arg(long, global = true, env = "STREAMER_STORAGE_TIMEOUT", default_value_t = 30)]
    pub storage_timeout: u64,

    #[arg(long, global = true, env = "STREAMER_CIRCUIT_BREAKER_THRESHOLD", default_value_t = 5)]
    pub circuit_breaker_threshold: u32,

    /// Breaker cooldown in seconds.
    #[arg(long, global = true, env = "STREAMER_CIRCUIT_BREAKER_TIMEOUT", default_value_t = 60)]
    pub circuit_breaker_timeout: u64,

    #[arg(long, global = true, env = "STREAMER_MAX_BATCH_SIZE", default_value_t = 1000)]
    pub max_batch_size: usize,

    /// Seconds an in-flight cycle may take to finish on shutdown.
    #[arg(long, global = true, env = "STREAMER_SHUTDOWN_TIMEOUT", default_value_t = 10)]
    pub shutdown_timeout: u64,

    /// Deliver batches to the storage service.
    #[arg(long, global = true, env = "STREAMER_PUBLISHER_ENABLED", action = ArgAction::Set, default_value_t = true)]
    pub publisher_enabled: bool,

    /// Also publish each quote as a CloudEvent on a Redis channel.
    #[arg(long, global = true, env = "STREAMER_REDIS_PUBLISHER_ENABLED", action = ArgAction::Set, default_value_t = false)]
    pub redis_publisher_enabled: bool,

    #[arg(long, global = true, env = "STREAMER_REDIS_URL", default_value = quotestream_core::DEFAULT_REDIS_URL)]
    pub redis_url: String,

    #[arg(long, global = true, env = "STREAMER_REDIS_CHANNEL", default_value = quotestream_core::DEFAULT_REDIS_CHANNEL)]
    pub redis_channel: String,

    /// Randomise retry backoff delays by up to half in either direction.
    #[arg(long, global = true, env = "STREAMER_RETRY_JITTER", action = ArgAction::Set, default_value_t = false)]
    pub retry_jitter: bool,
}

impl Settings {
    pub fn to_config(&self) -> Result<StreamerConfig, ConfigError> {
        let config = StreamerConfig {
            tickers: StreamerConfig::parse_tickers(&self.tickers)?,
            polling_interval: Duration::from_secs(self.polling_interval),
            max_requests_per_hour: self.max_requests_per_hour,
            source_url: self.source_url.clone(),
            symbols_per_request: self.symbols_per_request,
            storage_url: self.storage_url.clone(),
            storage_timeout: Duration::from_secs(self.storage_timeout),
            circuit_breaker_threshold: self.circuit_breaker_threshold,
            circuit_breaker_timeout: Duration::from_secs(self.circuit_breaker_timeout),
            max_batch_size: self.max_batch_size,
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout),
            publisher_enabled: self.publisher_enabled,
            redis_publisher_enabled: self.redis_publisher_enabled,
            redis_url: self.redis_url.clone(),
            redis_channel: self.redis_channel.clone(),
            retry_jitter: self.retry_jitter,
        };
        config.validate()?;
        Ok(config)
    }
}
