use tracing_subscriber::EnvFilter;

use crate::error::CliError;

/// Installs the global fmt subscriber. `RUST_LOG` takes precedence over
/// `level`, which only applies to the quotestream crates.
pub fn init(level: &str) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .map_err(|error| CliError::Logging(error.to_string()))
}

fn default_filter(level: &str) -> EnvFilter {
    let level = level.trim().to_ascii_lowercase();
    EnvFilter::new(format!("warn,quotestream={level},quotestream_core={level}"))
}
