use thiserror::Error;

/// CLI-level error categories mapped to exit codes.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] quotestream_core::ConfigError),

    #[error(transparent)]
    Service(#[from] quotestream_core::ServiceError),

    #[error(transparent)]
    Publisher(#[from] quotestream_core::ChannelError),

    #[error("in-flight cycle did not finish within {0:?}; aborted")]
    ShutdownTimedOut(std::time::Duration),

    #[error("metrics setup failed: {0}")]
    Metrics(String),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::Service(_) => 3,
            Self::Publisher(_) => 2,
            Self::ShutdownTimedOut(_) => 3,
            Self::Metrics(_) => 1,
            Self::Logging(_) => 1,
            Self::Serialization(_) => 4,
            Self::Io(_) => 10,
        }
    }
}
