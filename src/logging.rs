//! Process-wide tracing subscriber setup.

use thiserror::Error;
use tracing_subscriber::{fmt, EnvFilter};

/// Failure installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The filter directive could not be parsed.
    #[error("invalid log level: {0}")]
    InvalidLevel(String),
    /// A global subscriber is already installed.
    #[error("logging already initialized")]
    AlreadyInitialized,
}

/// Installs a fmt subscriber filtered by `level`, an `EnvFilter` directive
/// such as `"info"` or `"kindquery::query::executor=trace"`.
pub fn init_logging(level: &str) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_new(level).map_err(|e| LoggingError::InvalidLevel(e.to_string()))?;
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)
}
