mod buffer;

use std::sync::Arc;

use keel_types::error::{KeelError, Result};
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoggingConfig;

pub use self::buffer::{
    LogBuffer, LogBufferLayer, LogEntry, DEFAULT_ACTIVE_CAPACITY, DEFAULT_INACTIVE_CAPACITY,
    DEFAULT_SUBSCRIPTION_TIMEOUT,
};

/// Build the log buffer described by `config`.
pub fn log_buffer_from_config(config: &LoggingConfig) -> Result<LogBuffer> {
    config.validate()?;
    let base_level = config.level.trim().parse::<Level>().unwrap_or(Level::INFO);
    Ok(LogBuffer::new(
        config.buffer_capacity,
        config.active_buffer_capacity,
        config.subscription_timeout_duration()?,
        base_level,
    ))
}

/// Install the global subscriber: a stderr `fmt` layer filtered by
/// `RUST_LOG` (falling back to `config.level`) plus the in-process log
/// buffer. Returns the buffer for viewers.
pub fn init_tracing(config: &LoggingConfig) -> Result<Arc<LogBuffer>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            KeelError::Config(format!("invalid logging.level '{}': {e}", config.level))
        })?,
    };
    let buffer = Arc::new(log_buffer_from_config(config)?);

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_filter(filter))
        .with(LogBufferLayer::new(Arc::clone(&buffer)))
        .try_init()
        .map_err(|e| KeelError::Config(format!("tracing already initialized: {e}")))?;
    Ok(buffer)
}
