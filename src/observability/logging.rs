//! # Logging
//!
//! Installs the process-wide tracing subscriber. `RUST_LOG` takes precedence;
//! without it the configured level applies.

use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::core::config::{LogFormat, LoggingConfig};
use crate::core::error::{ServiceCacheError, ServiceCacheResult};

/// Build the env filter for `config`
pub fn env_filter(config: &LoggingConfig) -> ServiceCacheResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| ServiceCacheError::config(format!("Invalid log level '{}': {}", config.level, e))),
    }
}

/// Initialize tracing; a second call keeps the first subscriber
pub fn init_tracing(config: &LoggingConfig) -> ServiceCacheResult<()> {
    let filter = env_filter(config)?;

    let result = match config.format {
        LogFormat::Json => Registry::default()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_target(true)
                    .with_thread_ids(true),
            )
            .try_init(),
        LogFormat::Pretty => Registry::default()
            .with(filter)
            .with(fmt::layer().pretty().with_target(true))
            .try_init(),
    };

    if result.is_err() {
        warn!("Tracing subscriber already initialized, skipping initialization");
    }
    Ok(())
}
