/// Tracing subscriber setup
use tracing_subscriber::EnvFilter;

use crate::error::{FlowError, Result};
use crate::types::LoggingConfig;

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("tickflow={},{}", config.level, config.level)))
        .map_err(|e| FlowError::Config(format!("Invalid log level '{}': {}", config.level, e)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| FlowError::Internal(format!("Failed to install subscriber: {}", e)))
}
