/// Configuration loading from TOML file
use std::path::Path;

use crate::error::{FlowError, Result};
use crate::types::Config;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| FlowError::Config(format!("Failed to read config file: {}", e)))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)
        .map_err(|e| FlowError::Config(format!("Failed to parse config: {}", e)))?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    // Feed
    if config.feed.symbols.is_empty() {
        return Err(FlowError::Config("feed.symbols is empty".to_string()));
    }

    if config.feed.symbols.iter().any(|s| s.trim().is_empty()) {
        return Err(FlowError::Config("feed.symbols contains an empty symbol".to_string()));
    }

    if config.feed.backoff_initial_ms == 0 {
        return Err(FlowError::Config("feed.backoff_initial_ms must be > 0".to_string()));
    }

    if config.feed.backoff_initial_ms > config.feed.backoff_max_ms {
        return Err(FlowError::Config(format!(
            "feed.backoff_initial_ms ({}) must be <= feed.backoff_max_ms ({})",
            config.feed.backoff_initial_ms, config.feed.backoff_max_ms
        )));
    }

    if config.feed.tick_channel_capacity == 0 {
        return Err(FlowError::Config("feed.tick_channel_capacity must be > 0".to_string()));
    }

    // Storage
    if config.storage.max_ticks == 0
        || config.storage.max_bars == 0
        || config.storage.tick_buffer_capacity == 0
    {
        return Err(FlowError::Config("storage capacities must be > 0".to_string()));
    }

    // Aggregation
    if config.aggregation.intervals.is_empty() {
        return Err(FlowError::Config("aggregation.intervals is empty".to_string()));
    }

    if config.aggregation.snapshot_interval_ms == 0 {
        return Err(FlowError::Config("aggregation.snapshot_interval_ms must be > 0".to_string()));
    }

    // Broadcast
    if config.broadcast.subscriber_capacity == 0 || config.broadcast.max_send_failures == 0 {
        return Err(FlowError::Config(
            "broadcast.subscriber_capacity and broadcast.max_send_failures must be > 0".to_string(),
        ));
    }

    // Alerts
    if config.alerts.check_interval_ms == 0 {
        return Err(FlowError::Config("alerts.check_interval_ms must be > 0".to_string()));
    }

    if config.alerts.history_cap == 0 {
        return Err(FlowError::Config("alerts.history_cap must be > 0".to_string()));
    }

    for rule in &config.alerts.rules {
        if !rule.threshold.is_finite() {
            return Err(FlowError::Config(format!(
                "Invalid threshold for rule '{}': {}",
                rule.name, rule.threshold
            )));
        }
    }

    if config.analytics.volume_window == 0 {
        return Err(FlowError::Config("analytics.volume_window must be > 0".to_string()));
    }

    Ok(())
}
