/// Main entry point for the market data pipeline
use std::path::Path;

use anyhow::Context;
use tracing::{info, warn};

use tickflow::{config::load_config, utils::init_logging, Config, MarketApp};

const DEFAULT_CONFIG_PATH: &str = "tickflow.toml";

fn read_config(path: &str) -> anyhow::Result<(Config, bool)> {
    if !Path::new(path).exists() {
        return Ok((Config::default(), false));
    }

    let config = load_config(path).with_context(|| format!("loading {}", path))?;
    Ok((config, true))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let (config, from_file) = read_config(&config_path)?;

    init_logging(&config.logging).context("initializing logging")?;

    if from_file {
        info!("Configuration loaded from {}", config_path);
    } else {
        warn!("{} not found, running with default configuration", config_path);
    }

    let app = MarketApp::new(config).context("building pipeline")?;
    app.start().await.context("starting pipeline")?;

    tokio::signal::ctrl_c().await.context("listening for Ctrl+C")?;
    info!("Ctrl+C received - initiating graceful shutdown");

    app.shutdown().await;

    Ok(())
}
