/// Configuration loading from TOML file
use std::path::Path;

use crate::error::{MarketDataError, Result};
use crate::types::Config;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| MarketDataError::Config(format!("Failed to read config file: {}", e)))?;

    let config: Config = toml::from_str(&content)
        .map_err(|e| MarketDataError::Config(format!("Failed to parse config: {}", e)))?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_config(config: &Config) -> Result<()> {
    if !config.rest_base_url.starts_with("http://") && !config.rest_base_url.starts_with("https://")
    {
        return Err(MarketDataError::Config(format!(
            "Invalid rest_base_url: {}",
            config.rest_base_url
        )));
    }

    if !config.ws_url.starts_with("ws://") && !config.ws_url.starts_with("wss://") {
        return Err(MarketDataError::Config(format!(
            "Invalid ws_url: {}",
            config.ws_url
        )));
    }

    if config.request_timeout_sec == 0 {
        return Err(MarketDataError::Config(
            "request_timeout_sec must be positive".to_string(),
        ));
    }

    if config.seed_history_limit < 1 || config.seed_history_limit > 500 {
        return Err(MarketDataError::Config(format!(
            "Invalid seed_history_limit: {} (expected 1..=500)",
            config.seed_history_limit
        )));
    }

    if config.max_reconnect_delay_sec == 0 {
        return Err(MarketDataError::Config(
            "max_reconnect_delay_sec must be positive".to_string(),
        ));
    }

    if config.bind_addr.is_empty() {
        return Err(MarketDataError::Config("bind_addr is empty".to_string()));
    }

    Ok(())
}
