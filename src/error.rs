/// Centralized error types for the market-data backend
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MarketDataError {
    // Caller contract violations - never retried
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Upstream (broker) failures
    #[error("cTrader endpoint '{endpoint}' failed: {detail}")]
    Upstream {
        endpoint: String,
        status: Option<u16>,
        detail: String,
    },

    #[error("Malformed trendbar payload: {0}")]
    MalformedBar(String),

    // Socket-level failures during streaming
    #[error("Transport error: {0}")]
    Transport(String),

    // Ambient conversions
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, MarketDataError>;

impl MarketDataError {
    pub fn upstream(endpoint: &str, status: Option<u16>, detail: impl Into<String>) -> Self {
        MarketDataError::Upstream {
            endpoint: endpoint.to_string(),
            status,
            detail: detail.into(),
        }
    }

    /// True for failures a live session recovers from by reconnecting
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MarketDataError::Upstream { .. }
                | MarketDataError::MalformedBar(_)
                | MarketDataError::Transport(_)
                | MarketDataError::Http(_)
                | MarketDataError::Json(_)
        )
    }

    /// True when the broker, not the caller, is at fault
    pub fn is_upstream(&self) -> bool {
        !matches!(
            self,
            MarketDataError::InvalidArgument(_) | MarketDataError::Config(_)
        )
    }
}
