/// Core type definitions for the OHLC market-data backend
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MarketDataError, Result};

/// One OHLC(V) trendbar returned by cTrader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

/// Symbol identity as supplied by the caller
///
/// When `symbol_id` is already known the lookup round-trip is skipped;
/// otherwise it is resolved once per request and not cached beyond it.
#[derive(Debug, Clone)]
pub struct SymbolReference {
    pub symbol_name: String,
    pub symbol_id: Option<i64>,
}

impl SymbolReference {
    pub fn named(symbol_name: impl Into<String>) -> Self {
        SymbolReference {
            symbol_name: symbol_name.into(),
            symbol_id: None,
        }
    }

    pub fn with_id(symbol_name: impl Into<String>, symbol_id: i64) -> Self {
        SymbolReference {
            symbol_name: symbol_name.into(),
            symbol_id: Some(symbol_id),
        }
    }
}

/// Trendbar aggregation interval accepted by cTrader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Timeframe {
    #[default]
    M1,
    M5,
    M15,
    M30,
    H1,
    H4,
    D1,
    W1,
    Mn1,
}

impl Timeframe {
    pub fn as_str(&self) -> &str {
        match self {
            Timeframe::M1 => "M1",
            Timeframe::M5 => "M5",
            Timeframe::M15 => "M15",
            Timeframe::M30 => "M30",
            Timeframe::H1 => "H1",
            Timeframe::H4 => "H4",
            Timeframe::D1 => "D1",
            Timeframe::W1 => "W1",
            Timeframe::Mn1 => "MN1",
        }
    }

    /// Parse a timeframe code, case-insensitively
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_uppercase().as_str() {
            "M1" => Ok(Timeframe::M1),
            "M5" => Ok(Timeframe::M5),
            "M15" => Ok(Timeframe::M15),
            "M30" => Ok(Timeframe::M30),
            "H1" => Ok(Timeframe::H1),
            "H4" => Ok(Timeframe::H4),
            "D1" => Ok(Timeframe::D1),
            "W1" => Ok(Timeframe::W1),
            "MN1" => Ok(Timeframe::Mn1),
            other => Err(MarketDataError::InvalidArgument(format!(
                "Unrecognized timeframe '{}'",
                other
            ))),
        }
    }
}

/// Tagged event emitted to a streaming client
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Session start: symbol, timeframe and number of seeded bars
    Meta {
        symbol: String,
        timeframe: Timeframe,
        initial_bars: usize,
    },
    Bar(Bar),
    /// End of a bounded replay; never reached by an unbounded live session
    Complete,
    /// Terminal failure before any connection succeeded
    Error { message: String },
}

/// Runtime configuration loaded from TOML
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// cTrader Open API v3 REST base URL
    pub rest_base_url: String,
    /// cTrader Open API v3 WebSocket URL
    pub ws_url: String,
    /// Timeout (seconds) for one-shot REST calls
    pub request_timeout_sec: u64,
    /// Historical bars fetched before a stream goes live
    pub seed_history_limit: i64,
    /// Reconnect backoff cap (seconds)
    pub max_reconnect_delay_sec: u64,
    /// Address the HTTP boundary binds to
    pub bind_addr: String,
    /// Default tracing filter
    pub log_level: String,
}
