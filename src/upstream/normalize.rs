/// Normalization of heterogeneous cTrader trendbar payloads
///
/// Both the REST and the WebSocket paths funnel their raw JSON through this
/// module so that every field-name alias and timestamp encoding is handled in
/// exactly one place.
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{MarketDataError, Result};
use crate::types::Bar;

pub type JsonMap = Map<String, Value>;

/// Timestamp-bearing field names observed across cTrader payload variants
const TIMESTAMP_KEYS: &[&str] = &[
    "timestamp",
    "time",
    "openTimestamp",
    "startTimestamp",
    "utcTimestamp",
];

/// Envelope keys under which REST responses carry their bar list
const ENVELOPE_KEYS: &[&str] = &["data", "trendbars", "bars", "items"];

/// Convert one trendbar mapping into a `Bar`
///
/// Prices are looked up under a primary key and a `*Price` alias; a missing
/// price is a hard error, a missing or unparsable volume is not.
pub fn build_bar(raw: &JsonMap) -> Result<Bar> {
    let timestamp_value = TIMESTAMP_KEYS
        .iter()
        .find_map(|key| raw.get(*key))
        .ok_or_else(|| {
            MarketDataError::MalformedBar("Trendbar payload missing timestamp field".to_string())
        })?;
    let timestamp = parse_timestamp(timestamp_value)?;

    let open = price_field(raw, "open", "openPrice");
    let high = price_field(raw, "high", "highPrice");
    let low = price_field(raw, "low", "lowPrice");
    let close = price_field(raw, "close", "closePrice");

    let (Some(open), Some(high), Some(low), Some(close)) = (open, high, low, close) else {
        return Err(MarketDataError::MalformedBar(
            "Trendbar payload missing OHLC fields".to_string(),
        ));
    };

    let volume = parse_float(raw.get("volume"));
    Ok(Bar {
        timestamp,
        open,
        high,
        low,
        close,
        volume,
    })
}

/// Parse a timestamp value supplied by the API
///
/// Numeric values above 1e12 are epoch milliseconds, otherwise epoch seconds.
/// Strings are ISO-8601 (a trailing `Z` is accepted); a missing offset means
/// UTC. Everything is converted to UTC.
pub fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>> {
    match value {
        Value::Number(n) => {
            let mut seconds = n.as_f64().ok_or_else(|| {
                MarketDataError::MalformedBar(format!("Unsupported timestamp value: {}", n))
            })?;
            if seconds > 1e12 {
                seconds /= 1000.0;
            }
            let millis = (seconds * 1000.0).round() as i64;
            Utc.timestamp_millis_opt(millis).single().ok_or_else(|| {
                MarketDataError::MalformedBar(format!("Timestamp out of range: {}", n))
            })
        }
        Value::String(s) => parse_iso_timestamp(s),
        other => Err(MarketDataError::MalformedBar(format!(
            "Unsupported timestamp value: {}",
            other
        ))),
    }
}

fn parse_iso_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let text = raw.trim();
    let text = match text.strip_suffix('Z') {
        Some(stripped) => format!("{}+00:00", stripped),
        None => text.to_string(),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&text) {
        return Ok(dt.with_timezone(&Utc));
    }

    // Offset-less variants are assumed UTC
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(&text, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(&text, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(MarketDataError::MalformedBar(format!(
        "Invalid timestamp format received: '{}'",
        raw
    )))
}

/// Format a timestamp for subscription requests (UTC, `Z` suffix)
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// True when a mapping resembles a trendbar payload
pub fn looks_like_trendbar(candidate: &JsonMap) -> bool {
    let has_all = |keys: [&str; 4]| keys.iter().all(|key| candidate.contains_key(*key));
    has_all(["open", "high", "low", "close"])
        || has_all(["openPrice", "highPrice", "lowPrice", "closePrice"])
}

/// Collect the bar mappings carried by a payload field
pub fn bar_payloads(value: &Value) -> Vec<&JsonMap> {
    match value {
        Value::Object(map) => vec![map],
        Value::Array(items) => items.iter().filter_map(Value::as_object).collect(),
        _ => Vec::new(),
    }
}

/// Extract the trendbar list from a REST response envelope
///
/// Returns `None` when no recognizable bar list is present; the caller turns
/// that into an upstream error carrying the endpoint context.
pub fn extract_trendbars(payload: &Value) -> Option<Vec<&JsonMap>> {
    match payload {
        Value::Object(map) => {
            for key in ENVELOPE_KEYS {
                if let Some(Value::Array(items)) = map.get(*key) {
                    debug!("Found trendbars under payload key '{}'", key);
                    return Some(items.iter().filter_map(Value::as_object).collect());
                }
            }
            if let Some(Value::Array(items)) = map.get("trendbar") {
                debug!("Found trendbar list under 'trendbar' key");
                return Some(items.iter().filter_map(Value::as_object).collect());
            }
            if looks_like_trendbar(map) {
                debug!("Payload appears to be a single trendbar object");
                return Some(vec![map]);
            }
            None
        }
        Value::Array(items) => Some(items.iter().filter_map(Value::as_object).collect()),
        _ => None,
    }
}

fn price_field(raw: &JsonMap, primary: &str, alias: &str) -> Option<f64> {
    parse_float(raw.get(primary)).or_else(|| parse_float(raw.get(alias)))
}

/// Lenient float extraction: JSON numbers and numeric strings both parse
fn parse_float(value: Option<&Value>) -> Option<f64> {
    let parsed = match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}
