/// HTTP boundary: REST and SSE endpoints for OHLC retrieval
///
/// Thin glue over the upstream layer: query extraction, error mapping and
/// serialization live here, protocol logic does not.
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, NaiveDateTime, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};

use crate::error::{MarketDataError, Result};
use crate::types::{Bar, Config, StreamEvent, SymbolReference, Timeframe};
use crate::upstream::{HistoryFetcher, HistoryRequest, LiveFeed};

/// Shared state for the HTTP boundary
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
}

/// Buffered events per streaming client before backpressure applies
const STREAM_CHANNEL_CAPACITY: usize = 64;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ohlc/{ticker}", get(get_ohlc))
        .route("/ohlc/{ticker}/stream", get(stream_ohlc))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct OhlcQuery {
    access_token: Option<String>,
    account_id: Option<i64>,
    symbol_id: Option<i64>,
    timeframe: Option<String>,
    limit: Option<i64>,
    start: Option<String>,
    end: Option<String>,
    base_url: Option<String>,
    timeout: Option<f64>,
}

/// GET /ohlc/{ticker} - bounded history as one JSON response
async fn get_ohlc(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
    Query(query): Query<OhlcQuery>,
) -> Response {
    match fetch_history(&state, &ticker, &query).await {
        Ok((timeframe, bars)) => {
            let payload = json!({
                "ticker": ticker,
                "timeframe": timeframe.as_str(),
                "bars": bars,
            });
            (StatusCode::OK, Json(payload)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// GET /ohlc/{ticker}/stream - seeded history followed by live bars over SSE
async fn stream_ohlc(
    State(state): State<AppState>,
    Path(ticker): Path<String>,
    Query(query): Query<OhlcQuery>,
) -> Response {
    let feed = match build_feed(&state, &ticker, &query) {
        Ok(feed) => feed,
        Err(e) => return error_response(&e),
    };

    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    tokio::spawn(feed.run(tx));

    let stream = ReceiverStream::new(rx).map(|event| sse_event(&event));
    Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response()
}

async fn fetch_history(
    state: &AppState,
    ticker: &str,
    query: &OhlcQuery,
) -> Result<(Timeframe, Vec<Bar>)> {
    let (access_token, account_id, timeframe) = required_params(query)?;

    let start_time = query
        .start
        .as_deref()
        .map(parse_query_timestamp)
        .transpose()?;
    let end_time = query
        .end
        .as_deref()
        .map(parse_query_timestamp)
        .transpose()?;

    let base_url = query
        .base_url
        .clone()
        .unwrap_or_else(|| state.config.rest_base_url.clone());
    let timeout = request_timeout(state, query)?;

    let fetcher = HistoryFetcher::new(base_url, timeout)?;
    let request = HistoryRequest {
        access_token,
        account_id,
        symbol: symbol_reference(ticker, query),
        timeframe,
        limit: query.limit.unwrap_or(100),
        start_time,
        end_time,
    };

    let bars = fetcher.fetch_bars(&request).await?;
    Ok((timeframe, bars))
}

fn build_feed(state: &AppState, ticker: &str, query: &OhlcQuery) -> Result<LiveFeed> {
    let (access_token, account_id, timeframe) = required_params(query)?;
    LiveFeed::new(
        &state.config,
        access_token,
        account_id,
        symbol_reference(ticker, query),
        timeframe,
    )
}

fn required_params(query: &OhlcQuery) -> Result<(String, i64, Timeframe)> {
    let access_token = query.access_token.clone().ok_or_else(|| {
        MarketDataError::InvalidArgument(
            "Missing required 'access_token' query parameter".to_string(),
        )
    })?;
    let account_id = query.account_id.ok_or_else(|| {
        MarketDataError::InvalidArgument(
            "Missing required 'account_id' query parameter".to_string(),
        )
    })?;
    let timeframe = match query.timeframe.as_deref() {
        Some(raw) => Timeframe::parse(raw)?,
        None => Timeframe::default(),
    };
    Ok((access_token, account_id, timeframe))
}

fn symbol_reference(ticker: &str, query: &OhlcQuery) -> SymbolReference {
    match query.symbol_id {
        Some(id) => SymbolReference::with_id(ticker, id),
        None => SymbolReference::named(ticker),
    }
}

fn request_timeout(state: &AppState, query: &OhlcQuery) -> Result<Duration> {
    match query.timeout {
        // try_from_secs_f64 also rejects NaN, infinities and values beyond
        // Duration's range, so an absurd caller value cannot panic here
        Some(seconds) if seconds > 0.0 => Duration::try_from_secs_f64(seconds).map_err(|_| {
            MarketDataError::InvalidArgument(format!("Invalid 'timeout' value: {}", seconds))
        }),
        Some(seconds) => Err(MarketDataError::InvalidArgument(format!(
            "Invalid 'timeout' value: {}",
            seconds
        ))),
        None => Ok(Duration::from_secs(state.config.request_timeout_sec)),
    }
}

/// Parse an ISO-8601 query timestamp; timezone-less inputs are rejected
fn parse_query_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    let text = raw.trim();
    let text = match text.strip_suffix('Z') {
        Some(stripped) => format!("{}+00:00", stripped),
        None => text.to_string(),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&text) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if NaiveDateTime::parse_from_str(&text, format).is_ok() {
            return Err(MarketDataError::InvalidArgument(
                "Timestamps must include a timezone (expected UTC)".to_string(),
            ));
        }
    }

    Err(MarketDataError::InvalidArgument(format!(
        "Unable to parse ISO-8601 timestamp '{}'",
        raw
    )))
}

fn sse_event(event: &StreamEvent) -> std::result::Result<Event, axum::Error> {
    match event {
        StreamEvent::Meta {
            symbol,
            timeframe,
            initial_bars,
        } => Event::default().event("meta").json_data(json!({
            "symbol": symbol,
            "timeframe": timeframe.as_str(),
            "initialBars": initial_bars,
        })),
        StreamEvent::Bar(bar) => Event::default().event("bar").json_data(bar),
        StreamEvent::Complete => Ok(Event::default().event("complete").data("{}")),
        StreamEvent::Error { message } => Event::default()
            .event("error")
            .json_data(json!({ "error": message })),
    }
}

fn error_response(err: &MarketDataError) -> Response {
    let status = if err.is_upstream() {
        error!("Upstream failure: {}", err);
        StatusCode::BAD_GATEWAY
    } else {
        warn!("Rejected request: {}", err);
        StatusCode::BAD_REQUEST
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
