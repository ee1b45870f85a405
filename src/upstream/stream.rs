/// Live trendbar streaming over the cTrader WebSocket API
///
/// One `LiveFeed` owns one logical subscription: it seeds the consumer with
/// recent history, then keeps a persistent connection alive across reconnects
/// while discarding re-delivered bars against a session watermark.
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{MarketDataError, Result};
use crate::types::{Bar, Config, StreamEvent, SymbolReference, Timeframe};
use crate::upstream::history::{HistoryFetcher, HistoryRequest};
use crate::upstream::normalize::{
    bar_payloads, build_bar, format_timestamp, looks_like_trendbar,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Upstream sends ping/heartbeat frames; a silent connection this long is dead
const RECEIVE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Serialize)]
struct AuthenticateFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    payload: AuthenticatePayload<'a>,
}

#[derive(Debug, Serialize)]
struct AuthenticatePayload<'a> {
    #[serde(rename = "accessToken")]
    access_token: &'a str,
    application: &'static str,
}

#[derive(Debug, Serialize)]
struct SubscribeFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    payload: SubscribePayload<'a>,
}

#[derive(Debug, Serialize)]
struct SubscribePayload<'a> {
    #[serde(rename = "accountId")]
    account_id: i64,
    symbol: &'a str,
    timeframe: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<String>,
}

/// Exponential reconnect backoff: 1s doubling to a cap, reset on success
#[derive(Debug)]
pub(crate) struct Backoff {
    delay: Duration,
    max: Duration,
}

impl Backoff {
    pub(crate) fn new(max: Duration) -> Self {
        Backoff {
            delay: INITIAL_RECONNECT_DELAY,
            max,
        }
    }

    /// Current delay; doubles for the next failure
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.delay;
        self.delay = (self.delay * 2).min(self.max);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.delay = INITIAL_RECONNECT_DELAY;
    }
}

/// What an inbound frame asks the session to do
#[derive(Debug)]
pub(crate) enum FrameAction {
    /// Reply with a pong, echoing the ping's payload when present
    Pong(Option<Value>),
    /// Control acknowledgement, nothing to emit
    Control,
    Bars(Vec<Bar>),
    /// No locatable bar payload; logged and skipped
    Ignore,
}

/// Decode one inbound text frame and dispatch on its declared type
pub(crate) fn classify_frame(text: &str) -> Result<FrameAction> {
    let message: Value = serde_json::from_str(text).map_err(|_| {
        MarketDataError::MalformedBar("Invalid JSON payload received from cTrader".to_string())
    })?;
    let Some(map) = message.as_object() else {
        return Err(MarketDataError::MalformedBar(
            "Unexpected message shape received from cTrader".to_string(),
        ));
    };

    match map.get("type").and_then(Value::as_str).unwrap_or("") {
        "ping" | "heartbeat" => return Ok(FrameAction::Pong(map.get("payload").cloned())),
        "authenticated" | "subscriptionConfirmed" | "info" => return Ok(FrameAction::Control),
        _ => {}
    }

    let Some(payload) = map.get("payload").or_else(|| map.get("data")) else {
        debug!("Ignoring message without payload");
        return Ok(FrameAction::Ignore);
    };

    let raw_bars = match payload.as_object() {
        Some(obj) if obj.contains_key("trendbars") => bar_payloads(&obj["trendbars"]),
        Some(obj) if obj.contains_key("trendbar") => bar_payloads(&obj["trendbar"]),
        Some(obj) if looks_like_trendbar(obj) => vec![obj],
        _ => {
            debug!("Ignoring non-trendbar payload");
            return Ok(FrameAction::Ignore);
        }
    };

    let bars = raw_bars
        .into_iter()
        .map(build_bar)
        .collect::<Result<Vec<Bar>>>()?;
    Ok(FrameAction::Bars(bars))
}

/// Admit a bar only if it is strictly newer than the watermark
///
/// Advances the watermark on admission. The watermark survives reconnects so
/// re-delivered bars are dropped uniformly across the whole session.
pub(crate) fn accept_bar(watermark: &mut Option<DateTime<Utc>>, bar: &Bar) -> bool {
    if let Some(mark) = *watermark {
        if bar.timestamp <= mark {
            debug!(
                "Skipping bar at {} because it is not newer than {}",
                bar.timestamp, mark
            );
            return false;
        }
    }
    *watermark = Some(bar.timestamp);
    true
}

enum SessionEnd {
    Cancelled,
}

/// One live streaming subscription for (account, symbol, timeframe)
pub struct LiveFeed {
    access_token: String,
    account_id: i64,
    symbol: SymbolReference,
    timeframe: Timeframe,
    history: HistoryFetcher,
    ws_url: String,
    seed_limit: i64,
    max_reconnect_delay: Duration,
}

impl LiveFeed {
    pub fn new(
        config: &Config,
        access_token: impl Into<String>,
        account_id: i64,
        symbol: SymbolReference,
        timeframe: Timeframe,
    ) -> Result<Self> {
        let history = HistoryFetcher::new(
            config.rest_base_url.clone(),
            Duration::from_secs(config.request_timeout_sec),
        )?;

        Ok(LiveFeed {
            access_token: access_token.into(),
            account_id,
            symbol,
            timeframe,
            history,
            ws_url: config.ws_url.clone(),
            seed_limit: config.seed_history_limit,
            max_reconnect_delay: Duration::from_secs(config.max_reconnect_delay_sec),
        })
    }

    /// Run the session until the consumer drops its receiver
    ///
    /// A history-seeding failure is terminal because no connection has ever
    /// succeeded; afterwards every failure reconnects with backoff.
    pub async fn run(self, tx: mpsc::Sender<StreamEvent>) {
        info!(
            "Initialising OHLC stream for {} ({}) on account {}",
            self.symbol.symbol_name,
            self.timeframe.as_str(),
            self.account_id
        );

        let seed_request = HistoryRequest::latest(
            self.access_token.clone(),
            self.account_id,
            self.symbol.clone(),
            self.timeframe,
            self.seed_limit,
        );
        let seeded = match self.history.fetch_bars(&seed_request).await {
            Ok(bars) => bars,
            Err(e) => {
                error!("Failed to seed stream with history: {}", e);
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };
        info!("Retrieved {} historical bars before streaming", seeded.len());
        if seeded.is_empty() {
            warn!("No historical bars were returned before streaming");
        }

        let meta = StreamEvent::Meta {
            symbol: self.symbol.symbol_name.clone(),
            timeframe: self.timeframe,
            initial_bars: seeded.len(),
        };
        if tx.send(meta).await.is_err() {
            return;
        }

        let mut watermark: Option<DateTime<Utc>> = None;
        for bar in seeded {
            watermark = Some(bar.timestamp);
            if tx.send(StreamEvent::Bar(bar)).await.is_err() {
                return;
            }
        }

        let mut backoff = Backoff::new(self.max_reconnect_delay);
        loop {
            match self.run_connection(&tx, &mut watermark, &mut backoff).await {
                Ok(SessionEnd::Cancelled) => {
                    info!(
                        "Stream for {} cancelled by consumer",
                        self.symbol.symbol_name
                    );
                    return;
                }
                Err(e) if e.is_recoverable() => {
                    warn!("WebSocket connection lost ({}); reconnecting", e);
                }
                Err(e) => {
                    error!("Stream failed: {}", e);
                    let _ = tx
                        .send(StreamEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                    return;
                }
            }

            let delay = backoff.next_delay();
            info!("Reconnecting after {:?}", delay);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = tx.closed() => return,
            }
        }
    }

    /// One physical connection: handshake, auth, subscribe, frame loop
    async fn run_connection(
        &self,
        tx: &mpsc::Sender<StreamEvent>,
        watermark: &mut Option<DateTime<Utc>>,
        backoff: &mut Backoff,
    ) -> Result<SessionEnd> {
        let url = format!("{}?access_token={}", self.ws_url, self.access_token);
        info!(
            "Connecting to cTrader WebSocket for {} ({})",
            self.symbol.symbol_name,
            self.timeframe.as_str()
        );

        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url))
            .await
            .map_err(|_| MarketDataError::Transport("Connection handshake timed out".to_string()))?
            .map_err(|e| MarketDataError::Transport(format!("Connection failed: {}", e)))?;
        let (mut write, mut read) = ws_stream.split();

        self.authenticate_and_subscribe(&mut write, *watermark)
            .await?;

        // Connecting -> Streaming succeeded; the next failure starts over at 1s
        backoff.reset();

        loop {
            let frame = tokio::select! {
                _ = tx.closed() => return Ok(SessionEnd::Cancelled),
                frame = tokio::time::timeout(RECEIVE_IDLE_TIMEOUT, read.next()) => {
                    frame.map_err(|_| {
                        MarketDataError::Transport("Receive timed out".to_string())
                    })?
                }
            };

            let message = frame
                .ok_or_else(|| {
                    MarketDataError::Transport("Connection closed by upstream".to_string())
                })?
                .map_err(|e| MarketDataError::Transport(format!("WebSocket error: {}", e)))?;

            match message {
                Message::Text(text) => match classify_frame(&text)? {
                    FrameAction::Pong(payload) => {
                        self.send_pong(&mut write, payload).await?;
                    }
                    FrameAction::Control => {
                        debug!("Received control message");
                    }
                    FrameAction::Bars(bars) => {
                        for bar in bars {
                            if !accept_bar(watermark, &bar) {
                                continue;
                            }
                            if tx.send(StreamEvent::Bar(bar)).await.is_err() {
                                return Ok(SessionEnd::Cancelled);
                            }
                        }
                    }
                    FrameAction::Ignore => {}
                },
                Message::Close(_) => {
                    return Err(MarketDataError::Transport(
                        "Close frame received from upstream".to_string(),
                    ));
                }
                // Protocol-level pings are answered by the library
                _ => {}
            }
        }
    }

    async fn authenticate_and_subscribe(
        &self,
        write: &mut WsSink,
        watermark: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let auth = AuthenticateFrame {
            kind: "authenticate",
            payload: AuthenticatePayload {
                access_token: &self.access_token,
                application: "connect",
            },
        };
        send_frame(write, &auth).await?;

        let from = watermark.map(format_timestamp);
        if let Some(ref from) = from {
            info!("Requesting trendbars from {}", from);
        }
        let subscribe = SubscribeFrame {
            kind: "subscribeTrendbars",
            payload: SubscribePayload {
                account_id: self.account_id,
                symbol: &self.symbol.symbol_name,
                timeframe: self.timeframe.as_str(),
                from,
            },
        };
        send_frame(write, &subscribe).await?;
        info!(
            "Subscription message sent for {} ({})",
            self.symbol.symbol_name,
            self.timeframe.as_str()
        );
        Ok(())
    }

    async fn send_pong(&self, write: &mut WsSink, payload: Option<Value>) -> Result<()> {
        let mut response = serde_json::json!({ "type": "pong" });
        if let Some(payload) = payload {
            response["payload"] = payload;
        }
        let text = serde_json::to_string(&response)?;
        write
            .send(Message::Text(text))
            .await
            .map_err(|e| MarketDataError::Transport(format!("Failed to send pong: {}", e)))?;
        debug!("Sent pong response to ping/heartbeat message");
        Ok(())
    }
}

async fn send_frame<T: Serialize>(write: &mut WsSink, frame: &T) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    debug!("Sending WebSocket frame: {}", text);
    write
        .send(Message::Text(text))
        .await
        .map_err(|e| MarketDataError::Transport(format!("Failed to send frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar_at(secs: i64) -> Bar {
        Bar {
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: None,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps_at_max() {
        let mut backoff = Backoff::new(Duration::from_secs(30));
        let observed: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(observed, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_backoff_resets_to_one_second() {
        let mut backoff = Backoff::new(Duration::from_secs(30));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_accept_bar_discards_at_or_below_watermark() {
        let mut watermark = Some(Utc.timestamp_opt(2000, 0).unwrap());
        assert!(!accept_bar(&mut watermark, &bar_at(1000)));
        assert!(!accept_bar(&mut watermark, &bar_at(2000)));
        assert!(accept_bar(&mut watermark, &bar_at(3000)));
        assert_eq!(watermark, Some(Utc.timestamp_opt(3000, 0).unwrap()));
    }

    #[test]
    fn test_accept_bar_without_watermark_admits_and_sets() {
        let mut watermark = None;
        assert!(accept_bar(&mut watermark, &bar_at(1000)));
        assert_eq!(watermark, Some(Utc.timestamp_opt(1000, 0).unwrap()));
    }

    #[test]
    fn test_seed_then_duplicate_live_frame_emits_once() {
        // Seeded bar at t1; live frames re-deliver t1 then advance to t2
        let seed = bar_at(1000);
        let mut watermark = Some(seed.timestamp);
        let mut emitted = vec![seed.timestamp];

        for bar in [bar_at(1000), bar_at(2000)] {
            if accept_bar(&mut watermark, &bar) {
                emitted.push(bar.timestamp);
            }
        }

        let expected = vec![
            Utc.timestamp_opt(1000, 0).unwrap(),
            Utc.timestamp_opt(2000, 0).unwrap(),
        ];
        assert_eq!(emitted, expected);
    }

    #[test]
    fn test_connection_failures_are_recoverable() {
        // Everything the frame loop can raise reconnects with backoff
        let transport = MarketDataError::Transport("Receive timed out".to_string());
        assert!(transport.is_recoverable());
        let malformed = classify_frame("not json").unwrap_err();
        assert!(malformed.is_recoverable());

        // A caller mistake never loops on reconnect
        let invalid = MarketDataError::InvalidArgument("bad timeframe".to_string());
        assert!(!invalid.is_recoverable());
    }

    #[test]
    fn test_classify_frame_ping_echoes_payload() {
        let action = classify_frame(r#"{"type":"ping","payload":{"seq":7}}"#).unwrap();
        match action {
            FrameAction::Pong(Some(payload)) => assert_eq!(payload["seq"], 7),
            other => panic!("expected pong with payload, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_frame_heartbeat_without_payload() {
        let action = classify_frame(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(action, FrameAction::Pong(None)));
    }

    #[test]
    fn test_classify_frame_control_messages() {
        for kind in ["authenticated", "subscriptionConfirmed", "info"] {
            let text = format!(r#"{{"type":"{}"}}"#, kind);
            assert!(matches!(
                classify_frame(&text).unwrap(),
                FrameAction::Control
            ));
        }
    }

    #[test]
    fn test_classify_frame_trendbars_collection() {
        let text = r#"{
            "type": "trendbarUpdate",
            "payload": {"trendbars": [
                {"timestamp": 1000, "open": 1, "high": 1, "low": 1, "close": 1},
                {"timestamp": 2000, "open": 2, "high": 2, "low": 2, "close": 2}
            ]}
        }"#;
        match classify_frame(text).unwrap() {
            FrameAction::Bars(bars) => assert_eq!(bars.len(), 2),
            other => panic!("expected bars, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_frame_bare_bar_payload() {
        let text = r#"{
            "type": "trendbar",
            "data": {"timestamp": 1000, "open": 1, "high": 1, "low": 1, "close": 1}
        }"#;
        match classify_frame(text).unwrap() {
            FrameAction::Bars(bars) => assert_eq!(bars.len(), 1),
            other => panic!("expected one bar, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_frame_skips_unlocatable_payloads() {
        assert!(matches!(
            classify_frame(r#"{"type":"quote"}"#).unwrap(),
            FrameAction::Ignore
        ));
        assert!(matches!(
            classify_frame(r#"{"type":"quote","payload":{"bid":1.0}}"#).unwrap(),
            FrameAction::Ignore
        ));
    }

    #[test]
    fn test_classify_frame_invalid_json_is_malformed() {
        let err = classify_frame("not json").unwrap_err();
        assert!(matches!(err, MarketDataError::MalformedBar(_)));
        let err = classify_frame(r#"[1,2,3]"#).unwrap_err();
        assert!(matches!(err, MarketDataError::MalformedBar(_)));
    }

    #[test]
    fn test_classify_frame_undecodable_bar_is_malformed() {
        let text = r#"{
            "type": "trendbarUpdate",
            "payload": {"trendbar": [{"timestamp": 1000, "open": 1}]}
        }"#;
        let err = classify_frame(text).unwrap_err();
        assert!(matches!(err, MarketDataError::MalformedBar(_)));
    }
}
