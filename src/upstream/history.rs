/// Bounded REST queries for historical trendbars
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{MarketDataError, Result};
use crate::types::{Bar, SymbolReference, Timeframe};
use crate::upstream::normalize::{build_bar, extract_trendbars};
use crate::upstream::symbols::{body_excerpt, join_url, SymbolResolver};

/// Hard cap on the number of bars a single request may return
pub const MAX_LIMIT: i64 = 500;

/// One bounded history query
#[derive(Debug, Clone)]
pub struct HistoryRequest {
    pub access_token: String,
    pub account_id: i64,
    pub symbol: SymbolReference,
    pub timeframe: Timeframe,
    pub limit: i64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl HistoryRequest {
    pub fn latest(
        access_token: impl Into<String>,
        account_id: i64,
        symbol: SymbolReference,
        timeframe: Timeframe,
        limit: i64,
    ) -> Self {
        HistoryRequest {
            access_token: access_token.into(),
            account_id,
            symbol,
            timeframe,
            limit,
            start_time: None,
            end_time: None,
        }
    }
}

/// Fetches the latest N bars for a resolved symbol/timeframe via REST
pub struct HistoryFetcher {
    client: Client,
    base_url: String,
    resolver: SymbolResolver,
}

impl HistoryFetcher {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = base_url.into();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MarketDataError::Config(format!("Failed to build HTTP client: {}", e)))?;
        let resolver = SymbolResolver::new(client.clone(), base_url.clone());

        Ok(HistoryFetcher {
            client,
            base_url,
            resolver,
        })
    }

    /// Return the latest bars for the request, oldest first
    pub async fn fetch_bars(&self, req: &HistoryRequest) -> Result<Vec<Bar>> {
        if req.access_token.is_empty() {
            return Err(MarketDataError::InvalidArgument(
                "An OAuth access token is required to query cTrader".to_string(),
            ));
        }
        if req.symbol.symbol_name.is_empty() {
            return Err(MarketDataError::InvalidArgument(
                "A symbol must be supplied when requesting OHLC data".to_string(),
            ));
        }
        let limit = effective_limit(req.limit)?;

        let symbol_id = match req.symbol.symbol_id {
            Some(id) => id,
            None => {
                self.resolver
                    .resolve(&req.access_token, req.account_id, &req.symbol.symbol_name)
                    .await?
            }
        };

        let endpoint = format!(
            "accounts/{}/symbols/{}/trendbars",
            req.account_id, symbol_id
        );
        let url = join_url(&self.base_url, &endpoint);

        let mut query: Vec<(&str, String)> = vec![
            ("timeframe", req.timeframe.as_str().to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(start) = req.start_time {
            query.push(("from", start.timestamp_millis().to_string()));
        }
        if let Some(end) = req.end_time {
            query.push(("to", end.timestamp_millis().to_string()));
        }

        info!(
            "Requesting {} {} trendbars for {} (account {}) via REST",
            limit,
            req.timeframe.as_str(),
            req.symbol.symbol_name,
            req.account_id
        );

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", req.access_token))
            .query(&query)
            .send()
            .await
            .map_err(|e| {
                MarketDataError::upstream(&endpoint, None, format!("Request failed: {}", e))
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| MarketDataError::upstream(&endpoint, Some(status), e.to_string()))?;

        if status >= 400 {
            return Err(MarketDataError::upstream(
                &endpoint,
                Some(status),
                body_excerpt(&body),
            ));
        }

        let payload = parse_body(&body, &endpoint, status)?;

        let bars = collect_bars(&payload, limit, &endpoint, status)?;
        debug!("Fetched {} OHLC bars via REST", bars.len());
        Ok(bars)
    }
}

/// Reject a non-positive limit, clamp an oversized one to `MAX_LIMIT`
pub(crate) fn effective_limit(limit: i64) -> Result<usize> {
    if limit <= 0 {
        return Err(MarketDataError::InvalidArgument(
            "The number of trendbars requested must be positive".to_string(),
        ));
    }
    Ok(limit.min(MAX_LIMIT) as usize)
}

/// Decode a REST response body, mapping a non-JSON body to an upstream error
pub(crate) fn parse_body(body: &str, endpoint: &str, status: u16) -> Result<Value> {
    serde_json::from_str(body).map_err(|_| {
        MarketDataError::upstream(endpoint, Some(status), "Response body was not valid JSON")
    })
}

/// Normalize, order and truncate the bars carried by a REST payload
///
/// Guards against upstream returning more bars than requested or returning
/// them out of order.
pub(crate) fn collect_bars(
    payload: &Value,
    limit: usize,
    endpoint: &str,
    status: u16,
) -> Result<Vec<Bar>> {
    if let Some(error) = payload.get("error") {
        return Err(MarketDataError::upstream(
            endpoint,
            Some(status),
            format!("Upstream error field: {}", error),
        ));
    }

    let raw_bars = extract_trendbars(payload).ok_or_else(|| {
        MarketDataError::upstream(
            endpoint,
            Some(status),
            format!(
                "Response did not contain any trendbars: {}",
                body_excerpt(&payload.to_string())
            ),
        )
    })?;

    let mut bars = raw_bars
        .into_iter()
        .map(build_bar)
        .collect::<Result<Vec<Bar>>>()?;
    bars.sort_by_key(|bar| bar.timestamp);
    if bars.len() > limit {
        bars.drain(..bars.len() - limit);
    }
    Ok(bars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fetcher() -> HistoryFetcher {
        HistoryFetcher::new("https://unused.invalid/v3", Duration::from_secs(1)).unwrap()
    }

    fn request(limit: i64) -> HistoryRequest {
        HistoryRequest::latest(
            "token",
            1001,
            SymbolReference::with_id("EURUSD", 1),
            Timeframe::M1,
            limit,
        )
    }

    #[tokio::test]
    async fn test_empty_token_rejected_before_network() {
        let mut req = request(10);
        req.access_token = String::new();
        let err = fetcher().fetch_bars(&req).await.unwrap_err();
        assert!(matches!(err, MarketDataError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_non_positive_limit_rejected_before_network() {
        for limit in [0, -5] {
            let err = fetcher().fetch_bars(&request(limit)).await.unwrap_err();
            assert!(matches!(err, MarketDataError::InvalidArgument(_)));
        }
    }

    #[tokio::test]
    async fn test_empty_symbol_rejected_before_network() {
        let mut req = request(10);
        req.symbol = SymbolReference::named("");
        let err = fetcher().fetch_bars(&req).await.unwrap_err();
        assert!(matches!(err, MarketDataError::InvalidArgument(_)));
    }

    #[test]
    fn test_effective_limit_clamps_oversized_requests() {
        assert_eq!(effective_limit(501).unwrap(), 500);
        assert_eq!(effective_limit(10_000).unwrap(), 500);
        assert_eq!(effective_limit(500).unwrap(), 500);
        assert_eq!(effective_limit(1).unwrap(), 1);
    }

    #[test]
    fn test_effective_limit_rejects_non_positive() {
        for limit in [0, -5] {
            let err = effective_limit(limit).unwrap_err();
            assert!(matches!(err, MarketDataError::InvalidArgument(_)));
        }
    }

    #[test]
    fn test_parse_body_non_json_is_upstream_error() {
        let err = parse_body("<html>bad gateway</html>", "trendbars", 200).unwrap_err();
        assert!(matches!(err, MarketDataError::Upstream { .. }));

        let payload = parse_body(r#"{"trendbars": []}"#, "trendbars", 200).unwrap();
        assert!(payload.get("trendbars").is_some());
    }

    #[test]
    fn test_oversized_upstream_response_capped_at_max_limit() {
        // Upstream returns more bars than the cap; a clamped request never
        // sees more than the newest 500
        let raw: Vec<Value> = (1..=600)
            .map(|i| {
                json!({
                    "timestamp": i * 60_000,
                    "open": 1, "high": 1, "low": 1, "close": 1,
                })
            })
            .collect();
        let payload = json!({ "trendbars": raw });

        let limit = effective_limit(10_000).unwrap();
        let bars = collect_bars(&payload, limit, "trendbars", 200).unwrap();
        assert_eq!(bars.len(), 500);
        // Oldest hundred dropped, newest kept, still ascending
        assert_eq!(bars[0].timestamp.timestamp(), 101 * 60);
        assert_eq!(bars[499].timestamp.timestamp(), 600 * 60);
        assert!(bars.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_collect_bars_sorts_and_truncates_to_newest() {
        let payload = json!({
            "trendbars": [
                {"timestamp": 3000, "open": 3, "high": 3, "low": 3, "close": 3},
                {"timestamp": 1000, "open": 1, "high": 1, "low": 1, "close": 1},
                {"timestamp": 2000, "open": 2, "high": 2, "low": 2, "close": 2},
            ]
        });
        let bars = collect_bars(&payload, 2, "trendbars", 200).unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].open, 2.0);
        assert_eq!(bars[1].open, 3.0);
        assert!(bars[0].timestamp < bars[1].timestamp);
    }

    #[test]
    fn test_collect_bars_missing_envelope_is_upstream_error() {
        let payload = json!({"message": "nothing here"});
        let err = collect_bars(&payload, 10, "trendbars", 200).unwrap_err();
        assert!(matches!(err, MarketDataError::Upstream { .. }));
    }

    #[test]
    fn test_collect_bars_error_field_is_upstream_error() {
        let payload = json!({"error": {"code": "ACCESS_DENIED"}});
        let err = collect_bars(&payload, 10, "trendbars", 200).unwrap_err();
        assert!(matches!(err, MarketDataError::Upstream { .. }));
        assert!(err.to_string().contains("ACCESS_DENIED"));
    }

    #[test]
    fn test_collect_bars_malformed_bar_propagates() {
        let payload = json!({
            "bars": [{"timestamp": 1000, "open": 1, "high": 1, "low": 1}]
        });
        let err = collect_bars(&payload, 10, "trendbars", 200).unwrap_err();
        assert!(matches!(err, MarketDataError::MalformedBar(_)));
    }
}
