/// Symbol name to cTrader symbol id resolution
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{MarketDataError, Result};

/// Keys under which the lookup response may carry the numeric id
const ID_KEYS: &[&str] = &["symbolId", "id"];

/// Nested objects the id may be wrapped in
const WRAPPER_KEYS: &[&str] = &["symbol", "data"];

/// Resolves a human-readable symbol name to the broker's numeric identifier.
///
/// Resolution is scoped to a single request: the catalogue can change and
/// differs per account, so nothing is cached across requests.
pub struct SymbolResolver {
    client: Client,
    base_url: String,
}

impl SymbolResolver {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        SymbolResolver {
            client,
            base_url: base_url.into(),
        }
    }

    pub async fn resolve(
        &self,
        access_token: &str,
        account_id: i64,
        symbol_name: &str,
    ) -> Result<i64> {
        let endpoint = format!("accounts/{}/symbols/{}", account_id, symbol_name);
        let url = join_url(&self.base_url, &endpoint);

        info!(
            "Resolving symbol '{}' for account {}",
            symbol_name, account_id
        );

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", access_token))
            .send()
            .await
            .map_err(|e| {
                MarketDataError::upstream(&endpoint, None, format!("Request failed: {}", e))
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            MarketDataError::upstream(&endpoint, Some(status.as_u16()), e.to_string())
        })?;

        if status.as_u16() >= 400 {
            return Err(MarketDataError::upstream(
                &endpoint,
                Some(status.as_u16()),
                body_excerpt(&body),
            ));
        }

        let payload: Value = serde_json::from_str(&body).map_err(|_| {
            MarketDataError::upstream(
                &endpoint,
                Some(status.as_u16()),
                "Response body was not valid JSON",
            )
        })?;

        if let Some(error) = payload.get("error") {
            return Err(MarketDataError::upstream(
                &endpoint,
                Some(status.as_u16()),
                format!("Upstream error field: {}", error),
            ));
        }

        let symbol_id = find_symbol_id(&payload).ok_or_else(|| {
            MarketDataError::upstream(
                &endpoint,
                Some(status.as_u16()),
                "Response did not include a numeric symbol id",
            )
        })?;

        debug!("Resolved '{}' to symbol id {}", symbol_name, symbol_id);
        Ok(symbol_id)
    }
}

fn find_symbol_id(payload: &Value) -> Option<i64> {
    if let Some(map) = payload.as_object() {
        for key in ID_KEYS {
            if let Some(id) = numeric_id(map.get(*key)) {
                return Some(id);
            }
        }
        for wrapper in WRAPPER_KEYS {
            if let Some(inner) = map.get(*wrapper) {
                if let Some(id) = find_symbol_id(inner) {
                    return Some(id);
                }
            }
        }
    }
    None
}

fn numeric_id(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

pub(crate) fn join_url(base_url: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

pub(crate) fn body_excerpt(body: &str) -> String {
    const MAX_LEN: usize = 200;
    if body.chars().count() <= MAX_LEN {
        body.to_string()
    } else {
        body.chars().take(MAX_LEN).collect()
    }
}
