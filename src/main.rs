/// Main entry point for the OHLC market-data backend
use std::sync::Arc;

use tracing::info;

use barfeed::config::load_config;
use barfeed::server::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());
    let config = load_config(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(format!("barfeed={},info", config.log_level))
        .init();

    info!("Configuration loaded from {}", config_path);

    let bind_addr = config.bind_addr.clone();
    let state = AppState {
        config: Arc::new(config),
    };
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("OHLC backend listening on {}", bind_addr);
    axum::serve(listener, app).await?;

    Ok(())
}
