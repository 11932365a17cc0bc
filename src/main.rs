// =============================================================================
// Nexus Trader — Main Entry Point
// =============================================================================
//
// Startup order matters: the initial watchlist is seeded from the historical
// fetch BEFORE the stream manager opens its subscription, so live ticks never
// arrive into empty buffers.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod coingecko;
mod indicators;
mod market_data;
mod portfolio;
mod runtime_config;
mod types;
mod watchlist;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::coingecko::CoinGeckoClient;
use crate::runtime_config::RuntimeConfig;

const CONFIG_PATH: &str = "runtime_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Nexus Trader — market intelligence engine starting up");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Override the watchlist from env if available.
    if let Ok(raw) = std::env::var("NEXUS_WATCHLIST") {
        let parsed = runtime_config::parse_watchlist_override(&raw);
        if parsed.is_empty() {
            warn!(raw = %raw, "NEXUS_WATCHLIST set but contained no valid id:stream_key entries");
        } else {
            config.watchlist = parsed;
        }
    }
    if let Ok(addr) = std::env::var("NEXUS_BIND_ADDR") {
        config.bind_addr = addr;
    }

    info!(
        instruments = ?config
            .watchlist
            .iter()
            .map(|c| c.stream_key.as_str())
            .collect::<Vec<_>>(),
        capacity = config.history_capacity,
        "configured watchlist"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config, CoinGeckoClient::default()));

    // ── 3. Seed histories before any subscription exists ─────────────────
    if let Err(e) = watchlist::seed_startup(&state).await {
        warn!(error = %e, "startup seeding incomplete");
    }

    // ── 4. Start the stream manager ──────────────────────────────────────
    let stream = state.stream.clone();
    let stream_task = tokio::spawn(stream.run());
    info!("stream manager launched");

    // ── 5. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr = state.runtime_config.read().bind_addr.clone();
    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(listener) => {
                info!(addr = %bind_addr, "API server listening");
                if let Err(e) = axum::serve(listener, app).await {
                    error!(error = %e, "API server failed");
                }
            }
            Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind API server"),
        }
    });

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — releasing streaming connection");

    state.stream.shutdown();
    if let Err(e) = stream_task.await {
        error!(error = %e, "stream task join failed");
    }

    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("Nexus Trader shut down complete");
    Ok(())
}
