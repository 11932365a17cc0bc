// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// The produced state surface: read accessors for per-instrument snapshots,
// price series and RSI, plus the connection flag; write endpoints for the
// watchlist add flow and the simulated trade feature. All endpoints live
// under `/api/v1/`.
//
// CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::watchlist::{add_instrument, AddOutcome};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/market/:key", get(market))
        .route("/api/v1/search", get(search))
        .route("/api/v1/watchlist", post(watchlist_add))
        .route("/api/v1/trade", post(trade))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "state_version": state.current_state_version(),
        "connection": state.stream.connection_state().to_string(),
        "server_time": chrono::Utc::now().timestamp_millis(),
    }))
}

// =============================================================================
// Full state snapshot
// =============================================================================

async fn full_state(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

// =============================================================================
// Per-instrument market data
// =============================================================================

async fn market(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    match state.store.snapshot(&key) {
        Some(snapshot) => {
            let rsi = state.store.rsi(&key).unwrap_or(50.0);
            Json(serde_json::json!({
                "stream_key": key,
                "snapshot": snapshot,
                "series": state.store.series(&key),
                "rsi": rsi,
                "rsi_signal": crate::indicators::rsi_label(rsi),
                "price_idr": state.price_idr(&key),
            }))
            .into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "instrument not tracked" })),
        )
            .into_response(),
    }
}

// =============================================================================
// Symbol search
// =============================================================================

#[derive(Deserialize)]
struct SearchParams {
    q: String,
}

async fn search(
    State(state): State<Arc<AppState>>,
    Query(params): Query<SearchParams>,
) -> impl IntoResponse {
    if params.q.len() < 2 {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "query too short" })),
        )
            .into_response();
    }

    match state.gecko.search(&params.q).await {
        Ok(candidates) => Json(candidates).into_response(),
        Err(e) => {
            warn!(error = %e, "symbol search failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": format!("symbol lookup failed: {e}") })),
            )
                .into_response()
        }
    }
}

// =============================================================================
// Watchlist add
// =============================================================================

async fn watchlist_add(
    State(state): State<Arc<AppState>>,
    Json(candidate): Json<crate::types::Instrument>,
) -> impl IntoResponse {
    info!(id = %candidate.id, "watchlist add requested");
    match add_instrument(&state, candidate).await {
        AddOutcome::Added { seeded } => {
            Json(serde_json::json!({ "added": true, "seeded": seeded })).into_response()
        }
        AddOutcome::AlreadyWatched => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "added": false, "error": "already watched" })),
        )
            .into_response(),
    }
}

// =============================================================================
// Simulated trade
// =============================================================================

#[derive(Deserialize)]
struct TradeRequest {
    side: TradeRequestSide,
    stream_key: String,
    /// BUY: IDR amount to spend. SELL: asset quantity to sell.
    amount: f64,
}

#[derive(Deserialize, Clone, Copy)]
#[serde(rename_all = "UPPERCASE")]
enum TradeRequestSide {
    Buy,
    Sell,
}

async fn trade(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TradeRequest>,
) -> impl IntoResponse {
    let Some(price_idr) = state.price_idr(&req.stream_key) else {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": "no current price for instrument" })),
        )
            .into_response();
    };

    let result = {
        let mut portfolio = state.portfolio.write();
        match req.side {
            TradeRequestSide::Buy => portfolio.buy(&req.stream_key, req.amount, price_idr),
            TradeRequestSide::Sell => portfolio.sell(&req.stream_key, req.amount, price_idr),
        }
    };

    match result {
        Ok(record) => {
            state.increment_version();
            info!(
                side = %record.side,
                stream_key = %record.stream_key,
                amount_idr = record.amount_idr,
                "simulated trade executed"
            );
            Json(record).into_response()
        }
        Err(rejection) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": rejection.to_string() })),
        )
            .into_response(),
    }
}
