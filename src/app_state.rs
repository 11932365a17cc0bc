// =============================================================================
// Central Application State — Nexus Trader engine
// =============================================================================
//
// The single source of truth for the process. The market store is owned here
// and passed explicitly to the stream manager and to readers — no ambient
// global state.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared collections.
//   - tokio Mutex to serialize the add-instrument flow (the only suspending
//     mutation path).
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::coingecko::CoinGeckoClient;
use crate::indicators::rsi_label;
use crate::market_data::{MarketStore, StreamManager, TickSnapshot};
use crate::portfolio::{Portfolio, TradeRecord};
use crate::runtime_config::RuntimeConfig;
use crate::types::{ConnectionState, Instrument};

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;

/// A recorded error event for the state surface.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, incremented on every
    /// meaningful state mutation.
    pub state_version: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,

    // ── Market data core ────────────────────────────────────────────────
    pub store: Arc<MarketStore>,
    pub stream: Arc<StreamManager>,

    // ── External collaborators ──────────────────────────────────────────
    pub gecko: Arc<CoinGeckoClient>,

    // ── Simulation ──────────────────────────────────────────────────────
    pub portfolio: RwLock<Portfolio>,
    pub usd_idr_rate: RwLock<f64>,

    // ── Add-instrument flow ─────────────────────────────────────────────
    /// Serializes instrument adds: a second add must not interleave with an
    /// in-flight seed fetch.
    pub add_guard: tokio::sync::Mutex<()>,
    /// UI-facing loading flag for the add path. Always cleared, even when the
    /// seed fetch fails.
    pub seeding: RwLock<bool>,

    // ── Error log ───────────────────────────────────────────────────────
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    /// Construct the engine state from the runtime configuration. The store
    /// gets an entry per configured instrument up front so even a tick that
    /// races the initial seed has somewhere safe to land.
    pub fn new(config: RuntimeConfig, gecko: CoinGeckoClient) -> Self {
        let store = Arc::new(MarketStore::new(config.history_capacity, config.rsi_period));
        for instrument in &config.watchlist {
            store.ensure_entry(&instrument.stream_key);
        }

        let stream = Arc::new(StreamManager::new(
            store.clone(),
            config.watchlist.clone(),
            Duration::from_secs(config.reconnect_delay_secs),
        ));

        let portfolio = Portfolio::new(config.starting_balance_idr);
        let usd_idr_rate = config.usd_idr_rate;

        Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            store,
            stream,
            gecko: Arc::new(gecko),
            portfolio: RwLock::new(portfolio),
            usd_idr_rate: RwLock::new(usd_idr_rate),
            add_guard: tokio::sync::Mutex::new(()),
            seeding: RwLock::new(false),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Error logging ───────────────────────────────────────────────────

    /// Record an error message. Oldest entries are evicted past the cap.
    pub fn push_error(&self, msg: String) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message: msg,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        drop(errors);
        self.increment_version();
    }

    // ── Pricing helpers ─────────────────────────────────────────────────

    /// Current IDR price for a stream key, when a live/seeded USD price
    /// exists.
    pub fn price_idr(&self, stream_key: &str) -> Option<f64> {
        let snap = self.store.snapshot(stream_key)?;
        if snap.price <= 0.0 {
            return None;
        }
        Some(snap.price * *self.usd_idr_rate.read())
    }

    // ── Snapshot builder ────────────────────────────────────────────────

    /// Build the complete serialisable state surface: per-instrument tick
    /// snapshot, bounded price series, RSI, plus the process-wide connection
    /// flag and the simulated portfolio.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let rate = *self.usd_idr_rate.read();

        let instruments: Vec<InstrumentMarketData> = self
            .stream
            .watchlist()
            .into_iter()
            .map(|instrument| {
                let key = instrument.stream_key.clone();
                let snapshot = self.store.snapshot(&key);
                let series = self.store.series(&key);
                let rsi = self.store.rsi(&key).unwrap_or(50.0);
                let price_idr = self.price_idr(&key);
                InstrumentMarketData {
                    instrument,
                    snapshot,
                    series,
                    rsi,
                    rsi_signal: rsi_label(rsi),
                    price_idr,
                }
            })
            .collect();

        let portfolio = self.build_portfolio_snapshot(rate);

        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            connection: self.stream.connection_state(),
            live: self.stream.is_live(),
            seeding: *self.seeding.read(),
            usd_idr_rate: rate,
            uptime_secs: self.start_time.elapsed().as_secs(),
            instruments,
            portfolio,
            recent_errors: self.recent_errors.read().clone(),
        }
    }

    fn build_portfolio_snapshot(&self, rate: f64) -> PortfolioSnapshot {
        let portfolio = self.portfolio.read();
        let starting = self.runtime_config.read().starting_balance_idr;

        let holdings: Vec<HoldingSnapshot> = portfolio
            .holdings()
            .map(|(key, quantity)| HoldingSnapshot {
                stream_key: key.to_string(),
                quantity,
                value_idr: self
                    .store
                    .snapshot(key)
                    .map(|s| s.price * rate * quantity)
                    .unwrap_or(0.0),
            })
            .collect();

        let net_worth_idr = portfolio.net_worth_idr(|key| {
            self.store
                .snapshot(key)
                .filter(|s| s.price > 0.0)
                .map(|s| s.price * rate)
        });
        let pnl_idr = net_worth_idr - starting;
        let pnl_pct = if starting > 0.0 {
            pnl_idr / starting * 100.0
        } else {
            0.0
        };

        PortfolioSnapshot {
            balance_idr: portfolio.balance_idr(),
            net_worth_idr,
            pnl_idr,
            pnl_pct,
            holdings,
            recent_trades: portfolio.recent_trades().to_vec(),
        }
    }
}

// =============================================================================
// Serialisable snapshot types
// =============================================================================

/// Full engine state snapshot for the REST surface.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub connection: ConnectionState,
    pub live: bool,
    pub seeding: bool,
    pub usd_idr_rate: f64,
    pub uptime_secs: u64,
    pub instruments: Vec<InstrumentMarketData>,
    pub portfolio: PortfolioSnapshot,
    pub recent_errors: Vec<ErrorRecord>,
}

/// Per-instrument market data on the state surface.
#[derive(Debug, Clone, Serialize)]
pub struct InstrumentMarketData {
    pub instrument: Instrument,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<TickSnapshot>,
    pub series: Vec<f64>,
    pub rsi: f64,
    pub rsi_signal: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_idr: Option<f64>,
}

/// Simulated portfolio summary.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioSnapshot {
    pub balance_idr: f64,
    pub net_worth_idr: f64,
    pub pnl_idr: f64,
    pub pnl_pct: f64,
    pub holdings: Vec<HoldingSnapshot>,
    pub recent_trades: Vec<TradeRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HoldingSnapshot {
    pub stream_key: String,
    pub quantity: f64,
    pub value_idr: f64,
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::Tick;

    fn test_state() -> AppState {
        let config = RuntimeConfig {
            watchlist: vec![
                Instrument::new("bitcoin", "btcusdt", "Bitcoin", "BTC"),
                Instrument::new("ethereum", "ethusdt", "Ethereum", "ETH"),
            ],
            ..RuntimeConfig::default()
        };
        AppState::new(config, CoinGeckoClient::default())
    }

    #[test]
    fn new_state_precreates_store_entries() {
        let state = test_state();
        assert!(state.store.contains("btcusdt"));
        assert!(state.store.contains("ethusdt"));
        assert!(!state.store.contains("dogeusdt"));
    }

    #[test]
    fn snapshot_reflects_applied_ticks() {
        let state = test_state();
        state.store.apply_tick(
            "btcusdt",
            Tick {
                price: 40_000.0,
                change_pct: 2.0,
                high_24h: 41_000.0,
                low_24h: 39_000.0,
            },
        );

        let snap = state.build_snapshot();
        assert_eq!(snap.instruments.len(), 2);
        assert_eq!(snap.connection, ConnectionState::Disconnected);
        assert!(!snap.seeding);

        let btc = snap
            .instruments
            .iter()
            .find(|i| i.instrument.stream_key == "btcusdt")
            .unwrap();
        assert_eq!(btc.series, vec![40_000.0]);
        assert!((btc.snapshot.unwrap().price - 40_000.0).abs() < f64::EPSILON);
        // Not enough history yet: neutral RSI.
        assert!((btc.rsi - 50.0).abs() < f64::EPSILON);
        assert_eq!(btc.rsi_signal, "NEUTRAL");
        assert!((btc.price_idr.unwrap() - 40_000.0 * 16_000.0).abs() < 1.0);
    }

    #[test]
    fn price_idr_unknown_without_snapshot() {
        let state = test_state();
        assert!(state.price_idr("btcusdt").is_none());
        assert!(state.price_idr("unwatched").is_none());
    }

    #[test]
    fn error_ring_is_bounded() {
        let state = test_state();
        for i in 0..60 {
            state.push_error(format!("boom {i}"));
        }
        let errors = state.recent_errors.read();
        assert_eq!(errors.len(), 50);
        assert_eq!(errors[0].message, "boom 10");
    }

    #[test]
    fn portfolio_snapshot_tracks_net_worth() {
        let state = test_state();
        state.store.apply_tick(
            "btcusdt",
            Tick {
                price: 10.0,
                change_pct: 0.0,
                high_24h: 0.0,
                low_24h: 0.0,
            },
        );
        let price_idr = state.price_idr("btcusdt").unwrap();
        state
            .portfolio
            .write()
            .buy("btcusdt", 1_000_000.0, price_idr)
            .unwrap();

        let snap = state.build_snapshot();
        // Buying at the current price leaves net worth unchanged.
        assert!((snap.portfolio.net_worth_idr - 100_000_000.0).abs() < 1e-6);
        assert_eq!(snap.portfolio.holdings.len(), 1);
        assert_eq!(snap.portfolio.recent_trades.len(), 1);
    }
}
