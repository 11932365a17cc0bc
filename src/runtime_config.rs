// =============================================================================
// Runtime Configuration — engine settings with atomic save
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry serde defaults so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::indicators::DEFAULT_RSI_PERIOD;
use crate::portfolio::STARTING_BALANCE_IDR;
use crate::types::Instrument;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_watchlist() -> Vec<Instrument> {
    vec![
        Instrument::new("bitcoin", "btcusdt", "Bitcoin", "BTC"),
        Instrument::new("ethereum", "ethusdt", "Ethereum", "ETH"),
        Instrument::new("solana", "solusdt", "Solana", "SOL"),
        Instrument::new("binancecoin", "bnbusdt", "Binance", "BNB"),
    ]
}

fn default_history_capacity() -> usize {
    50
}

fn default_rsi_period() -> usize {
    DEFAULT_RSI_PERIOD
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_bind_addr() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_starting_balance_idr() -> f64 {
    STARTING_BALANCE_IDR
}

fn default_usd_idr_rate() -> f64 {
    16_000.0
}

// =============================================================================
// Environment overrides
// =============================================================================

/// Parse a `NEXUS_WATCHLIST` override: comma-separated `id:stream_key`
/// entries, e.g. `bitcoin:btcusdt,dogecoin:dogeusdt`. Entries without a
/// colon or with an empty side are skipped.
pub fn parse_watchlist_override(raw: &str) -> Vec<Instrument> {
    raw.split(',')
        .filter_map(|entry| {
            let (id, key) = entry.split_once(':')?;
            let id = id.trim().to_lowercase();
            let key = key.trim().to_lowercase();
            if id.is_empty() || key.is_empty() {
                return None;
            }
            let short = key.strip_suffix("usdt").unwrap_or(&key).to_uppercase();
            Some(Instrument::new(id.clone(), key, id, short))
        })
        .collect()
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Nexus engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Instruments tracked at startup.
    #[serde(default = "default_watchlist")]
    pub watchlist: Vec<Instrument>,

    /// Rolling price-history window size per instrument.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// RSI lookback period.
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,

    /// Delay between a transport fault and the next connection attempt.
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,

    /// Address the REST API binds to.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Simulated starting cash balance (IDR).
    #[serde(default = "default_starting_balance_idr")]
    pub starting_balance_idr: f64,

    /// Fallback USD→IDR rate used until the live rate is fetched.
    #[serde(default = "default_usd_idr_rate")]
    pub usd_idr_rate: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            watchlist: default_watchlist(),
            history_capacity: default_history_capacity(),
            rsi_period: default_rsi_period(),
            reconnect_delay_secs: default_reconnect_delay_secs(),
            bind_addr: default_bind_addr(),
            starting_balance_idr: default_starting_balance_idr(),
            usd_idr_rate: default_usd_idr_rate(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            instruments = config.watchlist.len(),
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}
