use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::indicators::rsi;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// One decoded inbound price update for a single instrument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub price: f64,
    pub change_pct: f64,
    pub high_24h: f64,
    pub low_24h: f64,
}

/// Latest per-instrument market snapshot. Overwritten wholesale on every new
/// tick or seed fetch — never partially merged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TickSnapshot {
    pub price: f64,
    pub change_pct: f64,
    pub high_24h: f64,
    pub low_24h: f64,
}

impl From<Tick> for TickSnapshot {
    fn from(t: Tick) -> Self {
        Self {
            price: t.price,
            change_pct: t.change_pct,
            high_24h: t.high_24h,
            low_24h: t.low_24h,
        }
    }
}

/// Everything the store holds for one instrument. The RSI is cached alongside
/// the history and refreshed inside the same write-lock scope as every
/// mutation, so readers never observe a history update without its matching
/// indicator update.
#[derive(Debug, Clone)]
struct SymbolState {
    history: VecDeque<f64>,
    snapshot: TickSnapshot,
    rsi: f64,
}

impl SymbolState {
    fn empty() -> Self {
        Self {
            history: VecDeque::new(),
            snapshot: TickSnapshot::default(),
            rsi: 50.0,
        }
    }
}

// ---------------------------------------------------------------------------
// MarketStore — bounded rolling history + snapshot + cached RSI per key
// ---------------------------------------------------------------------------

/// Thread-safe store of rolling price history, latest tick snapshot and
/// cached RSI per stream key.
///
/// Each history is a FIFO window of at most `capacity` samples, oldest first;
/// once at capacity every append evicts exactly the oldest sample. The store
/// is the single owner of this state — only the stream manager's tick handler
/// and the watchlist seeding routine mutate it.
pub struct MarketStore {
    symbols: RwLock<HashMap<String, SymbolState>>,
    capacity: usize,
    rsi_period: usize,
}

impl MarketStore {
    /// Create a store retaining at most `capacity` price samples per key.
    pub fn new(capacity: usize, rsi_period: usize) -> Self {
        Self {
            symbols: RwLock::new(HashMap::new()),
            capacity,
            rsi_period,
        }
    }

    /// Create an empty entry for `key` if none exists yet. Used by the
    /// add-instrument path so a stray early tick has somewhere safe to land.
    pub fn ensure_entry(&self, key: &str) {
        let mut map = self.symbols.write();
        map.entry(key.to_string()).or_insert_with(SymbolState::empty);
    }

    /// Whether the store tracks `key` at all.
    pub fn contains(&self, key: &str) -> bool {
        self.symbols.read().contains_key(key)
    }

    /// Apply a live tick: overwrite the snapshot, append the price to the
    /// bounded history and recompute the RSI for this key only.
    ///
    /// Returns `false` (and mutates nothing) when `key` is unknown — ticks
    /// for instruments outside the watchlist are dropped by the caller.
    pub fn apply_tick(&self, key: &str, tick: Tick) -> bool {
        let mut map = self.symbols.write();
        let Some(state) = map.get_mut(key) else {
            return false;
        };

        state.snapshot = tick.into();
        state.history.push_back(tick.price);
        while state.history.len() > self.capacity {
            state.history.pop_front();
        }
        state.rsi = rsi(state.history.make_contiguous(), self.rsi_period);
        true
    }

    /// Replace the entire history for `key` with a seeded sequence
    /// (most-recent last, truncated to capacity), set its snapshot and
    /// recompute the RSI.
    ///
    /// Any prior sequence is discarded outright — this is not an append. It
    /// is only called while the instrument has no live subscription yet.
    pub fn replace_seed(&self, key: &str, prices: &[f64], snapshot: TickSnapshot) {
        let start = prices.len().saturating_sub(self.capacity);
        let window = &prices[start..];

        let mut map = self.symbols.write();
        let state = map.entry(key.to_string()).or_insert_with(SymbolState::empty);
        state.history = window.iter().copied().collect();
        state.snapshot = snapshot;
        state.rsi = rsi(window, self.rsi_period);
    }

    /// Latest tick snapshot for `key`, if tracked.
    pub fn snapshot(&self, key: &str) -> Option<TickSnapshot> {
        self.symbols.read().get(key).map(|s| s.snapshot)
    }

    /// Current bounded price series for `key`, oldest first.
    pub fn series(&self, key: &str) -> Vec<f64> {
        self.symbols
            .read()
            .get(key)
            .map(|s| s.history.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Cached RSI for `key`, if tracked.
    pub fn rsi(&self, key: &str) -> Option<f64> {
        self.symbols.read().get(key).map(|s| s.rsi)
    }

    /// Number of price samples held for `key`.
    pub fn sample_count(&self, key: &str) -> usize {
        self.symbols.read().get(key).map_or(0, |s| s.history.len())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(price: f64) -> Tick {
        Tick {
            price,
            change_pct: 1.5,
            high_24h: price + 10.0,
            low_24h: price - 10.0,
        }
    }

    #[test]
    fn apply_tick_to_unknown_key_is_dropped() {
        let store = MarketStore::new(50, 14);
        assert!(!store.apply_tick("btcusdt", tick(100.0)));
        assert!(store.series("btcusdt").is_empty());
        assert!(store.snapshot("btcusdt").is_none());
    }

    #[test]
    fn first_tick_initialises_singleton_series() {
        let store = MarketStore::new(50, 14);
        store.ensure_entry("btcusdt");
        assert!(store.apply_tick("btcusdt", tick(100.0)));
        assert_eq!(store.series("btcusdt"), vec![100.0]);
    }

    #[test]
    fn fifo_window_never_exceeds_capacity() {
        let store = MarketStore::new(3, 14);
        store.ensure_entry("ethusdt");
        for i in 0..10 {
            store.apply_tick("ethusdt", tick(100.0 + i as f64));
        }
        // Oldest evicted first: only the final three survive.
        assert_eq!(store.series("ethusdt"), vec![107.0, 108.0, 109.0]);
        assert_eq!(store.sample_count("ethusdt"), 3);
    }

    #[test]
    fn snapshot_is_overwritten_wholesale() {
        let store = MarketStore::new(50, 14);
        store.ensure_entry("solusdt");
        store.apply_tick("solusdt", tick(20.0));
        store.apply_tick(
            "solusdt",
            Tick {
                price: 21.0,
                change_pct: -2.0,
                high_24h: 25.0,
                low_24h: 19.0,
            },
        );
        let snap = store.snapshot("solusdt").unwrap();
        assert!((snap.price - 21.0).abs() < f64::EPSILON);
        assert!((snap.change_pct + 2.0).abs() < f64::EPSILON);
        assert!((snap.high_24h - 25.0).abs() < f64::EPSILON);
        assert!((snap.low_24h - 19.0).abs() < f64::EPSILON);
    }

    #[test]
    fn replace_seed_discards_prior_history() {
        let store = MarketStore::new(50, 14);
        store.ensure_entry("btcusdt");
        store.apply_tick("btcusdt", tick(1.0));
        store.apply_tick("btcusdt", tick(2.0));

        store.replace_seed("btcusdt", &[10.0, 12.0, 11.0], TickSnapshot::default());
        assert_eq!(store.series("btcusdt"), vec![10.0, 12.0, 11.0]);
    }

    #[test]
    fn replace_seed_truncates_to_capacity_keeping_most_recent() {
        let store = MarketStore::new(4, 14);
        let prices: Vec<f64> = (1..=10).map(|x| x as f64).collect();
        store.replace_seed("btcusdt", &prices, TickSnapshot::default());
        assert_eq!(store.series("btcusdt"), vec![7.0, 8.0, 9.0, 10.0]);
    }

    #[test]
    fn seed_then_live_tick_extends_the_seeded_series() {
        // Add-instrument ordering: the first live tick must land on top of the
        // seeded baseline, never replace it.
        let store = MarketStore::new(50, 14);
        store.ensure_entry("newusdt");
        store.replace_seed("newusdt", &[10.0, 12.0, 11.0], TickSnapshot::default());
        store.apply_tick("newusdt", tick(13.0));
        assert_eq!(store.series("newusdt"), vec![10.0, 12.0, 11.0, 13.0]);
    }

    #[test]
    fn rsi_updates_atomically_with_history() {
        let store = MarketStore::new(50, 14);
        store.ensure_entry("btcusdt");

        // Too little data: neutral.
        for i in 0..10 {
            store.apply_tick("btcusdt", tick(100.0 + i as f64));
        }
        assert!((store.rsi("btcusdt").unwrap() - 50.0).abs() < f64::EPSILON);

        // Strictly rising past period+1 samples: 100.
        for i in 10..20 {
            store.apply_tick("btcusdt", tick(100.0 + i as f64));
        }
        assert!((store.rsi("btcusdt").unwrap() - 100.0).abs() < 1e-10);
    }

    #[test]
    fn rsi_of_seeded_history_matches_pure_function() {
        let store = MarketStore::new(50, 14);
        let prices: Vec<f64> = (0..16).map(|i| 100.0 + ((i * 7) % 5) as f64).collect();
        store.replace_seed("btcusdt", &prices, TickSnapshot::default());
        let expected = rsi(&prices, 14);
        assert!((store.rsi("btcusdt").unwrap() - expected).abs() < 1e-12);
    }

    #[test]
    fn mutating_one_key_leaves_others_untouched() {
        let store = MarketStore::new(50, 14);
        store.ensure_entry("a");
        store.ensure_entry("b");
        store.replace_seed("a", &[1.0, 2.0], TickSnapshot::default());

        store.apply_tick("b", tick(99.0));
        assert_eq!(store.series("a"), vec![1.0, 2.0]);
        assert_eq!(store.series("b"), vec![99.0]);
    }
}
