// =============================================================================
// Stream Connection Manager — Binance combined ticker stream
// =============================================================================
//
// Owns the single multiplexed WebSocket subscription for the current
// watchlist. The manager is the failure boundary for the wire: every
// transport fault is absorbed here, surfaced only through the connection
// state flag, and followed by a scheduled reconnect. No fault may escape to
// the caller or terminate the process.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::market_data::store::{MarketStore, Tick};
use crate::types::{ConnectionState, Instrument};

const BINANCE_STREAM_BASE: &str = "wss://stream.binance.com:9443/stream?streams=";

/// Why the inner read loop ended.
enum LoopExit {
    /// The watchlist changed (or shutdown was requested): resubscribe
    /// immediately with the current instrument set.
    Resubscribe,
    /// Transport fault or unexpected close: reconnect after the fixed delay.
    Fault,
}

/// Manages the single streaming connection for the watched instrument set.
pub struct StreamManager {
    store: Arc<MarketStore>,
    /// The live instrument set. Reconnects always read this field at the time
    /// the reconnect fires, never a set captured at error time.
    watchlist: RwLock<Vec<Instrument>>,
    state: RwLock<ConnectionState>,
    /// Signalled when the subscription must be rebuilt (watchlist change or
    /// shutdown). The read loop closes the old socket before opening a new
    /// one, so two subscriptions never coexist.
    restart: Notify,
    shutting_down: AtomicBool,
    reconnect_delay: Duration,
    /// Combined-stream URL prefix the stream keys are appended to.
    stream_base: String,
}

impl StreamManager {
    pub fn new(
        store: Arc<MarketStore>,
        watchlist: Vec<Instrument>,
        reconnect_delay: Duration,
    ) -> Self {
        Self {
            store,
            watchlist: RwLock::new(watchlist),
            state: RwLock::new(ConnectionState::Disconnected),
            restart: Notify::new(),
            shutting_down: AtomicBool::new(false),
            reconnect_delay,
            stream_base: BINANCE_STREAM_BASE.to_string(),
        }
    }

    #[cfg(test)]
    fn with_stream_base(mut self, base: &str) -> Self {
        self.stream_base = base.to_string();
        self
    }

    // ── Observational state ─────────────────────────────────────────────

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_live(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    fn set_state(&self, next: ConnectionState) {
        *self.state.write() = next;
    }

    // ── Watchlist ───────────────────────────────────────────────────────

    pub fn watchlist(&self) -> Vec<Instrument> {
        self.watchlist.read().clone()
    }

    pub fn is_watched(&self, id: &str) -> bool {
        self.watchlist.read().iter().any(|c| c.id == id)
    }

    /// Enlarge the instrument set and rebuild the subscription.
    ///
    /// Callers must have finished seeding the instrument's history before
    /// calling this — the very next connection will start delivering live
    /// ticks for it.
    pub fn add_and_resubscribe(&self, instrument: Instrument) {
        {
            let mut list = self.watchlist.write();
            if list.iter().any(|c| c.id == instrument.id) {
                return;
            }
            info!(id = %instrument.id, stream_key = %instrument.stream_key, "instrument added to watchlist");
            list.push(instrument);
        }
        self.restart.notify_one();
    }

    /// Request the run loop to release the connection and return. The only
    /// path that terminates streaming for good (explicit user exit).
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.restart.notify_one();
    }

    // ── Connection lifecycle ────────────────────────────────────────────

    /// Run the connect / read / reconnect loop until shutdown.
    ///
    /// Never returns early on a transport fault: connect failures, mid-stream
    /// errors and unexpected closes all set the state flag to Disconnected
    /// and schedule a reconnect after the configured delay.
    pub async fn run(self: Arc<Self>) {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }

            let url = self.stream_url();
            self.set_state(ConnectionState::Connecting);
            info!(url = %url, "connecting to ticker WebSocket");

            // The dial itself can stall on a dead network, so it races the
            // restart signal: a watchlist change or shutdown mid-connect is
            // honoured immediately.
            let connected = tokio::select! {
                res = connect_async(&url) => res,
                _ = self.restart.notified() => {
                    self.set_state(ConnectionState::Disconnected);
                    continue;
                }
            };

            match connected {
                Ok((ws_stream, _response)) => {
                    self.set_state(ConnectionState::Connected);
                    info!(
                        instruments = self.watchlist.read().len(),
                        "ticker WebSocket connected"
                    );

                    let (_write, mut read) = ws_stream.split();
                    let exit = loop {
                        tokio::select! {
                            _ = self.restart.notified() => break LoopExit::Resubscribe,
                            msg = read.next() => match msg {
                                Some(Ok(Message::Text(text))) => self.handle_message(&text),
                                // Ping/Pong/Binary/Close frames — tungstenite
                                // replies to pings automatically.
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    error!(error = %e, "ticker WebSocket read error");
                                    break LoopExit::Fault;
                                }
                                None => {
                                    warn!("ticker WebSocket stream ended");
                                    break LoopExit::Fault;
                                }
                            }
                        }
                    };

                    // Dropping both halves closes this subscription before
                    // the outer loop opens the next one.
                    drop(read);
                    drop(_write);
                    self.set_state(ConnectionState::Disconnected);

                    if matches!(exit, LoopExit::Fault) {
                        self.wait_before_reconnect().await;
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to connect to ticker WebSocket");
                    self.set_state(ConnectionState::Disconnected);
                    self.wait_before_reconnect().await;
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("stream manager stopped");
    }

    /// Sleep for the reconnect delay, waking early on a restart signal so a
    /// watchlist change during the backoff is picked up immediately.
    async fn wait_before_reconnect(&self) {
        debug!(delay_s = self.reconnect_delay.as_secs(), "scheduling reconnect");
        tokio::select! {
            _ = tokio::time::sleep(self.reconnect_delay) => {}
            _ = self.restart.notified() => {}
        }
    }

    /// Combined-stream URL for the current watchlist.
    fn stream_url(&self) -> String {
        let keys: Vec<String> = self
            .watchlist
            .read()
            .iter()
            .map(|c| format!("{}@ticker", c.stream_key))
            .collect();
        format!("{}{}", self.stream_base, keys.join("/"))
    }

    // ── Message handling ────────────────────────────────────────────────

    /// Decode one inbound frame and apply it to the store.
    ///
    /// Malformed payloads and ticks for untracked keys are dropped without
    /// disturbing existing state; nothing thrown here may stall subsequent
    /// messages.
    fn handle_message(&self, text: &str) {
        match parse_ticker_message(text) {
            Ok((key, tick)) => {
                if self.store.apply_tick(&key, tick) {
                    debug!(key = %key, price = tick.price, "tick applied");
                } else {
                    debug!(key = %key, "tick for untracked instrument dropped");
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to parse ticker message");
            }
        }
    }
}

/// Parse a combined-stream ticker message.
///
/// Expected shape:
/// ```json
/// { "stream": "btcusdt@ticker", "data": { "c": "37000.1", "P": "1.25", "h": "37500.0", "l": "36000.0" } }
/// ```
/// The instrument key is the `stream` field with its `@ticker` suffix
/// stripped.
fn parse_ticker_message(text: &str) -> Result<(String, Tick)> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse ticker JSON")?;

    let stream = root["stream"].as_str().context("missing field stream")?;
    let key = stream.split('@').next().unwrap_or("");
    if key.is_empty() {
        anyhow::bail!("empty stream key in '{stream}'");
    }

    let data = &root["data"];
    let tick = Tick {
        price: parse_string_f64(&data["c"], "data.c")?,
        change_pct: parse_string_f64(&data["P"], "data.P")?,
        high_24h: parse_string_f64(&data["h"], "data.h")?,
        low_24h: parse_string_f64(&data["l"], "data.l")?,
    };

    Ok((key.to_string(), tick))
}

/// Helper: Binance sends numeric values as JSON strings inside ticker
/// payloads.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker_json(stream: &str, price: &str) -> String {
        format!(
            r#"{{ "stream": "{stream}", "data": {{ "c": "{price}", "P": "2.5", "h": "110.0", "l": "90.0" }} }}"#
        )
    }

    fn manager_with(keys: &[&str]) -> Arc<StreamManager> {
        let store = Arc::new(MarketStore::new(50, 14));
        let watchlist = keys
            .iter()
            .map(|k| Instrument::new(format!("{k}-id"), *k, k.to_uppercase(), k.to_uppercase()))
            .collect();
        for key in keys {
            store.ensure_entry(key);
        }
        Arc::new(StreamManager::new(store, watchlist, Duration::from_secs(5)))
    }

    #[test]
    fn parse_ticker_message_ok() {
        let (key, tick) = parse_ticker_message(&ticker_json("btcusdt@ticker", "37020.5")).unwrap();
        assert_eq!(key, "btcusdt");
        assert!((tick.price - 37020.5).abs() < f64::EPSILON);
        assert!((tick.change_pct - 2.5).abs() < f64::EPSILON);
        assert!((tick.high_24h - 110.0).abs() < f64::EPSILON);
        assert!((tick.low_24h - 90.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_ticker_missing_price_fails() {
        let json = r#"{ "stream": "btcusdt@ticker", "data": { "P": "2.5", "h": "1", "l": "1" } }"#;
        assert!(parse_ticker_message(json).is_err());
    }

    #[test]
    fn parse_ticker_missing_stream_fails() {
        let json = r#"{ "data": { "c": "1", "P": "1", "h": "1", "l": "1" } }"#;
        assert!(parse_ticker_message(json).is_err());
    }

    #[test]
    fn parse_ticker_garbage_fails() {
        assert!(parse_ticker_message("not json at all").is_err());
    }

    #[test]
    fn handle_message_applies_tick_to_store() {
        let mgr = manager_with(&["btcusdt"]);
        mgr.handle_message(&ticker_json("btcusdt@ticker", "100.0"));
        assert_eq!(mgr.store.series("btcusdt"), vec![100.0]);
    }

    #[test]
    fn handle_message_malformed_payload_leaves_state_unchanged() {
        let mgr = manager_with(&["btcusdt"]);
        mgr.handle_message(&ticker_json("btcusdt@ticker", "100.0"));
        let state_before = mgr.connection_state();

        // Missing data.c must not throw past the handler boundary.
        mgr.handle_message(r#"{ "stream": "btcusdt@ticker", "data": { "P": "1" } }"#);
        mgr.handle_message("{{{{");

        assert_eq!(mgr.store.series("btcusdt"), vec![100.0]);
        assert_eq!(mgr.connection_state(), state_before);

        // Subsequent messages still processed.
        mgr.handle_message(&ticker_json("btcusdt@ticker", "101.0"));
        assert_eq!(mgr.store.series("btcusdt"), vec![100.0, 101.0]);
    }

    #[test]
    fn handle_message_unknown_key_is_dropped() {
        let mgr = manager_with(&["btcusdt"]);
        mgr.handle_message(&ticker_json("dogeusdt@ticker", "0.1"));
        assert!(mgr.store.series("dogeusdt").is_empty());
    }

    #[test]
    fn stream_url_covers_all_watched_keys() {
        let mgr = manager_with(&["btcusdt", "ethusdt"]);
        let url = mgr.stream_url();
        assert!(url.starts_with(BINANCE_STREAM_BASE));
        assert!(url.contains("btcusdt@ticker"));
        assert!(url.contains("ethusdt@ticker"));
    }

    #[test]
    fn add_and_resubscribe_grows_the_set_once() {
        let mgr = manager_with(&["btcusdt"]);
        let new = Instrument::new("solana", "solusdt", "Solana", "SOL");
        mgr.add_and_resubscribe(new.clone());
        mgr.add_and_resubscribe(new);
        assert_eq!(mgr.watchlist().len(), 2);
        assert!(mgr.is_watched("solana"));
        assert!(mgr.stream_url().contains("solusdt@ticker"));
    }

    #[test]
    fn initial_state_is_disconnected() {
        let mgr = manager_with(&["btcusdt"]);
        assert_eq!(mgr.connection_state(), ConnectionState::Disconnected);
        assert!(!mgr.is_live());
    }

    #[tokio::test]
    async fn transport_fault_reconnects_to_connected() {
        use futures_util::SinkExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // First accepted connection is closed right after the handshake; the
        // second one stays open and delivers a single tick.
        tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            drop(tokio_tungstenite::accept_async(first).await.unwrap());

            let (second, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(second).await.unwrap();
            ws.send(Message::Text(ticker_json("btcusdt@ticker", "37000.0")))
                .await
                .unwrap();
            // Hold the connection open until the client goes away.
            while let Some(Ok(_)) = ws.next().await {}
        });

        let store = Arc::new(MarketStore::new(50, 14));
        store.ensure_entry("btcusdt");
        let mgr = Arc::new(
            StreamManager::new(
                store.clone(),
                vec![Instrument::new("bitcoin", "btcusdt", "Bitcoin", "BTC")],
                Duration::from_millis(10),
            )
            .with_stream_base(&format!("ws://{addr}/stream?streams=")),
        );

        let handle = tokio::spawn(mgr.clone().run());

        // The tick only exists on the second connection, so observing it in
        // the store proves the manager survived the dropped first connection
        // and subscribed again.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while store.series("btcusdt").is_empty() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "manager never reconnected after the transport fault"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.series("btcusdt"), vec![37000.0]);
        assert_eq!(mgr.connection_state(), ConnectionState::Connected);
        assert!(mgr.is_live());

        mgr.shutdown();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("run loop should stop after shutdown")
            .expect("run loop must not panic");
    }

    #[tokio::test]
    async fn run_releases_connection_flag_on_shutdown() {
        // Connecting to an unroutable endpoint keeps the loop cycling between
        // Connecting and Disconnected; shutdown must make it return with the
        // flag cleared and without panicking.
        let store = Arc::new(MarketStore::new(50, 14));
        let mgr = Arc::new(StreamManager::new(
            store,
            vec![Instrument::new("bitcoin", "btcusdt", "Bitcoin", "BTC")],
            Duration::from_millis(10),
        ));

        let handle = tokio::spawn(mgr.clone().run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        mgr.shutdown();

        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .expect("run loop should stop after shutdown")
            .expect("run loop must not panic");
        assert_eq!(mgr.connection_state(), ConnectionState::Disconnected);
    }
}
