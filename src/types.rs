// =============================================================================
// Shared types used across the Nexus Trader engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// One tradable asset being tracked.
///
/// `id` is the stable CoinGecko identity (uniqueness is enforced on it);
/// `stream_key` is the lower-case symbol subscribed to on the Binance
/// combined stream (e.g. `btcusdt`). Both are immutable once the instrument
/// has been added to the watchlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub id: String,
    pub stream_key: String,
    pub name: String,
    pub short: String,
    /// Market-cap rank from the symbol lookup, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank: Option<u32>,
}

impl Instrument {
    pub fn new(
        id: impl Into<String>,
        stream_key: impl Into<String>,
        name: impl Into<String>,
        short: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            stream_key: stream_key.into(),
            name: name.into(),
            short: short.into(),
            rank: None,
        }
    }
}

/// Liveness of the single streaming connection.
///
/// Purely observational — it never gates tick processing. Every transport
/// fault loops back through Disconnected -> Connecting; there is no terminal
/// failure state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::Disconnected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}
