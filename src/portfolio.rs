// =============================================================================
// Paper Portfolio — simulated cash balance and holdings
// =============================================================================
//
// Pure arithmetic balance mutation: no orders ever reach an exchange. Invalid
// input is rejected synchronously with no state change — a rejection is a
// domain answer, not an error channel.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Starting simulated cash balance in IDR.
pub const STARTING_BALANCE_IDR: f64 = 100_000_000.0;

/// Maximum number of trade records retained.
const MAX_TRADE_RECORDS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// One executed simulated trade.
#[derive(Debug, Clone, Serialize)]
pub struct TradeRecord {
    pub id: String,
    pub side: TradeSide,
    pub stream_key: String,
    /// IDR value of the trade.
    pub amount_idr: f64,
    /// Quantity of the asset bought or sold.
    pub quantity: f64,
    /// IDR price per unit at execution time.
    pub price_idr: f64,
    pub at: DateTime<Utc>,
}

/// Why a trade request was refused. The portfolio is left untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TradeRejection {
    NonPositiveAmount,
    UnknownPrice,
    InsufficientBalance { requested: f64, available: f64 },
    InsufficientHolding { requested: f64, available: f64 },
}

impl std::fmt::Display for TradeRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonPositiveAmount => write!(f, "amount must be positive"),
            Self::UnknownPrice => write!(f, "no current price for instrument"),
            Self::InsufficientBalance { requested, available } => write!(
                f,
                "insufficient balance: requested {requested:.0} IDR, available {available:.0} IDR"
            ),
            Self::InsufficientHolding { requested, available } => write!(
                f,
                "insufficient holding: requested {requested}, available {available}"
            ),
        }
    }
}

/// Simulated portfolio: IDR cash plus per-instrument holdings.
#[derive(Debug, Clone)]
pub struct Portfolio {
    balance_idr: f64,
    holdings: HashMap<String, f64>,
    trades: Vec<TradeRecord>,
}

impl Default for Portfolio {
    fn default() -> Self {
        Self::new(STARTING_BALANCE_IDR)
    }
}

impl Portfolio {
    pub fn new(starting_balance_idr: f64) -> Self {
        Self {
            balance_idr: starting_balance_idr,
            holdings: HashMap::new(),
            trades: Vec::new(),
        }
    }

    pub fn balance_idr(&self) -> f64 {
        self.balance_idr
    }

    pub fn holding(&self, stream_key: &str) -> f64 {
        self.holdings.get(stream_key).copied().unwrap_or(0.0)
    }

    /// Non-zero holdings, for the portfolio summary.
    pub fn holdings(&self) -> impl Iterator<Item = (&str, f64)> {
        self.holdings
            .iter()
            .filter(|(_, qty)| **qty > 0.0)
            .map(|(k, qty)| (k.as_str(), *qty))
    }

    pub fn recent_trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    /// Spend `amount_idr` of cash on the instrument at `price_idr` per unit.
    pub fn buy(
        &mut self,
        stream_key: &str,
        amount_idr: f64,
        price_idr: f64,
    ) -> Result<TradeRecord, TradeRejection> {
        if amount_idr <= 0.0 {
            return Err(TradeRejection::NonPositiveAmount);
        }
        if price_idr <= 0.0 {
            return Err(TradeRejection::UnknownPrice);
        }
        if amount_idr > self.balance_idr {
            return Err(TradeRejection::InsufficientBalance {
                requested: amount_idr,
                available: self.balance_idr,
            });
        }

        let quantity = amount_idr / price_idr;
        self.balance_idr -= amount_idr;
        *self.holdings.entry(stream_key.to_string()).or_insert(0.0) += quantity;

        Ok(self.record(TradeSide::Buy, stream_key, amount_idr, quantity, price_idr))
    }

    /// Sell `quantity` units of the instrument at `price_idr` per unit.
    pub fn sell(
        &mut self,
        stream_key: &str,
        quantity: f64,
        price_idr: f64,
    ) -> Result<TradeRecord, TradeRejection> {
        if quantity <= 0.0 {
            return Err(TradeRejection::NonPositiveAmount);
        }
        if price_idr <= 0.0 {
            return Err(TradeRejection::UnknownPrice);
        }
        let held = self.holding(stream_key);
        if quantity > held {
            return Err(TradeRejection::InsufficientHolding {
                requested: quantity,
                available: held,
            });
        }

        let amount_idr = quantity * price_idr;
        self.balance_idr += amount_idr;
        *self.holdings.entry(stream_key.to_string()).or_insert(0.0) -= quantity;

        Ok(self.record(TradeSide::Sell, stream_key, amount_idr, quantity, price_idr))
    }

    /// Cash plus the IDR value of all holdings at the given prices. Holdings
    /// without a known price contribute nothing.
    pub fn net_worth_idr(&self, price_idr_of: impl Fn(&str) -> Option<f64>) -> f64 {
        let holdings_value: f64 = self
            .holdings
            .iter()
            .map(|(key, qty)| qty * price_idr_of(key).unwrap_or(0.0))
            .sum();
        self.balance_idr + holdings_value
    }

    fn record(
        &mut self,
        side: TradeSide,
        stream_key: &str,
        amount_idr: f64,
        quantity: f64,
        price_idr: f64,
    ) -> TradeRecord {
        let rec = TradeRecord {
            id: Uuid::new_v4().to_string(),
            side,
            stream_key: stream_key.to_string(),
            amount_idr,
            quantity,
            price_idr,
            at: Utc::now(),
        };
        self.trades.push(rec.clone());
        while self.trades.len() > MAX_TRADE_RECORDS {
            self.trades.remove(0);
        }
        rec
    }
}
