// =============================================================================
// Relative Strength Index (RSI) — simple-average variant
// =============================================================================
//
// RSI measures the speed and magnitude of recent price changes to evaluate
// whether an asset is overbought or oversold.
//
// Step 1 — Take the last `period` consecutive deltas of the sequence.
// Step 2 — Sum positive deltas into gains, absolute negative deltas into
//          losses, and average each over `period`.
// Step 3 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
//
// Thresholds:  RSI > 70 => OVERBOUGHT,  RSI < 30 => OVERSOLD.
// =============================================================================

/// Lookback period used everywhere in the engine.
pub const DEFAULT_RSI_PERIOD: usize = 14;

/// Compute the RSI of `prices` over the final `period` deltas.
///
/// Stateless — called synchronously after every history mutation for the
/// affected instrument only.
///
/// # Edge cases
/// - Fewer than `period + 1` samples => 50.0 (neutral, not an error).
/// - No losses in the lookback window => 100.0 (avoids division by zero).
pub fn rsi(prices: &[f64], period: usize) -> f64 {
    if period == 0 || prices.len() < period + 1 {
        return 50.0;
    }

    let mut gains = 0.0_f64;
    let mut losses = 0.0_f64;
    for i in prices.len() - period..prices.len() {
        let diff = prices[i] - prices[i - 1];
        if diff >= 0.0 {
            gains += diff;
        } else {
            losses -= diff;
        }
    }

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;

    if avg_loss == 0.0 {
        return 100.0;
    }

    let rs = avg_gain / avg_loss;
    100.0 - 100.0 / (1.0 + rs)
}

/// Human-readable label for an RSI value.
pub fn rsi_label(value: f64) -> &'static str {
    if value > 70.0 {
        "OVERBOUGHT"
    } else if value < 30.0 {
        "OVERSOLD"
    } else {
        "NEUTRAL"
    }
}
