// =============================================================================
// Watchlist mutation — seed-then-subscribe ordering
// =============================================================================
//
// Adding an instrument while streaming is active must follow a strict order:
// the historical seed is fetched and applied BEFORE the connection is rebuilt
// with the enlarged instrument set. Live ticks for the new instrument can
// therefore never arrive into an empty buffer, and a seed can never overwrite
// prices that already streamed in.
// =============================================================================

use anyhow::Result;
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::coingecko::MarketSeed;
use crate::market_data::MarketStore;
use crate::types::Instrument;

/// Outcome of an add-instrument request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// The instrument was added; `seeded` is false when the seed fetch failed
    /// and the instrument starts with neutral/empty history.
    Added { seeded: bool },
    AlreadyWatched,
}

/// Add `candidate` to the watched set while streaming continues.
///
/// Steps, in order:
/// 1. Serialize behind the add guard — a concurrent add may not interleave
///    with this one's in-flight seed fetch.
/// 2. Initialise an empty history entry so any stray early tick lands safely.
/// 3. Fetch and apply the historical seed. A fetch failure degrades to
///    neutral state; it never aborts the add.
/// 4. Only then enlarge the instrument set and rebuild the subscription.
///
/// The seeding flag is cleared on every path so the caller never hangs
/// waiting for a seed that will not arrive.
pub async fn add_instrument(state: &AppState, candidate: Instrument) -> AddOutcome {
    let _guard = state.add_guard.lock().await;

    if state.stream.is_watched(&candidate.id) {
        return AddOutcome::AlreadyWatched;
    }

    *state.seeding.write() = true;
    state.store.ensure_entry(&candidate.stream_key);

    let seeded = match state
        .gecko
        .seed_markets(std::slice::from_ref(&candidate))
        .await
    {
        Ok(seeds) => {
            let applied = apply_seeds(&state.store, std::slice::from_ref(&candidate), &seeds);
            if applied == 0 {
                warn!(id = %candidate.id, "seed fetch returned no data for instrument");
            }
            applied > 0
        }
        Err(e) => {
            warn!(id = %candidate.id, error = %e, "seed fetch failed — continuing with neutral history");
            state.push_error(format!("seed fetch for {} failed: {e}", candidate.id));
            false
        }
    };

    // History is in place (seeded or neutral): safe to start streaming ticks
    // for the enlarged set.
    state.stream.add_and_resubscribe(candidate.clone());

    *state.seeding.write() = false;
    state.increment_version();
    info!(id = %candidate.id, seeded, "instrument add complete");

    AddOutcome::Added { seeded }
}

/// Seed every configured instrument and fetch the FX rate before the stream
/// manager is started. Faults degrade to neutral state with a warning — the
/// engine always comes up.
pub async fn seed_startup(state: &AppState) -> Result<()> {
    match state.gecko.usd_idr_rate().await {
        Ok(rate) => {
            *state.usd_idr_rate.write() = rate;
            info!(rate, "USD→IDR rate fetched");
        }
        Err(e) => {
            warn!(error = %e, "failed to fetch USD→IDR rate — using configured fallback");
        }
    }

    let watchlist = state.stream.watchlist();
    match state.gecko.seed_markets(&watchlist).await {
        Ok(seeds) => {
            let applied = apply_seeds(&state.store, &watchlist, &seeds);
            info!(
                seeded = applied,
                total = watchlist.len(),
                "initial watchlist seeded"
            );
        }
        Err(e) => {
            warn!(error = %e, "initial seed fetch failed — starting with empty histories");
            state.push_error(format!("initial seed fetch failed: {e}"));
        }
    }

    state.increment_version();
    Ok(())
}

/// Apply fetched seeds to the store, matching seeds to instruments by id.
/// Returns how many instruments were seeded.
fn apply_seeds(store: &MarketStore, instruments: &[Instrument], seeds: &[MarketSeed]) -> usize {
    let mut applied = 0;
    for seed in seeds {
        let Some(instrument) = instruments.iter().find(|c| c.id == seed.id) else {
            continue;
        };
        store.replace_seed(&instrument.stream_key, &seed.prices, seed.snapshot);
        applied += 1;
    }
    applied
}
