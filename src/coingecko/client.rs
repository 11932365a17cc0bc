// =============================================================================
// CoinGecko REST API Client — historical seed fetch + symbol lookup
// =============================================================================
//
// All endpoints used here are public (no signing). The client is a plain I/O
// wrapper: it performs one request per call and reports failures through
// anyhow so callers can decide whether to degrade (seed-fetch faults leave
// the instrument with neutral state rather than aborting the add).
// =============================================================================

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::market_data::store::TickSnapshot;
use crate::types::Instrument;

/// Maximum number of candidates returned by a symbol search.
const MAX_SEARCH_RESULTS: usize = 5;

/// Per-instrument seed data from the markets endpoint: the latest snapshot
/// plus a recent price series (most-recent last) used verbatim as the seeded
/// rolling history.
#[derive(Debug, Clone)]
pub struct MarketSeed {
    pub id: String,
    pub snapshot: TickSnapshot,
    pub prices: Vec<f64>,
}

/// CoinGecko REST API client.
#[derive(Debug, Clone)]
pub struct CoinGeckoClient {
    base_url: String,
    client: reqwest::Client,
}

impl Default for CoinGeckoClient {
    fn default() -> Self {
        Self::new("https://api.coingecko.com/api/v3")
    }
}

impl CoinGeckoClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Historical seed fetch
    // -------------------------------------------------------------------------

    /// GET /coins/markets — current price, 24h change/high/low and the 7-day
    /// sparkline series for each requested instrument id.
    #[instrument(skip(self, instruments), name = "coingecko::seed_markets")]
    pub async fn seed_markets(&self, instruments: &[Instrument]) -> Result<Vec<MarketSeed>> {
        let ids: Vec<&str> = instruments.iter().map(|c| c.id.as_str()).collect();
        let url = format!(
            "{}/coins/markets?vs_currency=usd&ids={}&sparkline=true",
            self.base_url,
            ids.join(",")
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /coins/markets request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse markets response")?;

        if !status.is_success() {
            anyhow::bail!("CoinGecko GET /coins/markets returned {}: {}", status, body);
        }

        let seeds = parse_markets_response(&body)?;
        debug!(requested = instruments.len(), seeded = seeds.len(), "market seeds fetched");
        Ok(seeds)
    }

    // -------------------------------------------------------------------------
    // Symbol lookup
    // -------------------------------------------------------------------------

    /// GET /search — resolve a free-text query into candidate instruments.
    ///
    /// The stream key is derived from the short code (`<symbol>usdt`,
    /// lower-cased), matching the Binance combined-stream convention.
    #[instrument(skip(self), name = "coingecko::search")]
    pub async fn search(&self, query: &str) -> Result<Vec<Instrument>> {
        let resp = self
            .search_request(query)
            .send()
            .await
            .context("GET /search request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse search response")?;

        if !status.is_success() {
            anyhow::bail!("CoinGecko GET /search returned {}: {}", status, body);
        }

        let candidates = parse_search_response(&body);
        debug!(query, count = candidates.len(), "symbol lookup complete");
        Ok(candidates)
    }

    /// The query goes through reqwest's form encoding so free text with
    /// spaces or `&` stays a single parameter.
    fn search_request(&self, query: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}/search", self.base_url))
            .query(&[("query", query)])
    }

    // -------------------------------------------------------------------------
    // FX rate
    // -------------------------------------------------------------------------

    /// GET /simple/price — USD→IDR conversion rate via the tether peg.
    #[instrument(skip(self), name = "coingecko::usd_idr_rate")]
    pub async fn usd_idr_rate(&self) -> Result<f64> {
        let url = format!(
            "{}/simple/price?ids=tether&vs_currencies=idr",
            self.base_url
        );

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /simple/price request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse price response")?;

        if !status.is_success() {
            anyhow::bail!("CoinGecko GET /simple/price returned {}: {}", status, body);
        }

        body["tether"]["idr"]
            .as_f64()
            .context("missing tether.idr rate in response")
    }
}

// -----------------------------------------------------------------------------
// Response parsing (pure, unit-tested)
// -----------------------------------------------------------------------------

fn parse_markets_response(body: &serde_json::Value) -> Result<Vec<MarketSeed>> {
    let entries = body.as_array().context("markets response is not an array")?;

    let mut seeds = Vec::with_capacity(entries.len());
    for entry in entries {
        let Some(id) = entry["id"].as_str() else {
            warn!("skipping market entry without id");
            continue;
        };

        let snapshot = TickSnapshot {
            price: entry["current_price"].as_f64().unwrap_or(0.0),
            change_pct: entry["price_change_percentage_24h"].as_f64().unwrap_or(0.0),
            high_24h: entry["high_24h"].as_f64().unwrap_or(0.0),
            low_24h: entry["low_24h"].as_f64().unwrap_or(0.0),
        };

        let prices: Vec<f64> = entry["sparkline_in_7d"]["price"]
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.as_f64()).collect())
            .unwrap_or_default();

        seeds.push(MarketSeed {
            id: id.to_string(),
            snapshot,
            prices,
        });
    }

    Ok(seeds)
}

fn parse_search_response(body: &serde_json::Value) -> Vec<Instrument> {
    let Some(coins) = body["coins"].as_array() else {
        return Vec::new();
    };

    coins
        .iter()
        .take(MAX_SEARCH_RESULTS)
        .filter_map(|c| {
            let id = c["id"].as_str()?;
            let symbol = c["symbol"].as_str()?;
            let name = c["name"].as_str().unwrap_or(id);
            Some(Instrument {
                id: id.to_string(),
                stream_key: format!("{}usdt", symbol.to_lowercase()),
                name: name.to_string(),
                short: symbol.to_uppercase(),
                rank: c["market_cap_rank"].as_u64().map(|r| r as u32),
            })
        })
        .collect()
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_markets_extracts_snapshot_and_sparkline() {
        let body = serde_json::json!([
            {
                "id": "bitcoin",
                "current_price": 37000.5,
                "price_change_percentage_24h": -1.2,
                "high_24h": 38000.0,
                "low_24h": 36500.0,
                "sparkline_in_7d": { "price": [1.0, 2.0, 3.0] }
            }
        ]);
        let seeds = parse_markets_response(&body).unwrap();
        assert_eq!(seeds.len(), 1);
        let seed = &seeds[0];
        assert_eq!(seed.id, "bitcoin");
        assert!((seed.snapshot.price - 37000.5).abs() < f64::EPSILON);
        assert!((seed.snapshot.change_pct + 1.2).abs() < f64::EPSILON);
        assert_eq!(seed.prices, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn parse_markets_tolerates_missing_fields() {
        let body = serde_json::json!([
            { "id": "mystery-coin" },
            { "current_price": 1.0 }
        ]);
        let seeds = parse_markets_response(&body).unwrap();
        // Entry without an id is skipped, not fatal.
        assert_eq!(seeds.len(), 1);
        assert_eq!(seeds[0].id, "mystery-coin");
        assert!(seeds[0].prices.is_empty());
        assert!((seeds[0].snapshot.price).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_markets_rejects_non_array() {
        let body = serde_json::json!({ "error": "rate limited" });
        assert!(parse_markets_response(&body).is_err());
    }

    #[test]
    fn parse_search_builds_stream_keys() {
        let body = serde_json::json!({
            "coins": [
                { "id": "solana", "symbol": "SOL", "name": "Solana", "market_cap_rank": 5 },
                { "id": "dogecoin", "symbol": "doge", "name": "Dogecoin" }
            ]
        });
        let found = parse_search_response(&body);
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, "solana");
        assert_eq!(found[0].stream_key, "solusdt");
        assert_eq!(found[0].short, "SOL");
        assert_eq!(found[0].rank, Some(5));
        assert_eq!(found[1].stream_key, "dogeusdt");
        assert_eq!(found[1].rank, None);
    }

    #[test]
    fn parse_search_caps_result_count() {
        let coins: Vec<serde_json::Value> = (0..10)
            .map(|i| serde_json::json!({ "id": format!("coin-{i}"), "symbol": format!("c{i}"), "name": "Coin" }))
            .collect();
        let body = serde_json::json!({ "coins": coins });
        assert_eq!(parse_search_response(&body).len(), MAX_SEARCH_RESULTS);
    }

    #[test]
    fn parse_search_empty_body_is_empty() {
        assert!(parse_search_response(&serde_json::json!({})).is_empty());
    }

    #[test]
    fn search_request_encodes_free_text_query() {
        let client = CoinGeckoClient::new("http://127.0.0.1:9");
        let req = client.search_request("doge coin&wif=1").build().unwrap();
        let q = req.url().query().unwrap();
        // A raw space or `&` would split the query into extra parameters.
        assert!(!q.contains(' '));
        assert!(q.contains("%26"));
        assert_eq!(req.url().path(), "/search");
    }
}
