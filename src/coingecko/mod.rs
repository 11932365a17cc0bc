pub mod client;

pub use client::{CoinGeckoClient, MarketSeed};
