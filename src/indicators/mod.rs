pub mod rsi;

pub use rsi::{rsi, rsi_label, DEFAULT_RSI_PERIOD};
