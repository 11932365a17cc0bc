pub mod store;
pub mod stream;

pub use store::{MarketStore, Tick, TickSnapshot};
pub use stream::StreamManager;
