pub mod cache;
pub mod stream;

pub use cache::MarketFeedCaches;
pub use stream::{run_market_feed, MarketFeedEvent, MAX_RECONNECT_ATTEMPTS};
