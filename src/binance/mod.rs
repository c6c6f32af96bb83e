pub mod client;
pub mod rate_limit;

pub use client::{BinanceClient, OrderFill, SymbolFilters, VenuePosition};
pub use rate_limit::RateLimitTracker;
