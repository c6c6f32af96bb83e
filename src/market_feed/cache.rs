// =============================================================================
// Market Feed caches — per-symbol state fed by the combined venue stream
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::{BookTicker, Symbol};

const PRICE_HISTORY_MAX_AGE_SECONDS: i64 = 300;
const VOLUME_WINDOW_MAX_SAMPLES: usize = 1000;
/// §4.1: a book with no update for longer than this is stale; spread checks
/// must fail safe rather than trade on a frozen book.
const STALE_BOOK_SECONDS: i64 = 2;

#[derive(Debug, Clone, Copy)]
pub struct PricePoint {
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct VolumeSample {
    pub notional: f64,
    pub timestamp: DateTime<Utc>,
}

/// All Market Feed state for one symbol. Writer = feed reader task; readers
/// = Strategy Core, through the shared `RwLock`s (spec §5 permits either
/// message-passing or lock-free concurrent maps as long as readers see a
/// consistent per-symbol tuple; this crate takes the simpler `RwLock` route,
/// matching the teacher's own choice).
pub struct SymbolCache {
    last_trade_price: RwLock<Option<f64>>,
    last_book: RwLock<Option<BookTicker>>,
    price_history: RwLock<Vec<PricePoint>>,
    volume_window: RwLock<Vec<VolumeSample>>,
    trade_count: AtomicU64,
}

impl SymbolCache {
    pub(crate) fn new() -> Self {
        Self {
            last_trade_price: RwLock::new(None),
            last_book: RwLock::new(None),
            price_history: RwLock::new(Vec::new()),
            volume_window: RwLock::new(Vec::new()),
            trade_count: AtomicU64::new(0),
        }
    }

    pub fn update_book(&self, ticker: BookTicker) {
        *self.last_book.write() = Some(ticker);
    }

    /// §4.1: append to price-history (evict entries older than 5 min) and
    /// the volume window (evict beyond 1000 samples); update last price.
    pub fn record_trade(&self, price: f64, notional: f64, timestamp: DateTime<Utc>) {
        *self.last_trade_price.write() = Some(price);
        self.trade_count.fetch_add(1, Ordering::Relaxed);

        {
            let mut history = self.price_history.write();
            history.push(PricePoint { price, timestamp });
            let cutoff = timestamp - chrono::Duration::seconds(PRICE_HISTORY_MAX_AGE_SECONDS);
            history.retain(|p| p.timestamp >= cutoff);
        }

        {
            let mut window = self.volume_window.write();
            window.push(VolumeSample { notional, timestamp });
            while window.len() > VOLUME_WINDOW_MAX_SAMPLES {
                window.remove(0);
            }
        }
    }

    pub fn last_trade_price(&self) -> Option<f64> {
        *self.last_trade_price.read()
    }

    /// Book ticker, or `None` if stale (§4.1: no update for > 2s forces the
    /// spread check to fail safe via the caller treating `None` as +inf).
    pub fn book(&self, now: DateTime<Utc>) -> Option<BookTicker> {
        let book = *self.last_book.read();
        book.filter(|b| (now - b.timestamp).num_seconds() <= STALE_BOOK_SECONDS)
    }

    pub fn price_history_snapshot(&self) -> Vec<PricePoint> {
        self.price_history.read().clone()
    }

    pub fn volume_window_snapshot(&self) -> Vec<VolumeSample> {
        self.volume_window.read().clone()
    }

    pub fn trade_count(&self) -> u64 {
        self.trade_count.load(Ordering::Relaxed)
    }
}

/// Owns one [`SymbolCache`] per configured symbol.
pub struct MarketFeedCaches {
    caches: HashMap<Symbol, SymbolCache>,
}

impl MarketFeedCaches {
    pub fn new(symbols: &[Symbol]) -> Self {
        let caches = symbols
            .iter()
            .map(|s| (s.clone(), SymbolCache::new()))
            .collect();
        Self { caches }
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolCache> {
        self.caches.get(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.caches.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn price_history_evicts_entries_older_than_five_minutes() {
        let cache = SymbolCache::new();
        let t0 = now() - Duration::seconds(400);
        cache.record_trade(100.0, 1000.0, t0);
        cache.record_trade(101.0, 1000.0, now());
        assert_eq!(cache.price_history_snapshot().len(), 1);
    }

    #[test]
    fn volume_window_caps_at_1000_samples() {
        let cache = SymbolCache::new();
        for i in 0..1005 {
            cache.record_trade(100.0 + i as f64, 10.0, now());
        }
        assert_eq!(cache.volume_window_snapshot().len(), 1000);
    }

    #[test]
    fn stale_book_returns_none() {
        let cache = SymbolCache::new();
        cache.update_book(BookTicker {
            bid_price: 100.0,
            bid_qty: 1.0,
            ask_price: 100.1,
            ask_qty: 1.0,
            timestamp: now() - Duration::seconds(5),
        });
        assert!(cache.book(now()).is_none());
    }

    #[test]
    fn fresh_book_is_returned() {
        let cache = SymbolCache::new();
        cache.update_book(BookTicker {
            bid_price: 100.0,
            bid_qty: 1.0,
            ask_price: 100.1,
            ask_qty: 1.0,
            timestamp: now(),
        });
        assert!(cache.book(now()).is_some());
    }
}
