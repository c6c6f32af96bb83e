// =============================================================================
// Rolling Statistics — pure functions over the Market Feed caches, §4.2
// =============================================================================

use chrono::{DateTime, Duration, Utc};

use crate::market_feed::cache::SymbolCache;

/// Sentinel returned by `spread_bps` when the book is missing, per §4.2.
pub const SPREAD_BPS_SENTINEL: f64 = 999.0;

/// (bid + ask) / 2 from the latest book ticker; `None` if absent or stale.
pub fn mid(cache: &SymbolCache, now: DateTime<Utc>) -> Option<f64> {
    cache.book(now).map(|b| b.mid())
}

/// Spread in basis points; a large sentinel (>= 999) if the book is missing
/// or stale, so spread gates fail safe rather than trade blind.
pub fn spread_bps(cache: &SymbolCache, now: DateTime<Utc>) -> f64 {
    match cache.book(now) {
        Some(book) => book.spread_bps(),
        None => SPREAD_BPS_SENTINEL,
    }
}

/// Arithmetic mean of the entire volume window (per-trade notional).
pub fn avg_volume(cache: &SymbolCache) -> f64 {
    let samples = cache.volume_window_snapshot();
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().map(|s| s.notional).sum::<f64>() / samples.len() as f64
}

/// Mean of the last `min(len, seconds*10)` samples, per §4.2 (assumes a
/// roughly 10 trades/second arrival rate as the window-to-sample-count
/// conversion — the same constant the spec names literally).
pub fn recent_volume(cache: &SymbolCache, seconds: u32) -> f64 {
    let samples = cache.volume_window_snapshot();
    if samples.is_empty() {
        return 0.0;
    }
    let take = (seconds as usize * 10).min(samples.len());
    let start = samples.len() - take;
    let window = &samples[start..];
    window.iter().map(|s| s.notional).sum::<f64>() / window.len() as f64
}

/// ((current - oldest_in_window) / oldest_in_window) * 100, in percent.
/// Uses the earliest history entry within `seconds`; if none falls inside
/// the window, uses the earliest available entry overall.
pub fn price_delta(cache: &SymbolCache, now: DateTime<Utc>, seconds: u32) -> f64 {
    let history = cache.price_history_snapshot();
    let Some(current) = cache.last_trade_price() else {
        return 0.0;
    };
    if history.is_empty() {
        return 0.0;
    }

    let cutoff = now - Duration::seconds(seconds as i64);
    let oldest_in_window = history
        .iter()
        .find(|p| p.timestamp >= cutoff)
        .or_else(|| history.first());

    match oldest_in_window {
        Some(p) if p.price != 0.0 => (current - p.price) / p.price * 100.0,
        _ => 0.0,
    }
}

/// Count of direction reversals across four samples taken at `now`,
/// `now - 20s`, `now - 40s`, `now - 60s` (nearest entry within 10s of each
/// target), per §4.2. A reversal at index i is: sign(sample[i] -
/// sample[i-1]) differs from sign(sample[i-1] - sample[i-2]). Returns 0
/// when fewer than 3 samples are available.
///
/// This is the spec's own approximation of a true OHLC exhaustion candle
/// (see §9 open question); kept literal rather than refined.
pub fn exhaustion_candles(cache: &SymbolCache, now: DateTime<Utc>) -> u32 {
    let history = cache.price_history_snapshot();
    if history.is_empty() {
        return 0;
    }

    let offsets = [0i64, 20, 40, 60];
    let mut samples: Vec<f64> = Vec::new();
    for offset in offsets {
        let target = now - Duration::seconds(offset);
        let nearest = history
            .iter()
            .min_by_key(|p| (p.timestamp - target).num_seconds().abs());
        match nearest {
            Some(p) if (p.timestamp - target).num_seconds().abs() <= 10 => samples.push(p.price),
            _ => break,
        }
    }

    if samples.len() < 3 {
        return 0;
    }

    let mut reversals = 0;
    for i in 2..samples.len() {
        let prev_sign = (samples[i - 1] - samples[i - 2]).signum();
        let curr_sign = (samples[i] - samples[i - 1]).signum();
        if prev_sign != 0.0 && curr_sign != 0.0 && prev_sign != curr_sign {
            reversals += 1;
        }
    }
    reversals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BookTicker;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn mid_and_spread_absent_when_no_book() {
        let cache = SymbolCache::new();
        assert!(mid(&cache, now()).is_none());
        assert_eq!(spread_bps(&cache, now()), SPREAD_BPS_SENTINEL);
    }

    #[test]
    fn spread_bps_computed_from_fresh_book() {
        let cache = SymbolCache::new();
        cache.update_book(BookTicker {
            bid_price: 100.0,
            bid_qty: 1.0,
            ask_price: 100.02,
            ask_qty: 1.0,
            timestamp: now(),
        });
        let bps = spread_bps(&cache, now());
        assert!((bps - 2.0).abs() < 0.01);
    }

    #[test]
    fn avg_volume_zero_when_no_samples() {
        let cache = SymbolCache::new();
        assert_eq!(avg_volume(&cache), 0.0);
    }

    #[test]
    fn recent_volume_matches_avg_when_window_covers_all_samples() {
        let cache = SymbolCache::new();
        for _ in 0..5 {
            cache.record_trade(100.0, 1000.0, now());
        }
        assert!((recent_volume(&cache, 60) - avg_volume(&cache)).abs() < f64::EPSILON);
    }

    #[test]
    fn price_delta_zero_without_history() {
        let cache = SymbolCache::new();
        assert_eq!(price_delta(&cache, now(), 60), 0.0);
    }

    #[test]
    fn price_delta_nonzero_after_move() {
        let cache = SymbolCache::new();
        let t0 = now() - Duration::seconds(30);
        cache.record_trade(100.0, 10.0, t0);
        cache.record_trade(100.4, 10.0, now());
        let delta = price_delta(&cache, now(), 60);
        assert!((delta - 0.4).abs() < 0.01);
    }

    #[test]
    fn exhaustion_candles_zero_with_fewer_than_three_samples() {
        let cache = SymbolCache::new();
        cache.record_trade(100.0, 10.0, now());
        assert_eq!(exhaustion_candles(&cache, now()), 0);
    }

    #[test]
    fn exhaustion_candles_counts_direction_reversal() {
        let cache = SymbolCache::new();
        let t = now();
        cache.record_trade(100.0, 10.0, t - Duration::seconds(60));
        cache.record_trade(101.0, 10.0, t - Duration::seconds(40));
        cache.record_trade(100.5, 10.0, t - Duration::seconds(20));
        cache.record_trade(101.2, 10.0, t);
        assert!(exhaustion_candles(&cache, t) >= 1);
    }
}
