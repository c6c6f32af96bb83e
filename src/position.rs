// =============================================================================
// Position lifecycle — single Open Position slot + Trade Record, §3/§4.5
// =============================================================================

use chrono::{DateTime, Utc};

use crate::types::{ExitReason, OpenPosition, PositionSide, TradeRecord};

/// Result of evaluating exit conditions on a position-monitor tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitCheck {
    pub reason: ExitReason,
    pub pnl_pct: f64,
}

/// §4.5 "Position monitor": evaluated in this order, first match wins.
///   1. pnl_pct >= tp_pct -> TP
///   2. pnl_pct <= -sl_pct -> SL
///   3. (now - entry_time) >= time_stop_seconds -> TIME_STOP
pub fn evaluate_exit(
    position: &OpenPosition,
    current_price: f64,
    now: DateTime<Utc>,
    tp_pct: f64,
    sl_pct: f64,
    time_stop_seconds: u32,
) -> Option<ExitCheck> {
    let pnl_pct = position.pnl_pct(current_price);

    if pnl_pct >= tp_pct {
        return Some(ExitCheck { reason: ExitReason::Tp, pnl_pct });
    }
    if pnl_pct <= -sl_pct {
        return Some(ExitCheck { reason: ExitReason::Sl, pnl_pct });
    }
    let held_seconds = (now - position.entry_time).num_seconds();
    if held_seconds >= time_stop_seconds as i64 {
        return Some(ExitCheck { reason: ExitReason::TimeStop, pnl_pct });
    }
    None
}

/// §4.5 "Position sizing": computed once at entry, never updated.
pub fn size_position(equity_baseline: f64, risk_per_trade_pct: f64, entry_price_ref: f64, sl_pct: f64) -> f64 {
    let risk_amount = equity_baseline * risk_per_trade_pct;
    let sl_distance = entry_price_ref * sl_pct;
    if sl_distance <= 0.0 {
        return 0.0;
    }
    risk_amount / sl_distance
}

/// Closes a `TradeRecord` against an exit fill, computing realized PnL,
/// fees, and duration per §4.5's formulas.
pub fn close_trade_record(
    mut record: TradeRecord,
    side: PositionSide,
    entry_price: f64,
    quantity: f64,
    exit_price: f64,
    exit_reason: ExitReason,
    exit_ts: DateTime<Utc>,
    fee_rate_of_pnl: f64,
) -> TradeRecord {
    let raw_pct = (exit_price - entry_price) / entry_price;
    let pnl_pct = match side {
        PositionSide::Long => raw_pct,
        PositionSide::Short => -raw_pct,
    };
    let pnl_usdt_gross = entry_price * quantity * pnl_pct;
    let fees = pnl_usdt_gross.abs() * fee_rate_of_pnl;
    let pnl_usdt = pnl_usdt_gross - fees;
    // §8: duration = round((exit_ts - entry_ts) / 1s). num_seconds() truncates
    // toward zero, so round via milliseconds instead (150.9s -> 151, not 150).
    let duration_s = ((exit_ts - record.entry_ts).num_milliseconds() as f64 / 1000.0).round() as i64;

    record.exit_price = Some(exit_price);
    record.pnl_usdt = Some(pnl_usdt);
    record.pnl_pct = Some(pnl_pct);
    record.duration_s = Some(duration_s);
    record.fees = Some(fees);
    record.exit_reason = Some(exit_reason);
    record.exit_ts = Some(exit_ts);
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn open(side: PositionSide, entry_price: f64, entry_time: DateTime<Utc>) -> OpenPosition {
        OpenPosition {
            symbol: "BTCUSDT".to_string(),
            side,
            entry_price,
            quantity: 0.01,
            entry_time,
            trade_id: "trade-1".to_string(),
        }
    }

    #[test]
    fn tp_exit_on_long_when_price_rises_enough() {
        let pos = open(PositionSide::Long, 95000.0, Utc::now());
        let check = evaluate_exit(&pos, 95000.0 * 1.004, Utc::now(), 0.0035, 0.0045, 150).unwrap();
        assert_eq!(check.reason, ExitReason::Tp);
    }

    #[test]
    fn sl_exit_on_long_when_price_falls_enough() {
        let pos = open(PositionSide::Long, 95000.0, Utc::now());
        let check = evaluate_exit(&pos, 95000.0 * 0.995, Utc::now(), 0.0035, 0.0045, 150).unwrap();
        assert_eq!(check.reason, ExitReason::Sl);
    }

    #[test]
    fn time_stop_exit_when_held_too_long_without_tp_or_sl() {
        let pos = open(PositionSide::Long, 95000.0, Utc::now() - Duration::seconds(200));
        let check = evaluate_exit(&pos, 95000.0 * 1.0005, Utc::now(), 0.0035, 0.0045, 150).unwrap();
        assert_eq!(check.reason, ExitReason::TimeStop);
    }

    #[test]
    fn no_exit_when_within_bounds_and_not_yet_timed_out() {
        let pos = open(PositionSide::Long, 95000.0, Utc::now());
        assert!(evaluate_exit(&pos, 95000.0 * 1.001, Utc::now(), 0.0035, 0.0045, 150).is_none());
    }

    #[test]
    fn short_pnl_pct_is_negated() {
        let pos = open(PositionSide::Short, 95000.0, Utc::now());
        let check = evaluate_exit(&pos, 95000.0 * 0.996, Utc::now(), 0.0035, 0.0045, 150).unwrap();
        assert_eq!(check.reason, ExitReason::Tp);
        assert!(check.pnl_pct > 0.0);
    }

    #[test]
    fn size_position_scales_with_risk_amount_and_inversely_with_sl_distance() {
        let qty = size_position(1400.0, 0.005, 95000.0, 0.0045);
        let expected = (1400.0 * 0.005) / (95000.0 * 0.0045);
        assert!((qty - expected).abs() < 1e-9);
    }

    #[test]
    fn close_trade_record_computes_pnl_fees_and_duration() {
        let record = TradeRecord::open(
            "BTCUSDT".to_string(),
            PositionSide::Long,
            95000.0,
            0.01,
            Utc::now() - Duration::seconds(60),
            "setup-1".to_string(),
        );
        let closed = close_trade_record(
            record,
            PositionSide::Long,
            95000.0,
            0.01,
            95000.0 * 1.0035,
            ExitReason::Tp,
            Utc::now(),
            0.04,
        );
        assert!(closed.is_closed());
        assert!((closed.pnl_pct.unwrap() - 0.0035).abs() < 1e-9);
        assert!(closed.duration_s.unwrap() >= 60);
        assert!(closed.fees.unwrap() > 0.0);
    }

    #[test]
    fn close_trade_record_rounds_duration_instead_of_truncating() {
        let entry_ts = Utc::now();
        let record = TradeRecord::open(
            "BTCUSDT".to_string(),
            PositionSide::Long,
            95000.0,
            0.01,
            entry_ts,
            "setup-1".to_string(),
        );
        let exit_ts = entry_ts + Duration::milliseconds(150_900);
        let closed = close_trade_record(record, PositionSide::Long, 95000.0, 0.01, 95000.0, ExitReason::TimeStop, exit_ts, 0.04);
        assert_eq!(closed.duration_s.unwrap(), 151);
    }
}
