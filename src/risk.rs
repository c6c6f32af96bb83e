// =============================================================================
// Risk Governor — daily counters and trade admission, §4.4
// =============================================================================
//
// Holds the Risk Day state (realized PnL, trade count, consecutive losses,
// equity baseline) behind a single `parking_lot::RwLock`, so the Strategy
// Core's single-threaded mailbox loop is the only writer. `admit` is the
// conjunction of three checks; `on_trade_closed` updates counters;
// `maybe_rollover` resets at the UTC day boundary.
// =============================================================================

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::types::RiskDecision;

struct Inner {
    day: crate::types::RiskDay,
    /// Set when a `RejectAndPause` fires; cleared on rollover or timed
    /// cooldown expiry. Drives §4.4's "resume only after N minutes or at
    /// day rollover" rule.
    paused_at: Option<DateTime<Utc>>,
}

pub struct RiskGovernor {
    inner: RwLock<Inner>,
    max_trades_per_day: u32,
    max_consecutive_losses: u32,
    daily_max_loss_pct: f64,
    pause_after_consecutive_losses_minutes: u32,
}

impl RiskGovernor {
    pub fn new(
        now: DateTime<Utc>,
        equity_baseline: f64,
        max_trades_per_day: u32,
        max_consecutive_losses: u32,
        daily_max_loss_pct: f64,
        pause_after_consecutive_losses_minutes: u32,
    ) -> Self {
        info!(
            equity_baseline,
            max_trades_per_day,
            max_consecutive_losses,
            daily_max_loss_pct,
            "risk governor initialised"
        );
        Self {
            inner: RwLock::new(Inner {
                day: crate::types::RiskDay::new(now, equity_baseline),
                paused_at: None,
            }),
            max_trades_per_day,
            max_consecutive_losses,
            daily_max_loss_pct,
            pause_after_consecutive_losses_minutes,
        }
    }

    /// §4.4 admission: conjunction of trade-count, consecutive-loss, and
    /// daily-loss checks against the current Risk Day.
    pub fn admit(&self, now: DateTime<Utc>) -> RiskDecision {
        self.maybe_rollover(now);
        let s = self.inner.read();

        if s.day.trade_count_today >= self.max_trades_per_day {
            return RiskDecision::RejectSignal(vec![format!(
                "trade count {} >= max_trades_per_day {}",
                s.day.trade_count_today, self.max_trades_per_day
            )]);
        }

        if s.day.consecutive_losses >= self.max_consecutive_losses {
            return RiskDecision::RejectAndPause(vec![format!(
                "consecutive losses {} >= max_consecutive_losses {}",
                s.day.consecutive_losses, self.max_consecutive_losses
            )]);
        }

        let loss_pct = s.day.pnl_today.min(0.0).abs() / s.day.equity_baseline;
        if loss_pct >= self.daily_max_loss_pct {
            return RiskDecision::RejectAndPause(vec![format!(
                "daily loss {:.4} >= daily_max_loss_pct {:.4}",
                loss_pct, self.daily_max_loss_pct
            )]);
        }

        RiskDecision::Admit
    }

    /// §4.5 entry execution: "Increment trade_count_today" happens when the
    /// order is placed, not when the position later closes.
    pub fn record_entry(&self) {
        let mut s = self.inner.write();
        s.day.trade_count_today += 1;
    }

    /// §4.4: updates pnl_today and consecutive_losses (reset on
    /// non-negative pnl, increment on negative), realized_wins/losses.
    pub fn on_trade_closed(&self, pnl: f64) {
        let mut s = self.inner.write();
        s.day.pnl_today += pnl;

        if pnl >= 0.0 {
            s.day.realized_wins += 1;
            s.day.consecutive_losses = 0;
        } else {
            s.day.realized_losses += 1;
            s.day.consecutive_losses += 1;
        }

        info!(
            pnl,
            pnl_today = s.day.pnl_today,
            consecutive_losses = s.day.consecutive_losses,
            trade_count_today = s.day.trade_count_today,
            "trade result recorded"
        );
    }

    /// Marks the pause moment so [`Self::can_resume_from_risk_pause`] can
    /// measure the timed cooldown. Called by the Strategy Core immediately
    /// after it transitions to `PAUSED_RISK_LIMIT`.
    pub fn mark_paused(&self, now: DateTime<Utc>) {
        self.inner.write().paused_at = Some(now);
    }

    /// §4.4/§4.5: `PAUSED_RISK_LIMIT` resumes only after
    /// `pause_after_consecutive_losses_minutes` have elapsed, or at day
    /// rollover — never via manual resume.
    pub fn can_resume_from_risk_pause(&self, now: DateTime<Utc>) -> bool {
        self.maybe_rollover(now);
        let s = self.inner.read();
        match s.paused_at {
            None => true,
            Some(paused_at) => {
                let elapsed_minutes = (now - paused_at).num_minutes();
                elapsed_minutes >= self.pause_after_consecutive_losses_minutes as i64
            }
        }
    }

    /// §4.4: if `now` crosses the UTC day boundary, snapshot and reset.
    pub fn maybe_rollover(&self, now: DateTime<Utc>) {
        let today_start = now.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc();
        {
            let s = self.inner.read();
            if s.day.day_start_ts >= today_start {
                return;
            }
        }
        let mut s = self.inner.write();
        if s.day.day_start_ts < today_start {
            info!(
                old_day = %s.day.day_start_ts,
                new_day = %today_start,
                pnl_today = s.day.pnl_today,
                trade_count_today = s.day.trade_count_today,
                "risk day rolled over"
            );
            let equity_baseline = s.day.equity_baseline + s.day.pnl_today;
            s.day = crate::types::RiskDay::new(now, equity_baseline);
            s.paused_at = None;
        }
    }

    pub fn snapshot(&self) -> crate::types::RiskDay {
        self.inner.read().day.clone()
    }
}

impl std::fmt::Debug for RiskGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskGovernor")
            .field("max_trades_per_day", &self.max_trades_per_day)
            .field("max_consecutive_losses", &self.max_consecutive_losses)
            .field("daily_max_loss_pct", &self.daily_max_loss_pct)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn governor() -> RiskGovernor {
        RiskGovernor::new(Utc::now(), 1400.0, 10, 3, 0.02, 60)
    }

    #[test]
    fn admits_when_no_breakers_are_tripped() {
        let gov = governor();
        assert_eq!(gov.admit(Utc::now()), RiskDecision::Admit);
    }

    #[test]
    fn rejects_signal_when_trade_count_exhausted() {
        let gov = RiskGovernor::new(Utc::now(), 1400.0, 1, 3, 0.02, 60);
        gov.record_entry();
        let decision = gov.admit(Utc::now());
        assert!(matches!(decision, RiskDecision::RejectSignal(_)));
    }

    #[test]
    fn record_entry_does_not_affect_consecutive_losses() {
        let gov = governor();
        gov.record_entry();
        assert_eq!(gov.snapshot().trade_count_today, 1);
        assert_eq!(gov.snapshot().consecutive_losses, 0);
    }

    #[test]
    fn rejects_and_pauses_after_consecutive_losses() {
        let gov = governor();
        gov.on_trade_closed(-10.0);
        gov.on_trade_closed(-10.0);
        gov.on_trade_closed(-10.0);
        let decision = gov.admit(Utc::now());
        assert!(matches!(decision, RiskDecision::RejectAndPause(_)));
    }

    #[test]
    fn consecutive_losses_reset_on_non_negative_close() {
        let gov = governor();
        gov.on_trade_closed(-10.0);
        gov.on_trade_closed(-10.0);
        gov.on_trade_closed(5.0);
        assert_eq!(gov.snapshot().consecutive_losses, 0);
    }

    #[test]
    fn rejects_and_pauses_on_daily_loss_breach() {
        let gov = RiskGovernor::new(Utc::now(), 1000.0, 10, 10, 0.01, 60);
        gov.on_trade_closed(-15.0);
        let decision = gov.admit(Utc::now());
        assert!(matches!(decision, RiskDecision::RejectAndPause(_)));
    }

    #[test]
    fn cannot_resume_from_risk_pause_before_cooldown_elapses() {
        let gov = governor();
        gov.mark_paused(Utc::now());
        assert!(!gov.can_resume_from_risk_pause(Utc::now()));
    }

    #[test]
    fn can_resume_from_risk_pause_after_cooldown_elapses() {
        let gov = RiskGovernor::new(Utc::now(), 1400.0, 10, 3, 0.02, 15);
        gov.mark_paused(Utc::now() - chrono::Duration::minutes(16));
        assert!(gov.can_resume_from_risk_pause(Utc::now()));
    }
}
