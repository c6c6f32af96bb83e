// =============================================================================
// Market Event — the entry gate's audit record, §4.5 step 6
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{PositionSide, Side, Symbol};

/// Raw factor values computed for a single Liquidation event's gate
/// evaluation, alongside the five boolean verdicts §8 checks
/// `passed ↔ (liq_size_ok ∧ volume_ok ∧ spread_ok ∧ momentum_ok ∧
/// exhaustion_ok ∧ risk_admitted)` against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateFactors {
    pub liq_size_ok: bool,
    pub liq_notional_value: f64,
    pub min_liq_usd_threshold: f64,
    pub volume_mult_value: f64,
    pub volume_mult_threshold: f64,
    pub volume_ok: bool,
    pub spread_bps_value: f64,
    pub max_spread_bps_threshold: f64,
    pub spread_ok: bool,
    pub price_delta_value: f64,
    pub momentum_ok: bool,
    pub exhaustion_value: u32,
    pub exhaustion_ok: bool,
}

/// §4.5 step 2: momentum_ok and exhaustion_ok are defined against fixed
/// literals, not operator-configured knobs (see strategy.rs).
const MOMENTUM_CEILING_PCT: f64 = 0.5;
const EXHAUSTION_THRESHOLD: u32 = 1;

impl GateFactors {
    pub fn signal_quality_passed(&self) -> bool {
        self.liq_size_ok && self.volume_ok && self.spread_ok && self.momentum_ok && self.exhaustion_ok
    }

    /// Concatenation of all failing factors, joined by `; `, per §4.5 step 6.
    /// Each reason states the observed value against the threshold it missed,
    /// e.g. "Spread 6.0bps > 3bps".
    pub fn rejection_reasons(&self) -> Vec<String> {
        let mut reasons = Vec::new();
        if !self.liq_size_ok {
            reasons.push(format!(
                "Liquidation notional {:.0} < min_liq_usd {}",
                self.liq_notional_value, self.min_liq_usd_threshold
            ));
        }
        if !self.volume_ok {
            reasons.push(format!(
                "Volume mult {:.2} < {}",
                self.volume_mult_value, self.volume_mult_threshold
            ));
        }
        if !self.spread_ok {
            reasons.push(format!(
                "Spread {:.1}bps > {}bps",
                self.spread_bps_value, self.max_spread_bps_threshold
            ));
        }
        if !self.momentum_ok {
            reasons.push(format!(
                "|price_delta| {:.3}% >= momentum ceiling {}%",
                self.price_delta_value.abs(),
                MOMENTUM_CEILING_PCT
            ));
        }
        if !self.exhaustion_ok {
            reasons.push(format!(
                "Exhaustion candles {} < {}",
                self.exhaustion_value, EXHAUSTION_THRESHOLD
            ));
        }
        reasons
    }
}

/// The audit record persisted for every Liquidation event that reaches the
/// gate (cooldown-suppressed liquidations are silently dropped per §4.5
/// step 1 and never produce a `MarketEvent`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    pub symbol: Symbol,
    pub liquidation_side: Side,
    pub liquidation_notional: f64,
    pub factors: GateFactors,
    pub risk_admitted: bool,
    pub passed: bool,
    /// Failing factors joined by `; `, plus the risk governor's reasons
    /// when it rejected. Empty when `passed` is true.
    pub rejection_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_side: Option<PositionSide>,
    pub created_at: DateTime<Utc>,
}

impl MarketEvent {
    pub fn build(
        symbol: Symbol,
        liquidation_side: Side,
        liquidation_notional: f64,
        factors: GateFactors,
        risk_reasons: Vec<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let risk_admitted = risk_reasons.is_empty();
        let signal_quality_passed = factors.signal_quality_passed();
        let passed = signal_quality_passed && risk_admitted;

        let mut reasons = factors.rejection_reasons();
        reasons.extend(risk_reasons);
        let rejection_reason = reasons.join("; ");

        let entry_side = if passed {
            Some(PositionSide::from_liquidation_side(liquidation_side))
        } else {
            None
        };

        Self {
            symbol,
            liquidation_side,
            liquidation_notional,
            factors,
            risk_admitted,
            passed,
            rejection_reason,
            entry_side,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passing_factors() -> GateFactors {
        GateFactors {
            liq_size_ok: true,
            liq_notional_value: 3_000_000.0,
            min_liq_usd_threshold: 1_000_000.0,
            volume_mult_value: 2.5,
            volume_mult_threshold: 2.0,
            volume_ok: true,
            spread_bps_value: 2.0,
            max_spread_bps_threshold: 3.0,
            spread_ok: true,
            price_delta_value: 0.1,
            momentum_ok: true,
            exhaustion_value: 2,
            exhaustion_ok: true,
        }
    }

    #[test]
    fn passes_when_all_factors_and_risk_admit() {
        let event = MarketEvent::build(
            "BTCUSDT".to_string(),
            Side::Sell,
            3_000_000.0,
            passing_factors(),
            vec![],
            Utc::now(),
        );
        assert!(event.passed);
        assert_eq!(event.rejection_reason, "");
        assert_eq!(event.entry_side, Some(PositionSide::Long));
    }

    #[test]
    fn spread_rejection_reason_contains_bps_value() {
        let mut factors = passing_factors();
        factors.spread_bps_value = 6.0;
        factors.max_spread_bps_threshold = 3.0;
        factors.spread_ok = false;
        let event = MarketEvent::build(
            "BTCUSDT".to_string(),
            Side::Sell,
            3_000_000.0,
            factors,
            vec![],
            Utc::now(),
        );
        assert!(!event.passed);
        assert!(event.rejection_reason.contains("Spread 6.0bps > 3bps"));
        assert!(event.entry_side.is_none());
    }

    #[test]
    fn risk_rejection_included_even_when_factors_pass() {
        let event = MarketEvent::build(
            "BTCUSDT".to_string(),
            Side::Buy,
            3_000_000.0,
            passing_factors(),
            vec!["daily loss 0.03 >= daily_max_loss_pct 0.02".to_string()],
            Utc::now(),
        );
        assert!(!event.passed);
        assert!(event.rejection_reason.contains("daily loss"));
    }
}
