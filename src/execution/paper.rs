// =============================================================================
// Paper Execution Adapter — synthesizes fills against the live mid, §4.3
// =============================================================================

use anyhow::Result;
use rand::Rng;
use tracing::debug;

use crate::execution::{AdapterPosition, Fill};
use crate::types::Side;

/// Uniform random slippage range applied in the adverse direction, per §4.3.
const SLIPPAGE_MIN_PCT: f64 = 0.0001;
const SLIPPAGE_MAX_PCT: f64 = 0.0003;

/// Synthesizes fills locally; keeps no position ledger of its own — the
/// Strategy Core's Open Position slot is the single source of truth.
pub struct PaperAdapter;

impl PaperAdapter {
    pub fn new() -> Self {
        Self
    }

    pub async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<()> {
        Ok(())
    }

    pub async fn get_equity(&self) -> Result<f64> {
        // Paper mode has no venue account; the Strategy Core tracks equity
        // via the Risk Day's running baseline instead of querying here.
        Ok(0.0)
    }

    pub async fn get_positions(&self) -> Result<Vec<AdapterPosition>> {
        Ok(Vec::new())
    }

    pub async fn market_order(&self, side: Side, qty: f64, mid_price: f64) -> Result<Fill> {
        Ok(self.synthesize_fill(side, qty, mid_price))
    }

    pub async fn limit_ioc(&self, side: Side, qty: f64, _price: f64, mid_price: f64) -> Result<Fill> {
        Ok(self.synthesize_fill(side, qty, mid_price))
    }

    pub async fn close_all(&self) -> Result<()> {
        Ok(())
    }

    /// Applies uniform slippage in `[0.01%, 0.03%]` against the taker,
    /// reports zero network latency, per §4.3.
    fn synthesize_fill(&self, side: Side, qty: f64, mid_price: f64) -> Fill {
        let slippage_pct = rand::thread_rng().gen_range(SLIPPAGE_MIN_PCT..=SLIPPAGE_MAX_PCT);
        let avg_price = match side {
            Side::Buy => mid_price * (1.0 + slippage_pct),
            Side::Sell => mid_price * (1.0 - slippage_pct),
        };
        debug!(side = %side, qty, mid_price, avg_price, slippage_pct, "paper fill synthesized");
        Fill {
            avg_price,
            executed_qty: qty,
            status: "FILLED".to_string(),
            latency_ms: 0,
        }
    }
}

impl Default for PaperAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn buy_fill_has_adverse_slippage_above_mid() {
        let adapter = PaperAdapter::new();
        let fill = adapter.market_order(Side::Buy, 1.0, 100.0).await.unwrap();
        assert!(fill.avg_price >= 100.0);
        assert!(fill.avg_price <= 100.03);
        assert_eq!(fill.latency_ms, 0);
    }

    #[tokio::test]
    async fn sell_fill_has_adverse_slippage_below_mid() {
        let adapter = PaperAdapter::new();
        let fill = adapter.market_order(Side::Sell, 1.0, 100.0).await.unwrap();
        assert!(fill.avg_price <= 100.0);
        assert!(fill.avg_price >= 99.97);
    }

    #[tokio::test]
    async fn close_all_is_a_no_op() {
        let adapter = PaperAdapter::new();
        adapter.close_all().await.unwrap();
    }
}
