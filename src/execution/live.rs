// =============================================================================
// Live Execution Adapter — signed venue orders with exchange-info rounding,
// §4.3 + SPEC_FULL.md's exchange-info supplement
// =============================================================================

use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::binance::{BinanceClient, SymbolFilters};
use crate::execution::{AdapterPosition, Fill};
use crate::types::Side;

/// Wraps `BinanceClient`, caching per-symbol `SymbolFilters` so every order
/// is rounded to the venue's LOT_SIZE/PRICE_FILTER before submission.
pub struct LiveAdapter {
    client: BinanceClient,
    filters: Mutex<HashMap<String, SymbolFilters>>,
}

impl LiveAdapter {
    pub fn new(client: BinanceClient) -> Self {
        Self { client, filters: Mutex::new(HashMap::new()) }
    }

    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        self.client.set_leverage(symbol, leverage).await
    }

    pub async fn get_equity(&self) -> Result<f64> {
        self.client.get_equity().await
    }

    pub async fn get_positions(&self) -> Result<Vec<AdapterPosition>> {
        let positions = self.client.get_positions().await?;
        Ok(positions
            .into_iter()
            .map(|p| AdapterPosition {
                symbol: p.symbol,
                signed_qty: p.signed_qty,
                entry_price: p.entry_price,
                unrealized_pnl: p.unrealized_pnl,
                leverage: p.leverage,
            })
            .collect())
    }

    pub async fn market_order(&self, symbol: &str, side: Side, qty: f64) -> Result<Fill> {
        let filters = self.symbol_filters(symbol).await?;
        let rounded_qty = filters.round_quantity(qty);
        let fill = self.client.market_order(symbol, &side.to_string(), rounded_qty).await?;
        Ok(to_fill(fill))
    }

    pub async fn limit_ioc(&self, symbol: &str, side: Side, qty: f64, price: f64) -> Result<Fill> {
        let filters = self.symbol_filters(symbol).await?;
        let rounded_qty = filters.round_quantity(qty);
        let rounded_price = filters.round_price(price);
        let fill = self.client.limit_ioc(symbol, &side.to_string(), rounded_qty, rounded_price).await?;
        Ok(to_fill(fill))
    }

    /// §4.3: "iterates open positions, submits opposing market orders" to
    /// flatten the book in an emergency shutdown or manual flatten command.
    pub async fn close_all(&self) -> Result<()> {
        let positions = self.client.get_positions().await?;
        for pos in positions {
            if pos.signed_qty == 0.0 {
                continue;
            }
            let closing_side = if pos.signed_qty > 0.0 { Side::Sell } else { Side::Buy };
            let qty = pos.signed_qty.abs();
            info!(symbol = %pos.symbol, qty, side = %closing_side, "flattening live position");
            if let Err(e) = self.market_order(&pos.symbol, closing_side, qty).await {
                warn!(symbol = %pos.symbol, error = %e, "failed to flatten position");
                return Err(e);
            }
        }
        Ok(())
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        if let Some(f) = self.filters.lock().get(symbol).copied() {
            return Ok(f);
        }
        let fetched = self.client.get_symbol_filters(symbol).await?;
        self.filters.lock().insert(symbol.to_string(), fetched);
        Ok(fetched)
    }
}

fn to_fill(order_fill: crate::binance::OrderFill) -> Fill {
    Fill {
        avg_price: order_fill.avg_price,
        executed_qty: order_fill.executed_qty,
        status: order_fill.status,
        latency_ms: order_fill.latency_ms,
    }
}
