// =============================================================================
// Venue REST client — HMAC-SHA256 signed requests against the perpetual
// futures API, §4.3/§6
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. All signed
// requests include X-MBX-APIKEY as a header and a recvWindow of 5000ms to
// tolerate minor clock drift between this process and the venue.
// =============================================================================

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::binance::rate_limit::RateLimitTracker;

type HmacSha256 = Hmac<Sha256>;

/// Estimated request weights, per Binance's published weight table. Good
/// enough for a pre-flight `can_send_request` check; the tracker's own
/// counters are corrected from the `X-MBX-USED-WEIGHT-1M` response header
/// on every call regardless of this estimate.
const WEIGHT_LEVERAGE: u32 = 1;
const WEIGHT_BALANCE: u32 = 5;
const WEIGHT_POSITION_RISK: u32 = 5;
const WEIGHT_ORDER: u32 = 1;
const WEIGHT_EXCHANGE_INFO: u32 = 1;

const RECV_WINDOW: u64 = 5000;
const PROD_BASE_URL: &str = "https://fapi.binance.com";
const TESTNET_BASE_URL: &str = "https://testnet.binancefuture.com";

/// Filters required to round a computed order quantity/price to the
/// instrument's step, per SPEC_FULL.md's exchange-info supplement.
#[derive(Debug, Clone, Copy)]
pub struct SymbolFilters {
    pub step_size: f64,
    pub tick_size: f64,
    pub min_notional: f64,
}

impl SymbolFilters {
    pub fn round_quantity(&self, quantity: f64) -> f64 {
        round_to_step(quantity, self.step_size)
    }

    pub fn round_price(&self, price: f64) -> f64 {
        round_to_step(price, self.tick_size)
    }
}

fn round_to_step(value: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return value;
    }
    (value / step).floor() * step
}

/// Venue REST client with HMAC-SHA256 request signing. `Clone` is cheap —
/// `reqwest::Client` is internally `Arc`-backed.
#[derive(Clone)]
pub struct BinanceClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    rate_limiter: Arc<RateLimitTracker>,
}

impl BinanceClient {
    /// `use_testnet` is honored only when real testnet credentials are
    /// supplied by the operator, per §4.3's live-adapter contract.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, use_testnet: bool) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = if use_testnet { TESTNET_BASE_URL } else { PROD_BASE_URL }.to_string();
        debug!(base_url = %base_url, "BinanceClient initialised");

        Self { api_key, secret, base_url, client, rate_limiter: Arc::new(RateLimitTracker::new()) }
    }

    pub fn rate_limit_snapshot(&self) -> crate::binance::rate_limit::RateLimitSnapshot {
        self.rate_limiter.snapshot()
    }

    pub fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Builds the canonical query string: parameters in insertion order,
    /// joined by `&`, timestamp and recvWindow appended, signature last —
    /// exactly the ordering §4.3 specifies.
    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// POST /fapi/v1/leverage (signed).
    #[instrument(skip(self), name = "binance::set_leverage")]
    pub async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        if !self.rate_limiter.can_send_request(WEIGHT_LEVERAGE) {
            anyhow::bail!("rate limit would be exceeded, refusing to set leverage for {symbol}");
        }
        let params = format!("symbol={symbol}&leverage={leverage}");
        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/leverage?{}", self.base_url, qs);

        let resp = self.client.post(&url).send().await.context("POST /fapi/v1/leverage failed")?;
        self.rate_limiter.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse leverage response")?;
        if !status.is_success() {
            anyhow::bail!("venue rejected leverage set for {symbol}: {status} {body}");
        }
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }

    /// GET /fapi/v2/balance (signed). Returns total wallet balance for USDT.
    #[instrument(skip(self), name = "binance::get_equity")]
    pub async fn get_equity(&self) -> Result<f64> {
        if !self.rate_limiter.can_send_request(WEIGHT_BALANCE) {
            anyhow::bail!("rate limit would be exceeded, refusing to query equity");
        }
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/balance?{}", self.base_url, qs);

        let resp = self.client.get(&url).send().await.context("GET /fapi/v2/balance failed")?;
        self.rate_limiter.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse balance response")?;
        if !status.is_success() {
            anyhow::bail!("venue rejected equity query: {status} {body}");
        }

        let entries = body.as_array().context("balance response is not an array")?;
        for entry in entries {
            if entry["asset"].as_str() == Some("USDT") {
                let balance: f64 = entry["balance"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
                return Ok(balance);
            }
        }
        warn!("USDT asset not found in balance response");
        Ok(0.0)
    }

    /// GET /fapi/v2/positionRisk (signed).
    #[instrument(skip(self), name = "binance::get_positions")]
    pub async fn get_positions(&self) -> Result<Vec<VenuePosition>> {
        if !self.rate_limiter.can_send_request(WEIGHT_POSITION_RISK) {
            anyhow::bail!("rate limit would be exceeded, refusing to query positions");
        }
        let qs = self.signed_query("");
        let url = format!("{}/fapi/v2/positionRisk?{}", self.base_url, qs);

        let resp = self.client.get(&url).send().await.context("GET /fapi/v2/positionRisk failed")?;
        self.rate_limiter.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse positionRisk response")?;
        if !status.is_success() {
            anyhow::bail!("venue rejected positions query: {status} {body}");
        }

        let raw = body.as_array().context("positionRisk response is not an array")?;
        let mut positions = Vec::new();
        for entry in raw {
            let signed_qty: f64 = entry["positionAmt"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
            if signed_qty == 0.0 {
                continue;
            }
            positions.push(VenuePosition {
                symbol: entry["symbol"].as_str().unwrap_or_default().to_string(),
                signed_qty,
                entry_price: entry["entryPrice"].as_str().unwrap_or("0").parse().unwrap_or(0.0),
                unrealized_pnl: entry["unRealizedProfit"].as_str().unwrap_or("0").parse().unwrap_or(0.0),
                leverage: entry["leverage"].as_str().unwrap_or("1").parse().unwrap_or(1),
            });
        }
        Ok(positions)
    }

    /// POST /fapi/v1/order (signed) — MARKET order.
    #[instrument(skip(self), name = "binance::market_order")]
    pub async fn market_order(&self, symbol: &str, side: &str, quantity: f64) -> Result<OrderFill> {
        self.submit_order(symbol, side, "MARKET", quantity, None, None).await
    }

    /// POST /fapi/v1/order (signed) — LIMIT order with `timeInForce=IOC`.
    #[instrument(skip(self), name = "binance::limit_ioc")]
    pub async fn limit_ioc(&self, symbol: &str, side: &str, quantity: f64, price: f64) -> Result<OrderFill> {
        self.submit_order(symbol, side, "LIMIT", quantity, Some(price), Some("IOC")).await
    }

    async fn submit_order(
        &self,
        symbol: &str,
        side: &str,
        order_type: &str,
        quantity: f64,
        price: Option<f64>,
        time_in_force: Option<&str>,
    ) -> Result<OrderFill> {
        if !self.rate_limiter.can_send_request(WEIGHT_ORDER) || !self.rate_limiter.can_place_order() {
            anyhow::bail!("rate limit would be exceeded, refusing to submit order for {symbol}");
        }

        let start = std::time::Instant::now();
        let mut params = format!("symbol={symbol}&side={side}&type={order_type}&quantity={quantity}");
        if let Some(p) = price {
            params.push_str(&format!("&price={p}"));
        }
        if let Some(tif) = time_in_force {
            params.push_str(&format!("&timeInForce={tif}"));
        }

        let qs = self.signed_query(&params);
        let url = format!("{}/fapi/v1/order?{}", self.base_url, qs);

        debug!(symbol, side, order_type, quantity, "submitting order");

        let resp = self.client.post(&url).send().await.context("POST /fapi/v1/order failed")?;
        self.rate_limiter.update_from_headers(resp.headers());
        self.rate_limiter.record_order_sent();
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse order response")?;

        if !status.is_success() {
            anyhow::bail!("venue rejected order for {symbol}: {status} {body}");
        }

        let avg_price: f64 = body["avgPrice"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
        let executed_qty: f64 = body["executedQty"].as_str().unwrap_or("0").parse().unwrap_or(0.0);
        let order_status = body["status"].as_str().unwrap_or("UNKNOWN").to_string();

        Ok(OrderFill {
            avg_price,
            executed_qty,
            status: order_status,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// GET /fapi/v1/exchangeInfo filtered by symbol, per SPEC_FULL.md's
    /// exchange-info supplement.
    #[instrument(skip(self), name = "binance::get_symbol_filters")]
    pub async fn get_symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        if !self.rate_limiter.can_send_request(WEIGHT_EXCHANGE_INFO) {
            anyhow::bail!("rate limit would be exceeded, refusing to query exchangeInfo for {symbol}");
        }
        let url = format!("{}/fapi/v1/exchangeInfo?symbol={}", self.base_url, symbol);

        let resp = self.client.get(&url).send().await.context("GET /fapi/v1/exchangeInfo failed")?;
        self.rate_limiter.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse exchangeInfo response")?;
        if !status.is_success() {
            anyhow::bail!("venue rejected exchangeInfo query: {status} {body}");
        }

        let info = body["symbols"]
            .as_array()
            .and_then(|arr| arr.first().cloned())
            .context("symbol not found in exchangeInfo response")?;

        let filters = info["filters"].as_array().cloned().unwrap_or_default();
        let mut step_size = 0.0001;
        let mut tick_size = 0.01;
        let mut min_notional = 5.0;

        for filter in filters {
            match filter["filterType"].as_str() {
                Some("LOT_SIZE") => {
                    step_size = filter["stepSize"].as_str().unwrap_or("0.0001").parse().unwrap_or(0.0001);
                }
                Some("PRICE_FILTER") => {
                    tick_size = filter["tickSize"].as_str().unwrap_or("0.01").parse().unwrap_or(0.01);
                }
                Some("MIN_NOTIONAL") => {
                    min_notional = filter["notional"].as_str().unwrap_or("5.0").parse().unwrap_or(5.0);
                }
                _ => {}
            }
        }

        Ok(SymbolFilters { step_size, tick_size, min_notional })
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

/// Result of a `market_order`/`limit_ioc` call, per §4.3's adapter contract.
#[derive(Debug, Clone)]
pub struct OrderFill {
    pub avg_price: f64,
    pub executed_qty: f64,
    pub status: String,
    pub latency_ms: u64,
}

/// One element of the `get_positions()` result, per §4.3.
#[derive(Debug, Clone)]
pub struct VenuePosition {
    pub symbol: String,
    pub signed_qty: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_to_step_floors_to_the_nearest_step() {
        assert!((round_to_step(1.23456, 0.001) - 1.234).abs() < 1e-9);
    }

    #[test]
    fn round_to_step_is_identity_when_step_is_zero() {
        assert_eq!(round_to_step(1.23456, 0.0), 1.23456);
    }

    #[test]
    fn symbol_filters_round_quantity_and_price() {
        let filters = SymbolFilters { step_size: 0.001, tick_size: 0.01, min_notional: 5.0 };
        assert!((filters.round_quantity(0.12349) - 0.123).abs() < 1e-9);
        assert!((filters.round_price(95000.127) - 95000.12).abs() < 1e-9);
    }

    #[test]
    fn new_client_starts_with_an_empty_rate_limit_snapshot() {
        let client = BinanceClient::new("key", "secret", true);
        let snap = client.rate_limit_snapshot();
        assert_eq!(snap.used_weight_1m, 0);
        assert_eq!(snap.order_count_10s, 0);
    }
}
