// =============================================================================
// Market Feed — combined venue stream connect/parse/reconnect loop, §4.1
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::market_feed::cache::MarketFeedCaches;
use crate::types::{BookTicker, LiquidationEvent, Side, Symbol, TradeEvent};

/// §4.1: ceiling on reconnect attempts before the feed is declared
/// unavailable and the Strategy Core stops entering new trades.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const BACKOFF_BASE_SECONDS: u64 = 1;
const KEEPALIVE_PING_INTERVAL_SECONDS: u64 = 30;

/// Events the feed reader dispatches into the Strategy Core's mailbox.
#[derive(Debug, Clone)]
pub enum MarketFeedEvent {
    Liquidation(LiquidationEvent),
    Trade(TradeEvent),
    BookTicker { symbol: Symbol, ticker: BookTicker },
    /// §4.1: the attempt ceiling was reached; entries must stop but the
    /// open position, if any, continues to be monitored from cached prices.
    FeedUnavailable,
}

fn venue_stream_url(symbols: &[Symbol]) -> String {
    let mut parts: Vec<String> = symbols
        .iter()
        .flat_map(|s| {
            let lower = s.to_lowercase();
            vec![format!("{lower}@aggTrade"), format!("{lower}@bookTicker")]
        })
        .collect();
    parts.push("!forceOrder@arr".to_string());
    format!(
        "wss://fstream.binance.com/stream?streams={}",
        parts.join("/")
    )
}

/// Runs the combined stream forever, reconnecting with exponential backoff
/// until [`MAX_RECONNECT_ATTEMPTS`] consecutive failures, at which point a
/// single [`MarketFeedEvent::FeedUnavailable`] is emitted and the task exits.
pub async fn run_market_feed(
    symbols: Vec<Symbol>,
    caches: Arc<MarketFeedCaches>,
    tx: mpsc::Sender<MarketFeedEvent>,
) {
    let attempt = AtomicU32::new(0);

    loop {
        match run_single_connection(&symbols, &caches, &tx).await {
            Ok(()) => {
                // Clean disconnect (server closed the stream): reset the
                // attempt counter and reconnect immediately, per §4.1.
                attempt.store(0, Ordering::SeqCst);
                info!("market feed connection closed cleanly, reconnecting");
                continue;
            }
            Err(e) => {
                let n = attempt.fetch_add(1, Ordering::SeqCst) + 1;
                warn!(error = %e, attempt = n, "market feed connection failed");
                if n >= MAX_RECONNECT_ATTEMPTS {
                    error!(attempts = n, "market feed unavailable, ceiling reached");
                    let _ = tx.send(MarketFeedEvent::FeedUnavailable).await;
                    return;
                }
                let delay = BACKOFF_BASE_SECONDS * 2u64.pow(n - 1);
                tokio::time::sleep(StdDuration::from_secs(delay)).await;
            }
        }
    }
}

async fn run_single_connection(
    symbols: &[Symbol],
    caches: &Arc<MarketFeedCaches>,
    tx: &mpsc::Sender<MarketFeedEvent>,
) -> Result<()> {
    let url = venue_stream_url(symbols);
    info!(url = %url, "connecting to market feed");

    let (ws_stream, _response) = connect_async(&url)
        .await
        .context("failed to connect to market feed")?;

    info!("market feed connected");
    let (mut write, mut read) = ws_stream.split();

    // §4.1/SPEC_FULL.md supplement: explicit keepalive ping independent of
    // tokio-tungstenite's default pong handling.
    let mut ping_ticker = interval(StdDuration::from_secs(KEEPALIVE_PING_INTERVAL_SECONDS));
    ping_ticker.tick().await; // first tick fires immediately; discard it

    loop {
        tokio::select! {
            frame = read.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = handle_frame(&text, caches, tx).await {
                            warn!(error = %e, "failed to parse market feed frame");
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                }
            }
            _ = ping_ticker.tick() => {
                if write.send(Message::Ping(Vec::new())).await.is_err() {
                    anyhow::bail!("failed to send keepalive ping");
                }
            }
        }
    }
}

async fn handle_frame(
    text: &str,
    caches: &Arc<MarketFeedCaches>,
    tx: &mpsc::Sender<MarketFeedEvent>,
) -> Result<()> {
    let envelope: serde_json::Value =
        serde_json::from_str(text).context("failed to parse frame envelope")?;

    let stream = envelope["stream"].as_str().unwrap_or("");
    let data = &envelope["data"];

    if stream.starts_with("!forceOrder") {
        if let Some(event) = parse_force_order(data)? {
            let _ = tx.send(MarketFeedEvent::Liquidation(event)).await;
        }
    } else if stream.ends_with("@aggTrade") {
        let event = parse_agg_trade(data)?;
        if let Some(cache) = caches.get(&event.symbol) {
            cache.record_trade(event.price, event.notional(), event.timestamp);
        }
        let _ = tx.send(MarketFeedEvent::Trade(event)).await;
    } else if stream.ends_with("@bookTicker") {
        let (symbol, ticker) = parse_book_ticker(data)?;
        if let Some(cache) = caches.get(&symbol) {
            cache.update_book(ticker);
        }
        let _ = tx.send(MarketFeedEvent::BookTicker { symbol, ticker }).await;
    }

    Ok(())
}

fn epoch_ms_to_utc(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

fn parse_f64_field(v: &serde_json::Value, key: &str) -> Result<f64> {
    match v.get(key) {
        Some(serde_json::Value::String(s)) => {
            s.parse::<f64>().with_context(|| format!("failed to parse {key} as f64"))
        }
        Some(serde_json::Value::Number(n)) => {
            n.as_f64().with_context(|| format!("{key} is not a valid f64"))
        }
        _ => anyhow::bail!("missing field {key}"),
    }
}

/// Parses `!forceOrder@arr`'s `data.o = {s, S, p, q, T}`, per §6.
fn parse_force_order(data: &serde_json::Value) -> Result<Option<LiquidationEvent>> {
    let order = &data["o"];
    if order.is_null() {
        return Ok(None);
    }

    let symbol = order["s"].as_str().context("missing field s")?.to_string();
    let side_str = order["S"].as_str().context("missing field S")?;
    let side = match side_str {
        "BUY" => Side::Buy,
        "SELL" => Side::Sell,
        other => anyhow::bail!("unrecognized liquidation side {other}"),
    };
    let price = parse_f64_field(order, "p")?;
    let quantity = parse_f64_field(order, "q")?;
    let timestamp_ms = order["T"].as_i64().context("missing field T")?;

    Ok(Some(LiquidationEvent {
        symbol,
        side,
        price,
        quantity,
        timestamp: epoch_ms_to_utc(timestamp_ms),
    }))
}

/// Parses `<sym>@aggTrade`'s `data = {s, p, q, m, T}`, per §6.
fn parse_agg_trade(data: &serde_json::Value) -> Result<TradeEvent> {
    let symbol = data["s"].as_str().context("missing field s")?.to_string();
    let price = parse_f64_field(data, "p")?;
    let quantity = parse_f64_field(data, "q")?;
    let is_buyer_maker = data["m"].as_bool().context("missing field m")?;
    let timestamp_ms = data["T"].as_i64().context("missing field T")?;

    Ok(TradeEvent {
        symbol,
        price,
        quantity,
        is_buyer_maker,
        timestamp: epoch_ms_to_utc(timestamp_ms),
    })
}

/// Parses `<sym>@bookTicker`'s `data = {s, b, B, a, A}`, per §6.
fn parse_book_ticker(data: &serde_json::Value) -> Result<(Symbol, BookTicker)> {
    let symbol = data["s"].as_str().context("missing field s")?.to_string();
    let bid_price = parse_f64_field(data, "b")?;
    let bid_qty = parse_f64_field(data, "B")?;
    let ask_price = parse_f64_field(data, "a")?;
    let ask_qty = parse_f64_field(data, "A")?;

    Ok((
        symbol,
        BookTicker {
            bid_price,
            bid_qty,
            ask_price,
            ask_qty,
            timestamp: Utc::now(),
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_force_order_frame() {
        let data = json!({
            "o": { "s": "BTCUSDT", "S": "SELL", "p": "95000.00", "q": "10.5", "T": 1_700_000_000_000i64 }
        });
        let event = parse_force_order(&data).unwrap().unwrap();
        assert_eq!(event.symbol, "BTCUSDT");
        assert_eq!(event.side, Side::Sell);
        assert!((event.notional() - 95000.0 * 10.5).abs() < 0.01);
    }

    #[test]
    fn parses_agg_trade_frame() {
        let data = json!({ "s": "ETHUSDT", "p": "3200.5", "q": "2.0", "m": true, "T": 1_700_000_000_000i64 });
        let event = parse_agg_trade(&data).unwrap();
        assert_eq!(event.symbol, "ETHUSDT");
        assert!(event.is_buyer_maker);
    }

    #[test]
    fn parses_book_ticker_frame() {
        let data = json!({ "s": "SOLUSDT", "b": "150.0", "B": "10", "a": "150.05", "A": "8" });
        let (symbol, ticker) = parse_book_ticker(&data).unwrap();
        assert_eq!(symbol, "SOLUSDT");
        assert!((ticker.mid() - 150.025).abs() < 0.001);
    }

    #[test]
    fn force_order_without_o_field_is_none() {
        let data = json!({});
        assert!(parse_force_order(&data).unwrap().is_none());
    }

    #[test]
    fn venue_stream_url_includes_all_symbols_and_force_order() {
        let url = venue_stream_url(&["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        assert!(url.contains("btcusdt@aggTrade"));
        assert!(url.contains("ethusdt@bookTicker"));
        assert!(url.contains("!forceOrder@arr"));
    }
}
