// =============================================================================
// Strategy Core — the state machine, §4.5
// =============================================================================
//
// Conceptually single-threaded (§5): one mailbox loop serializes Liquidation
// handling, position-monitor ticks, and control commands onto a single
// logical task. This is the invariant that makes the Open Position slot and
// Risk Day safe to hold behind plain `RwLock`s instead of actor-internal
// state — there is never a second writer.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::decision::{GateFactors, MarketEvent};
use crate::market_feed::MarketFeedEvent;
use crate::position;
use crate::sink::db::{LogLevel, MetricsSnapshot};
use crate::stats;
use crate::types::{BotState, ControlCommand, ExitReason, OpenPosition, PositionSide, RiskDecision, TradeRecord};

/// Everything that can land on the Strategy Core's single mailbox, per §5's
/// "three independent concurrent actors feed this task".
#[derive(Debug)]
pub enum CoreEvent {
    Feed(MarketFeedEvent),
    /// Position-monitor tick, fired every 100ms.
    Tick,
    Command(ControlCommand),
    /// SIGINT/SIGTERM: flatten bounded by a 10s budget, then shut down.
    Shutdown,
}

/// §7: consecutive exit-order failures before escalating to ERROR.
const EXIT_FAILURE_ESCALATION_THRESHOLD: u32 = 5;
/// §5: flatten on shutdown is bounded by a 10s budget.
const SHUTDOWN_FLATTEN_BUDGET: StdDuration = StdDuration::from_secs(10);

/// Runs the Strategy Core mailbox loop until the mailbox closes or a
/// `Shutdown` event is processed.
pub async fn run_strategy_core(state: Arc<AppState>, mut rx: mpsc::Receiver<CoreEvent>) {
    info!("strategy core mailbox loop starting");
    while let Some(event) = rx.recv().await {
        match event {
            CoreEvent::Feed(feed_event) => handle_feed_event(&state, feed_event).await,
            CoreEvent::Tick => handle_tick(&state).await,
            CoreEvent::Command(command) => handle_command(&state, command).await,
            CoreEvent::Shutdown => {
                info!("shutdown requested, flattening before exit");
                let flattened = tokio::time::timeout(SHUTDOWN_FLATTEN_BUDGET, flatten(&state)).await;
                if flattened.is_err() {
                    error!("flatten did not complete within the shutdown budget; open position, if any, left as-is");
                }
                state.transition_to(BotState::Shutdown);
                break;
            }
        }
    }
    info!("strategy core mailbox loop exited");
}

async fn handle_feed_event(state: &Arc<AppState>, event: MarketFeedEvent) {
    match event {
        MarketFeedEvent::Liquidation(liq) => {
            state.feed_connected.store(true, Ordering::Relaxed);
            handle_liquidation(state, liq).await;
        }
        MarketFeedEvent::Trade(_) | MarketFeedEvent::BookTicker { .. } => {
            // Caches are already updated by the feed reader task itself
            // (market_feed::stream::handle_frame); the core only needs to
            // know the feed is alive.
            state.feed_connected.store(true, Ordering::Relaxed);
        }
        MarketFeedEvent::FeedUnavailable => {
            // §4.1: reconnect ceiling reached. §8 scenario S6: transition to
            // ERROR and stop accepting new entries; the open position, if
            // any, continues to be monitored from whatever prices remain
            // cached (handle_tick does not gate on bot_state).
            state.feed_connected.store(false, Ordering::Relaxed);
            state.record_error("market feed unavailable: reconnect attempt ceiling reached");
            state.transition_to(BotState::Error);
        }
    }
}

/// §4.5 "Entry gate": only evaluated when RUNNING and no open position.
async fn handle_liquidation(state: &Arc<AppState>, liq: crate::types::LiquidationEvent) {
    if *state.bot_state.read() != BotState::Running {
        return;
    }
    if state.has_open_position() {
        return;
    }

    let now = Utc::now();

    // Step 1: cooldown drop is silent — no Market Event is emitted.
    if state.is_in_cooldown(&liq.symbol, now) {
        return;
    }

    let Some(cache) = state.caches.get(&liq.symbol) else {
        return;
    };
    let config = state.config.read().clone();

    // Step 2: compute the five signal factors.
    let min_liq_usd = config.min_liq_usd.get(&liq.symbol).copied().unwrap_or(f64::INFINITY);
    let liq_size_ok = liq.notional() >= min_liq_usd;

    let avg_vol = stats::avg_volume(cache);
    let recent_vol = stats::recent_volume(cache, 60);
    let volume_mult_value = if avg_vol > 0.0 { recent_vol / avg_vol } else { 0.0 };
    let volume_ok = volume_mult_value >= config.volume_mult;

    let spread_bps_value = stats::spread_bps(cache, now);
    let max_spread_bps = config.max_spread_bps.get(&liq.symbol).copied().unwrap_or(0.0);
    let spread_ok = spread_bps_value <= max_spread_bps;

    let price_delta_value = stats::price_delta(cache, now, 60);
    let momentum_ok = price_delta_value.abs() < 0.5;

    // Step 2 (cont.): exhaustion_ok is fixed at >= 1, like the momentum
    // ceiling above — config.exhaustion_candles is validated but does not
    // gate this check (see DESIGN.md).
    let exhaustion_value = stats::exhaustion_candles(cache, now);
    let exhaustion_ok = exhaustion_value >= 1;

    let factors = GateFactors {
        liq_size_ok,
        liq_notional_value: liq.notional(),
        min_liq_usd_threshold: min_liq_usd,
        volume_mult_value,
        volume_mult_threshold: config.volume_mult,
        volume_ok,
        spread_bps_value,
        max_spread_bps_threshold: max_spread_bps,
        spread_ok,
        price_delta_value,
        momentum_ok,
        exhaustion_value,
        exhaustion_ok,
    };

    // Step 3: query the Risk Governor.
    let risk_decision = state.risk.admit(now);
    let risk_reasons = risk_decision.reasons();

    // Steps 4-6: build and persist the Market Event audit record.
    let event = MarketEvent::build(liq.symbol.clone(), liq.side, liq.notional(), factors, risk_reasons, now);
    let passed = event.passed;
    state.sink.record_market_event(event);

    // Step 7: RejectAndPause transitions the bot, regardless of signal quality.
    if matches!(risk_decision, RiskDecision::RejectAndPause(reasons)) {
        warn!(symbol = %liq.symbol, reasons = ?reasons, "risk governor rejected and paused");
        state.risk.mark_paused(now);
        state.transition_to(BotState::PausedRiskLimit);
        return;
    }

    // Step 8: not passed -> return.
    if !passed {
        return;
    }

    // Step 9: reversion side is opposite the liquidation's forced side.
    let side = PositionSide::from_liquidation_side(liq.side);

    // Step 10: sizing needs a current mid; without one there is nothing to
    // size against, so the setup is silently abandoned (no cached book).
    let Some(entry_price_ref) = stats::mid(cache, now) else {
        warn!(symbol = %liq.symbol, "gate passed but no mid price available, abandoning entry");
        return;
    };

    let equity_baseline = state.risk.snapshot().equity_baseline;
    let quantity = position::size_position(equity_baseline, config.risk_per_trade_pct, entry_price_ref, config.sl_pct);
    if quantity <= 0.0 {
        warn!(symbol = %liq.symbol, "computed entry quantity is zero, abandoning entry");
        return;
    }

    execute_entry(state, &config, liq.symbol.clone(), side, entry_price_ref, quantity, now).await;
}

/// §4.5 "Entry execution": submits the order, sets the cooldown, increments
/// the day's trade count, and persists the opening Trade Record. §7:
/// transient adapter failures abandon the setup without opening a position.
async fn execute_entry(
    state: &Arc<AppState>,
    config: &crate::config::Config,
    symbol: String,
    side: PositionSide,
    entry_price_ref: f64,
    quantity: f64,
    now: chrono::DateTime<Utc>,
) {
    let adapter = state.adapter();
    let order_side = side.entry_order_side();
    let timeout = StdDuration::from_millis(config.entry_fill_timeout_ms as u64);

    let fill = tokio::time::timeout(timeout, adapter.market_order(&symbol, order_side, quantity, entry_price_ref)).await;

    let fill = match fill {
        Ok(Ok(fill)) => fill,
        Ok(Err(e)) => {
            warn!(symbol = %symbol, error = %e, "entry order rejected, abandoning setup");
            state.sink.record_log(LogLevel::Warn, format!("entry rejected for {symbol}: {e}"));
            return;
        }
        Err(_elapsed) => {
            warn!(symbol = %symbol, timeout_ms = config.entry_fill_timeout_ms, "entry fill timed out, abandoning setup");
            state.sink.record_log(LogLevel::Warn, format!("entry fill timeout for {symbol}"));
            return;
        }
    };

    state.set_cooldown(symbol.clone(), now + chrono::Duration::seconds(config.symbol_cooldown_seconds as i64));
    state.risk.record_entry();

    let setup_id = Uuid::new_v4().to_string();
    let record = TradeRecord::open(symbol.clone(), side, fill.avg_price, fill.executed_qty, now, setup_id);
    state.sink.record_trade(record.clone()).await;
    *state.open_trade_record.write() = Some(record.clone());
    *state.open_position.write() = Some(OpenPosition {
        symbol: symbol.clone(),
        side,
        entry_price: fill.avg_price,
        quantity: fill.executed_qty,
        entry_time: now,
        trade_id: record.id,
    });

    info!(symbol = %symbol, side = %side, entry_price = fill.avg_price, quantity = fill.executed_qty, "position opened");
}

/// §4.5 "Position monitor": fires on every 100ms Tick. Runs regardless of
/// bot_state — §4.1 requires the open position to keep being monitored even
/// after the feed is declared unavailable, as long as prices remain cached.
/// Also resolves the PAUSED_RISK_LIMIT -> RUNNING transition (§4.4: timed
/// cooldown expiry or day rollover), since this is the tightest-cadence
/// point in the mailbox loop.
async fn handle_tick(state: &Arc<AppState>) {
    let now = Utc::now();

    if *state.bot_state.read() == BotState::PausedRiskLimit && state.risk.can_resume_from_risk_pause(now) {
        info!("risk pause cooldown elapsed, resuming");
        state.transition_to(BotState::Running);
    }

    let Some(position) = state.open_position.read().clone() else {
        return;
    };
    let Some(cache) = state.caches.get(&position.symbol) else {
        return;
    };
    let Some(current_price) = stats::mid(cache, now).or_else(|| cache.last_trade_price()) else {
        return;
    };

    let config = state.config.read().clone();
    if let Some(exit) = position::evaluate_exit(&position, current_price, now, config.tp_pct, config.sl_pct, config.time_stop_seconds) {
        execute_exit(state, &config, position, exit.reason, current_price, now).await;
    }
}

/// Submits the opposing order and closes the Trade Record. §7: on failure,
/// retries on the next 100ms tick (the caller is re-entered naturally since
/// the position stays open); escalates to ERROR after
/// [`EXIT_FAILURE_ESCALATION_THRESHOLD`] consecutive failures.
async fn execute_exit(
    state: &Arc<AppState>,
    config: &crate::config::Config,
    position: OpenPosition,
    reason: ExitReason,
    current_price: f64,
    now: chrono::DateTime<Utc>,
) {
    let adapter = state.adapter();
    let order_side = position.side.exit_order_side();
    let timeout = StdDuration::from_millis(config.entry_fill_timeout_ms as u64);

    let fill = tokio::time::timeout(
        timeout,
        adapter.market_order(&position.symbol, order_side, position.quantity, current_price),
    )
    .await;

    let fill = match fill {
        Ok(Ok(fill)) => fill,
        Ok(Err(e)) => {
            on_exit_failure(state, &position.symbol, &e.to_string());
            return;
        }
        Err(_elapsed) => {
            on_exit_failure(state, &position.symbol, "exit order timed out");
            return;
        }
    };

    state.exit_failure_streak.store(0, Ordering::Relaxed);

    let Some(record) = state.open_trade_record.write().take() else {
        // §7 invariant violation: exit with no open trade record.
        state.record_error("exit attempted with no open trade record");
        state.transition_to(BotState::Error);
        return;
    };

    let closed = position::close_trade_record(
        record,
        position.side,
        position.entry_price,
        position.quantity,
        fill.avg_price,
        reason,
        now,
        config.fee_rate_of_pnl,
    );

    let pnl = closed.pnl_usdt.unwrap_or(0.0);
    state.sink.record_trade(closed.clone()).await;
    state.risk.on_trade_closed(pnl);
    *state.open_position.write() = None;

    let day = state.risk.snapshot();
    state.sink.record_metrics(MetricsSnapshot {
        trade_count_today: day.trade_count_today,
        realized_wins: day.realized_wins,
        realized_losses: day.realized_losses,
        pnl_today: day.pnl_today,
        equity_baseline: day.equity_baseline,
    });

    info!(
        symbol = %closed.symbol,
        exit_reason = %reason,
        pnl_usdt = pnl,
        pnl_pct = closed.pnl_pct.unwrap_or(0.0),
        duration_s = closed.duration_s.unwrap_or(0),
        "position closed"
    );
}

fn on_exit_failure(state: &Arc<AppState>, symbol: &str, error: &str) {
    let n = state.exit_failure_streak.fetch_add(1, Ordering::Relaxed) + 1;
    warn!(symbol, error, streak = n, "exit order failed, will retry on next tick");
    state.sink.record_log(LogLevel::Warn, format!("exit failed for {symbol}: {error}"));
    if n >= EXIT_FAILURE_ESCALATION_THRESHOLD {
        state.record_error(format!("exit failed {n} consecutive times for {symbol}, giving up"));
        state.transition_to(BotState::Error);
    }
}

/// §4.6 Control Plane command application. The core is the only writer of
/// Bot State, so every command is applied here rather than by the Control
/// Plane task itself.
async fn handle_command(state: &Arc<AppState>, command: ControlCommand) {
    match command {
        ControlCommand::Pause => {
            // Idempotent: pausing an already-paused bot is a no-op.
            if *state.bot_state.read() == BotState::Running {
                state.transition_to(BotState::PausedManual);
            }
        }
        ControlCommand::Resume => {
            // §4.5: PAUSED_RISK_LIMIT never resumes via manual command; the
            // Control Plane already filters this before it reaches the
            // core, but the guard is repeated here since the core is the
            // sole writer of bot_state and must not trust callers blindly.
            if *state.bot_state.read() == BotState::PausedManual {
                state.transition_to(BotState::Running);
            }
        }
        ControlCommand::Flatten => {
            flatten(state).await;
        }
        ControlCommand::SetMode(mode) => {
            warn!(mode = %mode, "set_mode applied, takes effect on the next entry");
            state.set_execution_mode(mode);
        }
    }
}

/// §4.5 "Flatten": force-exits any open position with reason FLATTEN, then
/// transitions to PAUSED_MANUAL regardless of whether a position was open.
async fn flatten(state: &Arc<AppState>) {
    if let Some(position) = state.open_position.read().clone() {
        let now = Utc::now();
        let current_price = state
            .caches
            .get(&position.symbol)
            .and_then(|c| stats::mid(c, now).or_else(|| c.last_trade_price()))
            .unwrap_or(position.entry_price);
        let config = state.config.read().clone();
        execute_exit(state, &config, position, ExitReason::Flatten, current_price, now).await;
    }
    state.transition_to(BotState::PausedManual);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::VenueCredentials;
    use crate::config::Config;
    use crate::execution::ExecutionAdapter;
    use crate::risk::RiskGovernor;
    use crate::sink::EventSink;
    use crate::types::{BookTicker, LiquidationEvent, Side};

    fn state_with_config(config: Config) -> Arc<AppState> {
        Arc::new(AppState::new(
            config,
            std::path::PathBuf::from("/tmp/ignored.json"),
            ExecutionAdapter::paper(),
            None::<VenueCredentials>,
            RiskGovernor::new(Utc::now(), 1400.0, 10, 3, 0.02, 60),
            EventSink::spawn_in_memory().unwrap(),
        ))
    }

    fn seed_book(state: &Arc<AppState>, symbol: &str, bid: f64, ask: f64) {
        let cache = state.caches.get(symbol).unwrap();
        cache.update_book(BookTicker { bid_price: bid, bid_qty: 1.0, ask_price: ask, ask_qty: 1.0, timestamp: Utc::now() });
    }

    /// Seeds a baseline of quiet, low-notional trades far enough in the past
    /// that `recent_volume(60)` (last min(len, 600) samples, §4.2) excludes
    /// them, then a genuine recent spike, so `volume_mult` is computed from a
    /// real baseline/spike split rather than one uniform sample set.
    fn seed_volume_spike(state: &Arc<AppState>, symbol: &str) {
        let cache = state.caches.get(symbol).unwrap();
        let baseline_ts = Utc::now() - chrono::Duration::seconds(200);
        for _ in 0..500 {
            cache.record_trade(100.0, 10_000.0, baseline_ts);
        }
        let spike_ts = Utc::now() - chrono::Duration::seconds(75);
        for _ in 0..596 {
            cache.record_trade(100.03, 2_000_000.0, spike_ts);
        }
    }

    /// Seeds the exact four price samples `exhaustion_candles` looks for
    /// (now, -20s, -40s, -60s), shaped like S1's reversal (up, down, up) but
    /// scaled small enough that the 60s `price_delta` stays under the 0.5%
    /// momentum ceiling.
    fn seed_price_path(state: &Arc<AppState>, symbol: &str) {
        let cache = state.caches.get(symbol).unwrap();
        let now = Utc::now();
        cache.record_trade(100.00, 2_000_000.0, now - chrono::Duration::seconds(60));
        cache.record_trade(100.05, 2_000_000.0, now - chrono::Duration::seconds(40));
        cache.record_trade(100.02, 2_000_000.0, now - chrono::Duration::seconds(20));
        cache.record_trade(100.03, 2_000_000.0, now);
    }

    #[tokio::test]
    async fn clean_liquidation_opens_a_long_position_when_gate_passes() {
        let mut config = Config::default();
        config.volume_mult = 1.5;
        let state = state_with_config(config);
        state.transition_to(BotState::Running);
        seed_book(&state, "BTCUSDT", 94999.0, 95001.0);
        seed_volume_spike(&state, "BTCUSDT");
        seed_price_path(&state, "BTCUSDT");

        let liq = LiquidationEvent {
            symbol: "BTCUSDT".to_string(),
            side: Side::Sell,
            price: 95000.0,
            quantity: 40.0,
            timestamp: Utc::now(),
        };
        handle_liquidation(&state, liq).await;

        let position = state.open_position.read().clone();
        assert!(position.is_some());
        assert_eq!(position.unwrap().side, PositionSide::Long);
    }

    #[tokio::test]
    async fn cooldown_suppresses_second_liquidation_silently() {
        let state = state_with_config(Config::default());
        state.transition_to(BotState::Running);
        state.set_cooldown("BTCUSDT".to_string(), Utc::now() + chrono::Duration::seconds(60));

        let liq = LiquidationEvent {
            symbol: "BTCUSDT".to_string(),
            side: Side::Sell,
            price: 95000.0,
            quantity: 40.0,
            timestamp: Utc::now(),
        };
        handle_liquidation(&state, liq).await;
        assert!(state.open_position.read().is_none());
    }

    #[tokio::test]
    async fn pause_then_pause_is_idempotent() {
        let state = state_with_config(Config::default());
        state.transition_to(BotState::Running);
        handle_command(&state, ControlCommand::Pause).await;
        assert_eq!(*state.bot_state.read(), BotState::PausedManual);
        handle_command(&state, ControlCommand::Pause).await;
        assert_eq!(*state.bot_state.read(), BotState::PausedManual);
    }

    #[tokio::test]
    async fn resume_is_rejected_from_paused_risk_limit() {
        let state = state_with_config(Config::default());
        state.transition_to(BotState::PausedRiskLimit);
        handle_command(&state, ControlCommand::Resume).await;
        assert_eq!(*state.bot_state.read(), BotState::PausedRiskLimit);
    }

    #[tokio::test]
    async fn flatten_closes_open_position_and_pauses() {
        let state = state_with_config(Config::default());
        state.transition_to(BotState::Running);
        seed_book(&state, "BTCUSDT", 94999.0, 95001.0);

        let record = TradeRecord::open("BTCUSDT".to_string(), PositionSide::Long, 95000.0, 0.01, Utc::now(), "setup-1".to_string());
        *state.open_trade_record.write() = Some(record.clone());
        *state.open_position.write() = Some(OpenPosition {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            entry_price: 95000.0,
            quantity: 0.01,
            entry_time: Utc::now(),
            trade_id: record.id,
        });

        flatten(&state).await;
        assert!(state.open_position.read().is_none());
        assert_eq!(*state.bot_state.read(), BotState::PausedManual);
    }

    #[tokio::test]
    async fn tick_closes_position_on_take_profit() {
        let mut config = Config::default();
        config.tp_pct = 0.0035;
        let state = state_with_config(config);
        state.transition_to(BotState::Running);
        seed_book(&state, "BTCUSDT", 95000.0 * 1.004, 95000.0 * 1.0041);

        let record = TradeRecord::open("BTCUSDT".to_string(), PositionSide::Long, 95000.0, 0.01, Utc::now(), "setup-1".to_string());
        *state.open_trade_record.write() = Some(record.clone());
        *state.open_position.write() = Some(OpenPosition {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            entry_price: 95000.0,
            quantity: 0.01,
            entry_time: Utc::now(),
            trade_id: record.id,
        });

        handle_tick(&state).await;
        assert!(state.open_position.read().is_none());
    }

    #[tokio::test]
    async fn feed_unavailable_transitions_to_error() {
        let state = state_with_config(Config::default());
        state.transition_to(BotState::Running);
        handle_feed_event(&state, MarketFeedEvent::FeedUnavailable).await;
        assert_eq!(*state.bot_state.read(), BotState::Error);
        assert!(!state.feed_connected.load(Ordering::Relaxed));
    }

    #[tokio::test]
    async fn risk_pause_resumes_on_tick_after_cooldown_elapses() {
        let state = state_with_config(Config::default());
        state.transition_to(BotState::PausedRiskLimit);
        state.risk.mark_paused(Utc::now() - chrono::Duration::minutes(61));
        handle_tick(&state).await;
        assert_eq!(*state.bot_state.read(), BotState::Running);
    }

    #[tokio::test]
    async fn shutdown_event_flattens_and_transitions_to_shutdown() {
        let state = state_with_config(Config::default());
        state.transition_to(BotState::Running);
        seed_book(&state, "BTCUSDT", 94999.0, 95001.0);
        let record = TradeRecord::open("BTCUSDT".to_string(), PositionSide::Long, 95000.0, 0.01, Utc::now(), "setup-1".to_string());
        *state.open_trade_record.write() = Some(record.clone());
        *state.open_position.write() = Some(OpenPosition {
            symbol: "BTCUSDT".to_string(),
            side: PositionSide::Long,
            entry_price: 95000.0,
            quantity: 0.01,
            entry_time: Utc::now(),
            trade_id: record.id,
        });

        let (tx, rx) = mpsc::channel(4);
        tx.send(CoreEvent::Shutdown).await.unwrap();
        drop(tx);
        run_strategy_core(state.clone(), rx).await;

        assert!(state.open_position.read().is_none());
        assert_eq!(*state.bot_state.read(), BotState::Shutdown);
    }
}
