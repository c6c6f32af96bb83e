// =============================================================================
// Liquidation Reversion Engine — entry point
// =============================================================================
//
// Startup wiring: dotenv + tracing-subscriber init, config load, AppState
// build, spawn the Market Feed task, the 100ms position-monitor tick
// producer, the 5s Control Plane task, and run the Strategy Core mailbox
// loop on the main task. `ctrl_c()` triggers a bounded flatten-then-shutdown,
// per §5's cancellation semantics.
// =============================================================================

mod app_state;
mod binance;
mod config;
mod control;
mod decision;
mod execution;
mod market_feed;
mod position;
mod risk;
mod sink;
mod stats;
mod strategy;
mod types;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use app_state::{AppState, VenueCredentials};
use binance::BinanceClient;
use config::Config;
use execution::ExecutionAdapter;
use risk::RiskGovernor;
use sink::EventSink;
use strategy::CoreEvent;
use types::BotState;

/// §4.5's position-monitor tick cadence.
const TICK_INTERVAL_MS: u64 = 100;
/// Capacity of the Strategy Core mailbox: generous enough that a burst of
/// liquidations across every configured symbol never backs up the producers.
const CORE_MAILBOX_CAPACITY: usize = 1024;
/// §5: shutdown waits at most this long for the flatten to complete before
/// the process exits regardless.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(12);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.json".to_string());
    let config_path = std::path::PathBuf::from(config_path);
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            warn!(error = %e, path = %config_path.display(), "no config on disk, writing defaults");
            let config = Config::default();
            config.save(&config_path)?;
            config
        }
    };

    let violations = config.validate();
    if !violations.is_empty() {
        anyhow::bail!("config failed validation: {}", violations.join("; "));
    }

    let db_path = std::env::var("DATABASE_PATH").unwrap_or_else(|_| "liq_reversion.db".to_string());
    let sink = EventSink::spawn(&db_path)?;
    sink.record_config_version(config.version, &serde_json::to_string(&config)?);

    let api_key = std::env::var("BINANCE_API_KEY").ok();
    let api_secret = std::env::var("BINANCE_API_SECRET").ok();
    let use_testnet = std::env::var("BINANCE_TESTNET").map(|v| v == "1" || v == "true").unwrap_or(true);
    let requested_mode = std::env::var("EXECUTION_MODE").unwrap_or_else(|_| "paper".to_string());

    let credentials = match (&api_key, &api_secret) {
        (Some(key), Some(secret)) => Some(VenueCredentials {
            api_key: key.clone(),
            api_secret: secret.clone(),
            use_testnet,
        }),
        _ => None,
    };

    let adapter = match (requested_mode.as_str(), &credentials) {
        ("live", Some(creds)) => {
            info!(testnet = creds.use_testnet, "starting in live execution mode");
            ExecutionAdapter::live(BinanceClient::new(&creds.api_key, &creds.api_secret, creds.use_testnet))
        }
        ("live", None) => {
            warn!("EXECUTION_MODE=live requested but BINANCE_API_KEY/BINANCE_API_SECRET are unset, falling back to paper");
            ExecutionAdapter::paper()
        }
        _ => {
            info!("starting in paper execution mode");
            ExecutionAdapter::paper()
        }
    };

    // §4.4: the Risk Day's equity baseline is seeded from the venue account
    // in live mode; paper mode has no account to query, so it falls back to
    // a configured notional baseline.
    let equity_baseline = match adapter.get_equity().await {
        Ok(equity) if equity > 0.0 => equity,
        Ok(_) => {
            warn!("venue reported zero equity, falling back to the default paper baseline");
            1000.0
        }
        Err(e) => {
            if adapter.is_live() {
                anyhow::bail!("failed to query starting equity from venue: {e}");
            }
            1000.0
        }
    };

    let risk = RiskGovernor::new(
        Utc::now(),
        equity_baseline,
        config.max_trades_per_day,
        config.max_consecutive_losses,
        config.daily_max_loss_pct,
        config.pause_after_consecutive_losses_minutes,
    );

    if adapter.is_live() {
        for symbol in &config.symbols {
            if let Err(e) = adapter.set_leverage(symbol, config.leverage).await {
                warn!(symbol, error = %e, "failed to set leverage at startup");
            }
        }
    }

    let state = Arc::new(AppState::new(config.clone(), config_path, adapter, credentials, risk, sink));

    let (core_tx, core_rx) = mpsc::channel::<CoreEvent>(CORE_MAILBOX_CAPACITY);

    // Market Feed task, forwarding every event onto the Strategy Core mailbox.
    let (feed_tx, mut feed_rx) = mpsc::channel(CORE_MAILBOX_CAPACITY);
    tokio::spawn(market_feed::run_market_feed(config.symbols.clone(), state.caches.clone(), feed_tx));
    let forward_tx = core_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = feed_rx.recv().await {
            if forward_tx.send(CoreEvent::Feed(event)).await.is_err() {
                break;
            }
        }
    });

    // Position-monitor tick producer, §4.5.
    let tick_tx = core_tx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        loop {
            ticker.tick().await;
            if tick_tx.send(CoreEvent::Tick).await.is_err() {
                break;
            }
        }
    });

    // Control Plane: 5s poll of external commands + heartbeat publication, §4.6.
    tokio::spawn(control::run_control_plane(state.clone(), core_tx.clone()));

    // §4.5 BOOTING -> RUNNING: feed task is spawned, adapter is reachable (or
    // intentionally paper), risk day is initialized. Nothing here blocks on
    // the feed actually producing its first frame — RUNNING only means the
    // engine is ready to act on events as they arrive.
    info!(execution_mode = %state.execution_mode(), symbols = ?config.symbols, "engine booted, transitioning to running");
    state.transition_to(BotState::Running);

    let core_state = state.clone();
    let core_handle = tokio::spawn(strategy::run_strategy_core(core_state, core_rx));

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown signal received");

    if core_tx.send(CoreEvent::Shutdown).await.is_err() {
        warn!("strategy core mailbox already closed at shutdown");
    }
    drop(core_tx);

    if tokio::time::timeout(SHUTDOWN_GRACE, core_handle).await.is_err() {
        warn!("strategy core did not shut down within the grace period, exiting anyway");
    }

    info!("engine shutdown complete");
    Ok(())
}
