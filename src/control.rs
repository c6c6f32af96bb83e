// =============================================================================
// Control Plane — external commands + heartbeat publication, §4.6
// =============================================================================
//
// Generalises the teacher's `api/rest.rs` pause/resume/kill/account-mode
// handlers from synchronous HTTP routes into a polled external-store
// consumer: every 5s this reads unconsumed rows from the sink's
// `control_commands` table (§6's "table-like external store") and forwards
// them onto the Strategy Core's mailbox, preserving the single-writer
// invariant on Bot State (only the core task applies a command).
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::{debug, warn};

use crate::app_state::AppState;
use crate::sink::db::{LogLevel, MetricsSnapshot};
use crate::strategy::CoreEvent;
use crate::types::{BotState, ControlCommand};

pub const CONTROL_POLL_INTERVAL_SECONDS: u64 = 5;

pub async fn run_control_plane(state: Arc<AppState>, core_tx: mpsc::Sender<CoreEvent>) {
    let mut ticker = interval(Duration::from_secs(CONTROL_POLL_INTERVAL_SECONDS));
    loop {
        ticker.tick().await;
        poll_and_dispatch(&state, &core_tx).await;
        publish_heartbeat(&state);
    }
}

async fn poll_and_dispatch(state: &Arc<AppState>, core_tx: &mpsc::Sender<CoreEvent>) {
    for pending in state.sink.poll_pending_commands() {
        let Some(parsed) = ControlCommand::parse(&pending.command, pending.payload.as_deref()) else {
            warn!(command = %pending.command, "unrecognized control command, ignoring");
            state.sink.mark_command_consumed(pending.id);
            continue;
        };

        // §4.6: resume from PAUSED_RISK_LIMIT is rejected here, before it
        // ever reaches the core, with a user-visible reason.
        if matches!(parsed, ControlCommand::Resume) && *state.bot_state.read() == BotState::PausedRiskLimit {
            let reason = "resume rejected: bot is PAUSED_RISK_LIMIT, manual resume is not permitted until the timed cooldown elapses or the day rolls over";
            warn!("{reason}");
            state.sink.record_log(LogLevel::Warn, reason);
            state.sink.mark_command_consumed(pending.id);
            continue;
        }

        if matches!(parsed, ControlCommand::SetMode(_)) {
            warn!(?parsed, "set_mode command received, adapter switch takes effect on the next entry");
        }

        if core_tx.send(CoreEvent::Command(parsed)).await.is_err() {
            warn!("strategy core mailbox closed, dropping control command");
        }
        state.sink.mark_command_consumed(pending.id);
    }
}

/// §4.6: publishes bot state, feed/adapter/sink reachability every 5s.
/// Adapter reachability is inferred from the bot state rather than an extra
/// venue round trip every tick — a live network probe on this cadence would
/// add load the spec never asks for.
fn publish_heartbeat(state: &Arc<AppState>) {
    let bot_state = *state.bot_state.read();
    let feed_connected = state.feed_connected.load(Ordering::Relaxed);
    let adapter_reachable = bot_state != BotState::Error;
    let sink_reachable = state.sink.is_healthy();

    state.sink.record_health(feed_connected, adapter_reachable);

    let day = state.risk.snapshot();
    state.sink.record_metrics(MetricsSnapshot {
        trade_count_today: day.trade_count_today,
        realized_wins: day.realized_wins,
        realized_losses: day.realized_losses,
        pnl_today: day.pnl_today,
        equity_baseline: day.equity_baseline,
    });

    debug!(%bot_state, feed_connected, adapter_reachable, sink_reachable, "heartbeat published");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::VenueCredentials;
    use crate::config::Config;
    use crate::execution::ExecutionAdapter;
    use crate::risk::RiskGovernor;
    use crate::sink::EventSink;
    use chrono::Utc;

    fn state() -> Arc<AppState> {
        Arc::new(AppState::new(
            Config::default(),
            std::path::PathBuf::from("/tmp/ignored.json"),
            ExecutionAdapter::paper(),
            None::<VenueCredentials>,
            RiskGovernor::new(Utc::now(), 1400.0, 10, 3, 0.02, 60),
            EventSink::spawn_in_memory().unwrap(),
        ))
    }

    #[tokio::test]
    async fn pause_command_is_forwarded_to_core() {
        let state = state();
        state.sink.submit_control_command("pause", None).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        poll_and_dispatch(&state, &tx).await;
        let event = rx.try_recv().unwrap();
        assert!(matches!(event, CoreEvent::Command(ControlCommand::Pause)));
    }

    #[tokio::test]
    async fn resume_from_paused_risk_limit_is_rejected_before_dispatch() {
        let state = state();
        state.transition_to(BotState::PausedRiskLimit);
        state.sink.submit_control_command("resume", None).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        poll_and_dispatch(&state, &tx).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unrecognized_command_is_consumed_without_forwarding() {
        let state = state();
        state.sink.submit_control_command("bogus", None).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        poll_and_dispatch(&state, &tx).await;
        assert!(rx.try_recv().is_err());
        assert!(state.sink.poll_pending_commands().is_empty());
    }
}
