// =============================================================================
// Event Sink — append-only, best-effort persistence, §4.7
// =============================================================================

pub mod db;
pub mod queue;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use tracing::warn;

use crate::decision::MarketEvent;
use crate::types::{BotState, TradeRecord};
use db::{EventSinkDb, LogLevel, MetricsSnapshot};
use queue::{DropOldestQueue, QUEUE_CAPACITY};

const FLUSH_INTERVAL_MS: u64 = 200;

enum TradeMessage {
    Upsert(TradeRecord),
}

/// Handle shared across every component that needs to persist something.
/// All enqueue methods are non-blocking except [`EventSink::record_trade`],
/// which blocks only until the bounded trade channel accepts the item, per
/// §4.7.
pub struct EventSink {
    db: Arc<EventSinkDb>,
    trade_tx: mpsc::Sender<TradeMessage>,
    log_queue: Arc<DropOldestQueue<(LogLevel, String)>>,
    market_event_queue: Arc<DropOldestQueue<MarketEvent>>,
    metrics_queue: Arc<DropOldestQueue<MetricsSnapshot>>,
    healthy: Arc<AtomicBool>,
}

impl EventSink {
    /// Opens the backing database at `path` and spawns the background
    /// writer task. Writes submitted before the task has drained them are
    /// held in the bounded queues.
    pub fn spawn(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let db = Arc::new(EventSinkDb::open(path)?);
        Ok(Self::spawn_with_db(db))
    }

    pub fn spawn_in_memory() -> anyhow::Result<Self> {
        let db = Arc::new(EventSinkDb::open_memory()?);
        Ok(Self::spawn_with_db(db))
    }

    fn spawn_with_db(db: Arc<EventSinkDb>) -> Self {
        let (trade_tx, trade_rx) = mpsc::channel(QUEUE_CAPACITY);
        let log_queue = Arc::new(DropOldestQueue::new(QUEUE_CAPACITY));
        let market_event_queue = Arc::new(DropOldestQueue::new(QUEUE_CAPACITY));
        let metrics_queue = Arc::new(DropOldestQueue::new(QUEUE_CAPACITY));
        let healthy = Arc::new(AtomicBool::new(true));

        tokio::spawn(run_writer(
            db.clone(),
            trade_rx,
            log_queue.clone(),
            market_event_queue.clone(),
            metrics_queue.clone(),
            healthy.clone(),
        ));

        Self { db, trade_tx, log_queue, market_event_queue, metrics_queue, healthy }
    }

    /// §4.7: trade-record writes block only until accepted into the queue.
    pub async fn record_trade(&self, record: TradeRecord) {
        if self.trade_tx.send(TradeMessage::Upsert(record)).await.is_err() {
            warn!("event sink trade channel closed, writer task must have exited");
        }
    }

    pub fn record_market_event(&self, event: MarketEvent) {
        self.market_event_queue.push(event);
    }

    pub fn record_log(&self, level: LogLevel, message: impl Into<String>) {
        self.log_queue.push((level, message.into()));
    }

    pub fn record_metrics(&self, snapshot: MetricsSnapshot) {
        self.metrics_queue.push(snapshot);
    }

    pub fn record_bot_state(&self, state: BotState, last_error: Option<&str>) {
        if let Err(e) = self.db.insert_bot_state(state, last_error, Utc::now()) {
            warn!(error = %e, "failed to persist bot state");
            self.healthy.store(false, Ordering::Relaxed);
        }
    }

    pub fn record_health(&self, feed_connected: bool, adapter_reachable: bool) {
        let sink_reachable = self.is_healthy();
        if let Err(e) = self.db.insert_health(feed_connected, adapter_reachable, sink_reachable, Utc::now()) {
            warn!(error = %e, "failed to persist health check");
            self.healthy.store(false, Ordering::Relaxed);
        }
    }

    pub fn record_config_version(&self, version: u64, config_json: &str) {
        if let Err(e) = self.db.insert_config_version(version, config_json, Utc::now()) {
            warn!(error = %e, "failed to persist config version");
            self.healthy.store(false, Ordering::Relaxed);
        }
    }

    /// §4.6/§6: polled by the Control Plane every 5s.
    pub fn poll_pending_commands(&self) -> Vec<db::PendingCommand> {
        match self.db.poll_pending_commands() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "failed to poll control commands");
                self.healthy.store(false, Ordering::Relaxed);
                Vec::new()
            }
        }
    }

    pub fn mark_command_consumed(&self, id: i64) {
        if let Err(e) = self.db.mark_command_consumed(id, Utc::now()) {
            warn!(error = %e, "failed to mark control command consumed");
            self.healthy.store(false, Ordering::Relaxed);
        }
    }

    /// Test/operator-tool helper standing in for the excluded HTTP surface.
    pub fn submit_control_command(&self, command: &str, payload: Option<&str>) -> anyhow::Result<i64> {
        self.db.insert_control_command(command, payload, Utc::now())
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }
}

async fn run_writer(
    db: Arc<EventSinkDb>,
    mut trade_rx: mpsc::Receiver<TradeMessage>,
    log_queue: Arc<DropOldestQueue<(LogLevel, String)>>,
    market_event_queue: Arc<DropOldestQueue<MarketEvent>>,
    metrics_queue: Arc<DropOldestQueue<MetricsSnapshot>>,
    healthy: Arc<AtomicBool>,
) {
    let mut flush_ticker = interval(Duration::from_millis(FLUSH_INTERVAL_MS));

    loop {
        tokio::select! {
            msg = trade_rx.recv() => {
                match msg {
                    Some(TradeMessage::Upsert(record)) => {
                        if let Err(e) = db.upsert_trade(&record) {
                            warn!(error = %e, trade_id = %record.id, "failed to persist trade record");
                            healthy.store(false, Ordering::Relaxed);
                        }
                    }
                    None => return,
                }
            }
            _ = flush_ticker.tick() => {
                for event in market_event_queue.drain_nonblocking() {
                    if let Err(e) = db.insert_market_event(&event) {
                        warn!(error = %e, "failed to persist market event");
                        healthy.store(false, Ordering::Relaxed);
                    }
                }
                for (level, message) in log_queue.drain_nonblocking() {
                    if let Err(e) = db.insert_log_entry(level, &message, Utc::now()) {
                        warn!(error = %e, "failed to persist log entry");
                        healthy.store(false, Ordering::Relaxed);
                    }
                }
                for snapshot in metrics_queue.drain_nonblocking() {
                    if let Err(e) = db.insert_metrics(snapshot, Utc::now()) {
                        warn!(error = %e, "failed to persist metrics snapshot");
                        healthy.store(false, Ordering::Relaxed);
                    }
                }
            }
        }
    }
}
