// =============================================================================
// Event Sink storage — rusqlite-backed persistence, §4.7/§6
// =============================================================================
//
// Schema mirrors §6's "Persisted state layout" table names bit-exact, since
// the excluded dashboard reads this store directly: bot_states, metrics,
// trades, market_events, log_entries, configs, health_checks. The Control
// Plane's external control channel (§6) rides the same connection as a
// `control_commands` table, per SPEC_FULL.md's persistence decision.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};

use crate::decision::MarketEvent;
use crate::types::{BotState, PositionSide, TradeRecord};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS bot_states (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    state TEXT NOT NULL,
    last_error TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS health_checks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    feed_connected INTEGER NOT NULL,
    adapter_reachable INTEGER NOT NULL,
    sink_reachable INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS metrics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    trade_count_today INTEGER NOT NULL,
    realized_wins INTEGER NOT NULL,
    realized_losses INTEGER NOT NULL,
    pnl_today REAL NOT NULL,
    equity_baseline REAL NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS trades (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    entry_price REAL NOT NULL,
    exit_price REAL,
    quantity REAL NOT NULL,
    pnl_usdt REAL,
    pnl_pct REAL,
    duration_s INTEGER,
    fees REAL,
    slippage_est_pct REAL,
    exit_reason TEXT,
    entry_ts TEXT NOT NULL,
    exit_ts TEXT,
    setup_id TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS market_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    liquidation_side TEXT NOT NULL,
    liquidation_notional REAL NOT NULL,
    passed INTEGER NOT NULL,
    risk_admitted INTEGER NOT NULL,
    rejection_reason TEXT NOT NULL,
    entry_side TEXT,
    factors_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS log_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS configs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version INTEGER NOT NULL,
    config_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS control_commands (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    command TEXT NOT NULL,
    payload TEXT,
    created_at TEXT NOT NULL,
    consumed_at TEXT
);
"#;

/// Level of a persisted log entry, per §4.7.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

/// A pending external control instruction read back from `control_commands`.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub id: i64,
    pub command: String,
    pub payload: Option<String>,
}

/// Cumulative counters persisted on each trade close and heartbeat, §4.7.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub trade_count_today: u32,
    pub realized_wins: u32,
    pub realized_losses: u32,
    pub pnl_today: f64,
    pub equity_baseline: f64,
}

/// Single rusqlite connection guarded by a `Mutex`, matching the teacher's
/// `trade_recorder.rs` storage shape (schema-as-const, `execute_batch` once
/// at open, WAL mode).
pub struct EventSinkDb {
    conn: Mutex<Connection>,
}

impl EventSinkDb {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create directory for {}", path.display()))?;
            }
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags)
            .with_context(|| format!("failed to open event sink database at {}", path.display()))?;
        conn.execute_batch(SCHEMA).context("failed to initialise event sink schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory event sink database")?;
        conn.execute_batch(SCHEMA).context("failed to initialise event sink schema")?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn insert_bot_state(&self, state: BotState, last_error: Option<&str>, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bot_states (state, last_error, created_at) VALUES (?1, ?2, ?3)",
            params![state.to_string(), last_error, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn insert_health(
        &self,
        feed_connected: bool,
        adapter_reachable: bool,
        sink_reachable: bool,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO health_checks (feed_connected, adapter_reachable, sink_reachable, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![feed_connected, adapter_reachable, sink_reachable, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn insert_metrics(&self, snapshot: MetricsSnapshot, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO metrics (trade_count_today, realized_wins, realized_losses, pnl_today, equity_baseline, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                snapshot.trade_count_today,
                snapshot.realized_wins,
                snapshot.realized_losses,
                snapshot.pnl_today,
                snapshot.equity_baseline,
                now.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Upserts a Trade Record row: one row per lifecycle, updated on close,
    /// per §4.7.
    pub fn upsert_trade(&self, record: &TradeRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO trades (
                   id, symbol, side, entry_price, exit_price, quantity, pnl_usdt, pnl_pct,
                   duration_s, fees, slippage_est_pct, exit_reason, entry_ts, exit_ts, setup_id
               ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
               ON CONFLICT(id) DO UPDATE SET
                   exit_price = excluded.exit_price,
                   pnl_usdt = excluded.pnl_usdt,
                   pnl_pct = excluded.pnl_pct,
                   duration_s = excluded.duration_s,
                   fees = excluded.fees,
                   slippage_est_pct = excluded.slippage_est_pct,
                   exit_reason = excluded.exit_reason,
                   exit_ts = excluded.exit_ts"#,
            params![
                record.id,
                record.symbol,
                side_str(record.side),
                record.entry_price,
                record.exit_price,
                record.quantity,
                record.pnl_usdt,
                record.pnl_pct,
                record.duration_s,
                record.fees,
                record.slippage_est_pct,
                record.exit_reason.map(|r| r.to_string()),
                record.entry_ts.to_rfc3339(),
                record.exit_ts.map(|t| t.to_rfc3339()),
                record.setup_id,
            ],
        )?;
        Ok(())
    }

    pub fn insert_market_event(&self, event: &MarketEvent) -> Result<()> {
        let factors_json = serde_json::to_string(&event.factors).context("failed to serialize gate factors")?;
        let conn = self.conn.lock();
        conn.execute(
            r#"INSERT INTO market_events (
                   symbol, liquidation_side, liquidation_notional, passed, risk_admitted,
                   rejection_reason, entry_side, factors_json, created_at
               ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)"#,
            params![
                event.symbol,
                event.liquidation_side.to_string(),
                event.liquidation_notional,
                event.passed,
                event.risk_admitted,
                event.rejection_reason,
                event.entry_side.map(|s| s.to_string()),
                factors_json,
                event.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn insert_log_entry(&self, level: LogLevel, message: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO log_entries (level, message, created_at) VALUES (?1, ?2, ?3)",
            params![level.as_str(), message, now.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn insert_config_version(&self, version: u64, config_json: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO configs (version, config_json, created_at) VALUES (?1, ?2, ?3)",
            params![version as i64, config_json, now.to_rfc3339()],
        )?;
        Ok(())
    }

    /// Inserts an external control record — used by the operator tool or test
    /// harness standing in for the excluded HTTP surface.
    pub fn insert_control_command(&self, command: &str, payload: Option<&str>, now: DateTime<Utc>) -> Result<i64> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO control_commands (command, payload, created_at) VALUES (?1, ?2, ?3)",
            params![command, payload, now.to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// §4.6/§6: the Control Plane polls unconsumed rows every 5s.
    pub fn poll_pending_commands(&self) -> Result<Vec<PendingCommand>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, command, payload FROM control_commands WHERE consumed_at IS NULL ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(PendingCommand { id: row.get(0)?, command: row.get(1)?, payload: row.get(2)? })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn mark_command_consumed(&self, id: i64, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE control_commands SET consumed_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), id],
        )?;
        Ok(())
    }
}

fn side_str(side: PositionSide) -> &'static str {
    match side {
        PositionSide::Long => "LONG",
        PositionSide::Short => "SHORT",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn schema_initialises_on_memory_db() {
        let db = EventSinkDb::open_memory().unwrap();
        db.insert_bot_state(BotState::Booting, None, Utc::now()).unwrap();
    }

    #[test]
    fn trade_upsert_then_close_updates_same_row() {
        let db = EventSinkDb::open_memory().unwrap();
        let record = TradeRecord::open(
            "BTCUSDT".to_string(),
            PositionSide::Long,
            95000.0,
            0.01,
            Utc::now(),
            "setup-1".to_string(),
        );
        db.upsert_trade(&record).unwrap();

        let mut closed = record.clone();
        closed.exit_price = Some(95200.0);
        closed.pnl_usdt = Some(2.0);
        closed.exit_ts = Some(Utc::now());
        db.upsert_trade(&closed).unwrap();

        let conn = db.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM trades", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn control_commands_round_trip_pending_then_consumed() {
        let db = EventSinkDb::open_memory().unwrap();
        let id = db.insert_control_command("pause", None, Utc::now()).unwrap();
        let pending = db.poll_pending_commands().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);

        db.mark_command_consumed(id, Utc::now()).unwrap();
        let pending_after = db.poll_pending_commands().unwrap();
        assert!(pending_after.is_empty());
    }
}
