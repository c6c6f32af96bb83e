// =============================================================================
// Shared domain types for the liquidation reversion engine
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Symbol = String;

/// Side of a forced order or a market order, as reported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// Direction of our own position, distinct from the venue's `Side` of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "LONG"),
            Self::Short => write!(f, "SHORT"),
        }
    }
}

impl PositionSide {
    /// §4.5 step 9: reversion trade is opposite the liquidation's forced side.
    pub fn from_liquidation_side(liq_side: Side) -> Self {
        match liq_side {
            Side::Sell => Self::Long,
            Side::Buy => Self::Short,
        }
    }

    /// The order side that opens a position in this direction.
    pub fn entry_order_side(self) -> Side {
        match self {
            Self::Long => Side::Buy,
            Self::Short => Side::Sell,
        }
    }

    /// The order side that closes a position in this direction.
    pub fn exit_order_side(self) -> Side {
        self.entry_order_side().opposite()
    }
}

/// Bot State per §3. Transitions are enumerated in strategy.rs (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BotState {
    Booting,
    Running,
    PausedManual,
    PausedRiskLimit,
    Error,
    Shutdown,
}

impl Default for BotState {
    fn default() -> Self {
        Self::Booting
    }
}

impl std::fmt::Display for BotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Booting => write!(f, "BOOTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::PausedManual => write!(f, "PAUSED_MANUAL"),
            Self::PausedRiskLimit => write!(f, "PAUSED_RISK_LIMIT"),
            Self::Error => write!(f, "ERROR"),
            Self::Shutdown => write!(f, "SHUTDOWN"),
        }
    }
}

/// Whether the active `ExecutionAdapter` talks to the venue or simulates fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    Paper,
    Live,
}

impl Default for ExecutionMode {
    fn default() -> Self {
        Self::Paper
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Paper => write!(f, "paper"),
            Self::Live => write!(f, "live"),
        }
    }
}

/// Trade Record exit_reason per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Tp,
    Sl,
    TimeStop,
    Manual,
    Flatten,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tp => write!(f, "TP"),
            Self::Sl => write!(f, "SL"),
            Self::TimeStop => write!(f, "TIME_STOP"),
            Self::Manual => write!(f, "MANUAL"),
            Self::Flatten => write!(f, "FLATTEN"),
        }
    }
}

/// Liquidation Event per §3: `!forceOrder@arr` frame, `data.o`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidationEvent {
    pub symbol: Symbol,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub timestamp: DateTime<Utc>,
}

impl LiquidationEvent {
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

/// Trade Event per §3: `<sym>@aggTrade` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeEvent {
    pub symbol: Symbol,
    pub price: f64,
    pub quantity: f64,
    pub is_buyer_maker: bool,
    pub timestamp: DateTime<Utc>,
}

impl TradeEvent {
    pub fn notional(&self) -> f64 {
        self.price * self.quantity
    }
}

/// Book Ticker per §3: `<sym>@bookTicker` frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookTicker {
    pub bid_price: f64,
    pub bid_qty: f64,
    pub ask_price: f64,
    pub ask_qty: f64,
    pub timestamp: DateTime<Utc>,
}

impl BookTicker {
    pub fn mid(&self) -> f64 {
        (self.bid_price + self.ask_price) / 2.0
    }

    /// spread_bps = (ask - bid) / mid * 10000, per §3.
    pub fn spread_bps(&self) -> f64 {
        let mid = self.mid();
        if mid <= 0.0 {
            return f64::INFINITY;
        }
        (self.ask_price - self.bid_price) / mid * 10_000.0
    }
}

/// Open Position per §3. At most one globally; enforced by `AppState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenPosition {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub entry_price: f64,
    pub quantity: f64,
    pub entry_time: DateTime<Utc>,
    pub trade_id: String,
}

impl OpenPosition {
    /// pnl_pct for LONG is (current - entry)/entry; negated for SHORT, per §4.5.
    pub fn pnl_pct(&self, current_price: f64) -> f64 {
        let raw = (current_price - self.entry_price) / self.entry_price;
        match self.side {
            PositionSide::Long => raw,
            PositionSide::Short => -raw,
        }
    }
}

/// Trade Record per §3. Immutable once closed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub symbol: Symbol,
    pub side: PositionSide,
    pub entry_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<f64>,
    pub quantity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_usdt: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_s: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fees: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slippage_est_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<ExitReason>,
    pub entry_ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_ts: Option<DateTime<Utc>>,
    pub setup_id: String,
}

impl TradeRecord {
    pub fn open(
        symbol: Symbol,
        side: PositionSide,
        entry_price: f64,
        quantity: f64,
        entry_ts: DateTime<Utc>,
        setup_id: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            symbol,
            side,
            entry_price,
            exit_price: None,
            quantity,
            pnl_usdt: None,
            pnl_pct: None,
            duration_s: None,
            fees: None,
            slippage_est_pct: None,
            exit_reason: None,
            entry_ts,
            exit_ts: None,
            setup_id,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.exit_ts.is_some()
    }
}

/// Risk Day per §3. Resets at the first event after a UTC day boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskDay {
    pub day_start_ts: DateTime<Utc>,
    pub equity_baseline: f64,
    pub pnl_today: f64,
    pub trade_count_today: u32,
    pub consecutive_losses: u32,
    pub realized_wins: u32,
    pub realized_losses: u32,
}

impl RiskDay {
    pub fn new(now: DateTime<Utc>, equity_baseline: f64) -> Self {
        Self {
            day_start_ts: now.date_naive().and_hms_opt(0, 0, 0).unwrap().and_utc(),
            equity_baseline,
            pnl_today: 0.0,
            trade_count_today: 0,
            consecutive_losses: 0,
            realized_wins: 0,
            realized_losses: 0,
        }
    }
}

/// Risk Governor admission verdict, §4.4.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskDecision {
    Admit,
    RejectSignal(Vec<String>),
    RejectAndPause(Vec<String>),
}

impl RiskDecision {
    pub fn is_admit(&self) -> bool {
        matches!(self, Self::Admit)
    }

    pub fn reasons(&self) -> Vec<String> {
        match self {
            Self::Admit => Vec::new(),
            Self::RejectSignal(r) | Self::RejectAndPause(r) => r.clone(),
        }
    }
}

/// Control Plane surface commands, §6.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    Pause,
    Resume,
    Flatten,
    SetMode(ExecutionMode),
}

impl ControlCommand {
    pub fn parse(command: &str, payload: Option<&str>) -> Option<Self> {
        match command {
            "pause" => Some(Self::Pause),
            "resume" => Some(Self::Resume),
            "flatten" => Some(Self::Flatten),
            "set_mode" => match payload {
                Some("live") => Some(Self::SetMode(ExecutionMode::Live)),
                Some("paper") => Some(Self::SetMode(ExecutionMode::Paper)),
                _ => None,
            },
            _ => None,
        }
    }
}
