// =============================================================================
// Runtime Configuration — bounded engine parameters with atomic save
// =============================================================================
//
// Every tunable named in the data model lives here. Persistence uses an
// atomic tmp + rename pattern so a crash mid-write never corrupts the file
// on disk. All fields carry `#[serde(default = "...")]` so an older config
// file deserializes forward-compatibly when a new field is added.
//
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    vec!["BTCUSDT".to_string(), "ETHUSDT".to_string(), "SOLUSDT".to_string()]
}

fn default_leverage() -> u32 {
    2
}

fn default_risk_per_trade_pct() -> f64 {
    0.005
}

fn default_daily_max_loss_pct() -> f64 {
    0.02
}

fn default_max_trades_per_day() -> u32 {
    10
}

fn default_max_consecutive_losses() -> u32 {
    3
}

fn default_pause_after_consecutive_losses_minutes() -> u32 {
    60
}

fn default_max_margin_per_trade_pct() -> f64 {
    0.15
}

fn default_liq_window_seconds() -> u32 {
    60
}

fn default_min_liq_usd() -> HashMap<String, f64> {
    let mut m = HashMap::new();
    m.insert("BTCUSDT".to_string(), 1_000_000.0);
    m.insert("ETHUSDT".to_string(), 500_000.0);
    m.insert("SOLUSDT".to_string(), 250_000.0);
    m
}

fn default_volume_lookback() -> u32 {
    30
}

fn default_volume_mult() -> f64 {
    2.0
}

fn default_exhaustion_candles() -> u32 {
    1
}

fn default_max_spread_bps() -> HashMap<String, f64> {
    let mut m = HashMap::new();
    m.insert("BTCUSDT".to_string(), 3.0);
    m.insert("ETHUSDT".to_string(), 4.0);
    m.insert("SOLUSDT".to_string(), 6.0);
    m
}

fn default_symbol_cooldown_seconds() -> u32 {
    120
}

fn default_tp_pct() -> f64 {
    0.0035
}

fn default_sl_pct() -> f64 {
    0.0045
}

fn default_time_stop_seconds() -> u32 {
    150
}

fn default_entry_fill_timeout_ms() -> u32 {
    800
}

fn default_true() -> bool {
    true
}

fn default_fee_rate_of_pnl() -> f64 {
    0.04
}

fn default_version() -> u64 {
    1
}

// =============================================================================
// Config
// =============================================================================

/// Top-level engine configuration. Bounds named in the data model are
/// enforced by [`Config::validate`], not by the type system, so a config
/// loaded from disk can be rejected with a full list of violations instead
/// of panicking on the first bad field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    #[serde(default = "default_leverage")]
    pub leverage: u32,

    #[serde(default = "default_risk_per_trade_pct")]
    pub risk_per_trade_pct: f64,

    #[serde(default = "default_daily_max_loss_pct")]
    pub daily_max_loss_pct: f64,

    #[serde(default = "default_max_trades_per_day")]
    pub max_trades_per_day: u32,

    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,

    #[serde(default = "default_pause_after_consecutive_losses_minutes")]
    pub pause_after_consecutive_losses_minutes: u32,

    #[serde(default = "default_max_margin_per_trade_pct")]
    pub max_margin_per_trade_pct: f64,

    #[serde(default = "default_liq_window_seconds")]
    pub liq_window_seconds: u32,

    #[serde(default = "default_min_liq_usd")]
    pub min_liq_usd: HashMap<String, f64>,

    #[serde(default = "default_volume_lookback")]
    pub volume_lookback: u32,

    #[serde(default = "default_volume_mult")]
    pub volume_mult: f64,

    #[serde(default = "default_exhaustion_candles")]
    pub exhaustion_candles: u32,

    #[serde(default = "default_max_spread_bps")]
    pub max_spread_bps: HashMap<String, f64>,

    #[serde(default = "default_symbol_cooldown_seconds")]
    pub symbol_cooldown_seconds: u32,

    #[serde(default = "default_tp_pct")]
    pub tp_pct: f64,

    #[serde(default = "default_sl_pct")]
    pub sl_pct: f64,

    #[serde(default = "default_time_stop_seconds")]
    pub time_stop_seconds: u32,

    #[serde(default = "default_entry_fill_timeout_ms")]
    pub entry_fill_timeout_ms: u32,

    #[serde(default)]
    pub use_market_if_not_filled: bool,

    /// Feature flag: trade a fourth symbol beyond the base three.
    #[serde(default)]
    pub enable_additional_symbol: bool,

    /// Feature flag: a momentum-confirming variant of the entry gate.
    #[serde(default)]
    pub enable_momentum_variant: bool,

    /// Placeholder taker-fee factor applied to realized PnL, per §4.5.
    /// The spec flags this as provisional (§9); kept as a named constant
    /// rather than hand-derived from notional so a future fee-model change
    /// touches one field.
    #[serde(default = "default_fee_rate_of_pnl")]
    pub fee_rate_of_pnl: f64,

    #[serde(default = "default_version")]
    pub version: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            leverage: default_leverage(),
            risk_per_trade_pct: default_risk_per_trade_pct(),
            daily_max_loss_pct: default_daily_max_loss_pct(),
            max_trades_per_day: default_max_trades_per_day(),
            max_consecutive_losses: default_max_consecutive_losses(),
            pause_after_consecutive_losses_minutes: default_pause_after_consecutive_losses_minutes(),
            max_margin_per_trade_pct: default_max_margin_per_trade_pct(),
            liq_window_seconds: default_liq_window_seconds(),
            min_liq_usd: default_min_liq_usd(),
            volume_lookback: default_volume_lookback(),
            volume_mult: default_volume_mult(),
            exhaustion_candles: default_exhaustion_candles(),
            max_spread_bps: default_max_spread_bps(),
            symbol_cooldown_seconds: default_symbol_cooldown_seconds(),
            tp_pct: default_tp_pct(),
            sl_pct: default_sl_pct(),
            time_stop_seconds: default_time_stop_seconds(),
            entry_fill_timeout_ms: default_entry_fill_timeout_ms(),
            use_market_if_not_filled: default_true(),
            enable_additional_symbol: false,
            enable_momentum_variant: false,
            fee_rate_of_pnl: default_fee_rate_of_pnl(),
            version: default_version(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(path = %path.display(), symbols = ?config.symbols, version = config.version, "config loaded");

        Ok(config)
    }

    /// Persist the configuration to `path` using an atomic write (tmp, then
    /// rename). `version` is bumped by the caller before calling this when
    /// the change is semantic, never on a no-op save.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self).context("failed to serialize config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), version = self.version, "config saved (atomic)");
        Ok(())
    }

    /// Bump `version` and save. No-op saves (config unchanged from the last
    /// persisted copy) should call `save` directly instead, per the
    /// monotonic-version invariant in the data model.
    pub fn save_with_bump(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.version += 1;
        self.save(path)
    }

    /// Checks every inclusive bound named in the data model and returns the
    /// complete list of violations, not just the first.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let mut bound = |ok: bool, msg: &str| {
            if !ok {
                errors.push(msg.to_string());
            }
        };

        bound(
            (1..=3).contains(&self.leverage),
            "leverage must be in [1,3]",
        );
        bound(
            (0.001..=0.01).contains(&self.risk_per_trade_pct),
            "risk_per_trade_pct must be in [0.001,0.01]",
        );
        bound(
            (0.005..=0.05).contains(&self.daily_max_loss_pct),
            "daily_max_loss_pct must be in [0.005,0.05]",
        );
        bound(
            (1..=20).contains(&self.max_trades_per_day),
            "max_trades_per_day must be in [1,20]",
        );
        bound(
            (1..=10).contains(&self.max_consecutive_losses),
            "max_consecutive_losses must be in [1,10]",
        );
        bound(
            (15..=180).contains(&self.pause_after_consecutive_losses_minutes),
            "pause_after_consecutive_losses_minutes must be in [15,180]",
        );
        bound(
            (0.05..=0.5).contains(&self.max_margin_per_trade_pct),
            "max_margin_per_trade_pct must be in [0.05,0.5]",
        );
        bound(
            (30..=120).contains(&self.liq_window_seconds),
            "liq_window_seconds must be in [30,120]",
        );
        bound(
            (10..=50).contains(&self.volume_lookback),
            "volume_lookback must be in [10,50]",
        );
        bound(
            (1.5..=5.0).contains(&self.volume_mult),
            "volume_mult must be in [1.5,5]",
        );
        bound(
            (1..=5).contains(&self.exhaustion_candles),
            "exhaustion_candles must be in [1,5]",
        );
        bound(
            (60..=600).contains(&self.symbol_cooldown_seconds),
            "symbol_cooldown_seconds must be in [60,600]",
        );
        bound(
            (0.0025..=0.0045).contains(&self.tp_pct),
            "tp_pct must be in [0.0025,0.0045]",
        );
        bound(
            (0.0035..=0.0050).contains(&self.sl_pct),
            "sl_pct must be in [0.0035,0.0050]",
        );
        bound(
            (120..=180).contains(&self.time_stop_seconds),
            "time_stop_seconds must be in [120,180]",
        );
        bound(
            (200..=2000).contains(&self.entry_fill_timeout_ms),
            "entry_fill_timeout_ms must be in [200,2000]",
        );
        bound(!self.symbols.is_empty(), "symbols must not be empty");
        bound(
            self.symbols.len() <= self.max_symbols(),
            "symbols exceeds max_symbols() for the current enable_additional_symbol setting",
        );

        for symbol in &self.symbols {
            bound(
                self.min_liq_usd.contains_key(symbol),
                &format!("min_liq_usd missing entry for configured symbol {symbol}"),
            );
            bound(
                self.max_spread_bps.contains_key(symbol),
                &format!("max_spread_bps missing entry for configured symbol {symbol}"),
            );
        }

        errors
    }

    pub fn max_symbols(&self) -> usize {
        if self.enable_additional_symbol {
            4
        } else {
            3
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = Config::default();
        assert_eq!(cfg.symbols.len(), 3);
        assert_eq!(cfg.leverage, 2);
        assert!(cfg.validate().is_empty());
        assert_eq!(cfg.version, 1);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbols, default_symbols());
        assert!((cfg.tp_pct - 0.0035).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["ETHUSDT"], "leverage": 3 }"#;
        let cfg: Config = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["ETHUSDT"]);
        assert_eq!(cfg.leverage, 3);
        assert_eq!(cfg.max_trades_per_day, default_max_trades_per_day());
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = Config::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbols, cfg2.symbols);
        assert_eq!(cfg.version, cfg2.version);
    }

    #[test]
    fn validate_collects_every_violation_not_just_first() {
        let mut cfg = Config::default();
        cfg.leverage = 10;
        cfg.tp_pct = 0.9;
        cfg.symbol_cooldown_seconds = 1;
        let errors = cfg.validate();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn validate_requires_per_symbol_bounds_for_every_configured_symbol() {
        let mut cfg = Config::default();
        cfg.symbols.push("XRPUSDT".to_string());
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.contains("min_liq_usd")));
        assert!(errors.iter().any(|e| e.contains("max_spread_bps")));
    }

    #[test]
    fn validate_rejects_a_fourth_symbol_without_the_additional_symbol_flag() {
        let mut cfg = Config::default();
        cfg.symbols.push("XRPUSDT".to_string());
        cfg.min_liq_usd.insert("XRPUSDT".to_string(), 50_000.0);
        cfg.max_spread_bps.insert("XRPUSDT".to_string(), 8.0);
        let errors = cfg.validate();
        assert!(errors.iter().any(|e| e.contains("max_symbols")));

        cfg.enable_additional_symbol = true;
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn save_with_bump_increments_version_monotonically() {
        let dir = std::env::temp_dir().join(format!("liq-cfg-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        let mut cfg = Config::default();
        cfg.save(&path).unwrap();
        let before = cfg.version;
        cfg.save_with_bump(&path).unwrap();
        assert_eq!(cfg.version, before + 1);
        let reloaded = Config::load(&path).unwrap();
        assert_eq!(reloaded.version, cfg.version);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
