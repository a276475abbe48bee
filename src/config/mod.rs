//! Configuration management for the arbitrage engine.
//!
//! Loads settings from an optional config file and `DARB__`-prefixed
//! environment variables. All thresholds live here and nowhere else.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchange::{ExchangeRole, Symbol};

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Strategy instance settings
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Entry/exit thresholds
    #[serde(default)]
    pub thresholds: TradingThresholds,
    /// Risk limits
    #[serde(default)]
    pub risk: RiskParameters,
    /// Leg placement parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Exchange call retry policy
    #[serde(default)]
    pub exchange: ExchangeConfig,
    /// Trade record storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    #[serde(default = "default_base_asset")]
    pub base_asset: String,
    #[serde(default = "default_quote_asset")]
    pub quote_asset: String,
    /// Role holding the long base leg
    #[serde(default = "default_long_role")]
    pub long_role: ExchangeRole,
    /// Role holding the short hedge leg
    #[serde(default = "default_hedge_role")]
    pub hedge_role: ExchangeRole,
    /// Size of the delta-neutral base hedge, in base units
    #[serde(default = "default_base_position_size")]
    pub base_position_size: Decimal,
    /// Size of each arbitrage trade on top of the base hedge, in base units
    #[serde(default = "default_trade_quantity")]
    pub trade_quantity: Decimal,
    /// |delta| / base_position_size above this (percent) triggers a rebalance
    #[serde(default = "default_rebalance_tolerance_pct")]
    pub rebalance_tolerance_pct: Decimal,
    /// Maximum age of a book ticker usable for decisions
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: u64,
    /// Minimum interval between spread evaluations
    #[serde(default = "default_min_check_interval_ms")]
    pub min_check_interval_ms: u64,
    /// Drift and health check period while monitoring
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_max_recovery_attempts")]
    pub max_recovery_attempts: u32,
    /// Initial backoff in ErrorRecovery, doubled per attempt
    #[serde(default = "default_recovery_backoff_ms")]
    pub recovery_backoff_ms: u64,
    /// Equity baseline for drawdown tracking, in quote units
    #[serde(default = "default_initial_equity")]
    pub initial_equity: Decimal,
}

/// Entry and exit thresholds for a strategy instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingThresholds {
    /// Minimum spread (percent) to open a trade
    #[serde(default = "default_entry_pct")]
    pub entry_pct: Decimal,
    /// Spread (percent) at or below which an open trade is closed
    #[serde(default = "default_exit_pct")]
    pub exit_pct: Decimal,
    /// Maximum holding time of an arbitrage trade
    #[serde(default = "default_position_age_limit_secs")]
    pub position_age_limit_secs: u64,
    /// Minimum opportunity confidence (0-1)
    #[serde(default = "default_min_confidence")]
    pub min_confidence: Decimal,
    /// Limit price offset for entry/exit legs (percent)
    #[serde(default = "default_max_slippage_pct")]
    pub max_slippage_pct: Decimal,
    /// Gate entries on `spread_pct >= entry_pct`
    #[serde(default = "default_true")]
    pub use_entry_threshold: bool,
    /// Statistical gate on the basis z-score
    #[serde(default)]
    pub zscore: ZScoreFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZScoreFilter {
    #[serde(default)]
    pub enabled: bool,
    /// Number of basis samples in the rolling window
    #[serde(default = "default_zscore_window")]
    pub window: usize,
    #[serde(default = "default_min_zscore")]
    pub min_zscore: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParameters {
    /// Maximum quantity held on either role, in base units
    #[serde(default = "default_max_position_size")]
    pub max_position_size: Decimal,
    /// Maximum notional / collateral on margin roles
    #[serde(default = "default_max_leverage")]
    pub max_leverage: Decimal,
    /// Maximum drawdown from peak equity (percent)
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: Decimal,
    /// Entries are refused while a trade is open longer than this
    #[serde(default = "default_position_timeout_seconds")]
    pub position_timeout_seconds: u64,
    /// Balance buffer applied to required funds (percent)
    #[serde(default = "default_max_slippage_pct")]
    pub max_slippage_pct: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Per-leg placement timeout
    #[serde(default = "default_leg_timeout_ms")]
    pub leg_timeout_ms: u64,
    /// Timeout for each compensation order
    #[serde(default = "default_compensation_timeout_ms")]
    pub compensation_timeout_ms: u64,
    /// Minimum filled fraction of each leg for a clean execution (0-1)
    #[serde(default = "default_min_fill_ratio")]
    pub min_fill_ratio: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Attempts per call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite file for cycle records; empty disables persistence
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Bounded queue between coordinator and writer thread
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_base_asset() -> String {
    "BTC".to_string()
}

fn default_quote_asset() -> String {
    "USDT".to_string()
}

fn default_long_role() -> ExchangeRole {
    ExchangeRole::Spot
}

fn default_hedge_role() -> ExchangeRole {
    ExchangeRole::Futures
}

fn default_base_position_size() -> Decimal {
    Decimal::new(1, 1) // 0.1 BTC
}

fn default_trade_quantity() -> Decimal {
    Decimal::new(1, 2) // 0.01 BTC
}

fn default_rebalance_tolerance_pct() -> Decimal {
    Decimal::new(5, 0) // 5%
}

fn default_staleness_ms() -> u64 {
    5_000
}

fn default_min_check_interval_ms() -> u64 {
    100
}

fn default_heartbeat_ms() -> u64 {
    1_000
}

fn default_max_recovery_attempts() -> u32 {
    3
}

fn default_recovery_backoff_ms() -> u64 {
    500
}

fn default_initial_equity() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_entry_pct() -> Decimal {
    Decimal::new(5, 1) // 0.5%
}

fn default_exit_pct() -> Decimal {
    Decimal::new(1, 1) // 0.1%
}

fn default_position_age_limit_secs() -> u64 {
    3_600
}

fn default_min_confidence() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_max_slippage_pct() -> Decimal {
    Decimal::new(1, 1) // 0.1%
}

fn default_zscore_window() -> usize {
    120
}

fn default_min_zscore() -> Decimal {
    Decimal::new(2, 0)
}

fn default_max_position_size() -> Decimal {
    Decimal::new(5, 1) // 0.5 BTC
}

fn default_max_leverage() -> Decimal {
    Decimal::new(3, 0)
}

fn default_max_drawdown_pct() -> Decimal {
    Decimal::new(5, 0) // 5%
}

fn default_position_timeout_seconds() -> u64 {
    7_200
}

fn default_leg_timeout_ms() -> u64 {
    250
}

fn default_compensation_timeout_ms() -> u64 {
    1_000
}

fn default_min_fill_ratio() -> Decimal {
    Decimal::new(95, 2) // 0.95
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    1_000
}

fn default_db_path() -> String {
    "data/cycles.db".to_string()
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            base_asset: default_base_asset(),
            quote_asset: default_quote_asset(),
            long_role: default_long_role(),
            hedge_role: default_hedge_role(),
            base_position_size: default_base_position_size(),
            trade_quantity: default_trade_quantity(),
            rebalance_tolerance_pct: default_rebalance_tolerance_pct(),
            staleness_ms: default_staleness_ms(),
            min_check_interval_ms: default_min_check_interval_ms(),
            heartbeat_ms: default_heartbeat_ms(),
            max_recovery_attempts: default_max_recovery_attempts(),
            recovery_backoff_ms: default_recovery_backoff_ms(),
            initial_equity: default_initial_equity(),
        }
    }
}

impl StrategyConfig {
    pub fn symbol(&self) -> Symbol {
        Symbol::new(&self.base_asset, &self.quote_asset)
    }

    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.staleness_ms as i64)
    }

    /// Maximum tolerated |delta| in base units.
    pub fn delta_tolerance(&self) -> Decimal {
        self.base_position_size * self.rebalance_tolerance_pct / Decimal::ONE_HUNDRED
    }
}

impl Default for TradingThresholds {
    fn default() -> Self {
        Self {
            entry_pct: default_entry_pct(),
            exit_pct: default_exit_pct(),
            position_age_limit_secs: default_position_age_limit_secs(),
            min_confidence: default_min_confidence(),
            max_slippage_pct: default_max_slippage_pct(),
            use_entry_threshold: true,
            zscore: ZScoreFilter::default(),
        }
    }
}

impl Default for ZScoreFilter {
    fn default() -> Self {
        Self {
            enabled: false,
            window: default_zscore_window(),
            min_zscore: default_min_zscore(),
        }
    }
}

impl Default for RiskParameters {
    fn default() -> Self {
        Self {
            max_position_size: default_max_position_size(),
            max_leverage: default_max_leverage(),
            max_drawdown_pct: default_max_drawdown_pct(),
            position_timeout_seconds: default_position_timeout_seconds(),
            max_slippage_pct: default_max_slippage_pct(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            leg_timeout_ms: default_leg_timeout_ms(),
            compensation_timeout_ms: default_compensation_timeout_ms(),
            min_fill_ratio: default_min_fill_ratio(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("DARB").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        let s = &self.strategy;
        let t = &self.thresholds;
        let r = &self.risk;
        let e = &self.execution;

        anyhow::ensure!(
            s.long_role != s.hedge_role,
            "long_role and hedge_role must differ"
        );
        anyhow::ensure!(
            s.base_position_size > Decimal::ZERO,
            "base_position_size must be positive"
        );
        anyhow::ensure!(
            s.trade_quantity > Decimal::ZERO,
            "trade_quantity must be positive"
        );
        anyhow::ensure!(
            s.rebalance_tolerance_pct > Decimal::ZERO && s.rebalance_tolerance_pct < Decimal::ONE_HUNDRED,
            "rebalance_tolerance_pct must be between 0 and 100"
        );
        anyhow::ensure!(s.staleness_ms > 0, "staleness_ms must be positive");
        anyhow::ensure!(s.initial_equity > Decimal::ZERO, "initial_equity must be positive");

        anyhow::ensure!(
            t.use_entry_threshold || t.zscore.enabled,
            "at least one of use_entry_threshold or zscore.enabled must be set"
        );
        anyhow::ensure!(t.entry_pct > Decimal::ZERO, "entry_pct must be positive");
        anyhow::ensure!(t.exit_pct < t.entry_pct, "exit_pct must be below entry_pct");
        anyhow::ensure!(
            t.min_confidence >= Decimal::ZERO && t.min_confidence <= Decimal::ONE,
            "min_confidence must be between 0 and 1"
        );
        anyhow::ensure!(
            t.max_slippage_pct >= Decimal::ZERO,
            "thresholds.max_slippage_pct must not be negative"
        );
        anyhow::ensure!(
            !t.zscore.enabled || t.zscore.window >= 2,
            "zscore.window must be at least 2"
        );

        anyhow::ensure!(
            r.max_position_size >= s.base_position_size + s.trade_quantity,
            "max_position_size must cover base_position_size + trade_quantity"
        );
        anyhow::ensure!(r.max_leverage >= Decimal::ONE, "max_leverage must be at least 1");
        anyhow::ensure!(
            r.max_drawdown_pct > Decimal::ZERO && r.max_drawdown_pct <= Decimal::ONE_HUNDRED,
            "max_drawdown_pct must be between 0 and 100"
        );

        anyhow::ensure!(e.leg_timeout_ms > 0, "leg_timeout_ms must be positive");
        anyhow::ensure!(
            e.min_fill_ratio > Decimal::ZERO && e.min_fill_ratio <= Decimal::ONE,
            "min_fill_ratio must be between 0 and 1"
        );

        anyhow::ensure!(self.exchange.max_attempts >= 1, "max_attempts must be at least 1");
        anyhow::ensure!(
            self.exchange.base_backoff_ms <= self.exchange.max_backoff_ms,
            "base_backoff_ms must not exceed max_backoff_ms"
        );

        Ok(())
    }
}
