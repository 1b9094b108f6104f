//! Configuration management for the hedge keeper.
//!
//! Loads settings from an optional config file, `.env`, and `HEDGE__*`
//! environment variables. Every section falls back to defaults so a bare
//! file only needs `accounts` and `pairs`.

use crate::venue::{AccountId, MarketId};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tick intervals and order timeouts
    #[serde(default)]
    pub engine: EngineConfig,
    /// Retry and strike settings for reconciliation
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    /// Open/close protocol tolerances and stop distance policy
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Global risk ceilings
    #[serde(default)]
    pub risk: RiskConfig,
    /// Venue accounts the engine may trade on
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    /// Hedge pairs, each bound to one market and a set of accounts
    #[serde(default)]
    pub pairs: Vec<PairConfig>,
    /// Paper venue used by the `run` command
    #[serde(default)]
    pub paper: PaperConfig,
    /// SQLite lifecycle journal
    #[serde(default)]
    pub journal: JournalConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between opportunity checks
    #[serde(default = "default_opportunity_interval")]
    pub opportunity_interval_secs: u64,
    /// Seconds between position management passes
    #[serde(default = "default_management_interval")]
    pub management_interval_secs: u64,
    /// Pending entry orders older than this are considered stale
    #[serde(default = "default_order_timeout")]
    pub order_timeout_secs: u64,
    /// Hard deadline for the joint leg submission group
    #[serde(default = "default_leg_submit_timeout")]
    pub leg_submit_timeout_secs: u64,
    /// Closed/failed positions kept for status output
    #[serde(default = "default_history_retention")]
    pub history_retention: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationConfig {
    /// Exact-id order status lookups before falling back to a history scan
    #[serde(default = "default_attempts")]
    pub status_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub status_retry_delay_ms: u64,
    /// Number of recent orders searched by the broad scan
    #[serde(default = "default_history_scan_limit")]
    pub history_scan_limit: usize,
    /// Remote position checks after a close before giving up
    #[serde(default = "default_attempts")]
    pub close_verify_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub close_verify_delay_ms: u64,
    /// Remote sizes at or below this are treated as flat
    #[serde(default = "default_flat_size_epsilon")]
    pub flat_size_epsilon: Decimal,
    /// Identical observations required before remediation
    #[serde(default = "default_strike_threshold")]
    pub strike_threshold: u32,
    /// Minimum time between the first and the triggering observation
    #[serde(default = "default_min_strike_span")]
    pub min_strike_span_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum relative leg size divergence (0.05 = 5%).
    /// Shared by the post-fill size check and the imbalance detector.
    #[serde(default = "default_size_tolerance")]
    pub size_tolerance: Decimal,
    /// Maximum relative fill price divergence across legs (0.02 = 2%)
    #[serde(default = "default_fill_price_tolerance")]
    pub fill_price_tolerance: Decimal,
    /// Fraction of margin a stop may lose before leverage scaling
    #[serde(default = "default_max_loss_fraction")]
    pub max_loss_fraction: Decimal,
    /// Multiplier applied to the theoretical stop distance
    #[serde(default = "default_safety_factor")]
    pub safety_factor: Decimal,
    /// Stop distance used for unleveraged pairs
    #[serde(default = "default_unleveraged_stop_distance")]
    pub unleveraged_stop_distance: Decimal,
    /// Price move that forces an active close on leveraged pairs, divided by leverage
    #[serde(default = "default_emergency_move_leveraged")]
    pub emergency_move_leveraged: Decimal,
    /// Price move that forces an active close on unleveraged pairs
    #[serde(default = "default_emergency_move_unleveraged")]
    pub emergency_move_unleveraged: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Loss across all accounts that trips the emergency stop
    #[serde(default = "default_global_max_daily_loss")]
    pub global_max_daily_loss: Decimal,
    /// Fraction of any ceiling that emits a warning event
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: Decimal,
}

/// Per-account or per-pair ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: Decimal,
    /// Largest per-leg margin a single hedge may commit
    #[serde(default = "default_max_position_size")]
    pub max_position_size: Decimal,
    #[serde(default = "default_max_slippage")]
    pub max_slippage: Decimal,
    /// Balance that must stay untouched on every account
    #[serde(default = "default_min_balance")]
    pub min_balance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: AccountId,
    #[serde(default)]
    pub label: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default = "default_max_daily_trades")]
    pub max_daily_trades: u32,
    #[serde(default)]
    pub risk_limits: RiskLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub market: MarketId,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
    #[serde(default = "default_leverage")]
    pub leverage: u32,
    /// `"auto"` or a percentage such as `"2.5"`
    #[serde(default = "default_stop_take_distance")]
    pub stop_take_distance: String,
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u32,
    /// Maximum `(ask - bid) / mid` accepted for a reference price
    #[serde(default = "default_max_spread")]
    pub max_spread: Decimal,
    /// Quantity lot size for leg orders
    #[serde(default = "default_quantity_step")]
    pub quantity_step: Decimal,
    pub accounts: Vec<AccountId>,
    #[serde(default)]
    pub risk_limits: RiskLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    /// Starting balance of every configured account
    #[serde(default = "default_paper_balance")]
    pub initial_balance: Decimal,
    /// Initial mid price of every configured market
    #[serde(default = "default_paper_price")]
    pub start_price: Decimal,
    /// Half of the quoted spread, as a fraction of mid
    #[serde(default = "default_paper_half_spread")]
    pub half_spread: Decimal,
    /// Taker fee (0.0004 = 0.04%)
    #[serde(default = "default_paper_fee_rate")]
    pub fee_rate: Decimal,
    /// Largest price step per tick in basis points
    #[serde(default = "default_paper_volatility_bps")]
    pub volatility_bps: u32,
    #[serde(default = "default_paper_tick_ms")]
    pub tick_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_journal_path")]
    pub path: String,
}

/// How a pair chooses its stop-loss/take-profit distance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDistanceMode {
    /// Derived from leverage
    Auto,
    /// Fixed fraction of the basis price (0.02 = 2%), capped at the auto distance
    Manual(Decimal),
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_opportunity_interval() -> u64 {
    5
}

fn default_management_interval() -> u64 {
    5
}

fn default_order_timeout() -> u64 {
    30
}

fn default_leg_submit_timeout() -> u64 {
    15
}

fn default_history_retention() -> usize {
    50
}

fn default_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    2000
}

fn default_history_scan_limit() -> usize {
    100
}

fn default_flat_size_epsilon() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_strike_threshold() -> u32 {
    3
}

fn default_min_strike_span() -> u64 {
    30
}

fn default_size_tolerance() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_fill_price_tolerance() -> Decimal {
    Decimal::new(2, 2) // 0.02
}

fn default_max_loss_fraction() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_safety_factor() -> Decimal {
    Decimal::new(8, 1) // 0.8
}

fn default_unleveraged_stop_distance() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_emergency_move_leveraged() -> Decimal {
    Decimal::new(1, 1) // 0.1 / leverage
}

fn default_emergency_move_unleveraged() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_global_max_daily_loss() -> Decimal {
    Decimal::new(5000, 0)
}

fn default_warning_ratio() -> Decimal {
    Decimal::new(8, 1) // 0.8
}

fn default_max_daily_loss() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_max_position_size() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_max_slippage() -> Decimal {
    Decimal::new(5, 3) // 0.005
}

fn default_min_balance() -> Decimal {
    Decimal::new(100, 0)
}

fn default_max_daily_trades() -> u32 {
    100
}

fn default_leverage() -> u32 {
    1
}

fn default_stop_take_distance() -> String {
    "auto".to_string()
}

fn default_cooldown_minutes() -> u32 {
    10
}

fn default_max_spread() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_quantity_step() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

fn default_paper_balance() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_paper_price() -> Decimal {
    Decimal::new(100, 0)
}

fn default_paper_half_spread() -> Decimal {
    Decimal::new(5, 4) // 0.0005
}

fn default_paper_fee_rate() -> Decimal {
    Decimal::new(4, 4) // 0.0004
}

fn default_paper_volatility_bps() -> u32 {
    10
}

fn default_paper_tick_ms() -> u64 {
    1000
}

fn default_journal_path() -> String {
    "data/hedge_journal.db".to_string()
}

impl Config {
    /// Load configuration from `config.*` in the working directory and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from("config")
    }

    /// Load configuration from an explicit file (extension optional) and the environment.
    pub fn load_from(path: &str) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::default().separator("__").prefix("HEDGE"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.engine.opportunity_interval_secs > 0 && self.engine.management_interval_secs > 0,
            "tick intervals must be positive"
        );
        anyhow::ensure!(
            self.reconciliation.status_attempts >= 1 && self.reconciliation.close_verify_attempts >= 1,
            "retry attempts must be at least 1"
        );
        anyhow::ensure!(
            self.reconciliation.strike_threshold >= 1,
            "strike_threshold must be at least 1"
        );

        for (name, value) in [
            ("size_tolerance", self.execution.size_tolerance),
            ("fill_price_tolerance", self.execution.fill_price_tolerance),
            ("max_loss_fraction", self.execution.max_loss_fraction),
            ("safety_factor", self.execution.safety_factor),
            ("unleveraged_stop_distance", self.execution.unleveraged_stop_distance),
            ("warning_ratio", self.risk.warning_ratio),
        ] {
            anyhow::ensure!(
                value > Decimal::ZERO && value < Decimal::ONE,
                "{} must be between 0 and 1",
                name
            );
        }

        let mut account_ids = HashSet::new();
        for account in &self.accounts {
            anyhow::ensure!(
                account_ids.insert(account.id),
                "duplicate account id {}",
                account.id
            );
        }

        let mut pair_ids = HashSet::new();
        for pair in &self.pairs {
            anyhow::ensure!(pair_ids.insert(pair.id.as_str()), "duplicate pair id {}", pair.id);
            anyhow::ensure!(pair.leverage >= 1, "pair {}: leverage must be >= 1", pair.id);
            anyhow::ensure!(
                pair.accounts.len() >= 2,
                "pair {}: a hedge needs at least two accounts",
                pair.id
            );
            anyhow::ensure!(
                pair.max_spread > Decimal::ZERO,
                "pair {}: max_spread must be positive",
                pair.id
            );
            anyhow::ensure!(
                pair.quantity_step >= Decimal::ZERO,
                "pair {}: quantity_step must not be negative",
                pair.id
            );

            let mut seen = HashSet::new();
            for account in &pair.accounts {
                anyhow::ensure!(
                    account_ids.contains(account),
                    "pair {}: unknown account {}",
                    pair.id,
                    account
                );
                anyhow::ensure!(
                    seen.insert(*account),
                    "pair {}: account {} listed twice",
                    pair.id,
                    account
                );
            }

            pair.stop_distance_mode()?;
        }

        Ok(())
    }

    pub fn account(&self, id: AccountId) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.id == id)
    }

    pub fn pair(&self, id: &str) -> Option<&PairConfig> {
        self.pairs.iter().find(|p| p.id == id)
    }
}

impl EngineConfig {
    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    pub fn leg_submit_timeout(&self) -> Duration {
        Duration::from_secs(self.leg_submit_timeout_secs)
    }
}

impl PairConfig {
    /// Parse `stop_take_distance`.
    ///
    /// Percent values are converted to fractions, so `"2.5"` becomes `0.025`.
    pub fn stop_distance_mode(&self) -> Result<StopDistanceMode> {
        let raw = self.stop_take_distance.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("auto") {
            return Ok(StopDistanceMode::Auto);
        }

        let percent: Decimal = raw
            .trim_end_matches('%')
            .parse()
            .with_context(|| format!("pair {}: invalid stop_take_distance {:?}", self.id, raw))?;
        anyhow::ensure!(
            percent > Decimal::ZERO && percent < Decimal::ONE_HUNDRED,
            "pair {}: stop_take_distance must be between 0 and 100 percent",
            self.id
        );

        Ok(StopDistanceMode::Manual(percent / Decimal::ONE_HUNDRED))
    }

    pub fn leverage_decimal(&self) -> Decimal {
        Decimal::from(self.leverage.max(1))
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            reconciliation: ReconciliationConfig::default(),
            execution: ExecutionConfig::default(),
            risk: RiskConfig::default(),
            accounts: Vec::new(),
            pairs: Vec::new(),
            paper: PaperConfig::default(),
            journal: JournalConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            opportunity_interval_secs: default_opportunity_interval(),
            management_interval_secs: default_management_interval(),
            order_timeout_secs: default_order_timeout(),
            leg_submit_timeout_secs: default_leg_submit_timeout(),
            history_retention: default_history_retention(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            status_attempts: default_attempts(),
            status_retry_delay_ms: default_retry_delay_ms(),
            history_scan_limit: default_history_scan_limit(),
            close_verify_attempts: default_attempts(),
            close_verify_delay_ms: default_retry_delay_ms(),
            flat_size_epsilon: default_flat_size_epsilon(),
            strike_threshold: default_strike_threshold(),
            min_strike_span_secs: default_min_strike_span(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            size_tolerance: default_size_tolerance(),
            fill_price_tolerance: default_fill_price_tolerance(),
            max_loss_fraction: default_max_loss_fraction(),
            safety_factor: default_safety_factor(),
            unleveraged_stop_distance: default_unleveraged_stop_distance(),
            emergency_move_leveraged: default_emergency_move_leveraged(),
            emergency_move_unleveraged: default_emergency_move_unleveraged(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            global_max_daily_loss: default_global_max_daily_loss(),
            warning_ratio: default_warning_ratio(),
        }
    }
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_daily_loss: default_max_daily_loss(),
            max_position_size: default_max_position_size(),
            max_slippage: default_max_slippage(),
            min_balance: default_min_balance(),
        }
    }
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: default_paper_balance(),
            start_price: default_paper_price(),
            half_spread: default_paper_half_spread(),
            fee_rate: default_paper_fee_rate(),
            volatility_bps: default_paper_volatility_bps(),
            tick_ms: default_paper_tick_ms(),
        }
    }
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_journal_path(),
        }
    }
}
