//! Run Configuration
//!
//! External-facing run config with typed validation. Values arrive as
//! boundary floats and are converted to fixed-point exactly once, when the
//! engine config is built; everything after that is integer arithmetic.

use crate::dryrun::addon::AddonConfig;
use crate::dryrun::book::DEFAULT_BOOK_DEPTH;
use crate::dryrun::engine::{EngineConfig, ForcedCloseFallback};
use crate::dryrun::fixed::Fp;
use crate::dryrun::flip::FlipConfig;
use crate::dryrun::impact::MarketImpactConfig;
use crate::dryrun::metrics::DEFAULT_ATR_WINDOW;
use crate::dryrun::risk::RiskConfig;
use crate::dryrun::upstream::{verify_proxy, ProxyConfig, UpstreamError};
use crate::dryrun::winner::WinnerConfig;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a flip entry (or debug entry) is laddered into the book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntryLimitStrategy {
    /// Single MARKET IOC.
    #[default]
    Market,
    /// Post-only limit at the best same-side quote.
    Passive,
    /// Half MARKET, half passive limit.
    Split,
    /// Limit IOC at the best opposite quote.
    Aggressive,
}

/// Supervisor knobs. Everything here can be overridden per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionTunables {
    /// Minimum spacing between accepted depth events.
    pub min_event_interval_ms: i64,
    /// Spread ceiling used by add-on, flip and emergency gates.
    pub max_spread_pct: Fp,
    pub atr_window: usize,
    pub book_depth: usize,
    /// Qty for `submit_manual_test_order`.
    pub manual_test_qty: f64,
    /// Heuristic entries when idle (testing only).
    pub debug_aggressive_entry: bool,
    pub debug_entry_cooldown_ms: i64,
    pub entry_limit_strategy: EntryLimitStrategy,
    /// Charge the maker rate when a resting post-only GTC fills passively.
    pub maker_fee_for_resting: bool,
    pub forced_close_fallback: ForcedCloseFallback,
    pub winner: WinnerConfig,
    pub addon: AddonConfig,
    pub flip: FlipConfig,
    pub risk: RiskConfig,
}

impl Default for SessionTunables {
    fn default() -> Self {
        Self {
            min_event_interval_ms: 250,
            max_spread_pct: Fp::from_raw(300_000), // 0.3%
            atr_window: DEFAULT_ATR_WINDOW,
            book_depth: DEFAULT_BOOK_DEPTH,
            manual_test_qty: 0.01,
            debug_aggressive_entry: false,
            debug_entry_cooldown_ms: 60_000,
            entry_limit_strategy: EntryLimitStrategy::default(),
            maker_fee_for_resting: false,
            forced_close_fallback: ForcedCloseFallback::default(),
            winner: WinnerConfig::default(),
            addon: AddonConfig::default(),
            flip: FlipConfig::default(),
            risk: RiskConfig::default(),
        }
    }
}

/// Full run configuration as submitted by the session layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunConfig {
    pub run_id: String,
    pub symbols: Vec<String>,
    pub wallet_balance_start_usdt: f64,
    pub initial_margin_usdt: f64,
    pub leverage: f64,
    pub taker_fee_rate: f64,
    pub maker_fee_rate: f64,
    pub maintenance_margin_rate: f64,
    pub funding_rate: f64,
    pub funding_interval_ms: i64,
    #[serde(default)]
    pub funding_start_boundary_ms: Option<i64>,
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub market_impact: Option<MarketImpactConfig>,
    #[serde(default)]
    pub tunables: SessionTunables,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    SymbolsRequired,
    WalletBalanceStartMustBePositive,
    InitialMarginMustBePositive,
    LeverageMustBePositive,
    InvalidFundingIntervalMs { interval_ms: i64 },
    InvalidNumericValue { field: &'static str },
    Upstream(UpstreamError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SymbolsRequired => write!(f, "symbols_required"),
            Self::WalletBalanceStartMustBePositive => {
                write!(f, "wallet_balance_start_must_be_positive")
            }
            Self::InitialMarginMustBePositive => write!(f, "initial_margin_must_be_positive"),
            Self::LeverageMustBePositive => write!(f, "leverage_must_be_positive"),
            Self::InvalidFundingIntervalMs { interval_ms } => {
                write!(f, "invalid_funding_interval_ms: {interval_ms}")
            }
            Self::InvalidNumericValue { field } => {
                write!(f, "invalid_numeric_value: {field}")
            }
            Self::Upstream(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<UpstreamError> for ConfigError {
    fn from(e: UpstreamError) -> Self {
        Self::Upstream(e)
    }
}

fn to_fp(value: f64, field: &'static str) -> Result<Fp, ConfigError> {
    Fp::from_f64(value).ok_or(ConfigError::InvalidNumericValue { field })
}

impl DryRunConfig {
    /// A runnable default for tests and examples.
    pub fn sample(run_id: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            symbols: vec![symbol.into()],
            wallet_balance_start_usdt: 1_000.0,
            initial_margin_usdt: 100.0,
            leverage: 10.0,
            taker_fee_rate: 0.0004,
            maker_fee_rate: 0.0002,
            maintenance_margin_rate: 0.005,
            funding_rate: 0.0001,
            funding_interval_ms: 8 * 3_600_000,
            funding_start_boundary_ms: None,
            proxy: ProxyConfig::default(),
            market_impact: None,
            tunables: SessionTunables::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbols.is_empty() {
            return Err(ConfigError::SymbolsRequired);
        }
        if !(self.wallet_balance_start_usdt.is_finite() && self.wallet_balance_start_usdt > 0.0) {
            return Err(ConfigError::WalletBalanceStartMustBePositive);
        }
        if !(self.initial_margin_usdt.is_finite() && self.initial_margin_usdt > 0.0) {
            return Err(ConfigError::InitialMarginMustBePositive);
        }
        if !(self.leverage.is_finite() && self.leverage > 0.0) {
            return Err(ConfigError::LeverageMustBePositive);
        }
        if self.funding_interval_ms <= 0 {
            return Err(ConfigError::InvalidFundingIntervalMs {
                interval_ms: self.funding_interval_ms,
            });
        }
        verify_proxy(&self.proxy)?;
        Ok(())
    }

    /// Convert to the fixed-point engine config. Validation must pass first.
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        self.validate()?;
        Ok(EngineConfig {
            run_id: self.run_id.clone(),
            wallet_start: to_fp(self.wallet_balance_start_usdt, "wallet_balance_start_usdt")?,
            initial_margin: to_fp(self.initial_margin_usdt, "initial_margin_usdt")?,
            leverage: to_fp(self.leverage, "leverage")?,
            taker_fee_rate: to_fp(self.taker_fee_rate, "taker_fee_rate")?,
            maker_fee_rate: to_fp(self.maker_fee_rate, "maker_fee_rate")?,
            maintenance_margin_rate: to_fp(self.maintenance_margin_rate, "maintenance_margin_rate")?,
            funding_rate: to_fp(self.funding_rate, "funding_rate")?,
            funding_interval_ms: self.funding_interval_ms,
            funding_start_boundary_ms: self.funding_start_boundary_ms,
            book_depth: self.tunables.book_depth,
            impact: self.market_impact.clone().unwrap_or_default(),
            maker_fee_for_resting: self.tunables.maker_fee_for_resting,
            forced_close_fallback: self.tunables.forced_close_fallback,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_config_validates() {
        assert!(DryRunConfig::sample("run-1", "BTCUSDT").validate().is_ok());
    }

    #[test]
    fn test_empty_symbols_rejected() {
        let mut cfg = DryRunConfig::sample("run-1", "BTCUSDT");
        cfg.symbols.clear();
        assert_eq!(cfg.validate(), Err(ConfigError::SymbolsRequired));
    }

    #[test]
    fn test_nonpositive_wallet_rejected() {
        let mut cfg = DryRunConfig::sample("run-1", "BTCUSDT");
        cfg.wallet_balance_start_usdt = 0.0;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::WalletBalanceStartMustBePositive)
        );
        cfg.wallet_balance_start_usdt = f64::NAN;
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::WalletBalanceStartMustBePositive)
        );
    }

    #[test]
    fn test_bad_upstream_rejected() {
        let mut cfg = DryRunConfig::sample("run-1", "BTCUSDT");
        cfg.proxy.rest_base_url = "https://evil.example.com".to_string();
        assert!(matches!(cfg.validate(), Err(ConfigError::Upstream(_))));
    }

    #[test]
    fn test_engine_config_fixed_point_conversion() {
        let cfg = DryRunConfig::sample("run-1", "BTCUSDT");
        let engine = cfg.engine_config().unwrap();
        assert_eq!(engine.wallet_start, Fp::from_int(1_000));
        assert_eq!(engine.taker_fee_rate, Fp::from_bps(4));
    }

    #[test]
    fn test_error_codes_render_as_snake_case() {
        assert_eq!(ConfigError::SymbolsRequired.to_string(), "symbols_required");
        assert_eq!(
            ConfigError::LeverageMustBePositive.to_string(),
            "leverage_must_be_positive"
        );
    }
}
