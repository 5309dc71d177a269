//! Risk Governor
//!
//! Two jobs: size new exposure from equity, price and volatility, and pull
//! the emergency brake. Sizing is conservative by construction (risk budget
//! per trade, notional capped by leverage, scaled down in a HIGH volatility
//! regime). The emergency check flattens immediately on margin exhaustion,
//! a hard drawdown floor or a persistently unhealthy spread.

use crate::dryrun::fixed::Fp;
use crate::dryrun::metrics::VolatilityRegime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Equity fraction risked per entry.
    pub risk_per_trade_pct: Fp,
    /// Leverage ceiling for sizing.
    pub max_leverage: Fp,
    /// Smallest order the venue would accept.
    pub min_qty: Fp,
    /// Margin-health level at or below which the emergency fires.
    pub emergency_margin_health: Fp,
    /// Hard floor on unrealized PnL percentage (positive number, applied
    /// as `upnl <= -max(4 * deadband, floor)`).
    pub emergency_upnl_floor: Fp,
    /// Consecutive spread breaches that force a flatten.
    pub spread_breach_limit: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_per_trade_pct: Fp::from_raw(1_000_000), // 1%
            max_leverage: Fp::from_int(10),
            min_qty: Fp::from_raw(100_000), // 0.001
            emergency_margin_health: Fp::from_raw(5_000_000), // 0.05
            emergency_upnl_floor: Fp::from_raw(1_200_000), // 1.2%
            spread_breach_limit: 3,
        }
    }
}

/// Liquidation-proximity band derived from margin health.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LiquidationRisk {
    Green,
    Yellow,
    Orange,
    Red,
    Critical,
}

impl LiquidationRisk {
    pub fn from_margin_health(health: Fp) -> Self {
        if health > Fp::from_raw(50_000_000) {
            Self::Green
        } else if health > Fp::from_raw(25_000_000) {
            Self::Yellow
        } else if health > Fp::from_raw(10_000_000) {
            Self::Orange
        } else if health > Fp::from_raw(5_000_000) {
            Self::Red
        } else {
            Self::Critical
        }
    }

    pub fn is_emergency(&self) -> bool {
        matches!(self, Self::Red | Self::Critical)
    }
}

/// Sizing output for one entry or add-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sizing {
    pub qty: Fp,
    pub leverage: Fp,
}

/// Why the emergency flatten fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmergencyTrigger {
    MarginHealth,
    LiquidationRisk,
    DrawdownFloor,
    SpreadPersistence,
}

/// Inputs for the emergency check.
#[derive(Debug, Clone, Copy)]
pub struct EmergencyContext {
    pub margin_health: Fp,
    pub unrealized_pnl_pct: Fp,
    pub spread_breach_count: u32,
    /// The flip governor's deadband, reused for the drawdown floor.
    pub flip_deadband_pct: Fp,
}

#[derive(Debug, Clone, Default)]
pub struct RiskGovernor {
    config: RiskConfig,
}

impl RiskGovernor {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Compute entry qty and leverage. Risk budget over the stop distance,
    /// notional capped at `equity * leverage`, signal score scaling in
    /// [0.25, 1], regime haircut in HIGH volatility.
    pub fn size_entry(
        &self,
        equity: Fp,
        price: Fp,
        atr: Fp,
        regime: VolatilityRegime,
        signal_score: Fp,
    ) -> Option<Sizing> {
        if !equity.is_positive() || !price.is_positive() {
            return None;
        }
        let leverage = match regime {
            VolatilityRegime::High => self.config.max_leverage.div(Fp::from_int(2)),
            VolatilityRegime::Medium => self
                .config
                .max_leverage
                .mul(Fp::from_raw(75_000_000)), // 0.75x
            VolatilityRegime::Low => self.config.max_leverage,
        };

        // Stop distance proxy: 1.5 ATR, floored at 10 bps of price.
        let stop_distance = atr
            .mul(Fp::from_raw(150_000_000))
            .max(price.mul(Fp::from_raw(100_000)));
        let risk_amount = equity.mul(self.config.risk_per_trade_pct);
        let mut qty = risk_amount.checked_div(stop_distance)?;

        // Score scaling in [0.25, 1] of the base size.
        let score_scale = signal_score
            .div(Fp::from_int(100))
            .clamp(Fp::from_raw(25_000_000), Fp::ONE);
        qty = qty.mul(score_scale);

        // Notional cap.
        let max_notional = equity.mul(leverage);
        let max_qty = max_notional.checked_div(price)?;
        qty = qty.min(max_qty);

        if qty < self.config.min_qty {
            return None;
        }
        Some(Sizing { qty, leverage })
    }

    /// Emergency flatten decision.
    pub fn check_emergency(&self, ctx: &EmergencyContext) -> Option<EmergencyTrigger> {
        if ctx.margin_health <= self.config.emergency_margin_health {
            return Some(EmergencyTrigger::MarginHealth);
        }
        if LiquidationRisk::from_margin_health(ctx.margin_health).is_emergency() {
            return Some(EmergencyTrigger::LiquidationRisk);
        }
        let floor = ctx
            .flip_deadband_pct
            .mul(Fp::from_int(4))
            .max(self.config.emergency_upnl_floor);
        if ctx.unrealized_pnl_pct <= -floor {
            return Some(EmergencyTrigger::DrawdownFloor);
        }
        if ctx.spread_breach_count >= self.config.spread_breach_limit {
            return Some(EmergencyTrigger::SpreadPersistence);
        }
        None
    }
}
