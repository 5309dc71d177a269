//! Flip-Invalidation Governor
//!
//! Gates reversal of an open position on an opposing signal. A flip must
//! survive a minimum hold time, a PnL deadband (or a signal strong enough to
//! clear the hysteresis band), a spread gate and a persistence requirement
//! before the position is fully closed. The first qualifying opposite
//! evaluation only de-risks with a partial reduce; the full close waits for
//! the opposite thesis to persist.

use crate::dryrun::clock::Millis;
use crate::dryrun::events::Direction;
use crate::dryrun::fixed::Fp;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlipConfig {
    /// Minimum time since entry or last add-on before any flip action.
    pub min_hold_ms: i64,
    /// Losing-PnL deadband that lets a flip through on its own.
    pub deadband_pct: Fp,
    /// Consecutive opposite evaluations required for the full close.
    pub confirm_ticks: u32,
    /// Baseline entry score; the hysteresis band sits on top of it.
    pub entry_min_score: Fp,
    /// Hysteresis fraction; an opposite signal must beat
    /// `entry_min_score + hysteresis * 100` to bypass the deadband.
    pub hysteresis: Fp,
    /// Fraction of the position closed by the first confirmation.
    pub partial_reduce_pct: Fp,
}

impl Default for FlipConfig {
    fn default() -> Self {
        Self {
            min_hold_ms: 90_000,
            deadband_pct: Fp::from_raw(300_000), // 0.3%
            confirm_ticks: 3,
            entry_min_score: Fp::from_int(55),
            hysteresis: Fp::from_raw(15_000_000), // 0.15
            partial_reduce_pct: Fp::from_raw(40_000_000), // 40%
        }
    }
}

impl FlipConfig {
    /// Opposite-score threshold: `entry_min + hysteresis * 100`.
    pub fn hysteresis_score(&self) -> Fp {
        self.entry_min_score + self.hysteresis.mul(Fp::from_int(100))
    }
}

/// Why a flip evaluation did not confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlipBlock {
    MinHold,
    Deadband,
    Spread,
}

/// Outcome of one opposite-signal evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlipDecision {
    /// Conditions failed; counter state says why.
    Blocked(FlipBlock),
    /// Opposite thesis accumulating, not yet persistent enough.
    Pending { ticks: u32 },
    /// First qualifying confirmation: partial de-risk.
    ConfirmPartial { reduce_pct: Fp },
    /// Persistent opposite thesis: close the remainder and queue the flip.
    ConfirmFull,
}

/// Inputs for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct FlipContext {
    pub now_ms: Millis,
    pub last_entry_or_addon_ts: Millis,
    pub position_direction: Direction,
    pub signal_direction: Direction,
    pub signal_score: Fp,
    pub unrealized_pnl_pct: Fp,
    pub spread_pct: Fp,
    pub max_spread_pct: Fp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlipState {
    pub confirm_ticks: u32,
    pub last_opposite_side: Option<Direction>,
    pub partial_reduced: bool,
    pub last_partial_reduce_ts: Millis,
}

impl FlipState {
    pub fn reset(&mut self) {
        *self = FlipState::default();
    }

    /// Feed an aligned signal: the opposite streak is broken.
    pub fn observe_aligned(&mut self) {
        self.confirm_ticks = 0;
        self.last_opposite_side = None;
    }

    /// Evaluate an opposing signal. Call only when
    /// `ctx.signal_direction != ctx.position_direction`.
    pub fn evaluate(&mut self, config: &FlipConfig, ctx: &FlipContext) -> FlipDecision {
        debug_assert_ne!(ctx.signal_direction, ctx.position_direction);

        // Streak bookkeeping first: persistence is counted per evaluation,
        // resetting when the opposing side changes.
        if self.last_opposite_side == Some(ctx.signal_direction) {
            self.confirm_ticks += 1;
        } else {
            self.last_opposite_side = Some(ctx.signal_direction);
            self.confirm_ticks = 1;
        }

        if ctx.now_ms - ctx.last_entry_or_addon_ts < config.min_hold_ms {
            return FlipDecision::Blocked(FlipBlock::MinHold);
        }
        let deadband_hit = ctx.unrealized_pnl_pct <= -config.deadband_pct;
        let score_hit = ctx.signal_score >= config.hysteresis_score();
        if !deadband_hit && !score_hit {
            return FlipDecision::Blocked(FlipBlock::Deadband);
        }
        if ctx.spread_pct > ctx.max_spread_pct {
            return FlipDecision::Blocked(FlipBlock::Spread);
        }

        if !self.partial_reduced {
            self.partial_reduced = true;
            self.last_partial_reduce_ts = ctx.now_ms;
            return FlipDecision::ConfirmPartial {
                reduce_pct: config.partial_reduce_pct,
            };
        }
        if self.confirm_ticks >= config.confirm_ticks {
            return FlipDecision::ConfirmFull;
        }
        FlipDecision::Pending {
            ticks: self.confirm_ticks,
        }
    }
}
