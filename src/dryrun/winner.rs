//! Winner Management
//!
//! Stop logic for an open position: an initial R-stop placed on the losing
//! side, profit-lock step-ups that ratchet as favorable excursion accrues,
//! and an ATR trailing stop. All three are monotone in the favorable
//! direction; the active stop is whichever protects the most.

use crate::dryrun::events::{Direction, ReasonCode};
use crate::dryrun::fixed::Fp;
use serde::{Deserialize, Serialize};

/// One profit-lock rung: once favorable excursion reaches `trigger_r`
/// R-multiples, the stop rises to `lock_r` R-multiples above entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProfitLockStep {
    pub trigger_r: Fp,
    pub lock_r: Fp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinnerConfig {
    /// Floor on the initial stop distance, as a fraction of entry price.
    pub min_stop_pct: Fp,
    /// Initial stop distance in ATR multiples.
    pub r_atr_mult: Fp,
    /// Trailing stop distance in ATR multiples.
    pub trail_atr_mult: Fp,
    /// Profit-lock ladder, ascending trigger order.
    pub profit_lock_steps: Vec<ProfitLockStep>,
}

impl Default for WinnerConfig {
    fn default() -> Self {
        Self {
            min_stop_pct: Fp::from_raw(200_000), // 0.2%
            r_atr_mult: Fp::from_raw(150_000_000), // 1.5
            trail_atr_mult: Fp::from_int(2),
            profit_lock_steps: vec![
                ProfitLockStep {
                    trigger_r: Fp::ONE,
                    lock_r: Fp::from_raw(25_000_000), // +0.25R
                },
                ProfitLockStep {
                    trigger_r: Fp::from_int(2),
                    lock_r: Fp::ONE,
                },
                ProfitLockStep {
                    trigger_r: Fp::from_int(3),
                    lock_r: Fp::from_int(2),
                },
            ],
        }
    }
}

/// Close action emitted when the mark crosses the active stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopHit {
    pub reason: ReasonCode,
    pub stop_price: Fp,
}

/// Stop state for one open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinnerState {
    pub direction: Direction,
    pub entry_price: Fp,
    /// 1R in price terms.
    pub stop_distance: Fp,
    pub initial_stop: Fp,
    pub profit_lock_stop: Option<Fp>,
    pub trailing_stop: Option<Fp>,
    pub high_water: Fp,
    pub low_water: Fp,
}

impl WinnerState {
    pub fn new(direction: Direction, entry_price: Fp, atr: Fp, config: &WinnerConfig) -> Self {
        let stop_distance = entry_price
            .mul(config.min_stop_pct)
            .max(config.r_atr_mult.mul(atr));
        let initial_stop = match direction {
            Direction::Long => entry_price - stop_distance,
            Direction::Short => entry_price + stop_distance,
        };
        Self {
            direction,
            entry_price,
            stop_distance,
            initial_stop,
            profit_lock_stop: None,
            trailing_stop: None,
            high_water: entry_price,
            low_water: entry_price,
        }
    }

    /// Favorable excursion in R multiples.
    fn excursion_r(&self) -> Fp {
        let excursion = match self.direction {
            Direction::Long => self.high_water - self.entry_price,
            Direction::Short => self.entry_price - self.low_water,
        };
        excursion.checked_div(self.stop_distance).unwrap_or(Fp::ZERO)
    }

    /// The stop currently in force: the most protective of initial,
    /// profit-lock and trailing for this side.
    pub fn active_stop(&self) -> Fp {
        let mut stop = self.initial_stop;
        for candidate in [self.profit_lock_stop, self.trailing_stop].into_iter().flatten() {
            stop = match self.direction {
                Direction::Long => stop.max(candidate),
                Direction::Short => stop.min(candidate),
            };
        }
        stop
    }

    /// Advance water marks and stops, then test whether the mark crossed the
    /// active stop adversely.
    pub fn update(&mut self, mark_price: Fp, atr: Fp, config: &WinnerConfig) -> Option<StopHit> {
        self.high_water = self.high_water.max(mark_price);
        self.low_water = self.low_water.min(mark_price);

        // Profit-lock step-ups, monotone.
        let r = self.excursion_r();
        for step in &config.profit_lock_steps {
            if r >= step.trigger_r {
                let gained = step.lock_r.mul(self.stop_distance);
                let candidate = match self.direction {
                    Direction::Long => self.entry_price + gained,
                    Direction::Short => self.entry_price - gained,
                };
                self.profit_lock_stop = Some(match (self.profit_lock_stop, self.direction) {
                    (Some(existing), Direction::Long) => existing.max(candidate),
                    (Some(existing), Direction::Short) => existing.min(candidate),
                    (None, _) => candidate,
                });
            }
        }

        // ATR trail, monotone in the favorable direction.
        let trail_gap = config.trail_atr_mult.mul(atr);
        if trail_gap.is_positive() {
            let candidate = match self.direction {
                Direction::Long => mark_price - trail_gap,
                Direction::Short => mark_price + trail_gap,
            };
            self.trailing_stop = Some(match (self.trailing_stop, self.direction) {
                (Some(existing), Direction::Long) => existing.max(candidate),
                (Some(existing), Direction::Short) => existing.min(candidate),
                (None, _) => candidate,
            });
        }

        let stop = self.active_stop();
        let crossed = match self.direction {
            Direction::Long => mark_price <= stop,
            Direction::Short => mark_price >= stop,
        };
        if !crossed {
            return None;
        }
        let reason = if self.trailing_stop == Some(stop) {
            ReasonCode::TrailStop
        } else {
            ReasonCode::ProfitLock
        };
        Some(StopHit {
            reason,
            stop_price: stop,
        })
    }
}
