//! Derived Market Metrics
//!
//! Per-event rolling metrics the supervisor consults before synthesizing
//! orders: ATR over mark-price diffs, order-book imbalance, volatility
//! regime and spread health. History lives in a bounded ring so a long
//! session never grows memory.

use crate::dryrun::book::NormalizedBook;
use crate::dryrun::events::Side;
use crate::dryrun::fixed::Fp;
use crate::dryrun::ring::BoundedRing;
use serde::{Deserialize, Serialize};

/// Default ATR window (number of successive diffs averaged).
pub const DEFAULT_ATR_WINDOW: usize = 14;
/// Depth used for order-book imbalance.
pub const OBI_DEPTH: usize = 10;

/// Volatility regime relative to the longer-horizon average ATR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VolatilityRegime {
    Low,
    Medium,
    High,
}

/// Snapshot of the derived metrics after one event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub mark_price: Fp,
    pub atr: Fp,
    pub avg_atr: Fp,
    pub regime: VolatilityRegime,
    /// (sum_bids_topN - sum_asks_topN) / sum, in [-1, 1].
    pub obi: Fp,
    pub spread_pct: Fp,
    pub spread_breach_count: u32,
}

#[derive(Debug, Clone)]
pub struct MetricsTracker {
    prices: BoundedRing<Fp>,
    atr_window: usize,
    max_spread_pct: Fp,
    spread_breach_count: u32,
}

impl MetricsTracker {
    pub fn new(atr_window: usize, max_spread_pct: Fp) -> Self {
        let atr_window = atr_window.max(2);
        // History must cover the 2x-window average ATR with headroom.
        let capacity = (atr_window * 4).max(40);
        Self {
            prices: BoundedRing::new(capacity),
            atr_window,
            max_spread_pct,
            spread_breach_count: 0,
        }
    }

    /// Mean absolute successive diff over the last `window` diffs.
    fn mean_abs_diff(&self, window: usize) -> Fp {
        let prices: Vec<Fp> = self.prices.tail(window + 1).copied().collect();
        if prices.len() < 2 {
            return Fp::ZERO;
        }
        let sum: Fp = prices.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
        sum.div(Fp::from_int((prices.len() - 1) as i64))
    }

    pub fn update(&mut self, mark_price: Fp, book: &NormalizedBook) -> DerivedMetrics {
        self.prices.push(mark_price);

        let atr = self.mean_abs_diff(self.atr_window);
        let avg_atr = self.mean_abs_diff(self.atr_window * 2);

        const HIGH_RATIO: Fp = Fp::from_raw(150_000_000); // 1.5
        const LOW_RATIO: Fp = Fp::from_raw(70_000_000); // 0.7
        let regime = match atr.checked_div(avg_atr) {
            Some(ratio) if ratio > HIGH_RATIO => VolatilityRegime::High,
            Some(ratio) if ratio < LOW_RATIO => VolatilityRegime::Low,
            _ => VolatilityRegime::Medium,
        };

        let bid_qty = book.sum_top_n(Side::Buy, OBI_DEPTH);
        let ask_qty = book.sum_top_n(Side::Sell, OBI_DEPTH);
        let obi = (bid_qty - ask_qty)
            .checked_div(bid_qty + ask_qty)
            .unwrap_or(Fp::ZERO);

        let spread_pct = book.spread_pct().unwrap_or(Fp::ZERO);
        if spread_pct > self.max_spread_pct {
            self.spread_breach_count += 1;
        } else {
            self.spread_breach_count = 0;
        }

        DerivedMetrics {
            mark_price,
            atr,
            avg_atr,
            regime,
            obi,
            spread_pct,
            spread_breach_count: self.spread_breach_count,
        }
    }

    pub fn price_history_len(&self) -> usize {
        self.prices.len()
    }

    pub fn spread_breach_count(&self) -> u32 {
        self.spread_breach_count
    }

    pub fn reset(&mut self) {
        self.prices.clear();
        self.spread_breach_count = 0;
    }
}
