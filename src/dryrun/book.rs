//! Order Book Normalization
//!
//! Raw depth snapshots arrive as boundary floats and may contain junk:
//! non-finite numbers, non-positive prices or quantities, unsorted levels.
//! Normalization drops the junk, sorts bids descending / asks ascending and
//! truncates to the configured depth before anything downstream sees the
//! book. A crossed book after normalization is a data-integrity error, never
//! something to trade against.

use crate::dryrun::events::Side;
use crate::dryrun::fixed::Fp;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Default depth retained per side after normalization.
pub const DEFAULT_BOOK_DEPTH: usize = 20;

/// Raw price level as received from the depth feed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawLevel {
    pub price: f64,
    pub qty: f64,
}

/// Raw depth snapshot (boundary format).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawBook {
    pub bids: Vec<RawLevel>,
    pub asks: Vec<RawLevel>,
}

/// Validated fixed-point price level. Price and qty are strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Fp,
    pub qty: Fp,
}

/// Book integrity errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookError {
    /// best bid >= best ask after normalization.
    CrossedBook { best_bid: Fp, best_ask: Fp },
}

impl fmt::Display for BookError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookError::CrossedBook { best_bid, best_ask } => {
                write!(f, "crossed_book: best_bid={best_bid} best_ask={best_ask}")
            }
        }
    }
}

impl std::error::Error for BookError {}

/// Normalized order book: bids descending, asks ascending, junk removed,
/// truncated to depth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

fn sanitize_side(levels: &[RawLevel]) -> Vec<BookLevel> {
    levels
        .iter()
        .filter_map(|l| {
            if !l.price.is_finite() || !l.qty.is_finite() || l.price <= 0.0 || l.qty <= 0.0 {
                return None;
            }
            let price = Fp::from_f64(l.price)?;
            let qty = Fp::from_f64(l.qty)?;
            if price.is_positive() && qty.is_positive() {
                Some(BookLevel { price, qty })
            } else {
                None
            }
        })
        .collect()
}

impl NormalizedBook {
    pub fn from_raw(raw: &RawBook, depth: usize) -> Self {
        let mut bids = sanitize_side(&raw.bids);
        let mut asks = sanitize_side(&raw.asks);
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));
        bids.truncate(depth);
        asks.truncate(depth);
        Self { bids, asks }
    }

    #[inline]
    pub fn best_bid(&self) -> Option<&BookLevel> {
        self.bids.first()
    }

    #[inline]
    pub fn best_ask(&self) -> Option<&BookLevel> {
        self.asks.first()
    }

    #[inline]
    pub fn has_both_sides(&self) -> bool {
        !self.bids.is_empty() && !self.asks.is_empty()
    }

    /// Fails when best bid >= best ask.
    pub fn check_integrity(&self) -> Result<(), BookError> {
        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
            if bid.price >= ask.price {
                return Err(BookError::CrossedBook {
                    best_bid: bid.price,
                    best_ask: ask.price,
                });
            }
        }
        Ok(())
    }

    /// Mid price; `None` unless both sides are present.
    pub fn mid(&self) -> Option<Fp> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b.price + a.price).div(Fp::from_int(2))),
            _ => None,
        }
    }

    /// (best_ask - best_bid) / mid; `None` unless both sides are present.
    pub fn spread_pct(&self) -> Option<Fp> {
        let bid = self.best_bid()?.price;
        let ask = self.best_ask()?.price;
        let mid = self.mid()?;
        (ask - bid).checked_div(mid)
    }

    /// Levels on one side, best first.
    #[inline]
    pub fn side_levels(&self, side: Side) -> &[BookLevel] {
        match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        }
    }

    /// Sum of quantities over the top `n` levels of a side.
    pub fn sum_top_n(&self, side: Side, n: usize) -> Fp {
        self.side_levels(side).iter().take(n).map(|l| l.qty).sum()
    }
}
