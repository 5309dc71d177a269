//! Matching and Accounting Engine
//!
//! The single entry point is `process_event`: one market event in, one audit
//! report out, with every intermediate value carried in fixed-point. The
//! step order inside an event is contractual:
//!
//! 1. Admission (timestamp validity and monotonicity)
//! 2. Book normalization and integrity
//! 3. Funding gap loop
//! 4. TTL cancels and pending-limit rematch
//! 5. New order execution
//! 6. Liquidation check (may issue a forced close)
//! 7. Wallet reconciliation
//! 8. Report emission
//!
//! # Accounting Identity
//!
//! After every event:
//! `wallet_after == clamp0(wallet_before + realized_pnl - fee + funding_impact)`
//! where the clamp to zero is legal only when the event triggered a
//! liquidation. Any other mismatch is a fatal invariant violation and the
//! event fails with `wallet_reconciliation_failed`.

use crate::dryrun::book::{BookError, NormalizedBook};
use crate::dryrun::clock::{floor_to_interval, Millis};
use crate::dryrun::events::{
    DryRunEvent, DryRunOrderRequest, EventReport, OrderResult, OrderStatus, OrderType, ReasonCode,
    Side, TimeInForce,
};
use crate::dryrun::fixed::Fp;
use crate::dryrun::ids::{validate_order_id, IdGenerator, OrderFingerprint, TradeFingerprint};
use crate::dryrun::impact::{adjust_fill, FillObservation, MarketImpactConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Price used to synthesize the residual of a forced close when the book has
/// nothing left to match against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForcedCloseFallback {
    #[default]
    MarkPrice,
    LastVwap,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub run_id: String,
    pub wallet_start: Fp,
    pub initial_margin: Fp,
    pub leverage: Fp,
    pub taker_fee_rate: Fp,
    pub maker_fee_rate: Fp,
    pub maintenance_margin_rate: Fp,
    pub funding_rate: Fp,
    pub funding_interval_ms: i64,
    /// Explicit first funding boundary; defaults to the first event's
    /// timestamp floored to the interval.
    pub funding_start_boundary_ms: Option<Millis>,
    pub book_depth: usize,
    pub impact: MarketImpactConfig,
    /// Charge the maker rate when a resting post-only GTC fills passively.
    pub maker_fee_for_resting: bool,
    pub forced_close_fallback: ForcedCloseFallback,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    InvalidEventTimestamp { ts_ms: Millis },
    NonMonotonicEventTimestamp { ts_ms: Millis, last_ms: Millis },
    EmptyBookSide,
    CrossedBook { best_bid: Fp, best_ask: Fp },
    InvalidLeverage,
    InvalidFundingIntervalMs { interval_ms: i64 },
    RandomLikeOrderId { order_id: String },
    WalletReconciliationFailed { expected: Fp, actual: Fp },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEventTimestamp { ts_ms } => {
                write!(f, "invalid_event_timestamp: {ts_ms}")
            }
            Self::NonMonotonicEventTimestamp { ts_ms, last_ms } => {
                write!(f, "non_monotonic_event_timestamp: {ts_ms} <= {last_ms}")
            }
            Self::EmptyBookSide => write!(f, "empty_book_side"),
            Self::CrossedBook { best_bid, best_ask } => {
                write!(f, "crossed_book: {best_bid} >= {best_ask}")
            }
            Self::InvalidLeverage => write!(f, "invalid_leverage"),
            Self::InvalidFundingIntervalMs { interval_ms } => {
                write!(f, "invalid_funding_interval_ms: {interval_ms}")
            }
            Self::RandomLikeOrderId { order_id } => {
                write!(f, "invalid_random_like_order_id: {order_id}")
            }
            Self::WalletReconciliationFailed { expected, actual } => {
                write!(f, "wallet_reconciliation_failed: expected {expected}, wallet {actual}")
            }
        }
    }
}

impl std::error::Error for EngineError {}

/// The one open position, side encoded in the sign of the quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub signed_qty: Fp,
    pub entry_price: Fp,
    pub entry_ts_ms: Millis,
}

impl Position {
    #[inline]
    pub fn side(&self) -> Side {
        if self.signed_qty.is_positive() {
            Side::Buy
        } else {
            Side::Sell
        }
    }

    /// Signed mark-to-market PnL.
    #[inline]
    pub fn unrealized(&self, mark: Fp) -> Fp {
        (mark - self.entry_price).mul(self.signed_qty)
    }

    #[inline]
    pub fn notional(&self, price: Fp) -> Fp {
        self.signed_qty.abs().mul(price)
    }
}

/// A resting GTC limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingLimit {
    pub order_id: String,
    pub side: Side,
    pub price: Fp,
    pub remaining_qty: Fp,
    pub reduce_only: bool,
    pub post_only: bool,
    pub created_ts_ms: Millis,
    pub client_order_id: Option<String>,
    pub reason_code: ReasonCode,
    pub addon_index: Option<u32>,
    pub reprice_attempt: u32,
    pub ttl_ms: Option<i64>,
}

/// Rehydratable engine state. Opaque to callers; produced and consumed by
/// the engine only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub wallet: Fp,
    pub position: Option<Position>,
    pub pending_limits: Vec<PendingLimit>,
    pub last_event_ts_ms: Millis,
    pub next_funding_boundary_ms: Option<Millis>,
    pub sequence: u64,
    pub ids: IdGenerator,
    pub leverage_override: Option<Fp>,
}

/// Caller-facing view of the account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub wallet: Fp,
    pub position: Option<Position>,
    pub open_limits: Vec<PendingLimit>,
    pub next_funding_boundary_ms: Option<Millis>,
    pub margin_health: Option<Fp>,
}

struct FillOutcome {
    realized: Fp,
    trade_ids: Vec<String>,
}

pub struct DryRunEngine {
    config: EngineConfig,
    wallet: Fp,
    position: Option<Position>,
    pending: BTreeMap<String, PendingLimit>,
    last_event_ts: Millis,
    next_funding_boundary: Option<Millis>,
    sequence: u64,
    ids: IdGenerator,
    leverage_override: Option<Fp>,
    last_vwap: Option<Fp>,
}

impl DryRunEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        if config.funding_interval_ms <= 0 {
            return Err(EngineError::InvalidFundingIntervalMs {
                interval_ms: config.funding_interval_ms,
            });
        }
        if !config.leverage.is_positive() {
            return Err(EngineError::InvalidLeverage);
        }
        let ids = IdGenerator::new(config.run_id.clone());
        Ok(Self {
            wallet: config.wallet_start,
            position: None,
            pending: BTreeMap::new(),
            last_event_ts: 0,
            next_funding_boundary: None,
            sequence: 0,
            ids,
            leverage_override: None,
            last_vwap: None,
            config,
        })
    }

    pub fn wallet(&self) -> Fp {
        self.wallet
    }

    pub fn position(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    pub fn pending_limits(&self) -> impl Iterator<Item = &PendingLimit> {
        self.pending.values()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Leverage used by the position-cap rule; must stay positive.
    pub fn set_leverage_override(&mut self, leverage: Fp) -> Result<(), EngineError> {
        if !leverage.is_positive() {
            return Err(EngineError::InvalidLeverage);
        }
        self.leverage_override = Some(leverage);
        Ok(())
    }

    fn effective_leverage(&self) -> Fp {
        self.leverage_override.unwrap_or(self.config.leverage)
    }

    /// `(equity - maintenance) / equity` clamped to <= 1; -1 when equity is
    /// non-positive.
    pub fn margin_health(&self, mark: Fp) -> Fp {
        let unrealized = self
            .position
            .as_ref()
            .map(|p| p.unrealized(mark))
            .unwrap_or(Fp::ZERO);
        let equity = self.wallet + unrealized;
        if !equity.is_positive() {
            return -Fp::ONE;
        }
        let maintenance = self
            .position
            .as_ref()
            .map(|p| p.notional(mark).mul(self.config.maintenance_margin_rate))
            .unwrap_or(Fp::ZERO);
        (equity - maintenance).div(equity).min(Fp::ONE)
    }

    pub fn get_state_snapshot(&self, mark: Option<Fp>) -> StateSnapshot {
        StateSnapshot {
            wallet: self.wallet,
            position: self.position,
            open_limits: self.pending.values().cloned().collect(),
            next_funding_boundary_ms: self.next_funding_boundary,
            margin_health: mark.map(|m| self.margin_health(m)),
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            wallet: self.wallet,
            position: self.position,
            pending_limits: self.pending.values().cloned().collect(),
            last_event_ts_ms: self.last_event_ts,
            next_funding_boundary_ms: self.next_funding_boundary,
            sequence: self.sequence,
            ids: self.ids.clone(),
            leverage_override: self.leverage_override,
        }
    }

    /// Rehydrate without replay.
    pub fn restore_state(&mut self, snapshot: EngineSnapshot) {
        self.wallet = snapshot.wallet;
        self.position = snapshot.position;
        self.pending = snapshot
            .pending_limits
            .into_iter()
            .map(|p| (p.order_id.clone(), p))
            .collect();
        self.last_event_ts = snapshot.last_event_ts_ms;
        self.next_funding_boundary = snapshot.next_funding_boundary_ms;
        self.sequence = snapshot.sequence;
        self.ids = snapshot.ids;
        self.leverage_override = snapshot.leverage_override;
    }

    // =========================================================================
    // EVENT PROCESSING
    // =========================================================================

    pub fn process_event(&mut self, event: &DryRunEvent) -> Result<EventReport, EngineError> {
        // Step 1: admission.
        if event.timestamp_ms <= 0 {
            return Err(EngineError::InvalidEventTimestamp {
                ts_ms: event.timestamp_ms,
            });
        }
        if self.last_event_ts > 0 && event.timestamp_ms <= self.last_event_ts {
            return Err(EngineError::NonMonotonicEventTimestamp {
                ts_ms: event.timestamp_ms,
                last_ms: self.last_event_ts,
            });
        }

        // Step 2: normalization and integrity.
        let book = NormalizedBook::from_raw(&event.book, self.config.book_depth);
        book.check_integrity().map_err(|e| match e {
            BookError::CrossedBook { best_bid, best_ask } => {
                EngineError::CrossedBook { best_bid, best_ask }
            }
        })?;
        if !book.has_both_sides() {
            return Err(EngineError::EmptyBookSide);
        }
        let mark = event
            .mark_price
            .filter(|p| p.is_positive())
            .or_else(|| book.mid())
            .ok_or(EngineError::EmptyBookSide)?;

        let ts = event.timestamp_ms;
        self.last_event_ts = ts;

        let wallet_before = self.wallet;
        let mut realized_total = Fp::ZERO;
        let mut fee_total = Fp::ZERO;
        let mut results: Vec<OrderResult> = Vec::new();
        let mut liquidation_triggered = false;

        // Step 3: funding gap loop.
        let funding_impact = self.apply_funding(ts, mark);

        // Working book: fills within this event consume depth.
        let mut working = book.clone();

        // Step 4: TTL cancels, then rematch survivors.
        self.expire_ttl_limits(ts, &mut results);
        self.rematch_pending(
            &mut working,
            mark,
            ts,
            &mut results,
            &mut realized_total,
            &mut fee_total,
        )?;

        // Step 5: new orders.
        for req in &event.orders {
            let result = self.execute_order(
                req,
                &mut working,
                mark,
                ts,
                false,
                &mut realized_total,
                &mut fee_total,
            )?;
            results.push(result);
        }

        // Step 6: liquidation check.
        if let Some(pos) = self.position {
            let equity = self.wallet + pos.unrealized(mark);
            let maintenance = pos.notional(mark).mul(self.config.maintenance_margin_rate);
            let close_fee = pos.notional(mark).mul(self.config.taker_fee_rate);
            if equity <= maintenance + close_fee {
                liquidation_triggered = true;
                debug!(
                    equity = %equity,
                    maintenance = %maintenance,
                    "liquidation triggered, forcing close"
                );
                let forced = DryRunOrderRequest::market(
                    pos.side().opposite(),
                    pos.signed_qty.abs(),
                    true,
                    ReasonCode::ForcedLiquidation,
                );
                let result = self.execute_order(
                    &forced,
                    &mut working,
                    mark,
                    ts,
                    true,
                    &mut realized_total,
                    &mut fee_total,
                )?;
                results.push(result);
                self.pending.clear();
            }
        }

        // Step 7: reconciliation.
        let mut expected = wallet_before + realized_total - fee_total + funding_impact;
        if liquidation_triggered && expected.is_negative() {
            expected = Fp::ZERO;
            if self.wallet.is_negative() {
                self.wallet = Fp::ZERO;
            }
        }
        if expected != self.wallet {
            return Err(EngineError::WalletReconciliationFailed {
                expected,
                actual: self.wallet,
            });
        }

        // Step 8: emit.
        self.sequence += 1;
        let event_id = self.ids.next_event_id(ts);
        Ok(EventReport {
            run_id: self.config.run_id.clone(),
            event_timestamp_ms: ts,
            sequence: self.sequence,
            event_id,
            wallet_before,
            wallet_after: self.wallet,
            realized_pnl: realized_total,
            fee: fee_total,
            funding_impact,
            reconciliation_expected_after: expected,
            margin_health: self.margin_health(mark),
            liquidation_triggered,
            order_results: results,
        })
    }

    // =========================================================================
    // FUNDING
    // =========================================================================

    /// Apply every funding boundary crossed since the last event. Returns the
    /// summed wallet impact.
    fn apply_funding(&mut self, ts: Millis, mark: Fp) -> Fp {
        let interval = self.config.funding_interval_ms;
        let mut boundary = match self.next_funding_boundary {
            Some(b) => b,
            None => {
                let base = self
                    .config
                    .funding_start_boundary_ms
                    .unwrap_or_else(|| floor_to_interval(ts, interval));
                base + interval
            }
        };
        let mut total = Fp::ZERO;
        while ts >= boundary {
            if let Some(pos) = &self.position {
                // Longs pay when the rate is positive, shorts receive.
                let sign = Fp::from_int(pos.signed_qty.signum() as i64);
                let impact = -sign
                    .mul(pos.signed_qty.abs())
                    .mul(mark)
                    .mul(self.config.funding_rate);
                total += impact;
            }
            boundary += interval;
        }
        self.next_funding_boundary = Some(boundary);
        self.wallet += total;
        total
    }

    // =========================================================================
    // PENDING LIMITS
    // =========================================================================

    fn expire_ttl_limits(&mut self, ts: Millis, results: &mut Vec<OrderResult>) {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| {
                p.ttl_ms
                    .map(|ttl| ts > p.created_ts_ms + ttl)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(p) = self.pending.remove(&id) {
                results.push(OrderResult {
                    order_id: p.order_id,
                    status: OrderStatus::Canceled,
                    side: p.side,
                    order_type: OrderType::Limit,
                    requested_qty: p.remaining_qty,
                    filled_qty: Fp::ZERO,
                    remaining_qty: p.remaining_qty,
                    avg_fill_price: None,
                    fee: Fp::ZERO,
                    realized_pnl: Fp::ZERO,
                    slippage_bps: Fp::ZERO,
                    market_impact_bps: Fp::ZERO,
                    reason_text: "GTC limit expired by TTL".to_string(),
                    reason_code: ReasonCode::LimitTtlCancel,
                    addon_index: p.addon_index,
                    reprice_attempt: p.reprice_attempt,
                    client_order_id: p.client_order_id,
                    trade_ids: Vec::new(),
                });
            }
        }
    }

    /// Run surviving GTC limits through the same execution path as new
    /// orders. A result is emitted only when something filled.
    fn rematch_pending(
        &mut self,
        working: &mut NormalizedBook,
        mark: Fp,
        ts: Millis,
        results: &mut Vec<OrderResult>,
        realized_total: &mut Fp,
        fee_total: &mut Fp,
    ) -> Result<(), EngineError> {
        let ids: Vec<String> = self.pending.keys().cloned().collect();
        for id in ids {
            let Some(pending) = self.pending.get(&id).cloned() else {
                continue;
            };
            // Orphan reduce-only limits are tolerated but never matched
            // against a missing or same-side position.
            if pending.reduce_only {
                let reduces = self
                    .position
                    .map(|p| p.side() == pending.side.opposite())
                    .unwrap_or(false);
                if !reduces {
                    continue;
                }
            }
            // The cap rule applies to rematches exactly as to new orders.
            let match_qty = self.cap_allowed_qty(
                pending.side,
                pending.remaining_qty,
                pending.reduce_only,
                pending.price,
            );
            if !match_qty.is_positive() {
                continue;
            }
            let pre_walk = working.clone();
            let (filled, notional) = walk_book(working, pending.side, match_qty, Some(pending.price));
            if !filled.is_positive() {
                continue;
            }
            let raw_avg = notional.div(filled);
            self.last_vwap = Some(raw_avg);
            let obs = FillObservation {
                side: pending.side,
                order_type: OrderType::Limit,
                tif: TimeInForce::Gtc,
                requested_qty: pending.remaining_qty,
                filled_qty: filled,
                avg_fill_price: raw_avg,
            };
            let impact = adjust_fill(&self.config.impact, &obs, &pre_walk);
            let adjusted_notional = filled.mul(impact.adjusted_avg_price);

            let outcome = self.apply_fill(pending.side, filled, impact.adjusted_avg_price, ts);
            let fee_rate = if pending.post_only && self.config.maker_fee_for_resting {
                self.config.maker_fee_rate
            } else {
                self.config.taker_fee_rate
            };
            let fee = adjusted_notional.abs().mul(fee_rate);
            self.wallet += outcome.realized - fee;
            *realized_total += outcome.realized;
            *fee_total += fee;

            let remaining = pending.remaining_qty - filled;
            let status = if remaining.is_positive() {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Filled
            };
            if remaining.is_positive() {
                if let Some(p) = self.pending.get_mut(&id) {
                    p.remaining_qty = remaining;
                }
            } else {
                self.pending.remove(&id);
            }
            results.push(OrderResult {
                order_id: pending.order_id.clone(),
                status,
                side: pending.side,
                order_type: OrderType::Limit,
                requested_qty: pending.remaining_qty,
                filled_qty: filled,
                remaining_qty: remaining,
                avg_fill_price: Some(impact.adjusted_avg_price),
                fee,
                realized_pnl: outcome.realized,
                slippage_bps: impact.slippage_bps,
                market_impact_bps: impact.market_impact_bps,
                reason_text: "resting limit crossed".to_string(),
                reason_code: pending.reason_code,
                addon_index: pending.addon_index,
                reprice_attempt: pending.reprice_attempt,
                client_order_id: pending.client_order_id.clone(),
                trade_ids: outcome.trade_ids,
            });
        }
        Ok(())
    }

    // =========================================================================
    // ORDER EXECUTION
    // =========================================================================

    #[allow(clippy::too_many_arguments)]
    fn execute_order(
        &mut self,
        req: &DryRunOrderRequest,
        working: &mut NormalizedBook,
        mark: Fp,
        ts: Millis,
        forced: bool,
        realized_total: &mut Fp,
        fee_total: &mut Fp,
    ) -> Result<OrderResult, EngineError> {
        let order_id = self.ids.next_order_id(&OrderFingerprint {
            ts_ms: ts,
            side: req.side,
            qty: req.qty,
            order_type: req.order_type,
            price: req.price,
        });
        validate_order_id(&order_id).map_err(|e| match e {
            crate::dryrun::ids::IdError::RandomLikeOrderId { order_id } => {
                EngineError::RandomLikeOrderId { order_id }
            }
        })?;

        let reject = |reason_code: ReasonCode, text: &str| OrderResult {
            order_id: order_id.clone(),
            status: OrderStatus::Rejected,
            side: req.side,
            order_type: req.order_type,
            requested_qty: req.qty,
            filled_qty: Fp::ZERO,
            remaining_qty: req.qty,
            avg_fill_price: None,
            fee: Fp::ZERO,
            realized_pnl: Fp::ZERO,
            slippage_bps: Fp::ZERO,
            market_impact_bps: Fp::ZERO,
            reason_text: text.to_string(),
            reason_code,
            addon_index: req.addon_index,
            reprice_attempt: req.reprice_attempt,
            client_order_id: req.client_order_id.clone(),
            trade_ids: Vec::new(),
        };

        // Validation (forced closes are engine-synthesized and pre-validated).
        if !forced {
            if !req.qty.is_positive() {
                return Ok(reject(ReasonCode::InvalidQty, "qty must be positive"));
            }
            if req.order_type == OrderType::Limit
                && !req.price.map(|p| p.is_positive()).unwrap_or(false)
            {
                return Ok(reject(
                    ReasonCode::InvalidLimitPrice,
                    "limit orders require a positive price",
                ));
            }
            if req.reduce_only {
                let reduces = self
                    .position
                    .map(|p| p.side() == req.side.opposite())
                    .unwrap_or(false);
                if !reduces {
                    return Ok(reject(
                        ReasonCode::ReduceOnlyRejected,
                        "reduce-only requires an opposite position",
                    ));
                }
            }
        }

        let limit_price = match req.order_type {
            OrderType::Limit => req.price,
            OrderType::Market => None,
        };

        // Post-only must rest: reject if it would cross.
        if req.post_only && req.order_type == OrderType::Limit && req.tif == TimeInForce::Gtc {
            if let Some(price) = req.price {
                let crosses = match req.side {
                    Side::Buy => working.best_ask().map(|a| price >= a.price).unwrap_or(false),
                    Side::Sell => working.best_bid().map(|b| price <= b.price).unwrap_or(false),
                };
                if crosses {
                    return Ok(reject(
                        ReasonCode::OrderRejected,
                        "post-only limit would cross",
                    ));
                }
                self.rest_limit(req, &order_id, price, req.qty, ts);
                return Ok(OrderResult {
                    order_id,
                    status: OrderStatus::New,
                    side: req.side,
                    order_type: req.order_type,
                    requested_qty: req.qty,
                    filled_qty: Fp::ZERO,
                    remaining_qty: req.qty,
                    avg_fill_price: None,
                    fee: Fp::ZERO,
                    realized_pnl: Fp::ZERO,
                    slippage_bps: Fp::ZERO,
                    market_impact_bps: Fp::ZERO,
                    reason_text: "post-only resting".to_string(),
                    reason_code: req.reason_code,
                    addon_index: req.addon_index,
                    reprice_attempt: req.reprice_attempt,
                    client_order_id: req.client_order_id.clone(),
                    trade_ids: Vec::new(),
                });
            }
        }

        let ref_price = limit_price
            .or_else(|| working.side_levels(req.side.opposite()).first().map(|l| l.price))
            .unwrap_or(mark);
        let allowed = self.cap_allowed_qty(req.side, req.qty, req.reduce_only || forced, ref_price);
        if !allowed.is_positive() {
            return Ok(reject(
                ReasonCode::PositionLimitRejected,
                "position cap leaves no executable quantity",
            ));
        }

        // Depth walk.
        let pre_walk = working.clone();
        let (mut filled, mut notional) = walk_book(working, req.side, allowed, limit_price);

        // Forced close synthesizes the residual: VWAP of what matched, or
        // the fallback price when nothing matched.
        if forced && filled < allowed {
            let residual = allowed - filled;
            let synth_price = if filled.is_positive() {
                notional.div(filled)
            } else {
                match self.config.forced_close_fallback {
                    ForcedCloseFallback::MarkPrice => mark,
                    ForcedCloseFallback::LastVwap => self.last_vwap.unwrap_or(mark),
                }
            };
            filled += residual;
            notional += residual.mul(synth_price);
        }

        if !filled.is_positive() {
            // Nothing crossed.
            let (status, text) = match (req.order_type, req.tif) {
                (OrderType::Limit, TimeInForce::Gtc) => (OrderStatus::New, "resting"),
                (OrderType::Limit, TimeInForce::Ioc) => (OrderStatus::Expired, "IOC missed"),
                (OrderType::Market, _) => (OrderStatus::Canceled, "no opposite liquidity"),
            };
            if status == OrderStatus::New {
                if let Some(price) = req.price {
                    self.rest_limit(req, &order_id, price, allowed, ts);
                }
            }
            return Ok(OrderResult {
                order_id,
                status,
                side: req.side,
                order_type: req.order_type,
                requested_qty: req.qty,
                filled_qty: Fp::ZERO,
                remaining_qty: req.qty,
                avg_fill_price: None,
                fee: Fp::ZERO,
                realized_pnl: Fp::ZERO,
                slippage_bps: Fp::ZERO,
                market_impact_bps: Fp::ZERO,
                reason_text: text.to_string(),
                reason_code: req.reason_code,
                addon_index: req.addon_index,
                reprice_attempt: req.reprice_attempt,
                client_order_id: req.client_order_id.clone(),
                trade_ids: Vec::new(),
            });
        }

        let raw_avg = notional.div(filled);
        self.last_vwap = Some(raw_avg);
        let obs = FillObservation {
            side: req.side,
            order_type: req.order_type,
            tif: req.tif,
            requested_qty: req.qty,
            filled_qty: filled,
            avg_fill_price: raw_avg,
        };
        let impact = adjust_fill(&self.config.impact, &obs, &pre_walk);
        let adjusted_notional = filled.mul(impact.adjusted_avg_price);

        let outcome = self.apply_fill(req.side, filled, impact.adjusted_avg_price, ts);
        let fee = adjusted_notional.abs().mul(self.config.taker_fee_rate);
        self.wallet += outcome.realized - fee;
        *realized_total += outcome.realized;
        *fee_total += fee;

        let remaining = req.qty - filled;
        let status = if remaining.is_positive() {
            OrderStatus::PartiallyFilled
        } else {
            OrderStatus::Filled
        };

        // GTC residual rests, bounded by the cap-allowed quantity.
        if req.order_type == OrderType::Limit && req.tif == TimeInForce::Gtc {
            let restable = allowed - filled;
            if restable.is_positive() {
                if let Some(price) = req.price {
                    self.rest_limit(req, &order_id, price, restable, ts);
                }
            }
        }

        Ok(OrderResult {
            order_id,
            status,
            side: req.side,
            order_type: req.order_type,
            requested_qty: req.qty,
            filled_qty: filled,
            remaining_qty: remaining,
            avg_fill_price: Some(impact.adjusted_avg_price),
            fee,
            realized_pnl: outcome.realized,
            slippage_bps: impact.slippage_bps,
            market_impact_bps: impact.market_impact_bps,
            reason_text: if forced {
                "forced liquidation close".to_string()
            } else {
                "executed".to_string()
            },
            reason_code: if forced {
                ReasonCode::ForcedLiquidation
            } else {
                req.reason_code
            },
            addon_index: req.addon_index,
            reprice_attempt: req.reprice_attempt,
            client_order_id: req.client_order_id.clone(),
            trade_ids: outcome.trade_ids,
        })
    }

    /// Position-cap rule: the closing portion is always allowed and reserved
    /// first; the opening portion is capped so total same-side opening
    /// notional stays within `initial_margin * leverage`. Reduce-only and
    /// forced orders execute only their closing portion.
    fn cap_allowed_qty(&self, side: Side, qty: Fp, reduce_only: bool, ref_price: Fp) -> Fp {
        let closing = match self.position {
            Some(pos) if pos.side() == side.opposite() => qty.min(pos.signed_qty.abs()),
            _ => Fp::ZERO,
        };
        if reduce_only {
            return closing;
        }
        let opening_requested = qty - closing;
        if !opening_requested.is_positive() {
            return qty;
        }
        let cap_notional = self.config.initial_margin.mul(self.effective_leverage());
        let same_side_notional = match self.position {
            Some(pos) if pos.side() == side => pos.notional(ref_price),
            _ => Fp::ZERO,
        };
        let headroom = (cap_notional - same_side_notional).max(Fp::ZERO);
        let open_allowed = headroom
            .checked_div(ref_price)
            .unwrap_or(Fp::ZERO)
            .min(opening_requested);
        closing + open_allowed
    }

    fn rest_limit(
        &mut self,
        req: &DryRunOrderRequest,
        order_id: &str,
        price: Fp,
        qty: Fp,
        ts: Millis,
    ) {
        self.pending.insert(
            order_id.to_string(),
            PendingLimit {
                order_id: order_id.to_string(),
                side: req.side,
                price,
                remaining_qty: qty,
                reduce_only: req.reduce_only,
                post_only: req.post_only,
                created_ts_ms: ts,
                client_order_id: req.client_order_id.clone(),
                reason_code: req.reason_code,
                addon_index: req.addon_index,
                reprice_attempt: req.reprice_attempt,
                ttl_ms: req.ttl_ms,
            },
        );
    }

    /// Position arithmetic for one fill. Returns realized PnL and trade ids
    /// for any closed quantity.
    fn apply_fill(&mut self, side: Side, qty: Fp, price: Fp, ts: Millis) -> FillOutcome {
        let signed_fill = side.sign().mul(qty);
        match self.position {
            None => {
                self.position = Some(Position {
                    signed_qty: signed_fill,
                    entry_price: price,
                    entry_ts_ms: ts,
                });
                FillOutcome {
                    realized: Fp::ZERO,
                    trade_ids: Vec::new(),
                }
            }
            Some(pos) if pos.side() == side => {
                // Same side: weighted-average entry.
                let old_abs = pos.signed_qty.abs();
                let total = old_abs + qty;
                let entry = (old_abs.mul(pos.entry_price) + qty.mul(price)).div(total);
                self.position = Some(Position {
                    signed_qty: pos.signed_qty + signed_fill,
                    entry_price: entry,
                    entry_ts_ms: pos.entry_ts_ms,
                });
                FillOutcome {
                    realized: Fp::ZERO,
                    trade_ids: Vec::new(),
                }
            }
            Some(pos) => {
                // Opposite side: close first, then maybe flip.
                let pos_sign = Fp::from_int(pos.signed_qty.signum() as i64);
                let close_qty = qty.min(pos.signed_qty.abs());
                let realized = (price - pos.entry_price).mul(close_qty).mul(pos_sign);
                let trade_id = self.ids.next_trade_id(&TradeFingerprint {
                    entry_ts_ms: pos.entry_ts_ms,
                    close_ts_ms: ts,
                    side,
                    qty: close_qty,
                });
                let new_signed = pos.signed_qty + signed_fill;
                self.position = if new_signed.is_zero() {
                    None
                } else if new_signed.signum() == pos.signed_qty.signum() {
                    Some(Position {
                        signed_qty: new_signed,
                        entry_price: pos.entry_price,
                        entry_ts_ms: pos.entry_ts_ms,
                    })
                } else {
                    // Flip: the surplus opens fresh at this fill's price.
                    Some(Position {
                        signed_qty: new_signed,
                        entry_price: price,
                        entry_ts_ms: ts,
                    })
                };
                FillOutcome {
                    realized,
                    trade_ids: vec![trade_id],
                }
            }
        }
    }
}

/// Walk price-ordered opposite levels, consuming depth. Returns (filled,
/// notional at raw walk prices).
fn walk_book(
    working: &mut NormalizedBook,
    side: Side,
    qty: Fp,
    limit_price: Option<Fp>,
) -> (Fp, Fp) {
    let levels = match side {
        Side::Buy => &mut working.asks,
        Side::Sell => &mut working.bids,
    };
    let mut filled = Fp::ZERO;
    let mut notional = Fp::ZERO;
    for level in levels.iter_mut() {
        if filled >= qty {
            break;
        }
        if let Some(limit) = limit_price {
            let violates = match side {
                Side::Buy => level.price > limit,
                Side::Sell => level.price < limit,
            };
            if violates {
                break;
            }
        }
        let take = (qty - filled).min(level.qty);
        filled += take;
        notional += take.mul(level.price);
        level.qty -= take;
    }
    levels.retain(|l| l.qty.is_positive());
    (filled, notional)
}
