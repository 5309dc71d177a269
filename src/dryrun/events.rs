//! Event Model
//!
//! Canonical order, result and log-record types for the dry-run engine.
//! Everything here is serde-serializable: order results and event reports are
//! emitted verbatim into the audit log, so field names are part of the
//! outward contract.

use crate::dryrun::book::RawBook;
use crate::dryrun::clock::Millis;
use crate::dryrun::fixed::Fp;
use serde::{Deserialize, Serialize};

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// +1 for BUY, -1 for SELL.
    #[inline]
    pub fn sign(&self) -> Fp {
        match self {
            Side::Buy => Fp::ONE,
            Side::Sell => -Fp::ONE,
        }
    }
}

/// Position direction as the strategy layer speaks it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    #[inline]
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
        }
    }

    /// Order side that opens or widens this direction.
    #[inline]
    pub fn entry_side(&self) -> Side {
        match self {
            Direction::Long => Side::Buy,
            Direction::Short => Side::Sell,
        }
    }

    /// Order side that reduces this direction.
    #[inline]
    pub fn exit_side(&self) -> Side {
        self.entry_side().opposite()
    }

    #[inline]
    pub fn from_signed_qty(qty: Fp) -> Option<Self> {
        match qty.signum() {
            1 => Some(Direction::Long),
            -1 => Some(Direction::Short),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeInForce {
    /// Immediate or cancel: fill what crosses, cancel the rest.
    Ioc,
    /// Good til cancelled: the residual rests as a pending limit.
    Gtc,
}

/// Terminal/intermediate order status as reported in the event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Filled,
    PartiallyFilled,
    New,
    Canceled,
    Rejected,
    Expired,
}

/// Why an order was issued or rejected. Every behavior in the supervisor is
/// keyed off this tag; free-text reasons from the strategy layer must map to
/// a variant or the decision is refused at admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    Entry,
    ManualTest,
    DebugEntry,
    AddonMaker,
    TrailStop,
    #[serde(rename = "PROFITLOCK")]
    ProfitLock,
    RiskEmergency,
    ReducePartial,
    HardInvalidation,
    StrategyReduce,
    StrategyExit,
    ForcedLiquidation,
    LimitTtlCancel,
    // Reject codes observable in order results.
    InvalidQty,
    InvalidLimitPrice,
    ReduceOnlyRejected,
    PositionLimitRejected,
    OrderRejected,
}

impl ReasonCode {
    /// Map a strategy-supplied reason string to a variant. Unknown strings
    /// are an admission error at the supervisor boundary.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ENTRY" => Some(Self::Entry),
            "MANUAL_TEST" => Some(Self::ManualTest),
            "DEBUG_ENTRY" => Some(Self::DebugEntry),
            "ADDON_MAKER" => Some(Self::AddonMaker),
            "TRAIL_STOP" => Some(Self::TrailStop),
            "PROFITLOCK" => Some(Self::ProfitLock),
            "RISK_EMERGENCY" => Some(Self::RiskEmergency),
            "REDUCE_PARTIAL" => Some(Self::ReducePartial),
            "HARD_INVALIDATION" => Some(Self::HardInvalidation),
            "STRATEGY_REDUCE" => Some(Self::StrategyReduce),
            "STRATEGY_EXIT" => Some(Self::StrategyExit),
            "FORCED_LIQUIDATION" => Some(Self::ForcedLiquidation),
            "LIMIT_TTL_CANCEL" => Some(Self::LimitTtlCancel),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entry => "ENTRY",
            Self::ManualTest => "MANUAL_TEST",
            Self::DebugEntry => "DEBUG_ENTRY",
            Self::AddonMaker => "ADDON_MAKER",
            Self::TrailStop => "TRAIL_STOP",
            Self::ProfitLock => "PROFITLOCK",
            Self::RiskEmergency => "RISK_EMERGENCY",
            Self::ReducePartial => "REDUCE_PARTIAL",
            Self::HardInvalidation => "HARD_INVALIDATION",
            Self::StrategyReduce => "STRATEGY_REDUCE",
            Self::StrategyExit => "STRATEGY_EXIT",
            Self::ForcedLiquidation => "FORCED_LIQUIDATION",
            Self::LimitTtlCancel => "LIMIT_TTL_CANCEL",
            Self::InvalidQty => "INVALID_QTY",
            Self::InvalidLimitPrice => "INVALID_LIMIT_PRICE",
            Self::ReduceOnlyRejected => "REDUCE_ONLY_REJECTED",
            Self::PositionLimitRejected => "POSITION_LIMIT_REJECTED",
            Self::OrderRejected => "ORDER_REJECTED",
        }
    }
}

/// Order submission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunOrderRequest {
    pub side: Side,
    pub order_type: OrderType,
    pub tif: TimeInForce,
    pub qty: Fp,
    /// Required for LIMIT, ignored for MARKET.
    pub price: Option<Fp>,
    pub reduce_only: bool,
    pub post_only: bool,
    /// Resting lifetime for GTC limits; expiry cancels with LIMIT_TTL_CANCEL.
    pub ttl_ms: Option<i64>,
    pub reason_code: ReasonCode,
    pub client_order_id: Option<String>,
    pub addon_index: Option<u32>,
    pub reprice_attempt: u32,
}

impl DryRunOrderRequest {
    /// Plain taker order with no ladder metadata.
    pub fn market(side: Side, qty: Fp, reduce_only: bool, reason_code: ReasonCode) -> Self {
        Self {
            side,
            order_type: OrderType::Market,
            tif: TimeInForce::Ioc,
            qty,
            price: None,
            reduce_only,
            post_only: false,
            ttl_ms: None,
            reason_code,
            client_order_id: None,
            addon_index: None,
            reprice_attempt: 0,
        }
    }

    pub fn limit(
        side: Side,
        qty: Fp,
        price: Fp,
        tif: TimeInForce,
        reason_code: ReasonCode,
    ) -> Self {
        Self {
            side,
            order_type: OrderType::Limit,
            tif,
            qty,
            price: Some(price),
            reduce_only: false,
            post_only: false,
            ttl_ms: None,
            reason_code,
            client_order_id: None,
            addon_index: None,
            reprice_attempt: 0,
        }
    }
}

/// Per-order outcome inside an event report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResult {
    pub order_id: String,
    pub status: OrderStatus,
    pub side: Side,
    pub order_type: OrderType,
    pub requested_qty: Fp,
    pub filled_qty: Fp,
    pub remaining_qty: Fp,
    pub avg_fill_price: Option<Fp>,
    pub fee: Fp,
    pub realized_pnl: Fp,
    pub slippage_bps: Fp,
    pub market_impact_bps: Fp,
    pub reason_text: String,
    pub reason_code: ReasonCode,
    pub addon_index: Option<u32>,
    pub reprice_attempt: u32,
    pub client_order_id: Option<String>,
    pub trade_ids: Vec<String>,
}

/// Engine input: one market event, optionally carrying a batch of orders.
/// The book arrives raw (boundary floats); the engine normalizes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DryRunEvent {
    pub timestamp_ms: Millis,
    /// Resolved externally when absent: mid of the normalized book.
    pub mark_price: Option<Fp>,
    pub book: RawBook,
    #[serde(default)]
    pub orders: Vec<DryRunOrderRequest>,
}

/// Append-only audit record, one per processed event. The wallet
/// reconciliation identity holds on every record:
/// `wallet_after == clamp0(wallet_before + realized_pnl - fee + funding_impact)`
/// with clamping permitted only under liquidation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventReport {
    pub run_id: String,
    pub event_timestamp_ms: Millis,
    pub sequence: u64,
    pub event_id: String,
    pub wallet_before: Fp,
    pub wallet_after: Fp,
    pub realized_pnl: Fp,
    pub fee: Fp,
    pub funding_impact: Fp,
    pub reconciliation_expected_after: Fp,
    /// (equity - maintenance) / equity, clamped to <= 1; -1 encodes
    /// non-positive equity.
    pub margin_health: Fp,
    pub liquidation_triggered: bool,
    pub order_results: Vec<OrderResult>,
}
