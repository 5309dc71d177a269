//! Session Supervisor
//!
//! The outward-facing state machine, one session per symbol. It admits depth
//! events, maintains derived metrics, consults the winner/add-on/flip/risk
//! components in a fixed precedence order, synthesizes the order batch for
//! the engine, and reconciles session state with the engine's position after
//! matching. Callers must serialize events per symbol; the admission check
//! enforces a minimum spacing and strict timestamp monotonicity.
//!
//! # Order Synthesis Precedence
//!
//! 1. Dequeued manual/strategy order.
//! 2. Flat book-out: pending flip entry (sized entry ladder), else the
//!    debug heuristic entry when enabled and off cooldown.
//! 3. Open position: winner-stop hit or risk emergency, as a reduce-only
//!    MARKET IOC.

use crate::dryrun::addon::{AddonContext, AddonState};
use crate::dryrun::book::{NormalizedBook, RawBook};
use crate::dryrun::clock::{EventClock, Millis};
use crate::dryrun::config::{ConfigError, DryRunConfig, EntryLimitStrategy};
use crate::dryrun::engine::{
    DryRunEngine, EngineError, EngineSnapshot, Position, StateSnapshot,
};
use crate::dryrun::events::{
    Direction, DryRunEvent, DryRunOrderRequest, EventReport, ReasonCode,
    Side, TimeInForce,
};
use crate::dryrun::fixed::Fp;
use crate::dryrun::flip::{FlipContext, FlipDecision, FlipState};
use crate::dryrun::metrics::{DerivedMetrics, MetricsTracker};
use crate::dryrun::risk::{EmergencyContext, RiskGovernor};
use crate::dryrun::session_store::{SessionStore, SessionSummary, StoreError};
use crate::dryrun::trade_logger::{LogKind, TradeLogRecord, TradeLogger};
use crate::dryrun::winner::WinnerState;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// STRATEGY CONTRACT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyActionType {
    Entry,
    Add,
    Reduce,
    Exit,
    Noop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyAction {
    #[serde(rename = "type")]
    pub action_type: StrategyActionType,
    pub side: Option<Direction>,
    pub reason: String,
    #[serde(default)]
    pub expected_price: Option<f64>,
    #[serde(default)]
    pub size_multiplier: Option<f64>,
    #[serde(default)]
    pub reduce_pct: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyDecision {
    pub symbol: String,
    pub timestamp_ms: Millis,
    #[serde(default)]
    pub regime: Option<String>,
    /// Decision confidence score on a 0-100 scale.
    #[serde(default)]
    pub dfs: Option<f64>,
    pub actions: Vec<StrategyAction>,
}

// =============================================================================
// ERRORS AND OUTCOMES
// =============================================================================

#[derive(Debug)]
pub enum SessionError {
    Config(ConfigError),
    Engine(EngineError),
    Store(StoreError),
    NotRunningForSymbol { symbol: String },
    ManualTestQtyInvalid,
    UnknownReason { reason: String },
    StoreUnconfigured,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{e}"),
            Self::Engine(e) => write!(f, "{e}"),
            Self::Store(e) => write!(f, "{e}"),
            Self::NotRunningForSymbol { symbol } => {
                write!(f, "dry_run_not_running_for_symbol: {symbol}")
            }
            Self::ManualTestQtyInvalid => write!(f, "manual_test_qty_invalid"),
            Self::UnknownReason { reason } => write!(f, "unknown_reason_code: {reason}"),
            Self::StoreUnconfigured => write!(f, "session_store_unconfigured"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ConfigError> for SessionError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<EngineError> for SessionError {
    fn from(e: EngineError) -> Self {
        Self::Engine(e)
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Why a depth event was not processed. Rejections mutate no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestRejection {
    NonMonotonicTimestamp,
    BelowMinInterval,
    EmptyBookSide,
}

#[derive(Debug)]
pub enum IngestOutcome {
    Processed(Box<EventReport>),
    Rejected(IngestRejection),
}

/// Incoming depth event at the supervisor boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthEvent {
    pub symbol: String,
    pub event_timestamp_ms: Millis,
    pub order_book: RawBook,
    #[serde(default)]
    pub mark_price: Option<f64>,
}

// =============================================================================
// PER-SYMBOL SESSION STATE
// =============================================================================

/// The flip entry queued by a confirmed hard invalidation, consumed by the
/// next synthesis tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingFlipEntry {
    pub direction: Direction,
    pub signal_score: Fp,
}

struct SymbolSession {
    symbol: String,
    engine: DryRunEngine,
    metrics: MetricsTracker,
    winner: Option<WinnerState>,
    addon: AddonState,
    flip: FlipState,
    pending_flip_entry: Option<PendingFlipEntry>,
    queue: VecDeque<DryRunOrderRequest>,
    last_ingest_ts: Millis,
    last_entry_or_addon_ts: Millis,
    last_debug_entry_ts: Millis,
    last_signal_direction: Option<Direction>,
    last_metrics: Option<DerivedMetrics>,
    empty_book_rejections: u64,
}

/// Serialized per-symbol state for the session store. Price history is
/// rebuilt from the live feed after a restore; everything that affects
/// accounting or governor decisions round-trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SymbolSnapshot {
    symbol: String,
    engine: EngineSnapshot,
    winner: Option<WinnerState>,
    addon: AddonState,
    flip: FlipState,
    pending_flip_entry: Option<PendingFlipEntry>,
    last_ingest_ts: Millis,
    last_entry_or_addon_ts: Millis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SupervisorSnapshot {
    config: DryRunConfig,
    sessions: Vec<SymbolSnapshot>,
    saved_at_ms: Millis,
}

/// Status view for callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolStatus {
    pub symbol: String,
    pub wallet: Fp,
    pub position: Option<Position>,
    pub open_limit_count: usize,
    pub sequence: u64,
    pub queued_orders: usize,
    pub addon_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub run_id: String,
    pub running: bool,
    pub symbols: Vec<SymbolStatus>,
}

// =============================================================================
// SUPERVISOR
// =============================================================================

pub struct DryRunSupervisor {
    config: DryRunConfig,
    sessions: HashMap<String, SymbolSession>,
    risk: RiskGovernor,
    clock: EventClock,
    logger: Option<Arc<TradeLogger>>,
    store: Option<SessionStore>,
    running: bool,
}

impl std::fmt::Debug for DryRunSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DryRunSupervisor")
            .field("config", &self.config)
            .field("symbols", &self.sessions.keys().collect::<Vec<_>>())
            .field("running", &self.running)
            .finish()
    }
}

impl DryRunSupervisor {
    /// Validate the config and boot one session per symbol.
    pub fn start(
        config: DryRunConfig,
        logger: Option<Arc<TradeLogger>>,
        store: Option<SessionStore>,
    ) -> Result<Self, SessionError> {
        config.validate()?;
        let mut supervisor = Self {
            risk: RiskGovernor::new(config.tunables.risk.clone()),
            sessions: HashMap::new(),
            clock: EventClock::new(),
            logger,
            store,
            running: true,
            config,
        };
        supervisor.build_sessions()?;
        info!(
            run_id = %supervisor.config.run_id,
            symbols = supervisor.sessions.len(),
            "dry-run supervisor started"
        );
        Ok(supervisor)
    }

    fn build_sessions(&mut self) -> Result<(), SessionError> {
        self.sessions.clear();
        for symbol in &self.config.symbols {
            let engine = DryRunEngine::new(self.config.engine_config()?)?;
            self.sessions.insert(
                symbol.clone(),
                SymbolSession {
                    symbol: symbol.clone(),
                    engine,
                    metrics: MetricsTracker::new(
                        self.config.tunables.atr_window,
                        self.config.tunables.max_spread_pct,
                    ),
                    winner: None,
                    addon: AddonState::default(),
                    flip: FlipState::default(),
                    pending_flip_entry: None,
                    queue: VecDeque::new(),
                    last_ingest_ts: 0,
                    last_entry_or_addon_ts: 0,
                    last_debug_entry_ts: 0,
                    last_signal_direction: None,
                    last_metrics: None,
                    empty_book_rejections: 0,
                },
            );
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.running = false;
        info!(run_id = %self.config.run_id, "dry-run supervisor stopped");
    }

    /// Drop all session state and boot fresh from the original config.
    pub fn reset(&mut self) -> Result<(), SessionError> {
        self.build_sessions()?;
        self.clock = EventClock::new();
        self.running = true;
        Ok(())
    }

    pub fn get_status(&self) -> SupervisorStatus {
        let mut symbols: Vec<SymbolStatus> = self
            .sessions
            .values()
            .map(|s| SymbolStatus {
                symbol: s.symbol.clone(),
                wallet: s.engine.wallet(),
                position: s.engine.position().copied(),
                open_limit_count: s.engine.pending_limits().count(),
                sequence: s.engine.sequence(),
                queued_orders: s.queue.len(),
                addon_count: s.addon.count,
            })
            .collect();
        symbols.sort_by(|a, b| a.symbol.cmp(&b.symbol));
        SupervisorStatus {
            run_id: self.config.run_id.clone(),
            running: self.running,
            symbols,
        }
    }

    pub fn get_state_snapshot(&self, symbol: &str) -> Result<StateSnapshot, SessionError> {
        let session = self.session(symbol)?;
        let mark = session.last_metrics.map(|m| m.mark_price);
        Ok(session.engine.get_state_snapshot(mark))
    }

    fn session(&self, symbol: &str) -> Result<&SymbolSession, SessionError> {
        if !self.running {
            return Err(SessionError::NotRunningForSymbol {
                symbol: symbol.to_string(),
            });
        }
        self.sessions
            .get(symbol)
            .ok_or_else(|| SessionError::NotRunningForSymbol {
                symbol: symbol.to_string(),
            })
    }

    fn session_mut(&mut self, symbol: &str) -> Result<&mut SymbolSession, SessionError> {
        if !self.running {
            return Err(SessionError::NotRunningForSymbol {
                symbol: symbol.to_string(),
            });
        }
        self.sessions
            .get_mut(symbol)
            .ok_or_else(|| SessionError::NotRunningForSymbol {
                symbol: symbol.to_string(),
            })
    }

    // =========================================================================
    // MANUAL AND STRATEGY INPUT
    // =========================================================================

    pub fn submit_manual_test_order(
        &mut self,
        symbol: &str,
        side: Side,
    ) -> Result<(), SessionError> {
        let qty = self.config.tunables.manual_test_qty;
        let qty = Fp::from_f64(qty)
            .filter(|q| q.is_positive())
            .ok_or(SessionError::ManualTestQtyInvalid)?;
        let session = self.session_mut(symbol)?;
        session
            .queue
            .push_back(DryRunOrderRequest::market(side, qty, false, ReasonCode::ManualTest));
        debug!(symbol, ?side, "manual test order queued");
        Ok(())
    }

    /// Translate a strategy decision into queued order requests. Unknown
    /// reason strings are an admission error and queue nothing.
    pub fn submit_strategy_decision(
        &mut self,
        symbol: &str,
        decision: &StrategyDecision,
        ts_override: Option<Millis>,
    ) -> Result<(), SessionError> {
        // Admission: every reason must map before anything is queued.
        for action in &decision.actions {
            if action.action_type != StrategyActionType::Noop
                && ReasonCode::parse(&action.reason).is_none()
            {
                return Err(SessionError::UnknownReason {
                    reason: action.reason.clone(),
                });
            }
        }

        let now = ts_override.unwrap_or(decision.timestamp_ms).max(self.clock.now_ms());
        let score = Fp::from_f64(decision.dfs.unwrap_or(50.0)).unwrap_or(Fp::from_int(50));
        let max_spread = self.config.tunables.max_spread_pct;
        let flip_config = self.config.tunables.flip.clone();
        let addon_config = self.config.tunables.addon.clone();
        let run_id = self.config.run_id.clone();
        let risk = self.risk.clone();
        let logger = self.logger.clone();

        let session = self.session_mut(symbol)?;
        for action in &decision.actions {
            if action.action_type == StrategyActionType::Noop {
                continue;
            }
            let Some(reason) = ReasonCode::parse(&action.reason) else {
                continue; // unreachable: validated above
            };
            match action.action_type {
                StrategyActionType::Entry => {
                    let Some(direction) = action.side else { continue };
                    session.last_signal_direction = Some(direction);
                    match session.engine.position().copied() {
                        None => {
                            session.pending_flip_entry = Some(PendingFlipEntry {
                                direction,
                                signal_score: score,
                            });
                        }
                        Some(pos) => {
                            let Some(pos_dir) = Direction::from_signed_qty(pos.signed_qty) else {
                                continue;
                            };
                            if direction == pos_dir.opposite() {
                                Self::run_flip_governor(
                                    session,
                                    &flip_config,
                                    max_spread,
                                    now,
                                    direction,
                                    score,
                                    logger.as_deref(),
                                );
                            } else {
                                session.flip.observe_aligned();
                            }
                        }
                    }
                }
                StrategyActionType::Add => {
                    let Some(direction) = action.side else { continue };
                    session.last_signal_direction = Some(direction);
                    let Some(pos) = session.engine.position().copied() else {
                        continue;
                    };
                    let Some(pos_dir) = Direction::from_signed_qty(pos.signed_qty) else {
                        continue;
                    };
                    if direction != pos_dir {
                        continue;
                    }
                    let Some(m) = session.last_metrics else { continue };
                    let mark = m.mark_price;
                    let upnl_pct = unrealized_pct(&pos, mark);
                    let sized = risk
                        .size_entry(
                            session.engine.wallet() + pos.unrealized(mark),
                            mark,
                            m.atr,
                            m.regime,
                            score,
                        )
                        .map(|s| s.qty)
                        .unwrap_or(Fp::ZERO);
                    let mult = action
                        .size_multiplier
                        .and_then(Fp::from_f64)
                        .filter(|m| m.is_positive())
                        .unwrap_or(Fp::ONE);
                    let best_same_side = best_same_side_price(&m, &pos);
                    let ctx = AddonContext {
                        now_ms: now,
                        position_direction: pos_dir,
                        position_notional: pos.notional(mark),
                        unrealized_pnl_pct: upnl_pct,
                        signal_direction: direction,
                        signal_score: score,
                        spread_pct: m.spread_pct,
                        max_spread_pct: max_spread,
                        best_same_side_price: best_same_side,
                        sized_qty: sized.mul(mult),
                    };
                    if let Some(order) =
                        session.addon.evaluate(&addon_config, &run_id, symbol, &ctx)
                    {
                        session.queue.push_back(order);
                    }
                }
                StrategyActionType::Reduce => {
                    let Some(pos) = session.engine.position().copied() else {
                        continue;
                    };
                    let pct = action
                        .reduce_pct
                        .and_then(Fp::from_f64)
                        .filter(|p| p.is_positive() && *p <= Fp::ONE)
                        .unwrap_or(Fp::from_raw(50_000_000)); // 50%
                    let qty = pos.signed_qty.abs().mul(pct);
                    if qty.is_positive() {
                        session.queue.push_back(DryRunOrderRequest::market(
                            pos.side().opposite(),
                            qty,
                            true,
                            reason,
                        ));
                    }
                }
                StrategyActionType::Exit => {
                    let Some(pos) = session.engine.position().copied() else {
                        continue;
                    };
                    session.queue.push_back(DryRunOrderRequest::market(
                        pos.side().opposite(),
                        pos.signed_qty.abs(),
                        true,
                        reason,
                    ));
                }
                StrategyActionType::Noop => {}
            }
        }

        let spread = session
            .last_metrics
            .map(|m| m.spread_pct)
            .unwrap_or(Fp::ZERO);
        // Crude cost-to-cross estimate: half the spread, in bps.
        let impact_estimate_bps = spread.mul(Fp::from_int(10_000)).div(Fp::from_int(2));
        let hold_remaining =
            (flip_config.min_hold_ms - (now - session.last_entry_or_addon_ts)).max(0);
        Self::emit_log(
            logger.as_deref(),
            LogKind::Signal,
            now,
            symbol,
            json!({
                "dfs": decision.dfs,
                "actions": decision.actions.len(),
                "hold_remaining_ms": hold_remaining,
                "flip_ticks": session.flip.confirm_ticks,
                "partial_reduced": session.flip.partial_reduced,
                "spread_pct": spread,
                "impact_estimate_bps": impact_estimate_bps,
                "queued": session.queue.len(),
            }),
        );
        Ok(())
    }

    fn run_flip_governor(
        session: &mut SymbolSession,
        flip_config: &crate::dryrun::flip::FlipConfig,
        max_spread: Fp,
        now: Millis,
        signal_direction: Direction,
        score: Fp,
        logger: Option<&TradeLogger>,
    ) {
        let Some(pos) = session.engine.position().copied() else {
            return;
        };
        let Some(m) = session.last_metrics else {
            return;
        };
        let Some(pos_dir) = Direction::from_signed_qty(pos.signed_qty) else {
            return;
        };
        let ctx = FlipContext {
            now_ms: now,
            last_entry_or_addon_ts: session.last_entry_or_addon_ts,
            position_direction: pos_dir,
            signal_direction,
            signal_score: score,
            unrealized_pnl_pct: unrealized_pct(&pos, m.mark_price),
            spread_pct: m.spread_pct,
            max_spread_pct: max_spread,
        };
        let decision = session.flip.evaluate(flip_config, &ctx);
        match decision {
            FlipDecision::Blocked(block) => {
                Self::emit_log(
                    logger,
                    LogKind::Action,
                    now,
                    &session.symbol,
                    json!({
                        "action": "FLIP_BLOCKED",
                        "block": block,
                        "ticks": session.flip.confirm_ticks,
                        "spread_pct": m.spread_pct,
                    }),
                );
            }
            FlipDecision::Pending { ticks } => {
                debug!(symbol = %session.symbol, ticks, "flip pending confirmation");
            }
            FlipDecision::ConfirmPartial { reduce_pct } => {
                let qty = pos.signed_qty.abs().mul(reduce_pct);
                if qty.is_positive() {
                    session.queue.push_back(DryRunOrderRequest::market(
                        pos.side().opposite(),
                        qty,
                        true,
                        ReasonCode::ReducePartial,
                    ));
                }
                Self::emit_log(
                    logger,
                    LogKind::Action,
                    now,
                    &session.symbol,
                    json!({
                        "action": "REDUCE_PARTIAL",
                        "reduce_pct": reduce_pct,
                        "ticks": session.flip.confirm_ticks,
                    }),
                );
            }
            FlipDecision::ConfirmFull => {
                session.queue.push_back(DryRunOrderRequest::market(
                    pos.side().opposite(),
                    pos.signed_qty.abs(),
                    true,
                    ReasonCode::HardInvalidation,
                ));
                session.pending_flip_entry = Some(PendingFlipEntry {
                    direction: signal_direction,
                    signal_score: score,
                });
                Self::emit_log(
                    logger,
                    LogKind::Action,
                    now,
                    &session.symbol,
                    json!({
                        "action": "HARD_INVALIDATION",
                        "flip_to": signal_direction,
                        "ticks": session.flip.confirm_ticks,
                    }),
                );
            }
        }
    }

    // =========================================================================
    // DEPTH INGESTION
    // =========================================================================

    pub fn ingest_depth_event(&mut self, event: &DepthEvent) -> Result<IngestOutcome, SessionError> {
        let tunables = self.config.tunables.clone();
        let run_id = self.config.run_id.clone();
        let risk = self.risk.clone();
        let logger = self.logger.clone();
        let session = self.session_mut(&event.symbol)?;
        let ts = event.event_timestamp_ms;

        // Admission.
        if ts <= session.last_ingest_ts {
            return Ok(IngestOutcome::Rejected(IngestRejection::NonMonotonicTimestamp));
        }
        if session.last_ingest_ts > 0 && ts < session.last_ingest_ts + tunables.min_event_interval_ms
        {
            return Ok(IngestOutcome::Rejected(IngestRejection::BelowMinInterval));
        }
        let normalized = NormalizedBook::from_raw(&event.order_book, tunables.book_depth);
        if !normalized.has_both_sides() {
            session.empty_book_rejections += 1;
            if session.empty_book_rejections % 50 == 1 {
                warn!(
                    symbol = %event.symbol,
                    count = session.empty_book_rejections,
                    "depth event with empty book side, waiting for liquidity"
                );
            }
            return Ok(IngestOutcome::Rejected(IngestRejection::EmptyBookSide));
        }

        // Mark price: provided when positive, else book mid.
        let Some(mark) = event
            .mark_price
            .and_then(Fp::from_f64)
            .filter(|p| p.is_positive())
            .or_else(|| normalized.mid())
        else {
            return Ok(IngestOutcome::Rejected(IngestRejection::EmptyBookSide));
        };

        // Derived metrics.
        let metrics = session.metrics.update(mark, &normalized);
        session.last_metrics = Some(metrics);

        // Order synthesis.
        let position_before = session.engine.position().copied();
        let mut orders: Vec<DryRunOrderRequest> = Vec::new();
        if let Some(queued) = session.queue.pop_front() {
            orders.push(queued);
        } else if position_before.is_none() && session.engine.pending_limits().count() == 0 {
            if let Some(flip_entry) = session.pending_flip_entry.take() {
                let wallet = session.engine.wallet();
                if let Some(sizing) = risk.size_entry(
                    wallet,
                    mark,
                    metrics.atr,
                    metrics.regime,
                    flip_entry.signal_score,
                ) {
                    session.engine.set_leverage_override(sizing.leverage)?;
                    orders.extend(entry_ladder(
                        tunables.entry_limit_strategy,
                        flip_entry.direction,
                        sizing.qty,
                        &normalized,
                        ReasonCode::Entry,
                    ));
                    Self::emit_log(
                        logger.as_deref(),
                        LogKind::Action,
                        ts,
                        &event.symbol,
                        json!({
                            "action": "FLIP_ENTRY",
                            "direction": flip_entry.direction,
                            "qty": sizing.qty,
                            "leverage": sizing.leverage,
                            "strategy": tunables.entry_limit_strategy,
                        }),
                    );
                }
            } else if tunables.debug_aggressive_entry
                && ts - session.last_debug_entry_ts >= tunables.debug_entry_cooldown_ms
            {
                // Heuristic: lean into book imbalance.
                let direction = if metrics.obi.is_negative() {
                    Direction::Short
                } else {
                    Direction::Long
                };
                let wallet = session.engine.wallet();
                if let Some(sizing) =
                    risk.size_entry(wallet, mark, metrics.atr, metrics.regime, Fp::from_int(60))
                {
                    session.engine.set_leverage_override(sizing.leverage)?;
                    orders.push(DryRunOrderRequest::market(
                        direction.entry_side(),
                        sizing.qty,
                        false,
                        ReasonCode::DebugEntry,
                    ));
                    session.last_debug_entry_ts = ts;
                }
            }
        } else if let Some(pos) = position_before {
            let stop_hit = session
                .winner
                .as_mut()
                .and_then(|w| w.update(mark, metrics.atr, &tunables.winner));
            let emergency = risk.check_emergency(&EmergencyContext {
                margin_health: session.engine.margin_health(mark),
                unrealized_pnl_pct: unrealized_pct(&pos, mark),
                spread_breach_count: metrics.spread_breach_count,
                flip_deadband_pct: tunables.flip.deadband_pct,
            });
            let close_reason = if let Some(hit) = stop_hit {
                Some((hit.reason, json!({"stop_price": hit.stop_price})))
            } else {
                emergency.map(|trigger| {
                    (
                        ReasonCode::RiskEmergency,
                        json!({"trigger": trigger}),
                    )
                })
            };
            if let Some((reason, detail)) = close_reason {
                orders.push(DryRunOrderRequest::market(
                    pos.side().opposite(),
                    pos.signed_qty.abs(),
                    true,
                    reason,
                ));
                Self::emit_log(
                    logger.as_deref(),
                    LogKind::Action,
                    ts,
                    &event.symbol,
                    json!({
                        "action": reason,
                        "detail": detail,
                        "spread_pct": metrics.spread_pct,
                    }),
                );
            }
        }

        // Engine step.
        let engine_event = DryRunEvent {
            timestamp_ms: ts,
            mark_price: Some(mark),
            book: event.order_book.clone(),
            orders,
        };
        let report = session.engine.process_event(&engine_event)?;

        // Post-matching sync.
        session.last_ingest_ts = ts;
        Self::sync_after_matching(
            session,
            &tunables,
            &run_id,
            logger.as_deref(),
            &report,
            position_before,
            mark,
            metrics,
            ts,
        );
        self.clock.observe(ts);

        Ok(IngestOutcome::Processed(Box::new(report)))
    }

    /// Reconcile governor state with the engine position after matching and
    /// feed add-on lifecycle events.
    #[allow(clippy::too_many_arguments)]
    fn sync_after_matching(
        session: &mut SymbolSession,
        tunables: &crate::dryrun::config::SessionTunables,
        run_id: &str,
        logger: Option<&TradeLogger>,
        report: &EventReport,
        position_before: Option<Position>,
        mark: Fp,
        metrics: DerivedMetrics,
        ts: Millis,
    ) {
        // Add-on lifecycle from order results.
        for result in &report.order_results {
            let Some(client_id) = result.client_order_id.as_deref() else {
                continue;
            };
            if result.reason_code == ReasonCode::AddonMaker && result.filled_qty.is_positive() {
                session.addon.on_fill(client_id, ts);
                session.last_entry_or_addon_ts = ts;
            }
            if result.reason_code == ReasonCode::LimitTtlCancel {
                let signal_direction = session.last_signal_direction;
                let position_direction = session
                    .engine
                    .position()
                    .and_then(|p| Direction::from_signed_qty(p.signed_qty));
                if let Some(pos_dir) = position_direction {
                    let refreshed = session
                        .last_metrics
                        .map(|m| match pos_dir {
                            Direction::Long => m.mark_price - m.mark_price.mul(m.spread_pct).div(Fp::from_int(2)),
                            Direction::Short => m.mark_price + m.mark_price.mul(m.spread_pct).div(Fp::from_int(2)),
                        })
                        .unwrap_or(mark);
                    if let Some(order) = session.addon.on_ttl_cancel(
                        &tunables.addon,
                        run_id,
                        &session.symbol,
                        client_id,
                        result.remaining_qty,
                        pos_dir,
                        signal_direction,
                        refreshed,
                    ) {
                        session.queue.push_back(order);
                    }
                }
            }
        }

        let position_after = session.engine.position().copied();
        match (position_before, position_after) {
            (None, Some(pos)) => {
                let Some(direction) = Direction::from_signed_qty(pos.signed_qty) else {
                    return;
                };
                session.winner = Some(WinnerState::new(
                    direction,
                    pos.entry_price,
                    metrics.atr,
                    &tunables.winner,
                ));
                session.addon.reset();
                session.flip.reset();
                session.last_entry_or_addon_ts = ts;
                Self::emit_log(
                    logger,
                    LogKind::Entry,
                    ts,
                    &session.symbol,
                    json!({
                        "direction": direction,
                        "qty": pos.signed_qty.abs(),
                        "entry_price": pos.entry_price,
                        "sequence": report.sequence,
                    }),
                );
            }
            (Some(old), None) => {
                session.winner = None;
                session.flip.reset();
                session.addon.reset();
                Self::emit_log(
                    logger,
                    LogKind::Exit,
                    ts,
                    &session.symbol,
                    json!({
                        "qty": old.signed_qty.abs(),
                        "entry_price": old.entry_price,
                        "holding_ms": ts - old.entry_ts_ms,
                        "realized_pnl": report.realized_pnl,
                        "liquidation": report.liquidation_triggered,
                        "sequence": report.sequence,
                    }),
                );
            }
            (Some(old), Some(new)) if old.signed_qty.signum() != new.signed_qty.signum() => {
                // Side flip through matching: reseed both governors.
                let Some(direction) = Direction::from_signed_qty(new.signed_qty) else {
                    return;
                };
                session.winner = Some(WinnerState::new(
                    direction,
                    new.entry_price,
                    metrics.atr,
                    &tunables.winner,
                ));
                session.flip.reset();
                session.addon.reset();
                session.last_entry_or_addon_ts = ts;
                Self::emit_log(
                    logger,
                    LogKind::Entry,
                    ts,
                    &session.symbol,
                    json!({
                        "direction": direction,
                        "qty": new.signed_qty.abs(),
                        "entry_price": new.entry_price,
                        "flip": true,
                        "holding_ms": ts - old.entry_ts_ms,
                        "sequence": report.sequence,
                    }),
                );
            }
            _ => {}
        }

        if report.liquidation_triggered {
            Self::emit_log(
                logger,
                LogKind::Snapshot,
                ts,
                &session.symbol,
                json!({
                    "event": "LIQUIDATION",
                    "wallet_after": report.wallet_after,
                    "sequence": report.sequence,
                }),
            );
        }
    }

    fn emit_log(
        logger: Option<&TradeLogger>,
        kind: LogKind,
        ts: Millis,
        symbol: &str,
        data: serde_json::Value,
    ) {
        if let Some(logger) = logger {
            logger.log(TradeLogRecord {
                kind,
                timestamp_ms: ts,
                symbol: symbol.to_string(),
                data,
            });
        }
    }

    // =========================================================================
    // SESSION PERSISTENCE
    // =========================================================================

    pub fn save_session(&self, session_id: Option<String>) -> Result<String, SessionError> {
        let store = self.store.as_ref().ok_or(SessionError::StoreUnconfigured)?;
        let id = session_id.unwrap_or_else(|| self.config.run_id.clone());
        let snapshot = SupervisorSnapshot {
            config: self.config.clone(),
            sessions: self
                .sessions
                .values()
                .map(|s| SymbolSnapshot {
                    symbol: s.symbol.clone(),
                    engine: s.engine.snapshot(),
                    winner: s.winner.clone(),
                    addon: s.addon.clone(),
                    flip: s.flip.clone(),
                    pending_flip_entry: s.pending_flip_entry.clone(),
                    last_ingest_ts: s.last_ingest_ts,
                    last_entry_or_addon_ts: s.last_entry_or_addon_ts,
                })
                .collect(),
            saved_at_ms: self.clock.now_ms(),
        };
        let symbol = self.config.symbols.join(",");
        store.save(&id, &symbol, self.clock.now_ms(), &snapshot)?;
        info!(session_id = %id, "session snapshot saved");
        Ok(id)
    }

    pub fn load_session(&mut self, session_id: &str) -> Result<(), SessionError> {
        let store = self.store.as_ref().ok_or(SessionError::StoreUnconfigured)?;
        let snapshot: SupervisorSnapshot = store.load(session_id)?;
        self.config = snapshot.config;
        self.risk = RiskGovernor::new(self.config.tunables.risk.clone());
        self.build_sessions()?;
        for symbol_snapshot in snapshot.sessions {
            if let Some(session) = self.sessions.get_mut(&symbol_snapshot.symbol) {
                session.engine.restore_state(symbol_snapshot.engine);
                session.winner = symbol_snapshot.winner;
                session.addon = symbol_snapshot.addon;
                session.flip = symbol_snapshot.flip;
                session.pending_flip_entry = symbol_snapshot.pending_flip_entry;
                session.last_ingest_ts = symbol_snapshot.last_ingest_ts;
                session.last_entry_or_addon_ts = symbol_snapshot.last_entry_or_addon_ts;
            }
        }
        self.clock.observe(snapshot.saved_at_ms);
        self.running = true;
        info!(session_id, "session snapshot restored");
        Ok(())
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>, SessionError> {
        let store = self.store.as_ref().ok_or(SessionError::StoreUnconfigured)?;
        Ok(store.list()?)
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Unrealized PnL as a fraction of entry notional.
fn unrealized_pct(pos: &Position, mark: Fp) -> Fp {
    let entry_notional = pos.signed_qty.abs().mul(pos.entry_price);
    pos.unrealized(mark)
        .checked_div(entry_notional)
        .unwrap_or(Fp::ZERO)
}

/// Best quote on the position's own side of the book, derived from the last
/// metrics mark and spread when explicit levels are unavailable.
fn best_same_side_price(metrics: &DerivedMetrics, pos: &Position) -> Fp {
    let half_spread = metrics.mark_price.mul(metrics.spread_pct).div(Fp::from_int(2));
    match pos.side() {
        Side::Buy => metrics.mark_price - half_spread,
        Side::Sell => metrics.mark_price + half_spread,
    }
}

/// Build the order batch for one sized entry.
fn entry_ladder(
    strategy: EntryLimitStrategy,
    direction: Direction,
    qty: Fp,
    book: &NormalizedBook,
    reason: ReasonCode,
) -> Vec<DryRunOrderRequest> {
    let side = direction.entry_side();
    let same_side_best = match side {
        Side::Buy => book.best_bid().map(|l| l.price),
        Side::Sell => book.best_ask().map(|l| l.price),
    };
    let opposite_best = match side {
        Side::Buy => book.best_ask().map(|l| l.price),
        Side::Sell => book.best_bid().map(|l| l.price),
    };
    match strategy {
        EntryLimitStrategy::Market => {
            vec![DryRunOrderRequest::market(side, qty, false, reason)]
        }
        EntryLimitStrategy::Passive => match same_side_best {
            Some(price) => {
                let mut order =
                    DryRunOrderRequest::limit(side, qty, price, TimeInForce::Gtc, reason);
                order.post_only = true;
                vec![order]
            }
            None => vec![DryRunOrderRequest::market(side, qty, false, reason)],
        },
        EntryLimitStrategy::Split => {
            let half = qty.div(Fp::from_int(2));
            let mut orders = vec![DryRunOrderRequest::market(side, half, false, reason)];
            if let Some(price) = same_side_best {
                let mut passive =
                    DryRunOrderRequest::limit(side, qty - half, price, TimeInForce::Gtc, reason);
                passive.post_only = true;
                orders.push(passive);
            } else {
                orders.push(DryRunOrderRequest::market(side, qty - half, false, reason));
            }
            orders
        }
        EntryLimitStrategy::Aggressive => match opposite_best {
            Some(price) => {
                vec![DryRunOrderRequest::limit(
                    side,
                    qty,
                    price,
                    TimeInForce::Ioc,
                    reason,
                )]
            }
            None => vec![DryRunOrderRequest::market(side, qty, false, reason)],
        },
    }
}

