//! Deterministic Dry-Run Execution Engine
//!
//! Paper-trading core for perpetual futures: fixed-point order matching
//! against replayed depth, a margin account with a single symbol position,
//! funding, liquidation and a reproducible audit trail of every state
//! transition.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       DryRunSupervisor                          │
//! │  (admission, derived metrics, order synthesis, session state)  │
//! └─────────────────────────────────────────────────────────────────┘
//!          │                  │                    │
//!          ▼                  ▼                    ▼
//!   ┌────────────┐     ┌────────────┐      ┌─────────────┐
//!   │ Metrics    │     │ Winner /   │      │ RiskGovernor│
//!   │ (ATR/OBI)  │     │ Addon/Flip │      │ (sizing)    │
//!   └────────────┘     └────────────┘      └─────────────┘
//!          │                  │                    │
//!          └─────────┬────────┴────────────────────┘
//!                    ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        DryRunEngine                             │
//! │  funding → TTL/rematch → orders → liquidation → reconcile       │
//! │  (impact model for fills, deterministic IDs, Fp accounting)     │
//! └─────────────────────────────────────────────────────────────────┘
//!                    │
//!        ┌───────────┴───────────┐
//!        ▼                       ▼
//! ┌─────────────┐        ┌─────────────┐
//! │ TradeLogger │        │ SessionStore│
//! │ (JSONL)     │        │ (SQLite)    │
//! └─────────────┘        └─────────────┘
//! ```
//!
//! # Determinism Guarantees
//!
//! - All money math in `Fp` (i128 x 1e8); floats only at the boundary
//! - Event/order/trade IDs are SHA-256 of `(run_id, kind, counter, input)`
//! - No system time inside the engine; all time from event timestamps
//! - Pending limits iterate in `BTreeMap` order
//! - Same `(run_id, event stream)` reproduces every report bit-for-bit

pub mod addon;
pub mod book;
pub mod clock;
pub mod config;
pub mod engine;
pub mod events;
pub mod fixed;
pub mod flip;
pub mod ids;
pub mod impact;
pub mod metrics;
pub mod ring;
pub mod risk;
pub mod session_store;
pub mod supervisor;
pub mod trade_logger;
pub mod upstream;
pub mod winner;

#[cfg(test)]
mod engine_tests;

// Re-exports for convenience
pub use book::{BookLevel, NormalizedBook, RawBook, RawLevel};
pub use config::{DryRunConfig, EntryLimitStrategy, SessionTunables};
pub use engine::{DryRunEngine, EngineConfig, EngineError, Position, StateSnapshot};
pub use events::{
    Direction, DryRunEvent, DryRunOrderRequest, EventReport, OrderResult, OrderStatus, OrderType,
    ReasonCode, Side, TimeInForce,
};
pub use fixed::Fp;
pub use ids::IdGenerator;
pub use metrics::{DerivedMetrics, MetricsTracker, VolatilityRegime};
pub use risk::{LiquidationRisk, RiskGovernor, Sizing};
pub use session_store::SessionStore;
pub use supervisor::{
    DepthEvent, DryRunSupervisor, IngestOutcome, IngestRejection, SessionError, StrategyAction,
    StrategyActionType, StrategyDecision,
};
pub use trade_logger::{LogKind, TradeLogRecord, TradeLogger, TradeLoggerConfig};
