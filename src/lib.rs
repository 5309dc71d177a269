//! PerpBot Backend Library
//!
//! Deterministic dry-run execution core for perpetual-futures paper
//! trading. The `dryrun` module tree is the whole product: a strategy layer
//! and session orchestrator sit on top of it, out of this crate.

pub mod dryrun;
pub mod logging;

// Re-export the session surface at the crate root for convenience
pub use dryrun::{
    DepthEvent, DryRunConfig, DryRunSupervisor, Fp, IngestOutcome, SessionError, StrategyAction,
    StrategyActionType, StrategyDecision,
};
