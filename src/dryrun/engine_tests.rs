//! Matching/Accounting Engine Tests
//!
//! These tests verify:
//! 1. The wallet reconciliation identity holds on every event
//! 2. Admission rejects bad and non-monotonic timestamps
//! 3. The status table (NEW / PARTIALLY_FILLED / FILLED / EXPIRED / CANCELED)
//! 4. GTC residuals rest and rematch
//! 5. The position cap reserves the closing portion first
//! 6. Forced liquidation clamps the wallet at zero
//! 7. The funding gap loop applies once per crossed boundary
//! 8. Determinism: identical runs produce identical IDs and balances
//!
//! Impact is zeroed in most tests so fills land at raw book prices and the
//! accounting assertions are exact.

use crate::dryrun::book::{RawBook, RawLevel};
use crate::dryrun::engine::{DryRunEngine, EngineConfig, EngineError, ForcedCloseFallback};
use crate::dryrun::events::{
    DryRunEvent, DryRunOrderRequest, OrderStatus, ReasonCode, Side, TimeInForce,
};
use crate::dryrun::fixed::Fp;
use crate::dryrun::ids::validate_order_id;
use crate::dryrun::impact::MarketImpactConfig;

fn fp(v: f64) -> Fp {
    Fp::from_f64(v).unwrap()
}

fn impact_off() -> MarketImpactConfig {
    MarketImpactConfig {
        impact_factor_bps: 0,
        queue_penalty_bps: 0,
        ..Default::default()
    }
}

fn config(wallet: f64, margin: f64, leverage: f64) -> EngineConfig {
    EngineConfig {
        run_id: "test-run".to_string(),
        wallet_start: fp(wallet),
        initial_margin: fp(margin),
        leverage: fp(leverage),
        taker_fee_rate: fp(0.0004),
        maker_fee_rate: fp(0.0002),
        maintenance_margin_rate: fp(0.05),
        funding_rate: Fp::ZERO,
        funding_interval_ms: 3_600_000,
        funding_start_boundary_ms: None,
        book_depth: 20,
        impact: impact_off(),
        maker_fee_for_resting: false,
        forced_close_fallback: ForcedCloseFallback::MarkPrice,
    }
}

fn book(bids: &[(f64, f64)], asks: &[(f64, f64)]) -> RawBook {
    RawBook {
        bids: bids.iter().map(|&(price, qty)| RawLevel { price, qty }).collect(),
        asks: asks.iter().map(|&(price, qty)| RawLevel { price, qty }).collect(),
    }
}

fn event(ts: i64, mark: f64, b: RawBook, orders: Vec<DryRunOrderRequest>) -> DryRunEvent {
    DryRunEvent {
        timestamp_ms: ts,
        mark_price: Some(fp(mark)),
        book: b,
        orders,
    }
}

fn buy_market(qty: f64) -> DryRunOrderRequest {
    DryRunOrderRequest::market(Side::Buy, fp(qty), false, ReasonCode::ManualTest)
}

fn sell_market(qty: f64) -> DryRunOrderRequest {
    DryRunOrderRequest::market(Side::Sell, fp(qty), false, ReasonCode::ManualTest)
}

fn reduce_only(side: Side, qty: f64) -> DryRunOrderRequest {
    DryRunOrderRequest::market(side, fp(qty), true, ReasonCode::ManualTest)
}

/// Reconciliation identity: wallet_after = wallet_before + pnl - fee + funding,
/// clamped only under liquidation.
fn assert_reconciled(report: &crate::dryrun::events::EventReport) {
    let raw =
        report.wallet_before + report.realized_pnl - report.fee + report.funding_impact;
    let expected = if report.liquidation_triggered && raw.is_negative() {
        Fp::ZERO
    } else {
        raw
    };
    assert_eq!(report.wallet_after, expected, "reconciliation identity broken");
}

// =============================================================================
// TEST: simple long round trip (scenario: open at 100, close at 101)
// =============================================================================

#[test]
fn test_long_round_trip() {
    let mut engine = DryRunEngine::new(config(1_000.0, 100.0, 10.0)).unwrap();

    let report = engine
        .process_event(&event(
            1_000,
            100.0,
            book(&[(99.9, 10.0)], &[(100.0, 10.0)]),
            vec![buy_market(1.0)],
        ))
        .unwrap();
    assert_reconciled(&report);
    assert_eq!(report.order_results.len(), 1);
    let fill = &report.order_results[0];
    assert_eq!(fill.status, OrderStatus::Filled);
    assert_eq!(fill.avg_fill_price, Some(fp(100.0)));
    assert_eq!(fill.fee, fp(0.04));
    assert_eq!(report.wallet_after, fp(999.96));
    let pos = engine.position().unwrap();
    assert_eq!(pos.signed_qty, fp(1.0));
    assert_eq!(pos.entry_price, fp(100.0));

    let report = engine
        .process_event(&event(
            2_000,
            101.0,
            book(&[(101.0, 10.0)], &[(101.1, 10.0)]),
            vec![{
                let mut o = reduce_only(Side::Sell, 1.0);
                o.reason_code = ReasonCode::StrategyExit;
                o
            }],
        ))
        .unwrap();
    assert_reconciled(&report);
    let close = &report.order_results[0];
    assert_eq!(close.status, OrderStatus::Filled);
    assert_eq!(close.realized_pnl, fp(1.0));
    assert_eq!(close.fee, fp(0.0404));
    assert_eq!(report.wallet_after, fp(1_000.9196));
    assert!(!report.liquidation_triggered);
    assert!(engine.position().is_none());
    assert_eq!(close.trade_ids.len(), 1);
    assert!(validate_order_id(&close.order_id).is_ok());
}

// =============================================================================
// TEST: admission errors
// =============================================================================

#[test]
fn test_rejects_invalid_timestamp() {
    let mut engine = DryRunEngine::new(config(1_000.0, 100.0, 10.0)).unwrap();
    let err = engine
        .process_event(&event(0, 100.0, book(&[(99.0, 1.0)], &[(100.0, 1.0)]), vec![]))
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidEventTimestamp { .. }));
}

#[test]
fn test_rejects_non_monotonic_timestamp() {
    let mut engine = DryRunEngine::new(config(1_000.0, 100.0, 10.0)).unwrap();
    let b = || book(&[(99.0, 1.0)], &[(100.0, 1.0)]);
    engine.process_event(&event(1_000, 100.0, b(), vec![])).unwrap();
    let err = engine.process_event(&event(1_000, 100.0, b(), vec![])).unwrap_err();
    assert!(matches!(err, EngineError::NonMonotonicEventTimestamp { .. }));
    let err = engine.process_event(&event(500, 100.0, b(), vec![])).unwrap_err();
    assert!(matches!(err, EngineError::NonMonotonicEventTimestamp { .. }));
}

#[test]
fn test_rejects_empty_book_side() {
    let mut engine = DryRunEngine::new(config(1_000.0, 100.0, 10.0)).unwrap();
    let err = engine
        .process_event(&event(1_000, 100.0, book(&[], &[(100.0, 1.0)]), vec![]))
        .unwrap_err();
    assert!(matches!(err, EngineError::EmptyBookSide));
}

#[test]
fn test_rejects_crossed_book() {
    let mut engine = DryRunEngine::new(config(1_000.0, 100.0, 10.0)).unwrap();
    let err = engine
        .process_event(&event(1_000, 100.0, book(&[(101.0, 1.0)], &[(100.0, 1.0)]), vec![]))
        .unwrap_err();
    assert!(matches!(err, EngineError::CrossedBook { .. }));
}

#[test]
fn test_invalid_funding_interval_refused() {
    let mut cfg = config(1_000.0, 100.0, 10.0);
    cfg.funding_interval_ms = 0;
    assert!(matches!(
        DryRunEngine::new(cfg),
        Err(EngineError::InvalidFundingIntervalMs { .. })
    ));
}

// =============================================================================
// TEST: per-order soft rejects never abort the batch
// =============================================================================

#[test]
fn test_soft_rejects_materialize_in_batch() {
    let mut engine = DryRunEngine::new(config(1_000.0, 100.0, 10.0)).unwrap();
    let bad_qty = DryRunOrderRequest::market(Side::Buy, Fp::ZERO, false, ReasonCode::ManualTest);
    let bad_price =
        DryRunOrderRequest::limit(Side::Buy, fp(1.0), Fp::ZERO, TimeInForce::Gtc, ReasonCode::ManualTest);
    let orphan_reduce = reduce_only(Side::Sell, 1.0);
    let good = buy_market(1.0);

    let report = engine
        .process_event(&event(
            1_000,
            100.0,
            book(&[(99.9, 10.0)], &[(100.0, 10.0)]),
            vec![bad_qty, bad_price, orphan_reduce, good],
        ))
        .unwrap();
    assert_reconciled(&report);
    assert_eq!(report.order_results.len(), 4);
    assert_eq!(report.order_results[0].status, OrderStatus::Rejected);
    assert_eq!(report.order_results[0].reason_code, ReasonCode::InvalidQty);
    assert_eq!(report.order_results[1].reason_code, ReasonCode::InvalidLimitPrice);
    assert_eq!(report.order_results[2].reason_code, ReasonCode::ReduceOnlyRejected);
    assert_eq!(report.order_results[3].status, OrderStatus::Filled);
    assert!(engine.position().is_some());
}

// =============================================================================
// TEST: GTC residual rests and rematches (scenario S2)
// =============================================================================

#[test]
fn test_gtc_residual_rests_then_rematches() {
    let mut engine = DryRunEngine::new(config(1_000.0, 100.0, 10.0)).unwrap();

    let limit =
        DryRunOrderRequest::limit(Side::Buy, fp(2.0), fp(99.0), TimeInForce::Gtc, ReasonCode::ManualTest);
    let report = engine
        .process_event(&event(
            1_000,
            100.0,
            book(&[(98.0, 5.0)], &[(100.0, 1.0)]),
            vec![limit],
        ))
        .unwrap();
    let placed = &report.order_results[0];
    assert_eq!(placed.status, OrderStatus::New);
    assert_eq!(placed.filled_qty, Fp::ZERO);
    assert_eq!(engine.pending_limits().count(), 1);

    // Asks shift down so 99 becomes crossable for one unit.
    let report = engine
        .process_event(&event(2_000, 99.0, book(&[(98.0, 5.0)], &[(99.0, 1.0)]), vec![]))
        .unwrap();
    assert_reconciled(&report);
    let rematch = &report.order_results[0];
    assert_eq!(rematch.status, OrderStatus::PartiallyFilled);
    assert_eq!(rematch.filled_qty, fp(1.0));
    assert_eq!(rematch.remaining_qty, fp(1.0));
    let pending: Vec<_> = engine.pending_limits().collect();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].remaining_qty, fp(1.0));
    let pos = engine.position().unwrap();
    assert_eq!(pos.signed_qty, fp(1.0));
}

#[test]
fn test_limit_ioc_expires_when_uncrossable() {
    let mut engine = DryRunEngine::new(config(1_000.0, 100.0, 10.0)).unwrap();
    let limit =
        DryRunOrderRequest::limit(Side::Buy, fp(1.0), fp(99.0), TimeInForce::Ioc, ReasonCode::ManualTest);
    let report = engine
        .process_event(&event(1_000, 100.0, book(&[(98.0, 5.0)], &[(100.0, 1.0)]), vec![limit]))
        .unwrap();
    assert_eq!(report.order_results[0].status, OrderStatus::Expired);
    assert_eq!(engine.pending_limits().count(), 0);
}

#[test]
fn test_ttl_cancel_emits_result() {
    let mut engine = DryRunEngine::new(config(1_000.0, 100.0, 10.0)).unwrap();
    let mut limit =
        DryRunOrderRequest::limit(Side::Buy, fp(1.0), fp(99.0), TimeInForce::Gtc, ReasonCode::AddonMaker);
    limit.ttl_ms = Some(1_000);
    limit.client_order_id = Some("addon-test-run-BTCUSDT-0-0".to_string());
    engine
        .process_event(&event(1_000, 100.0, book(&[(98.0, 5.0)], &[(100.0, 1.0)]), vec![limit]))
        .unwrap();
    assert_eq!(engine.pending_limits().count(), 1);

    let report = engine
        .process_event(&event(2_500, 100.0, book(&[(98.0, 5.0)], &[(100.0, 1.0)]), vec![]))
        .unwrap();
    let cancel = &report.order_results[0];
    assert_eq!(cancel.status, OrderStatus::Canceled);
    assert_eq!(cancel.reason_code, ReasonCode::LimitTtlCancel);
    assert_eq!(cancel.remaining_qty, fp(1.0));
    assert_eq!(cancel.client_order_id.as_deref(), Some("addon-test-run-BTCUSDT-0-0"));
    assert_eq!(engine.pending_limits().count(), 0);
}

// =============================================================================
// TEST: post-only semantics
// =============================================================================

#[test]
fn test_post_only_rests_or_rejects() {
    let mut engine = DryRunEngine::new(config(1_000.0, 100.0, 10.0)).unwrap();
    let mut resting =
        DryRunOrderRequest::limit(Side::Buy, fp(1.0), fp(99.0), TimeInForce::Gtc, ReasonCode::AddonMaker);
    resting.post_only = true;
    let mut crossing =
        DryRunOrderRequest::limit(Side::Buy, fp(1.0), fp(100.5), TimeInForce::Gtc, ReasonCode::AddonMaker);
    crossing.post_only = true;

    let report = engine
        .process_event(&event(
            1_000,
            100.0,
            book(&[(99.9, 10.0)], &[(100.0, 10.0)]),
            vec![resting, crossing],
        ))
        .unwrap();
    assert_eq!(report.order_results[0].status, OrderStatus::New);
    assert_eq!(report.order_results[1].status, OrderStatus::Rejected);
    assert_eq!(report.order_results[1].reason_code, ReasonCode::OrderRejected);
    assert_eq!(engine.pending_limits().count(), 1);
}

// =============================================================================
// TEST: position cap (scenario property 4)
// =============================================================================

#[test]
fn test_position_cap_limits_opening_qty() {
    // Cap notional = 100 * 10 = 1000 -> at price 100, max 10 units.
    let mut engine = DryRunEngine::new(config(10_000.0, 100.0, 10.0)).unwrap();
    let report = engine
        .process_event(&event(
            1_000,
            100.0,
            book(&[(99.9, 100.0)], &[(100.0, 100.0)]),
            vec![buy_market(20.0)],
        ))
        .unwrap();
    assert_reconciled(&report);
    let result = &report.order_results[0];
    assert_eq!(result.status, OrderStatus::PartiallyFilled);
    assert_eq!(result.filled_qty, fp(10.0));
    assert_eq!(result.remaining_qty, fp(10.0));
    let pos = engine.position().unwrap();
    assert_eq!(pos.signed_qty, fp(10.0));

    // Cap exhausted: a further opening order is rejected outright.
    let report = engine
        .process_event(&event(
            2_000,
            100.0,
            book(&[(99.9, 100.0)], &[(100.0, 100.0)]),
            vec![buy_market(1.0)],
        ))
        .unwrap();
    assert_eq!(report.order_results[0].status, OrderStatus::Rejected);
    assert_eq!(
        report.order_results[0].reason_code,
        ReasonCode::PositionLimitRejected
    );
}

#[test]
fn test_closing_portion_bypasses_cap() {
    let mut engine = DryRunEngine::new(config(10_000.0, 100.0, 10.0)).unwrap();
    engine
        .process_event(&event(
            1_000,
            100.0,
            book(&[(99.9, 100.0)], &[(100.0, 100.0)]),
            vec![buy_market(10.0)],
        ))
        .unwrap();

    // Sell 20: 10 close + 10 open, opening capped at 10 by the short cap.
    let report = engine
        .process_event(&event(
            2_000,
            100.0,
            book(&[(100.0, 100.0)], &[(100.1, 100.0)]),
            vec![sell_market(20.0)],
        ))
        .unwrap();
    assert_reconciled(&report);
    let result = &report.order_results[0];
    assert_eq!(result.filled_qty, fp(20.0));
    let pos = engine.position().unwrap();
    assert_eq!(pos.signed_qty, fp(-10.0));
    // Flip resets the entry to the fill price.
    assert_eq!(pos.entry_price, fp(100.0));
    assert_eq!(result.trade_ids.len(), 1);
}

// =============================================================================
// TEST: forced liquidation clamps wallet at zero (scenario S3)
// =============================================================================

#[test]
fn test_forced_liquidation_clamps_wallet() {
    let mut engine = DryRunEngine::new(config(50.0, 50.0, 20.0)).unwrap();
    // Open SHORT 10 @ 100: notional 1000 == cap exactly.
    let report = engine
        .process_event(&event(
            1_000,
            100.0,
            book(&[(100.0, 20.0)], &[(100.1, 20.0)]),
            vec![sell_market(10.0)],
        ))
        .unwrap();
    assert_eq!(report.order_results[0].filled_qty, fp(10.0));

    // Mark jumps to 108: equity is deep underwater, engine force-closes.
    let report = engine
        .process_event(&event(
            2_000,
            108.0,
            book(&[(108.0, 20.0)], &[(108.1, 20.0)]),
            vec![],
        ))
        .unwrap();
    assert!(report.liquidation_triggered);
    assert_eq!(report.wallet_after, Fp::ZERO);
    assert_eq!(report.reconciliation_expected_after, Fp::ZERO);
    assert!(engine.position().is_none());
    assert_eq!(engine.pending_limits().count(), 0);
    let forced = report
        .order_results
        .iter()
        .find(|r| r.reason_code == ReasonCode::ForcedLiquidation)
        .expect("forced close result present");
    assert_eq!(forced.filled_qty, fp(10.0));
    assert_eq!(forced.side, Side::Buy);
}

#[test]
fn test_forced_close_synthesizes_residual_at_matched_vwap() {
    let mut engine = DryRunEngine::new(config(50.0, 50.0, 20.0)).unwrap();
    engine
        .process_event(&event(
            1_000,
            100.0,
            book(&[(100.0, 20.0)], &[(100.1, 20.0)]),
            vec![sell_market(10.0)],
        ))
        .unwrap();

    // Thin opposite side: only 2 of 10 available; residual fills at VWAP of
    // what matched.
    let report = engine
        .process_event(&event(
            2_000,
            108.0,
            book(&[(108.0, 20.0)], &[(108.1, 2.0)]),
            vec![],
        ))
        .unwrap();
    assert!(report.liquidation_triggered);
    let forced = report
        .order_results
        .iter()
        .find(|r| r.reason_code == ReasonCode::ForcedLiquidation)
        .unwrap();
    assert_eq!(forced.filled_qty, fp(10.0));
    assert_eq!(forced.avg_fill_price, Some(fp(108.1)));
    assert_eq!(report.wallet_after, Fp::ZERO);
}

// =============================================================================
// TEST: funding gap loop (scenario S4)
// =============================================================================

#[test]
fn test_funding_gap_applies_per_boundary() {
    let mut cfg = config(1_000.0, 100.0, 10.0);
    cfg.funding_rate = fp(0.0001);
    let mut engine = DryRunEngine::new(cfg).unwrap();

    // Open LONG 1 @ 100 shortly after epoch; first boundary = 1h.
    engine
        .process_event(&event(
            1_000,
            100.0,
            book(&[(99.9, 10.0)], &[(100.0, 10.0)]),
            vec![buy_market(1.0)],
        ))
        .unwrap();

    // Jump to exactly 2h: two boundaries crossed, each costing 0.01.
    let report = engine
        .process_event(&event(
            7_200_000,
            100.0,
            book(&[(99.9, 10.0)], &[(100.0, 10.0)]),
            vec![],
        ))
        .unwrap();
    assert_reconciled(&report);
    assert_eq!(report.funding_impact, fp(-0.02));

    // Next event inside the same interval: no further funding.
    let report = engine
        .process_event(&event(
            7_500_000,
            100.0,
            book(&[(99.9, 10.0)], &[(100.0, 10.0)]),
            vec![],
        ))
        .unwrap();
    assert_eq!(report.funding_impact, Fp::ZERO);
}

#[test]
fn test_short_receives_positive_funding() {
    let mut cfg = config(1_000.0, 100.0, 10.0);
    cfg.funding_rate = fp(0.0001);
    let mut engine = DryRunEngine::new(cfg).unwrap();
    engine
        .process_event(&event(
            1_000,
            100.0,
            book(&[(100.0, 10.0)], &[(100.1, 10.0)]),
            vec![sell_market(1.0)],
        ))
        .unwrap();
    let report = engine
        .process_event(&event(
            3_600_000,
            100.0,
            book(&[(100.0, 10.0)], &[(100.1, 10.0)]),
            vec![],
        ))
        .unwrap();
    assert_eq!(report.funding_impact, fp(0.01));
}

// =============================================================================
// TEST: leverage override and snapshots
// =============================================================================

#[test]
fn test_leverage_override_validation() {
    let mut engine = DryRunEngine::new(config(1_000.0, 100.0, 10.0)).unwrap();
    assert!(matches!(
        engine.set_leverage_override(Fp::ZERO),
        Err(EngineError::InvalidLeverage)
    ));
    engine.set_leverage_override(fp(5.0)).unwrap();

    // Cap now 100 * 5 = 500 -> 5 units at price 100.
    let report = engine
        .process_event(&event(
            1_000,
            100.0,
            book(&[(99.9, 100.0)], &[(100.0, 100.0)]),
            vec![buy_market(10.0)],
        ))
        .unwrap();
    assert_eq!(report.order_results[0].filled_qty, fp(5.0));
}

#[test]
fn test_snapshot_restore_round_trip() {
    let mut engine = DryRunEngine::new(config(1_000.0, 100.0, 10.0)).unwrap();
    engine
        .process_event(&event(
            1_000,
            100.0,
            book(&[(99.9, 10.0)], &[(100.0, 10.0)]),
            vec![buy_market(1.0)],
        ))
        .unwrap();
    let snapshot = engine.snapshot();

    let mut restored = DryRunEngine::new(config(1_000.0, 100.0, 10.0)).unwrap();
    restored.restore_state(snapshot);
    assert_eq!(restored.wallet(), engine.wallet());
    assert_eq!(restored.position(), engine.position());
    assert_eq!(restored.sequence(), engine.sequence());

    // The restored engine keeps rejecting stale timestamps.
    let err = restored
        .process_event(&event(500, 100.0, book(&[(99.0, 1.0)], &[(100.0, 1.0)]), vec![]))
        .unwrap_err();
    assert!(matches!(err, EngineError::NonMonotonicEventTimestamp { .. }));
}

#[test]
fn test_state_snapshot_margin_health() {
    let mut engine = DryRunEngine::new(config(1_000.0, 100.0, 10.0)).unwrap();
    engine
        .process_event(&event(
            1_000,
            100.0,
            book(&[(99.9, 10.0)], &[(100.0, 10.0)]),
            vec![buy_market(1.0)],
        ))
        .unwrap();
    let snapshot = engine.get_state_snapshot(Some(fp(100.0)));
    assert!(snapshot.margin_health.unwrap() > Fp::ZERO);
    assert!(snapshot.margin_health.unwrap() <= Fp::ONE);
    assert_eq!(snapshot.position.unwrap().signed_qty, fp(1.0));
}

// =============================================================================
// TEST: determinism (property 5)
// =============================================================================

#[test]
fn test_identical_runs_are_bit_identical() {
    let run = || {
        let mut cfg = config(1_000.0, 100.0, 10.0);
        cfg.funding_rate = fp(0.0001);
        cfg.impact = MarketImpactConfig::default();
        let mut engine = DryRunEngine::new(cfg).unwrap();
        let mut reports = Vec::new();
        reports.push(
            engine
                .process_event(&event(
                    1_000,
                    100.0,
                    book(&[(99.9, 10.0)], &[(100.0, 10.0)]),
                    vec![buy_market(1.5)],
                ))
                .unwrap(),
        );
        reports.push(
            engine
                .process_event(&event(
                    3_700_000,
                    101.0,
                    book(&[(101.0, 10.0)], &[(101.1, 10.0)]),
                    vec![reduce_only(Side::Sell, 0.5)],
                ))
                .unwrap(),
        );
        reports
    };

    let a = run();
    let b = run();
    assert_eq!(
        serde_json::to_string(&a).unwrap(),
        serde_json::to_string(&b).unwrap()
    );
    assert_eq!(a[0].order_results[0].order_id, b[0].order_results[0].order_id);
    assert_eq!(a[1].order_results[0].trade_ids, b[1].order_results[0].trade_ids);
}

// =============================================================================
// TEST: weighted average entry on same-side adds
// =============================================================================

#[test]
fn test_same_side_add_weights_entry() {
    let mut engine = DryRunEngine::new(config(10_000.0, 1_000.0, 10.0)).unwrap();
    engine
        .process_event(&event(
            1_000,
            100.0,
            book(&[(99.9, 10.0)], &[(100.0, 10.0)]),
            vec![buy_market(1.0)],
        ))
        .unwrap();
    engine
        .process_event(&event(
            2_000,
            102.0,
            book(&[(101.9, 10.0)], &[(102.0, 10.0)]),
            vec![buy_market(1.0)],
        ))
        .unwrap();
    let pos = engine.position().unwrap();
    assert_eq!(pos.signed_qty, fp(2.0));
    assert_eq!(pos.entry_price, fp(101.0));
}

// =============================================================================
// TEST: exact zero crossing clears the position
// =============================================================================

#[test]
fn test_exact_close_clears_position() {
    let mut engine = DryRunEngine::new(config(1_000.0, 100.0, 10.0)).unwrap();
    engine
        .process_event(&event(
            1_000,
            100.0,
            book(&[(99.9, 10.0)], &[(100.0, 10.0)]),
            vec![buy_market(2.0)],
        ))
        .unwrap();
    let report = engine
        .process_event(&event(
            2_000,
            100.0,
            book(&[(100.0, 10.0)], &[(100.1, 10.0)]),
            vec![sell_market(2.0)],
        ))
        .unwrap();
    assert!(engine.position().is_none());
    assert_eq!(report.order_results[0].filled_qty, fp(2.0));
    // No carry: a fresh reduce-only order is now rejected.
    let report = engine
        .process_event(&event(
            3_000,
            100.0,
            book(&[(100.0, 10.0)], &[(100.1, 10.0)]),
            vec![reduce_only(Side::Sell, 1.0)],
        ))
        .unwrap();
    assert_eq!(report.order_results[0].reason_code, ReasonCode::ReduceOnlyRejected);
}

// =============================================================================
// TEST: sequence numbering
// =============================================================================

#[test]
fn test_sequence_increments_per_event() {
    let mut engine = DryRunEngine::new(config(1_000.0, 100.0, 10.0)).unwrap();
    let b = || book(&[(99.0, 1.0)], &[(100.0, 1.0)]);
    let r1 = engine.process_event(&event(1_000, 100.0, b(), vec![])).unwrap();
    let r2 = engine.process_event(&event(2_000, 100.0, b(), vec![])).unwrap();
    let r3 = engine.process_event(&event(3_000, 100.0, b(), vec![])).unwrap();
    assert_eq!(r1.sequence, 1);
    assert_eq!(r2.sequence, 2);
    assert_eq!(r3.sequence, 3);
    assert_ne!(r1.event_id, r2.event_id);
    assert_ne!(r2.event_id, r3.event_id);
}
