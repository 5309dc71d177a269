//! Add-On Ladder
//!
//! Pyramiding into a winning position with passive maker orders. An add-on
//! is only placed when the position is already profitable, the signal still
//! agrees, spread and notional are healthy and the ladder has rungs left.
//! Placed orders are post-only GTC with a TTL; on TTL expiry the order is
//! repriced at the refreshed quote a bounded number of times.

use crate::dryrun::clock::Millis;
use crate::dryrun::events::{Direction, DryRunOrderRequest, OrderType, ReasonCode, TimeInForce};
use crate::dryrun::fixed::Fp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddonConfig {
    /// Minimum unrealized PnL (fraction of entry notional) before adding.
    pub min_upnl_pct: Fp,
    /// Minimum signal score (0-100 scale).
    pub signal_min: Fp,
    /// Minimum gap between add-ons.
    pub cooldown_ms: i64,
    /// Ladder size.
    pub max_count: u32,
    /// Cap on position notional + proposed notional.
    pub max_notional: Fp,
    /// Scales the risk-governor qty for add-ons.
    pub size_multiplier: Fp,
    /// Resting lifetime of the maker order.
    pub ttl_ms: i64,
    /// Reprice budget after TTL cancels.
    pub max_reprice_attempts: u32,
}

impl Default for AddonConfig {
    fn default() -> Self {
        Self {
            min_upnl_pct: Fp::from_raw(200_000), // 0.2%
            signal_min: Fp::from_int(60),
            cooldown_ms: 60_000,
            max_count: 3,
            max_notional: Fp::from_int(10_000),
            size_multiplier: Fp::from_raw(50_000_000), // 0.5
            ttl_ms: 15_000,
            max_reprice_attempts: 2,
        }
    }
}

/// Everything the eligibility check needs for one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct AddonContext {
    pub now_ms: Millis,
    pub position_direction: Direction,
    pub position_notional: Fp,
    pub unrealized_pnl_pct: Fp,
    pub signal_direction: Direction,
    pub signal_score: Fp,
    pub spread_pct: Fp,
    pub max_spread_pct: Fp,
    /// Best quote on the position's own side (bid for LONG, ask for SHORT).
    pub best_same_side_price: Fp,
    /// Risk-governor base qty before the add-on multiplier.
    pub sized_qty: Fp,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddonState {
    pub count: u32,
    pub last_addon_ts: Millis,
    pub pending_client_order_id: Option<String>,
    pub pending_addon_index: Option<u32>,
    pub pending_attempt: u32,
    pub filled_client_order_ids: BTreeSet<String>,
}

impl AddonState {
    pub fn reset(&mut self) {
        *self = AddonState::default();
    }

    fn client_order_id(run_id: &str, symbol: &str, index: u32, attempt: u32) -> String {
        format!("addon-{run_id}-{symbol}-{index}-{attempt}")
    }

    fn build_order(
        &self,
        config: &AddonConfig,
        direction: Direction,
        price: Fp,
        qty: Fp,
        index: u32,
        attempt: u32,
        client_order_id: String,
    ) -> DryRunOrderRequest {
        DryRunOrderRequest {
            side: direction.entry_side(),
            order_type: OrderType::Limit,
            tif: TimeInForce::Gtc,
            qty,
            price: Some(price),
            reduce_only: false,
            post_only: true,
            ttl_ms: Some(config.ttl_ms),
            reason_code: ReasonCode::AddonMaker,
            client_order_id: Some(client_order_id),
            addon_index: Some(index),
            reprice_attempt: attempt,
        }
    }

    /// Evaluate eligibility; on success the returned maker order is recorded
    /// as pending.
    pub fn evaluate(
        &mut self,
        config: &AddonConfig,
        run_id: &str,
        symbol: &str,
        ctx: &AddonContext,
    ) -> Option<DryRunOrderRequest> {
        if self.pending_client_order_id.is_some() {
            return None;
        }
        if ctx.signal_direction != ctx.position_direction {
            return None;
        }
        if ctx.unrealized_pnl_pct < config.min_upnl_pct {
            return None;
        }
        if ctx.signal_score < config.signal_min {
            return None;
        }
        if ctx.now_ms - self.last_addon_ts < config.cooldown_ms {
            return None;
        }
        if self.count >= config.max_count {
            return None;
        }
        if ctx.spread_pct > ctx.max_spread_pct {
            return None;
        }
        let qty = ctx.sized_qty.mul(config.size_multiplier);
        if !qty.is_positive() || !ctx.best_same_side_price.is_positive() {
            return None;
        }
        let proposed_notional = qty.mul(ctx.best_same_side_price);
        if ctx.position_notional + proposed_notional > config.max_notional {
            return None;
        }

        let index = self.count;
        let attempt = 0;
        let client_order_id = Self::client_order_id(run_id, symbol, index, attempt);
        let order = self.build_order(
            config,
            ctx.position_direction,
            ctx.best_same_side_price,
            qty,
            index,
            attempt,
            client_order_id.clone(),
        );
        self.pending_client_order_id = Some(client_order_id);
        self.pending_addon_index = Some(index);
        self.pending_attempt = attempt;
        Some(order)
    }

    /// React to a TTL cancel of the pending maker order. Reprices at the
    /// refreshed quote while the attempt budget lasts and the signal still
    /// agrees with the position.
    #[allow(clippy::too_many_arguments)]
    pub fn on_ttl_cancel(
        &mut self,
        config: &AddonConfig,
        run_id: &str,
        symbol: &str,
        client_order_id: &str,
        remaining_qty: Fp,
        position_direction: Direction,
        signal_direction: Option<Direction>,
        refreshed_price: Fp,
    ) -> Option<DryRunOrderRequest> {
        if self.pending_client_order_id.as_deref() != Some(client_order_id) {
            return None;
        }
        let index = self.pending_addon_index.unwrap_or(self.count);
        let next_attempt = self.pending_attempt + 1;
        self.pending_client_order_id = None;
        self.pending_addon_index = None;

        if !remaining_qty.is_positive()
            || next_attempt > config.max_reprice_attempts
            || signal_direction != Some(position_direction)
            || !refreshed_price.is_positive()
        {
            self.pending_attempt = 0;
            return None;
        }

        let new_id = Self::client_order_id(run_id, symbol, index, next_attempt);
        let order = self.build_order(
            config,
            position_direction,
            refreshed_price,
            remaining_qty,
            index,
            next_attempt,
            new_id.clone(),
        );
        self.pending_client_order_id = Some(new_id);
        self.pending_addon_index = Some(index);
        self.pending_attempt = next_attempt;
        Some(order)
    }

    /// Record a fill of an add-on maker order. The ladder count advances
    /// once per distinct client order id.
    pub fn on_fill(&mut self, client_order_id: &str, now_ms: Millis) {
        if self.filled_client_order_ids.insert(client_order_id.to_string()) {
            self.count += 1;
            self.last_addon_ts = now_ms;
        }
        if self.pending_client_order_id.as_deref() == Some(client_order_id) {
            self.pending_client_order_id = None;
            self.pending_addon_index = None;
            self.pending_attempt = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(v: f64) -> Fp {
        Fp::from_f64(v).unwrap()
    }

    fn ctx() -> AddonContext {
        AddonContext {
            now_ms: 100_000,
            position_direction: Direction::Long,
            position_notional: fp(100.0),
            unrealized_pnl_pct: fp(0.005),
            signal_direction: Direction::Long,
            signal_score: fp(70.0),
            spread_pct: fp(0.0005),
            max_spread_pct: fp(0.003),
            best_same_side_price: fp(100.0),
            sized_qty: fp(1.0),
        }
    }

    #[test]
    fn test_eligible_addon_places_post_only_gtc() {
        let config = AddonConfig::default();
        let mut state = AddonState::default();
        let order = state.evaluate(&config, "run1", "BTCUSDT", &ctx()).unwrap();
        assert_eq!(order.order_type, OrderType::Limit);
        assert_eq!(order.tif, TimeInForce::Gtc);
        assert!(order.post_only);
        assert_eq!(order.price, Some(fp(100.0)));
        assert_eq!(order.qty, fp(0.5));
        assert_eq!(order.reason_code, ReasonCode::AddonMaker);
        assert_eq!(
            order.client_order_id.as_deref(),
            Some("addon-run1-BTCUSDT-0-0")
        );
    }

    #[test]
    fn test_blocked_while_pending() {
        let config = AddonConfig::default();
        let mut state = AddonState::default();
        assert!(state.evaluate(&config, "run1", "BTCUSDT", &ctx()).is_some());
        assert!(state.evaluate(&config, "run1", "BTCUSDT", &ctx()).is_none());
    }

    #[test]
    fn test_ineligibility_gates() {
        let config = AddonConfig::default();
        let mut state = AddonState::default();

        let losing = AddonContext {
            unrealized_pnl_pct: fp(-0.001),
            ..ctx()
        };
        assert!(state.evaluate(&config, "r", "S", &losing).is_none());

        let opposed = AddonContext {
            signal_direction: Direction::Short,
            ..ctx()
        };
        assert!(state.evaluate(&config, "r", "S", &opposed).is_none());

        let weak = AddonContext {
            signal_score: fp(10.0),
            ..ctx()
        };
        assert!(state.evaluate(&config, "r", "S", &weak).is_none());

        let wide = AddonContext {
            spread_pct: fp(0.02),
            ..ctx()
        };
        assert!(state.evaluate(&config, "r", "S", &wide).is_none());

        let oversized = AddonContext {
            position_notional: fp(9_990.0),
            ..ctx()
        };
        assert!(state.evaluate(&config, "r", "S", &oversized).is_none());
    }

    #[test]
    fn test_ttl_reprice_increments_attempt() {
        let config = AddonConfig::default();
        let mut state = AddonState::default();
        let first = state.evaluate(&config, "run1", "BTCUSDT", &ctx()).unwrap();
        let id = first.client_order_id.clone().unwrap();

        let repriced = state
            .on_ttl_cancel(
                &config,
                "run1",
                "BTCUSDT",
                &id,
                first.qty,
                Direction::Long,
                Some(Direction::Long),
                fp(99.5),
            )
            .unwrap();
        assert_eq!(repriced.reprice_attempt, 1);
        assert_eq!(repriced.price, Some(fp(99.5)));
        assert_eq!(
            repriced.client_order_id.as_deref(),
            Some("addon-run1-BTCUSDT-0-1")
        );
        assert_eq!(state.count, 0);
    }

    #[test]
    fn test_reprice_budget_exhausts() {
        let config = AddonConfig {
            max_reprice_attempts: 1,
            ..Default::default()
        };
        let mut state = AddonState::default();
        let first = state.evaluate(&config, "r", "S", &ctx()).unwrap();
        let id1 = first.client_order_id.clone().unwrap();
        let second = state
            .on_ttl_cancel(&config, "r", "S", &id1, first.qty, Direction::Long, Some(Direction::Long), fp(99.0))
            .unwrap();
        let id2 = second.client_order_id.clone().unwrap();
        assert!(state
            .on_ttl_cancel(&config, "r", "S", &id2, first.qty, Direction::Long, Some(Direction::Long), fp(99.0))
            .is_none());
        assert!(state.pending_client_order_id.is_none());
    }

    #[test]
    fn test_reprice_blocked_when_signal_flips() {
        let config = AddonConfig::default();
        let mut state = AddonState::default();
        let first = state.evaluate(&config, "r", "S", &ctx()).unwrap();
        let id = first.client_order_id.clone().unwrap();
        assert!(state
            .on_ttl_cancel(&config, "r", "S", &id, first.qty, Direction::Long, Some(Direction::Short), fp(99.0))
            .is_none());
    }

    #[test]
    fn test_fill_counts_once_per_client_id() {
        let config = AddonConfig::default();
        let mut state = AddonState::default();
        let order = state.evaluate(&config, "r", "S", &ctx()).unwrap();
        let id = order.client_order_id.clone().unwrap();
        state.on_fill(&id, 200_000);
        state.on_fill(&id, 201_000);
        assert_eq!(state.count, 1);
        assert_eq!(state.last_addon_ts, 200_000);
        assert!(state.pending_client_order_id.is_none());
    }
}
