// Plan generation. Pure over a snapshot of the projection so the policy is
// unit-testable without storage or chain.

use log::debug;
use serde::Serialize;

use meridian_common::{
    config::{BPS_DENOMINATOR, DEFAULT_MAX_SLIPPAGE_BPS, PENDING_OUTFLOW_ALERT_BPS},
    fund::{Amount, AssetHolding, BasisPoints, Tier, TierPolicy},
    rebalance::{PlannedAction, PurchaseMethod, RebalanceAction, TierSnapshot},
};

#[derive(Debug, Clone, Copy, Serialize)]
pub struct TierDeviation {
    pub tier: Tier,
    pub current_ratio_bps: BasisPoints,
    pub target_ratio_bps: BasisPoints,
    // signed, current - target
    pub deviation_bps: i64,
    pub within_bounds: bool,
}

pub fn tier_deviations(state: &TierSnapshot, policy: &TierPolicy) -> Vec<TierDeviation> {
    policy
        .iter()
        .map(|(tier, bounds)| {
            let current = state.tier_ratio_bps(*tier);
            TierDeviation {
                tier: *tier,
                current_ratio_bps: current,
                target_ratio_bps: bounds.target_bps,
                deviation_bps: current as i64 - bounds.target_bps as i64,
                within_bounds: current >= bounds.low_bps && current <= bounds.high_bps,
            }
        })
        .collect()
}

fn ratio_of(total: Amount, bps: BasisPoints) -> Amount {
    total / BPS_DENOMINATOR as u128 * bps as u128
}

// The generation policy, priority 0 (highest) to 3:
//   0. waterfall preparation when confirmed 7d outflow crowds L1+L2
//   1. L1 refill from L2 surplus, then L3 redemption
//   2. L1 drain into L3 shortfall, then L2
//   3. L2 buffer correction
// Actions below `min_amount` are dropped.
pub fn generate_actions(
    state: &TierSnapshot,
    policy: &TierPolicy,
    holdings: &[AssetHolding],
    confirmed_outflow_7d: Amount,
    min_amount: Amount,
) -> Vec<PlannedAction> {
    let mut actions = Vec::new();
    let l1 = state.l1;
    let l2 = state.l2;
    let l3 = state.l3;

    let l1_bounds = policy.get(&Tier::L1).copied();
    let l2_bounds = policy.get(&Tier::L2).copied();
    let l3_bounds = policy.get(&Tier::L3).copied();

    // 0: pending redemption preparation
    let liquid = l1.saturating_add(l2);
    let coverage_floor = liquid / BPS_DENOMINATOR as u128 * PENDING_OUTFLOW_ALERT_BPS as u128;
    if confirmed_outflow_7d > coverage_floor {
        let deficit = confirmed_outflow_7d - coverage_floor;
        actions.push(PlannedAction {
            priority: 0,
            action: RebalanceAction::Waterfall {
                amount_needed: deficit,
                max_tier: Tier::L3,
            },
        });
    }

    // 1: L1 refill
    if let (Some(l1b), Some(l2b)) = (l1_bounds, l2_bounds) {
        let l1_low = ratio_of(state.total_assets, l1b.low_bps);
        if l1 < l1_low {
            let mut deficit = ratio_of(state.total_assets, l1b.target_bps).saturating_sub(l1);
            let l2_surplus = l2.saturating_sub(ratio_of(state.total_assets, l2b.target_bps));
            let transfer = deficit.min(l2_surplus);
            if transfer > 0 {
                actions.push(PlannedAction {
                    priority: 1,
                    action: RebalanceAction::Transfer {
                        from_tier: Tier::L2,
                        to_tier: Tier::L1,
                        amount: transfer,
                    },
                });
                deficit -= transfer;
            }
            if deficit > 0 {
                if let Some(asset) = largest_holding(holdings, Tier::L3) {
                    actions.push(PlannedAction {
                        priority: 1,
                        action: RebalanceAction::Redeem {
                            asset: asset.asset,
                            amount: deficit.min(l3),
                            to_tier: Tier::L1,
                            max_slippage_bps: DEFAULT_MAX_SLIPPAGE_BPS,
                        },
                    });
                } else {
                    debug!("L1 deficit of {} but no L3 holding to redeem", deficit);
                }
            }
        }
    }

    // 2: L1 drain
    if let (Some(l1b), Some(l3b)) = (l1_bounds, l3_bounds) {
        let l1_high = ratio_of(state.total_assets, l1b.high_bps);
        if l1 > l1_high {
            let mut excess = l1.saturating_sub(ratio_of(state.total_assets, l1b.target_bps));
            let l3_shortfall = ratio_of(state.total_assets, l3b.target_bps).saturating_sub(l3);
            let into_l3 = excess.min(l3_shortfall);
            if into_l3 > 0 {
                if let Some(asset) = largest_holding(holdings, Tier::L3) {
                    actions.push(PlannedAction {
                        priority: 2,
                        action: RebalanceAction::Purchase {
                            asset: asset.asset,
                            from_tier: Tier::L1,
                            usdt_amount: into_l3,
                            method: PurchaseMethod::Instant,
                            max_slippage_bps: DEFAULT_MAX_SLIPPAGE_BPS,
                        },
                    });
                    excess -= into_l3;
                }
            }
            if excess > 0 {
                if let Some(asset) = largest_holding(holdings, Tier::L2) {
                    actions.push(PlannedAction {
                        priority: 2,
                        action: RebalanceAction::Purchase {
                            asset: asset.asset,
                            from_tier: Tier::L1,
                            usdt_amount: excess,
                            method: PurchaseMethod::Instant,
                            max_slippage_bps: DEFAULT_MAX_SLIPPAGE_BPS,
                        },
                    });
                } else {
                    actions.push(PlannedAction {
                        priority: 2,
                        action: RebalanceAction::Transfer {
                            from_tier: Tier::L1,
                            to_tier: Tier::L2,
                            amount: excess,
                        },
                    });
                }
            }
        }
    }

    // 3: L2 buffer correction
    if let Some(l2b) = l2_bounds {
        let l2_low = ratio_of(state.total_assets, l2b.low_bps);
        let l2_high = ratio_of(state.total_assets, l2b.high_bps);
        let l2_target = ratio_of(state.total_assets, l2b.target_bps);
        if l2 < l2_low {
            let amount = (l2_target - l2).min(l3);
            if amount > 0 {
                actions.push(PlannedAction {
                    priority: 3,
                    action: RebalanceAction::Transfer {
                        from_tier: Tier::L3,
                        to_tier: Tier::L2,
                        amount,
                    },
                });
            }
        } else if l2 > l2_high {
            actions.push(PlannedAction {
                priority: 3,
                action: RebalanceAction::Transfer {
                    from_tier: Tier::L2,
                    to_tier: Tier::L3,
                    amount: l2 - l2_target,
                },
            });
        }
    }

    actions.retain(|a| a.action.amount() >= min_amount);
    actions.sort_by_key(|a| a.priority);
    actions
}

// Expected state once every action lands; the simulation gate compares this
// against the plan's target
pub fn project_post_state(state: &TierSnapshot, actions: &[PlannedAction]) -> TierSnapshot {
    let mut post = *state;
    for planned in actions {
        match &planned.action {
            RebalanceAction::Transfer {
                from_tier,
                to_tier,
                amount,
            } => {
                let from = post.tier_value(*from_tier);
                post.set_tier_value(*from_tier, from.saturating_sub(*amount));
                let to = post.tier_value(*to_tier);
                post.set_tier_value(*to_tier, to.saturating_add(*amount));
            }
            RebalanceAction::Purchase {
                from_tier,
                usdt_amount,
                ..
            } => {
                let from = post.tier_value(*from_tier);
                post.set_tier_value(*from_tier, from.saturating_sub(*usdt_amount));
                let l3 = post.tier_value(Tier::L3);
                post.set_tier_value(Tier::L3, l3.saturating_add(*usdt_amount));
            }
            RebalanceAction::Redeem {
                amount, to_tier, ..
            } => {
                let l3 = post.tier_value(Tier::L3);
                post.set_tier_value(Tier::L3, l3.saturating_sub(*amount));
                let to = post.tier_value(*to_tier);
                post.set_tier_value(*to_tier, to.saturating_add(*amount));
            }
            RebalanceAction::Waterfall { amount_needed, max_tier } => {
                let mut remaining = *amount_needed;
                for tier in [Tier::L2, Tier::L3] {
                    if tier > *max_tier || remaining == 0 {
                        continue;
                    }
                    let value = post.tier_value(tier);
                    let taken = value.min(remaining);
                    post.set_tier_value(tier, value - taken);
                    remaining -= taken;
                }
                let l1 = post.tier_value(Tier::L1);
                post.set_tier_value(
                    Tier::L1,
                    l1.saturating_add(amount_needed.saturating_sub(remaining)),
                );
            }
        }
    }
    post
}

fn largest_holding(holdings: &[AssetHolding], tier: Tier) -> Option<&AssetHolding> {
    holdings
        .iter()
        .filter(|h| h.tier == tier)
        .max_by_key(|h| h.balance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::{chain::ContractAddress, fund::default_tier_policy};

    fn holdings() -> Vec<AssetHolding> {
        vec![
            AssetHolding {
                asset: ContractAddress::repeat_byte(2),
                tier: Tier::L2,
                balance: 300,
                target_allocation_bps: 0,
                updated_at: 0,
            },
            AssetHolding {
                asset: ContractAddress::repeat_byte(3),
                tier: Tier::L3,
                balance: 550,
                target_allocation_bps: 0,
                updated_at: 0,
            },
        ]
    }

    #[test]
    fn balanced_fund_generates_no_actions() {
        let state = TierSnapshot {
            l1: 1_500_000,
            l2: 3_000_000,
            l3: 5_500_000,
            total_assets: 10_000_000,
        };
        let actions = generate_actions(&state, &default_tier_policy(), &holdings(), 0, 1);
        assert!(actions.is_empty());
    }

    #[test]
    fn l1_refill_prefers_l2_surplus_then_l3() {
        // L1 at 5% (low is 10%), L2 fat at 40%
        let state = TierSnapshot {
            l1: 500_000,
            l2: 4_000_000,
            l3: 5_500_000,
            total_assets: 10_000_000,
        };
        let actions = generate_actions(&state, &default_tier_policy(), &holdings(), 0, 1);
        // deficit to target = 1.0M, l2 surplus = 1.0M: a single transfer
        assert_eq!(actions.len(), 1);
        match &actions[0].action {
            RebalanceAction::Transfer {
                from_tier,
                to_tier,
                amount,
            } => {
                assert_eq!((*from_tier, *to_tier), (Tier::L2, Tier::L1));
                assert_eq!(*amount, 1_000_000);
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert_eq!(actions[0].priority, 1);

        // with a thin L2 the remainder comes from L3
        let state = TierSnapshot {
            l1: 500_000,
            l2: 3_200_000,
            l3: 6_300_000,
            total_assets: 10_000_000,
        };
        let actions = generate_actions(&state, &default_tier_policy(), &holdings(), 0, 1);
        assert_eq!(actions.len(), 2);
        assert!(matches!(
            actions[1].action,
            RebalanceAction::Redeem { amount: 800_000, .. }
        ));
    }

    #[test]
    fn outflow_crunch_emits_priority_zero_waterfall() {
        let state = TierSnapshot {
            l1: 1_500_000,
            l2: 3_000_000,
            l3: 5_500_000,
            total_assets: 10_000_000,
        };
        // outflow of 4.0M exceeds 80% of L1+L2 (3.6M)
        let actions =
            generate_actions(&state, &default_tier_policy(), &holdings(), 4_000_000, 1);
        assert_eq!(actions[0].priority, 0);
        assert!(matches!(
            actions[0].action,
            RebalanceAction::Waterfall {
                amount_needed: 400_000,
                max_tier: Tier::L3
            }
        ));
    }

    #[test]
    fn small_actions_are_dropped_at_the_boundary() {
        let state = TierSnapshot {
            l1: 500_000,
            l2: 4_000_000,
            l3: 5_500_000,
            total_assets: 10_000_000,
        };
        // transfer of exactly 1.0M survives a min of 1.0M
        let actions =
            generate_actions(&state, &default_tier_policy(), &holdings(), 0, 1_000_000);
        assert_eq!(actions.len(), 1);
        // one unit above the action amount: dropped
        let actions =
            generate_actions(&state, &default_tier_policy(), &holdings(), 0, 1_000_001);
        assert!(actions.is_empty());
    }

    #[test]
    fn post_state_projection_reaches_target() {
        let state = TierSnapshot {
            l1: 500_000,
            l2: 4_000_000,
            l3: 5_500_000,
            total_assets: 10_000_000,
        };
        let policy = default_tier_policy();
        let actions = generate_actions(&state, &policy, &holdings(), 0, 1);
        let post = project_post_state(&state, &actions);
        assert_eq!(post.l1, 1_500_000);
        assert_eq!(post.l2, 3_000_000);
    }
}
