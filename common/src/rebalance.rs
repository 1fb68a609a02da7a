use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::{
    chain::{ContractAddress, TxHash},
    config::BPS_DENOMINATOR,
    fund::{Amount, BasisPoints, Tier},
    time::TimestampMillis,
};

pub type PlanId = u64;

// What caused a plan to be generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum RebalanceTrigger {
    Threshold,
    Liquidity,
    Strategic,
    NavUpdated,
    LargeFlow,
    Manual,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Draft,
    PendingApproval,
    Approved,
    Executing,
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Partial | Self::Failed | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PurchaseMethod {
    Instant,
    Subscription,
}

// The four action shapes a plan is allowed to contain
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "UPPERCASE")]
pub enum RebalanceAction {
    Transfer {
        from_tier: Tier,
        to_tier: Tier,
        amount: Amount,
    },
    Purchase {
        asset: ContractAddress,
        from_tier: Tier,
        usdt_amount: Amount,
        method: PurchaseMethod,
        max_slippage_bps: BasisPoints,
    },
    Redeem {
        asset: ContractAddress,
        amount: Amount,
        to_tier: Tier,
        max_slippage_bps: BasisPoints,
    },
    Waterfall {
        amount_needed: Amount,
        max_tier: Tier,
    },
}

impl RebalanceAction {
    pub fn amount(&self) -> Amount {
        match self {
            Self::Transfer { amount, .. } => *amount,
            Self::Purchase { usdt_amount, .. } => *usdt_amount,
            Self::Redeem { amount, .. } => *amount,
            Self::Waterfall { amount_needed, .. } => *amount_needed,
        }
    }

    pub fn max_slippage_bps(&self) -> Option<BasisPoints> {
        match self {
            Self::Purchase {
                max_slippage_bps, ..
            }
            | Self::Redeem {
                max_slippage_bps, ..
            } => Some(*max_slippage_bps),
            _ => None,
        }
    }

    // Tiers this action reads from or writes to; used for the independence
    // check that allows same-priority concurrency
    pub fn tiers_touched(&self) -> Vec<Tier> {
        match self {
            Self::Transfer { from_tier, to_tier, .. } => vec![*from_tier, *to_tier],
            Self::Purchase { from_tier, .. } => vec![*from_tier, Tier::L3],
            Self::Redeem { to_tier, .. } => vec![Tier::L3, *to_tier],
            // Waterfall may touch everything up to max_tier
            Self::Waterfall { max_tier, .. } => {
                Tier::ALL.iter().filter(|t| **t <= *max_tier).copied().collect()
            }
        }
    }

    pub fn is_independent_of(&self, other: &RebalanceAction) -> bool {
        let mine = self.tiers_touched();
        !other.tiers_touched().iter().any(|t| mine.contains(t))
    }
}

// An action with its execution priority; lower executes first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannedAction {
    pub priority: u8,
    pub action: RebalanceAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionOutcome {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResult {
    pub index: usize,
    pub outcome: ActionOutcome,
    pub tx_hash: Option<TxHash>,
    pub error: Option<String>,
    pub executed_at: TimestampMillis,
}

// Tier values captured before planning and projected after execution
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TierSnapshot {
    pub l1: Amount,
    pub l2: Amount,
    pub l3: Amount,
    pub total_assets: Amount,
}

impl TierSnapshot {
    pub fn tier_value(&self, tier: Tier) -> Amount {
        match tier {
            Tier::L1 => self.l1,
            Tier::L2 => self.l2,
            Tier::L3 => self.l3,
        }
    }

    pub fn set_tier_value(&mut self, tier: Tier, value: Amount) {
        match tier {
            Tier::L1 => self.l1 = value,
            Tier::L2 => self.l2 = value,
            Tier::L3 => self.l3 = value,
        }
    }

    pub fn tier_ratio_bps(&self, tier: Tier) -> BasisPoints {
        if self.total_assets == 0 {
            return 0;
        }
        ((self.tier_value(tier) * BPS_DENOMINATOR as u128) / self.total_assets) as BasisPoints
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalancePlan {
    pub id: PlanId,
    pub trigger: RebalanceTrigger,
    pub pre_state: TierSnapshot,
    pub target_state: TierSnapshot,
    pub actions: Vec<PlannedAction>,
    pub estimated_gas_cost: u64,
    pub estimated_slippage_bps: BasisPoints,
    pub requires_approval: bool,
    pub approval_ticket_id: Option<u64>,
    pub status: PlanStatus,
    pub results: Vec<ActionResult>,
    pub created_at: TimestampMillis,
    pub updated_at: TimestampMillis,
}

impl RebalancePlan {
    pub fn total_amount(&self) -> Amount {
        self.actions.iter().map(|a| a.action.amount()).sum()
    }

    // Results must stay a prefix of actions in priority order
    pub fn results_are_ordered_prefix(&self) -> bool {
        self.results
            .iter()
            .enumerate()
            .all(|(i, r)| r.index == i && r.index < self.actions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_independence() {
        let a = RebalanceAction::Transfer {
            from_tier: Tier::L2,
            to_tier: Tier::L1,
            amount: 100,
        };
        let b = RebalanceAction::Transfer {
            from_tier: Tier::L2,
            to_tier: Tier::L1,
            amount: 50,
        };
        assert!(!a.is_independent_of(&b));
    }

    #[test]
    fn waterfall_touches_all_tiers_up_to_max() {
        let w = RebalanceAction::Waterfall {
            amount_needed: 100,
            max_tier: Tier::L2,
        };
        let tiers = w.tiers_touched();
        assert!(tiers.contains(&Tier::L1));
        assert!(tiers.contains(&Tier::L2));
        assert!(!tiers.contains(&Tier::L3));
    }

    #[test]
    fn snapshot_ratios() {
        let snap = TierSnapshot {
            l1: 150,
            l2: 300,
            l3: 550,
            total_assets: 1_000,
        };
        assert_eq!(snap.tier_ratio_bps(Tier::L1), 1_500);
        assert_eq!(snap.tier_ratio_bps(Tier::L3), 5_500);
    }
}
