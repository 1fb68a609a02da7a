mod executor;
mod planner;

pub use executor::*;
pub use planner::*;

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info};
use metrics::counter;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;

use meridian_common::{
    approval::TicketStatus,
    chain::{ContractAddress, SendConstraints},
    config::PENDING_OUTFLOW_HORIZON_SECS,
    fund::{Amount, RedemptionStatus, TierPolicy},
    rebalance::{PlanId, PlanStatus, RebalancePlan, RebalanceTrigger, TierSnapshot},
    time::get_current_time_in_millis,
};

use crate::{
    approval::{ApprovalEngine, ApprovalError},
    chain::{ChainGateway, GatewayError},
    core::{error::StorageError, storage::Storage},
    notify::Notifier,
};

#[derive(Debug, Error)]
pub enum RebalanceError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error("plan {0} not found")]
    PlanNotFound(PlanId),

    #[error("plan {id} is {status}, expected {expected}")]
    InvalidPlanState {
        id: PlanId,
        status: PlanStatus,
        expected: PlanStatus,
    },

    #[error("simulation reverted for action {index}: {reason}")]
    SimulationReverted { index: usize, reason: String },

    #[error("predicted slippage {predicted_bps}bp exceeds limit {max_bps}bp on action {index}")]
    SlippageExceeded {
        index: usize,
        predicted_bps: u64,
        max_bps: u64,
    },

    #[error("projected post-state drifts {drift_bps}bp from target on tier {tier}")]
    ProjectionDrift { tier: String, drift_bps: u64 },
}

// The rebalancing engine: trigger evaluation, plan generation, the simulation
// gate and execution. Owns plans; every mutation happens under the plan's row
// lock.
pub struct RebalanceEngine<S: Storage, G: ChainGateway> {
    storage: Arc<S>,
    gateway: Arc<G>,
    approval: Arc<ApprovalEngine<S, G>>,
    notifier: Arc<dyn Notifier>,
    policy: TierPolicy,
    min_rebalance_amount: Amount,
    approval_threshold: Amount,
    vault_contract: ContractAddress,
    constraints: SendConstraints,
    locks: DashMap<PlanId, Arc<Mutex<()>>>,
}

impl<S: Storage, G: ChainGateway> RebalanceEngine<S, G> {
    pub fn new(
        storage: Arc<S>,
        gateway: Arc<G>,
        approval: Arc<ApprovalEngine<S, G>>,
        notifier: Arc<dyn Notifier>,
        policy: TierPolicy,
        min_rebalance_amount: Amount,
        approval_threshold: Amount,
        vault_contract: ContractAddress,
        constraints: SendConstraints,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            gateway,
            approval,
            notifier,
            policy,
            min_rebalance_amount,
            approval_threshold,
            vault_contract,
            constraints,
            locks: DashMap::new(),
        })
    }

    pub(super) fn row_lock(&self, id: PlanId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn policy(&self) -> &TierPolicy {
        &self.policy
    }

    async fn current_state(&self) -> Result<TierSnapshot, RebalanceError> {
        let projection = self.storage.get_fund_projection().await?;
        Ok(TierSnapshot {
            l1: projection.l1_cash + projection.l1_yield,
            l2: projection.l2,
            l3: projection.l3,
            total_assets: projection.total_assets,
        })
    }

    // Confirmed outflow settling within the horizon; SETTLED and CANCELLED
    // requests owe nothing
    async fn confirmed_outflow_7d(&self) -> Result<Amount, RebalanceError> {
        let now = get_current_time_in_millis();
        let cutoff = now + PENDING_OUTFLOW_HORIZON_SECS * 1_000;
        let requests = self.storage.list_redemptions_settling_before(cutoff).await?;
        Ok(requests
            .iter()
            .filter(|r| {
                !matches!(
                    r.status,
                    RedemptionStatus::Settled | RedemptionStatus::Cancelled
                )
            })
            .map(|r| r.gross_amount)
            .sum())
    }

    // Current per-tier deviation view, also served by the query API
    pub async fn deviations(&self) -> Result<Vec<TierDeviation>, RebalanceError> {
        let state = self.current_state().await?;
        Ok(tier_deviations(&state, &self.policy))
    }

    // Trigger evaluation: compute deviations and produce a plan when anything
    // is out of bounds. Returns None when the fund needs no action.
    pub async fn evaluate(
        &self,
        trigger: RebalanceTrigger,
    ) -> Result<Option<RebalancePlan>, RebalanceError> {
        let state = self.current_state().await?;
        if state.total_assets == 0 {
            return Ok(None);
        }

        let holdings = self.storage.list_holdings().await?;
        let outflow = self.confirmed_outflow_7d().await?;
        let actions = generate_actions(
            &state,
            &self.policy,
            &holdings,
            outflow,
            self.min_rebalance_amount,
        );
        if actions.is_empty() {
            debug!("trigger {} produced no actions", trigger);
            return Ok(None);
        }

        let plan = self.persist_plan(trigger, state, actions).await?;
        Ok(Some(plan))
    }

    // Build a plan without persisting or executing; the command surface uses
    // this for previews
    pub async fn preview(
        &self,
        trigger: RebalanceTrigger,
    ) -> Result<Option<RebalancePlan>, RebalanceError> {
        let state = self.current_state().await?;
        if state.total_assets == 0 {
            return Ok(None);
        }
        let holdings = self.storage.list_holdings().await?;
        let outflow = self.confirmed_outflow_7d().await?;
        let actions = generate_actions(
            &state,
            &self.policy,
            &holdings,
            outflow,
            self.min_rebalance_amount,
        );
        if actions.is_empty() {
            return Ok(None);
        }

        let now = get_current_time_in_millis();
        let total: Amount = actions.iter().map(|a| a.action.amount()).sum();
        Ok(Some(RebalancePlan {
            id: 0,
            trigger,
            pre_state: state,
            target_state: project_post_state(&state, &actions),
            estimated_gas_cost: estimate_gas(&actions),
            estimated_slippage_bps: 0,
            requires_approval: total > self.approval_threshold,
            approval_ticket_id: None,
            status: PlanStatus::Draft,
            results: Vec::new(),
            created_at: now,
            updated_at: now,
            actions,
        }))
    }

    async fn persist_plan(
        &self,
        trigger: RebalanceTrigger,
        state: TierSnapshot,
        actions: Vec<meridian_common::rebalance::PlannedAction>,
    ) -> Result<RebalancePlan, RebalanceError> {
        let now = get_current_time_in_millis();
        let id = self.storage.next_plan_id().await?;
        let total: Amount = actions.iter().map(|a| a.action.amount()).sum();
        let requires_approval = total > self.approval_threshold;

        let mut plan = RebalancePlan {
            id,
            trigger,
            pre_state: state,
            target_state: project_post_state(&state, &actions),
            estimated_gas_cost: estimate_gas(&actions),
            estimated_slippage_bps: 0,
            requires_approval,
            approval_ticket_id: None,
            status: PlanStatus::Draft,
            results: Vec::new(),
            created_at: now,
            updated_at: now,
            actions,
        };

        if requires_approval && trigger != RebalanceTrigger::Emergency {
            self.storage.set_plan(&plan).await?;
            let ticket = self
                .approval
                .request_approval(
                    "rebalance",
                    meridian_common::approval::ReferenceType::Rebalance,
                    id,
                    "rebalance_engine",
                    json!({
                        "plan_id": id,
                        "trigger": trigger,
                        "total_amount": total.to_string(),
                        "action_count": plan.actions.len(),
                    }),
                )
                .await?;
            plan.approval_ticket_id = Some(ticket.id);
            plan.status = if ticket.status == TicketStatus::Approved {
                PlanStatus::Approved
            } else {
                PlanStatus::PendingApproval
            };
        } else {
            // small plans and emergency plans skip the human gate
            plan.status = PlanStatus::Approved;
        }

        plan.updated_at = get_current_time_in_millis();
        self.storage.set_plan(&plan).await?;
        counter!("meridian_plans_generated").increment(1);
        info!(
            "plan {} generated by {} with {} actions (total {}, approval: {})",
            id,
            trigger,
            plan.actions.len(),
            total,
            plan.requires_approval
        );
        Ok(plan)
    }

    // Emergency path: a single priority-0 waterfall for the shortfall,
    // executed immediately under the incident's authority
    pub async fn emergency_waterfall(
        &self,
        shortfall: Amount,
    ) -> Result<RebalancePlan, RebalanceError> {
        let state = self.current_state().await?;
        let actions = vec![meridian_common::rebalance::PlannedAction {
            priority: 0,
            action: meridian_common::rebalance::RebalanceAction::Waterfall {
                amount_needed: shortfall,
                max_tier: meridian_common::fund::Tier::L3,
            },
        }];
        let plan = self
            .persist_plan(RebalanceTrigger::Emergency, state, actions)
            .await?;
        self.execute(plan.id).await
    }
}

fn estimate_gas(actions: &[meridian_common::rebalance::PlannedAction]) -> u64 {
    actions.len() as u64 * 180_000
}
