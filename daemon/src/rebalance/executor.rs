// Plan execution: simulation gate first, then strict priority order with
// same-priority independent actions running concurrently. No automatic
// rollback; chain transactions are irreversible.

use futures::future::join_all;
use log::{error, info, warn};
use metrics::counter;
use serde_json::json;

use meridian_common::{
    chain::{ChainCall, SignerRole, SimulationOutcome},
    config::{BPS_DENOMINATOR, DRIFT_TOLERANCE_BPS, SEND_ATTEMPT_BUDGET},
    fund::Tier,
    rebalance::{
        ActionOutcome, ActionResult, PlanId, PlanStatus, PlannedAction, RebalanceAction,
        RebalancePlan, TierSnapshot,
    },
    risk::{RiskEvent, RiskLevel},
    time::get_current_time_in_millis,
};

use crate::{
    chain::ChainGateway,
    core::storage::Storage,
    notify::{NotifyChannel, NotifyLevel},
};

use super::{project_post_state, RebalanceEngine, RebalanceError};

impl<S: Storage, G: ChainGateway> RebalanceEngine<S, G> {
    // Execute an approved plan. Holds the plan row lock for the whole run.
    pub async fn execute(&self, plan_id: PlanId) -> Result<RebalancePlan, RebalanceError> {
        let lock = self.row_lock(plan_id);
        let _guard = lock.lock().await;

        let mut plan = self
            .storage
            .get_plan(plan_id)
            .await?
            .ok_or(RebalanceError::PlanNotFound(plan_id))?;
        if plan.status != PlanStatus::Approved {
            return Err(RebalanceError::InvalidPlanState {
                id: plan_id,
                status: plan.status,
                expected: PlanStatus::Approved,
            });
        }

        // Gate: every action simulates clean or nothing executes
        if let Err(e) = self.simulate_plan(&plan).await {
            warn!("plan {} failed simulation: {}", plan_id, e);
            plan.status = PlanStatus::Failed;
            plan.updated_at = get_current_time_in_millis();
            self.storage.set_plan(&plan).await?;
            counter!("meridian_plans_failed_simulation").increment(1);
            return Err(e);
        }

        plan.status = PlanStatus::Executing;
        plan.updated_at = get_current_time_in_millis();
        self.storage.set_plan(&plan).await?;
        info!("plan {} executing {} actions", plan_id, plan.actions.len());

        let mut results: Vec<ActionResult> = Vec::with_capacity(plan.actions.len());
        let mut failed_actions: Vec<RebalanceAction> = Vec::new();
        let mut fatal = false;

        let mut index = 0;
        while index < plan.actions.len() && !fatal {
            let priority = plan.actions[index].priority;
            let group_end = index
                + plan.actions[index..]
                    .iter()
                    .take_while(|a| a.priority == priority)
                    .count();
            let group = &plan.actions[index..group_end];

            let pairwise_independent = group.len() > 1
                && group.iter().enumerate().all(|(i, a)| {
                    group
                        .iter()
                        .skip(i + 1)
                        .all(|b| a.action.is_independent_of(&b.action))
                });

            let group_results: Vec<ActionResult> = if pairwise_independent
                && failed_actions.is_empty()
            {
                join_all(
                    group
                        .iter()
                        .enumerate()
                        .map(|(offset, planned)| self.execute_action(index + offset, planned)),
                )
                .await
            } else {
                let mut sequential = Vec::with_capacity(group.len());
                for (offset, planned) in group.iter().enumerate() {
                    // an action touching a failed action's tiers is skipped;
                    // independent ones continue
                    let blocked = failed_actions
                        .iter()
                        .any(|failed| !planned.action.is_independent_of(failed));
                    if blocked {
                        sequential.push(ActionResult {
                            index: index + offset,
                            outcome: ActionOutcome::Skipped,
                            tx_hash: None,
                            error: Some("depends on a failed action".to_string()),
                            executed_at: get_current_time_in_millis(),
                        });
                        continue;
                    }
                    sequential.push(self.execute_action(index + offset, planned).await);
                }
                sequential
            };

            for result in group_results {
                if result.outcome == ActionOutcome::Failed {
                    let planned = &plan.actions[result.index];
                    failed_actions.push(planned.action.clone());
                    if planned.priority == 0 {
                        // a failed priority-0 action aborts the whole plan
                        fatal = true;
                    }
                }
                results.push(result);
            }

            index = group_end;
        }

        let any_failed = results.iter().any(|r| r.outcome == ActionOutcome::Failed);
        plan.results = results;
        plan.status = if fatal {
            PlanStatus::Failed
        } else if any_failed {
            PlanStatus::Partial
        } else {
            PlanStatus::Completed
        };
        plan.updated_at = get_current_time_in_millis();
        self.storage.set_plan(&plan).await?;
        counter!("meridian_plans_executed").increment(1);
        info!("plan {} finished as {}", plan_id, plan.status);

        if plan.status != PlanStatus::Completed {
            self.notifier
                .notify(
                    NotifyLevel::Warning,
                    NotifyChannel::FundManager,
                    "rebalance plan degraded",
                    &format!("plan {} ended as {}", plan_id, plan.status),
                )
                .await;
        }

        self.verify_execution(&plan).await?;
        Ok(plan)
    }

    async fn simulate_plan(&self, plan: &RebalancePlan) -> Result<(), RebalanceError> {
        let mut simulated_slippage_bps: u64 = 0;
        for (index, planned) in plan.actions.iter().enumerate() {
            let call = self.action_to_call(&planned.action);
            match self.gateway.simulate(&call).await? {
                SimulationOutcome::Reverted { reason } => {
                    return Err(RebalanceError::SimulationReverted { index, reason });
                }
                SimulationOutcome::Success {
                    predicted_slippage_bps,
                    ..
                } => {
                    if let Some(max_bps) = planned.action.max_slippage_bps() {
                        if predicted_slippage_bps > max_bps {
                            return Err(RebalanceError::SlippageExceeded {
                                index,
                                predicted_bps: predicted_slippage_bps,
                                max_bps,
                            });
                        }
                    }
                    simulated_slippage_bps = simulated_slippage_bps.max(predicted_slippage_bps);
                }
            }
        }

        // Projected post-state must land within tolerance of the plan's goal
        let projected = project_post_state(&plan.pre_state, &plan.actions);
        for tier in Tier::ALL {
            let goal = plan.target_state.tier_ratio_bps(tier);
            let post = projected.tier_ratio_bps(tier);
            let drift = goal.abs_diff(post) + simulated_slippage_bps * post / BPS_DENOMINATOR;
            if drift > DRIFT_TOLERANCE_BPS {
                return Err(RebalanceError::ProjectionDrift {
                    tier: tier.to_string(),
                    drift_bps: drift,
                });
            }
        }
        Ok(())
    }

    async fn execute_action(&self, index: usize, planned: &PlannedAction) -> ActionResult {
        let call = self.action_to_call(&planned.action);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self
                .gateway
                .send(&call, SignerRole::Rebalancer, &self.constraints)
                .await
            {
                Ok(receipt) => {
                    info!(
                        "action #{} ({}) confirmed in tx {:x}",
                        index, call.method, receipt.tx_hash
                    );
                    return ActionResult {
                        index,
                        outcome: ActionOutcome::Success,
                        tx_hash: Some(receipt.tx_hash),
                        error: None,
                        executed_at: get_current_time_in_millis(),
                    };
                }
                Err(e) if e.is_transient() && attempt < SEND_ATTEMPT_BUDGET => {
                    warn!(
                        "action #{} attempt {}/{} failed: {}",
                        index, attempt, SEND_ATTEMPT_BUDGET, e
                    );
                }
                Err(e) => {
                    error!("action #{} failed permanently: {}", index, e);
                    return ActionResult {
                        index,
                        outcome: ActionOutcome::Failed,
                        tx_hash: None,
                        error: Some(e.to_string()),
                        executed_at: get_current_time_in_millis(),
                    };
                }
            }
        }
    }

    fn action_to_call(&self, action: &RebalanceAction) -> ChainCall {
        match action {
            RebalanceAction::Transfer {
                from_tier,
                to_tier,
                amount,
            } => ChainCall::new(
                self.vault_contract,
                "allocateToLayer",
                json!({
                    "from_tier": from_tier,
                    "to_tier": to_tier,
                    "amount": amount.to_string(),
                }),
            )
            .with_amount(*amount),
            RebalanceAction::Purchase {
                asset,
                from_tier,
                usdt_amount,
                method,
                max_slippage_bps,
            } => ChainCall::new(
                self.vault_contract,
                "purchaseAsset",
                json!({
                    "asset": asset,
                    "from_tier": from_tier,
                    "usdt_amount": usdt_amount.to_string(),
                    "method": method,
                    "max_slippage_bps": max_slippage_bps,
                }),
            )
            .with_amount(*usdt_amount),
            RebalanceAction::Redeem {
                asset,
                amount,
                to_tier,
                max_slippage_bps,
            } => ChainCall::new(
                self.vault_contract,
                "redeemAsset",
                json!({
                    "asset": asset,
                    "amount": amount.to_string(),
                    "to_tier": to_tier,
                    "max_slippage_bps": max_slippage_bps,
                }),
            )
            .with_amount(*amount),
            RebalanceAction::Waterfall {
                amount_needed,
                max_tier,
            } => ChainCall::new(
                self.vault_contract,
                "executeWaterfallLiquidation",
                json!({
                    "amount_needed": amount_needed.to_string(),
                    "max_tier": max_tier,
                }),
            )
            .with_amount(*amount_needed),
        }
    }

    // Post-execution verification against fresh projection state. Drift above
    // tolerance is a warning-level risk event, never a rollback.
    async fn verify_execution(&self, plan: &RebalancePlan) -> Result<(), RebalanceError> {
        let successful: Vec<PlannedAction> = plan
            .results
            .iter()
            .filter(|r| r.outcome == ActionOutcome::Success)
            .map(|r| plan.actions[r.index].clone())
            .collect();
        if successful.is_empty() {
            return Ok(());
        }

        let expected = project_post_state(&plan.pre_state, &successful);
        let projection = self.storage.get_fund_projection().await?;
        let actual = TierSnapshot {
            l1: projection.l1_cash + projection.l1_yield,
            l2: projection.l2,
            l3: projection.l3,
            total_assets: projection.total_assets,
        };

        for tier in Tier::ALL {
            let drift = expected
                .tier_ratio_bps(tier)
                .abs_diff(actual.tier_ratio_bps(tier));
            if drift > DRIFT_TOLERANCE_BPS {
                warn!(
                    "plan {} verification drift on {}: {}bp",
                    plan.id, tier, drift
                );
                let id = self.storage.next_risk_event_id().await?;
                self.storage
                    .append_risk_event(&RiskEvent {
                        id,
                        level: RiskLevel::Elevated,
                        source: "rebalance_verification".to_string(),
                        message: format!(
                            "plan {} drifted {}bp from projection on tier {}",
                            plan.id, drift, tier
                        ),
                        created_at: get_current_time_in_millis(),
                    })
                    .await?;
                break;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        approval::ApprovalEngine,
        chain::{testing::MockChainGateway, GatewayError},
        core::storage::{PlanProvider, ProjectionProvider, SledStorage},
        notify::LogNotifier,
        tasks::TaskRuntime,
    };
    use meridian_common::{
        approval::default_rules,
        chain::{ContractAddress, SendConstraints},
        fund::{default_tier_policy, FundProjection},
        rebalance::RebalanceTrigger,
    };
    use serde_json::Value;
    use std::sync::Arc;
    use tempdir::TempDir;

    struct Fixture {
        storage: Arc<SledStorage>,
        gateway: Arc<MockChainGateway>,
        engine: Arc<RebalanceEngine<SledStorage, MockChainGateway>>,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new("meridian-rebalance").unwrap();
        let storage = Arc::new(SledStorage::open(dir.path()).unwrap());
        let gateway = Arc::new(MockChainGateway::new());
        let tasks = TaskRuntime::new(Arc::clone(&storage), 1);
        let (approval, _plans) = ApprovalEngine::new(
            Arc::clone(&storage),
            Arc::clone(&gateway),
            tasks,
            Arc::new(LogNotifier),
            default_rules(),
            ContractAddress::repeat_byte(0xee),
            SendConstraints::unrestricted(),
        );
        let engine = RebalanceEngine::new(
            Arc::clone(&storage),
            Arc::clone(&gateway),
            approval,
            Arc::new(LogNotifier),
            default_tier_policy(),
            1_000,
            1_000_000_000,
            ContractAddress::repeat_byte(0xee),
            SendConstraints::unrestricted(),
        );
        Fixture {
            storage,
            gateway,
            engine,
            _dir: dir,
        }
    }

    async fn seed_projection(fixture: &Fixture, l1: u128, l2: u128, l3: u128) {
        let total = l1 + l2 + l3;
        fixture
            .storage
            .set_fund_projection(&FundProjection {
                total_assets: total,
                l1_cash: l1,
                l2,
                l3,
                ..Default::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn evaluate_generates_and_executes_refill_plan() {
        let fixture = fixture().await;
        // L1 at 5%: refill needed, total under the approval threshold
        seed_projection(&fixture, 500_000, 4_000_000, 5_500_000).await;

        let plan = fixture
            .engine
            .evaluate(RebalanceTrigger::Threshold)
            .await
            .unwrap()
            .expect("plan generated");
        assert_eq!(plan.status, PlanStatus::Approved);
        assert!(!plan.requires_approval);
        assert_eq!(plan.total_amount(), 1_000_000);

        let executed = fixture.engine.execute(plan.id).await.unwrap();
        assert_eq!(executed.status, PlanStatus::Completed);
        assert!(executed.results_are_ordered_prefix());
        assert_eq!(fixture.gateway.sent_methods(), vec!["allocateToLayer"]);
    }

    #[tokio::test]
    async fn balanced_fund_produces_no_plan() {
        let fixture = fixture().await;
        seed_projection(&fixture, 1_500_000, 3_000_000, 5_500_000).await;
        assert!(fixture
            .engine
            .evaluate(RebalanceTrigger::Threshold)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn large_plan_waits_for_approval() {
        let fixture = fixture().await;
        // approval threshold of 1.0e9 in fixture; make the plan bigger
        seed_projection(&fixture, 500_000_000_000, 4_000_000_000_000, 5_500_000_000_000).await;

        let plan = fixture
            .engine
            .evaluate(RebalanceTrigger::Threshold)
            .await
            .unwrap()
            .expect("plan generated");
        assert!(plan.requires_approval);
        assert_eq!(plan.status, PlanStatus::PendingApproval);
        assert!(plan.approval_ticket_id.is_some());

        // executing an unapproved plan is refused
        let result = fixture.engine.execute(plan.id).await;
        assert!(matches!(
            result,
            Err(RebalanceError::InvalidPlanState { .. })
        ));
        assert!(fixture.gateway.sent_calls().is_empty());
    }

    #[tokio::test]
    async fn excessive_slippage_fails_plan_before_any_send() {
        let fixture = fixture().await;
        seed_projection(&fixture, 500_000, 3_200_000, 6_300_000).await;
        // seed an L3 holding so the planner emits the redeem leg
        fixture
            .storage
            .set_holding(&meridian_common::fund::AssetHolding {
                asset: ContractAddress::repeat_byte(3),
                tier: meridian_common::fund::Tier::L3,
                balance: 6_300_000,
                target_allocation_bps: 0,
                updated_at: 0,
            })
            .await
            .unwrap();

        let plan = fixture
            .engine
            .evaluate(RebalanceTrigger::Manual)
            .await
            .unwrap()
            .expect("plan generated");

        // simulation predicts 3% slippage against the 2% limit
        fixture.gateway.set_simulation(
            "redeemAsset",
            SimulationOutcome::Success {
                output: Value::Null,
                predicted_slippage_bps: 300,
                estimated_gas: 100_000,
            },
        );

        let result = fixture.engine.execute(plan.id).await;
        assert!(matches!(
            result,
            Err(RebalanceError::SlippageExceeded {
                predicted_bps: 300,
                max_bps: 200,
                ..
            })
        ));
        // plan fails with zero on-chain writes
        let stored = fixture.storage.get_plan(plan.id).await.unwrap().unwrap();
        assert_eq!(stored.status, PlanStatus::Failed);
        assert!(fixture.gateway.sent_calls().is_empty());
    }

    #[tokio::test]
    async fn simulation_revert_fails_plan() {
        let fixture = fixture().await;
        seed_projection(&fixture, 500_000, 4_000_000, 5_500_000).await;
        let plan = fixture
            .engine
            .evaluate(RebalanceTrigger::Manual)
            .await
            .unwrap()
            .expect("plan generated");

        fixture.gateway.set_simulation(
            "allocateToLayer",
            SimulationOutcome::Reverted {
                reason: "InsufficientBuffer".to_string(),
            },
        );
        let result = fixture.engine.execute(plan.id).await;
        assert!(matches!(
            result,
            Err(RebalanceError::SimulationReverted { .. })
        ));
        assert!(fixture.gateway.sent_calls().is_empty());
    }

    #[tokio::test]
    async fn non_critical_failure_ends_partial() {
        let fixture = fixture().await;
        // thin L2 so the plan is transfer (L2->L1) + redeem (L3->L1): two
        // priority-1 actions sharing L1, so they run sequentially
        seed_projection(&fixture, 500_000, 3_200_000, 6_300_000).await;
        fixture
            .storage
            .set_holding(&meridian_common::fund::AssetHolding {
                asset: ContractAddress::repeat_byte(3),
                tier: meridian_common::fund::Tier::L3,
                balance: 6_300_000,
                target_allocation_bps: 0,
                updated_at: 0,
            })
            .await
            .unwrap();

        let plan = fixture
            .engine
            .evaluate(RebalanceTrigger::Manual)
            .await
            .unwrap()
            .expect("plan generated");
        assert_eq!(plan.actions.len(), 2);

        // first send fails terminally
        fixture
            .gateway
            .fail_next_send(GatewayError::ReceiptFailed(Default::default()));

        let executed = fixture.engine.execute(plan.id).await.unwrap();
        assert_eq!(executed.status, PlanStatus::Partial);
        assert!(executed.results_are_ordered_prefix());
        assert_eq!(executed.results[0].outcome, ActionOutcome::Failed);
        // the second leg also lands on L1: skipped as dependent
        assert_eq!(executed.results[1].outcome, ActionOutcome::Skipped);
    }

    #[tokio::test]
    async fn priority_zero_failure_is_fatal() {
        let fixture = fixture().await;
        seed_projection(&fixture, 1_500_000, 3_000_000, 5_500_000).await;

        let plan = fixture.engine.emergency_waterfall(4_000_000).await;
        // the emergency path executes immediately; make its send fail
        // (first build a fresh fixture state: the call above succeeded)
        assert!(plan.is_ok());

        fixture
            .gateway
            .fail_next_send(GatewayError::ReceiptFailed(Default::default()));
        let plan = fixture
            .engine
            .emergency_waterfall(4_000_000)
            .await
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Failed);
        assert_eq!(plan.results.len(), 1);
        assert_eq!(plan.results[0].outcome, ActionOutcome::Failed);
    }
}
