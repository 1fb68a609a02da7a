// Node wiring: builds every engine over shared storage and gateway, routes
// dispatcher side effects, and implements the task handler that connects the
// runtime to the engines.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{error, info, warn};
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use meridian_common::{
    approval::ApprovalRule,
    chain::{BlockNumber, ChainCall, ContractAddress, SendConstraints, SignerRole},
    config::{SECONDS_PER_DAY, SNAPSHOT_RETENTION_DAYS},
    fund::{Amount, TierPolicy},
    rebalance::{PlanId, PlanStatus, RebalanceTrigger},
    risk::{ForecastHorizon, RiskLevel, ThresholdTable},
    time::{get_current_time_in_millis, get_current_time_in_seconds},
};

use crate::{
    approval::{ApprovalEngine, ApprovalError},
    chain::ChainGateway,
    core::{
        error::CoreError,
        storage::{AuditEntry, Storage},
    },
    dispatch::{EventDispatcher, SideEffect},
    ingest::{EventIngestor, EventQueue, IngestError},
    notify::{Notifier, NotifyChannel, NotifyLevel},
    rebalance::{RebalanceEngine, RebalanceError},
    risk::{EmergencyDriver, RiskEngine},
    tasks::{ReportKind, TaskHandler, TaskPayload, TaskRuntime},
};

pub struct NodeSettings {
    pub contracts: Vec<ContractAddress>,
    pub vault_contract: ContractAddress,
    pub genesis_block: BlockNumber,
    pub confirmations: u64,
    pub polling_interval: Duration,
    pub batch_size: u64,
    pub instance_id: String,
    pub rules: Vec<ApprovalRule>,
    pub policy: TierPolicy,
    pub thresholds: ThresholdTable,
    pub min_rebalance_amount: Amount,
    pub approval_threshold: Amount,
    pub constraints: SendConstraints,
    pub overdue_days_back: u32,
    pub task_workers: usize,
}

pub struct Node<S: Storage, G: ChainGateway> {
    pub storage: Arc<S>,
    pub gateway: Arc<G>,
    pub notifier: Arc<dyn Notifier>,
    pub tasks: Arc<TaskRuntime<S>>,
    pub ingestor: Arc<EventIngestor<S, G>>,
    pub dispatcher: Arc<EventDispatcher<S>>,
    pub approval: Arc<ApprovalEngine<S, G>>,
    pub rebalance: Arc<RebalanceEngine<S, G>>,
    pub risk: Arc<RiskEngine<S, G>>,
    vault_contract: ContractAddress,
    constraints: SendConstraints,
    overdue_days_back: u32,
    effects: Mutex<Option<mpsc::UnboundedReceiver<SideEffect>>>,
    plan_handoff: Mutex<Option<mpsc::UnboundedReceiver<PlanId>>>,
}

impl<S: Storage, G: ChainGateway> Node<S, G> {
    pub fn new(
        storage: Arc<S>,
        gateway: Arc<G>,
        notifier: Arc<dyn Notifier>,
        settings: NodeSettings,
    ) -> Arc<Self> {
        let queue = Arc::new(EventQueue::new());
        let tasks = TaskRuntime::new(Arc::clone(&storage), settings.task_workers);

        let ingestor = EventIngestor::new(
            Arc::clone(&storage),
            Arc::clone(&gateway),
            Arc::clone(&queue),
            Arc::clone(&notifier),
            settings.contracts.clone(),
            settings.genesis_block,
            settings.confirmations,
            settings.polling_interval,
            settings.batch_size,
            settings.instance_id.clone(),
        );
        let (dispatcher, effects) = EventDispatcher::new(Arc::clone(&storage), queue);

        let (approval, plan_handoff) = ApprovalEngine::new(
            Arc::clone(&storage),
            Arc::clone(&gateway),
            Arc::clone(&tasks),
            Arc::clone(&notifier),
            settings.rules.clone(),
            settings.vault_contract,
            settings.constraints,
        );
        let rebalance = RebalanceEngine::new(
            Arc::clone(&storage),
            Arc::clone(&gateway),
            Arc::clone(&approval),
            Arc::clone(&notifier),
            settings.policy.clone(),
            settings.min_rebalance_amount,
            settings.approval_threshold,
            settings.vault_contract,
            settings.constraints,
        );
        let emergency = EmergencyDriver::new(
            Arc::clone(&storage),
            Arc::clone(&gateway),
            Arc::clone(&rebalance),
            Arc::clone(&tasks),
            Arc::clone(&notifier),
            settings.vault_contract,
            settings.constraints,
            settings.instance_id.clone(),
        );
        let risk = RiskEngine::new(
            Arc::clone(&storage),
            Arc::clone(&rebalance),
            emergency,
            Arc::clone(&notifier),
            settings.thresholds.clone(),
            settings.policy.clone(),
        );

        Arc::new(Self {
            storage,
            gateway,
            notifier,
            tasks,
            ingestor,
            dispatcher,
            approval,
            rebalance,
            risk,
            vault_contract: settings.vault_contract,
            constraints: settings.constraints,
            overdue_days_back: settings.overdue_days_back,
            effects: Mutex::new(Some(effects)),
            plan_handoff: Mutex::new(Some(plan_handoff)),
        })
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), CoreError> {
        info!("starting meridian node");

        let handler: Arc<dyn TaskHandler> = Arc::new(NodeTaskHandler {
            node: Arc::clone(self),
        });
        self.tasks.start(handler).await;

        self.spawn_effect_router().await;
        self.spawn_plan_handoff().await;

        self.dispatcher.start().await;
        self.ingestor.start().await;
        self.risk.emergency_driver().resume_active_incident().await?;

        self.register_schedule().await;
        info!("meridian node started");
        Ok(())
    }

    pub async fn stop(&self) {
        info!("stopping meridian node");
        self.ingestor.stop().await;
        self.dispatcher.stop().await;
        self.tasks.stop().await;
    }

    // Operator resync: rewind checkpoints and clear halts
    pub async fn resync(&self, from_block: BlockNumber) -> Result<(), IngestError> {
        self.ingestor.resync(from_block).await?;
        self.dispatcher.clear_halt();
        Ok(())
    }

    async fn register_schedule(&self) {
        // §scheduled beats; SLA timers are deferred tasks, not periodics
        self.tasks
            .register_periodic(TaskPayload::RiskIndicatorTick, Duration::from_secs(60))
            .await;
        self.tasks
            .register_periodic(TaskPayload::LiquidityCheckTick, Duration::from_secs(300))
            .await;
        self.tasks
            .register_periodic(TaskPayload::DeviationCheckTick, Duration::from_secs(3_600))
            .await;
        self.tasks
            .register_periodic(TaskPayload::ForecastTick, Duration::from_secs(3_600))
            .await;
        self.tasks
            .register_periodic(
                TaskPayload::OverdueLiabilityBatch {
                    days_back: self.overdue_days_back,
                },
                Duration::from_secs(SECONDS_PER_DAY),
            )
            .await;
        self.tasks
            .register_periodic(TaskPayload::RetentionPrune, Duration::from_secs(SECONDS_PER_DAY))
            .await;
        self.tasks
            .register_periodic(
                TaskPayload::GenerateReport {
                    kind: ReportKind::Daily,
                    reference: None,
                },
                Duration::from_secs(SECONDS_PER_DAY),
            )
            .await;
        self.tasks
            .register_periodic(
                TaskPayload::GenerateReport {
                    kind: ReportKind::Weekly,
                    reference: None,
                },
                Duration::from_secs(7 * SECONDS_PER_DAY),
            )
            .await;
        self.tasks
            .register_periodic(
                TaskPayload::GenerateReport {
                    kind: ReportKind::Monthly,
                    reference: None,
                },
                Duration::from_secs(30 * SECONDS_PER_DAY),
            )
            .await;
    }

    async fn spawn_effect_router(self: &Arc<Self>) {
        let Some(mut receiver) = self.effects.lock().await.take() else {
            warn!("effect router already running");
            return;
        };
        let node = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(effect) = receiver.recv().await {
                if let Err(e) = node.route_effect(effect).await {
                    error!("effect routing failed: {}", e);
                }
            }
        });
    }

    async fn spawn_plan_handoff(self: &Arc<Self>) {
        let Some(mut receiver) = self.plan_handoff.lock().await.take() else {
            return;
        };
        let node = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(plan_id) = receiver.recv().await {
                if let Err(e) = node
                    .tasks
                    .submit(TaskPayload::ExecutePlan { plan_id })
                    .await
                {
                    error!("failed to queue approved plan {}: {}", plan_id, e);
                }
            }
        });
    }

    async fn route_effect(self: &Arc<Self>, effect: SideEffect) -> Result<(), CoreError> {
        match effect {
            SideEffect::RequestApproval { request_id } => {
                match self.approval.request_redemption_approval(request_id).await {
                    Ok(_) => {}
                    Err(ApprovalError::NoRuleMatched(ticket_type)) => {
                        // surfaced as an operational event, never retried
                        error!(
                            "no approval rule for redemption {} ({})",
                            request_id, ticket_type
                        );
                        self.risk
                            .record_risk_event(
                                RiskLevel::High,
                                "approval",
                                &format!("no rule matched redemption {}", request_id),
                            )
                            .await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            SideEffect::TicketReferenceResolved {
                request_id,
                approved,
            } => {
                self.approval
                    .resolve_reference_from_chain(request_id, approved)
                    .await?;
            }
            SideEffect::WakeRiskEvaluator => {
                self.risk.evaluate().await?;
            }
            SideEffect::TriggerRebalance { trigger } => {
                self.run_rebalance(trigger).await?;
            }
            SideEffect::EmergencyModeChanged { enabled } => {
                if enabled {
                    self.risk
                        .emergency_driver()
                        .start_incident("emergency mode observed on-chain", true)
                        .await?;
                } else if let Some(mut incident) = self.storage.get_incident().await? {
                    if incident.is_active() {
                        info!("emergency mode cleared on-chain, closing incident");
                        incident.closed_at = Some(get_current_time_in_millis());
                        self.storage.set_incident(&incident).await?;
                    }
                }
            }
            SideEffect::LiquidityAlert {
                level,
                ratio_bps,
                available,
            } => {
                self.risk
                    .handle_liquidity_alert(level, ratio_bps, available)
                    .await?;
            }
            SideEffect::RaiseRiskEvent {
                level,
                source,
                message,
            } => {
                self.risk.record_risk_event(level, &source, &message).await?;
            }
            SideEffect::InvariantViolated { drift } => {
                self.notifier
                    .notify(
                        NotifyLevel::Critical,
                        NotifyChannel::Ops,
                        "projection invariant violated",
                        &format!("accounting drift of {} base units; dispatcher halted", drift),
                    )
                    .await;
                self.risk
                    .record_risk_event(
                        RiskLevel::Critical,
                        "projection",
                        &format!("invariant drift {} halted the dispatcher", drift),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    // Evaluate and, when no human gate applies, execute immediately
    async fn run_rebalance(&self, trigger: RebalanceTrigger) -> Result<(), CoreError> {
        if let Some(plan) = self.rebalance.evaluate(trigger).await? {
            if plan.status == PlanStatus::Approved {
                self.tasks
                    .submit(TaskPayload::ExecutePlan { plan_id: plan.id })
                    .await
                    .map_err(CoreError::Task)?;
            }
        }
        Ok(())
    }

    async fn generate_report(
        &self,
        kind: ReportKind,
        reference: Option<u64>,
    ) -> Result<(), CoreError> {
        let projection = self.storage.get_fund_projection().await?;
        let id = self.storage.next_audit_id().await?;
        self.storage
            .append_audit(&AuditEntry {
                id,
                actor: "system".to_string(),
                action: format!("report_{}", kind),
                details: json!({
                    "kind": kind,
                    "reference": reference,
                    "total_assets": projection.total_assets.to_string(),
                    "share_price": projection.share_price.to_string(),
                    "emergency_mode": projection.emergency_mode,
                }),
                created_at: get_current_time_in_millis(),
            })
            .await?;
        self.notifier
            .notify(
                NotifyLevel::Info,
                NotifyChannel::Ops,
                "report generated",
                &format!("{} report ready (audit entry {})", kind, id),
            )
            .await;
        Ok(())
    }

    async fn retention_prune(&self) -> Result<(), CoreError> {
        let cutoff = get_current_time_in_millis()
            .saturating_sub(SNAPSHOT_RETENTION_DAYS * SECONDS_PER_DAY * 1_000);
        let snapshots = self.storage.prune_risk_snapshots_before(cutoff).await?;
        let results = self.tasks.purge_stale_results().await.map_err(CoreError::Task)?;
        let dedup = self
            .storage
            .purge_expired_dedup(get_current_time_in_seconds())
            .await?;
        info!(
            "retention prune: {} snapshots, {} task results, {} dedup markers",
            snapshots, results, dedup
        );
        Ok(())
    }
}

struct NodeTaskHandler<S: Storage, G: ChainGateway> {
    node: Arc<Node<S, G>>,
}

#[async_trait]
impl<S: Storage, G: ChainGateway> TaskHandler for NodeTaskHandler<S, G> {
    async fn handle(&self, payload: &TaskPayload) -> Result<(), CoreError> {
        let node = &self.node;
        match payload {
            TaskPayload::SlaWarning { ticket_id } => {
                node.approval.sla_warning(*ticket_id).await?;
            }
            TaskPayload::SlaEscalation { ticket_id } => {
                node.approval.sla_escalation(*ticket_id).await?;
            }
            TaskPayload::SlaDeadline { ticket_id } => {
                node.approval.sla_deadline(*ticket_id).await?;
            }
            TaskPayload::ProcessApprovalResult { ticket_id } => {
                node.approval.process_result(*ticket_id).await?;
            }
            TaskPayload::ExecutePlan { plan_id } => {
                match node.rebalance.execute(*plan_id).await {
                    Ok(_) => {}
                    // a redelivered execution finds the plan already terminal
                    Err(RebalanceError::InvalidPlanState { id, status, .. })
                        if status.is_terminal() =>
                    {
                        warn!("plan {} already finished as {}", id, status);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            TaskPayload::RiskIndicatorTick => {
                node.risk.evaluate().await?;
            }
            TaskPayload::LiquidityCheckTick => {
                node.run_rebalance(RebalanceTrigger::Liquidity).await?;
            }
            TaskPayload::DeviationCheckTick => {
                node.run_rebalance(RebalanceTrigger::Threshold).await?;
            }
            TaskPayload::ForecastTick => {
                node.risk.forecast(ForecastHorizon::SevenDays).await?;
            }
            TaskPayload::OverdueLiabilityBatch { days_back } => {
                let call = ChainCall::new(
                    node.vault_contract,
                    "processOverdueLiabilityBatch",
                    json!({ "days": days_back }),
                );
                node.gateway
                    .send(&call, SignerRole::Admin, &node.constraints)
                    .await
                    .map_err(CoreError::Gateway)?;
            }
            TaskPayload::RetentionPrune => {
                node.retention_prune().await?;
            }
            TaskPayload::GenerateReport { kind, reference } => {
                node.generate_report(*kind, *reference).await?;
            }
        }
        Ok(())
    }
}
