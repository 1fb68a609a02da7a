use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use metrics::counter;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use meridian_common::{
    approval::{
        find_matching_rule, ApprovalAction, ApprovalRecord, ApprovalRule, ApprovalTicket,
        ApproverRole, ReferenceType, TicketId, TicketStateError, TicketStatus,
    },
    chain::{ChainCall, ContractAddress, RequestId, SendConstraints, SignerRole},
    fund::RedemptionStatus,
    rebalance::{PlanId, PlanStatus},
    time::get_current_time_in_millis,
};

use crate::{
    chain::{ChainGateway, GatewayError},
    core::{error::StorageError, storage::Storage},
    notify::{Notifier, NotifyChannel, NotifyLevel},
    tasks::{TaskError, TaskPayload, TaskRuntime},
};

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    TicketState(#[from] TicketStateError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("no approval rule matched ticket type '{0}'")]
    NoRuleMatched(String),

    #[error("unsupported reference type {0}")]
    UnsupportedReference(ReferenceType),

    #[error("ticket {0} not found")]
    TicketNotFound(TicketId),

    #[error("redemption {0} not found")]
    RedemptionNotFound(RequestId),
}

// The approval workflow engine. Owns tickets: every mutation happens under
// the per-ticket row lock, SLA timers live in the durable task store, and
// on-chain commits run through the result processor with at-least-once
// semantics.
pub struct ApprovalEngine<S: Storage, G: ChainGateway> {
    storage: Arc<S>,
    gateway: Arc<G>,
    tasks: Arc<TaskRuntime<S>>,
    notifier: Arc<dyn Notifier>,
    rules: Vec<ApprovalRule>,
    locks: DashMap<TicketId, Arc<Mutex<()>>>,
    vault_contract: ContractAddress,
    signer_constraints: SendConstraints,
    // Approved plans are handed to the rebalance executor through here
    plan_handoff: mpsc::UnboundedSender<PlanId>,
}

impl<S: Storage, G: ChainGateway> ApprovalEngine<S, G> {
    pub fn new(
        storage: Arc<S>,
        gateway: Arc<G>,
        tasks: Arc<TaskRuntime<S>>,
        notifier: Arc<dyn Notifier>,
        rules: Vec<ApprovalRule>,
        vault_contract: ContractAddress,
        signer_constraints: SendConstraints,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<PlanId>) {
        let (plan_handoff, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                storage,
                gateway,
                tasks,
                notifier,
                rules,
                locks: DashMap::new(),
                vault_contract,
                signer_constraints,
                plan_handoff,
            }),
            receiver,
        )
    }

    fn row_lock(&self, id: TicketId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // Create a ticket for a flagged redemption and link it to the request
    pub async fn request_redemption_approval(
        &self,
        request_id: RequestId,
    ) -> Result<ApprovalTicket, ApprovalError> {
        let mut request = self
            .storage
            .get_redemption(request_id)
            .await?
            .ok_or(ApprovalError::RedemptionNotFound(request_id))?;

        if let Some(existing) = request.approval_ticket_id {
            debug!("redemption {} already has ticket {}", request_id, existing);
            return self
                .storage
                .get_ticket(existing)
                .await?
                .ok_or(ApprovalError::TicketNotFound(existing));
        }

        let data = json!({
            "request_id": request.request_id,
            "owner": format!("{:x}", request.owner),
            "gross_amount": request.gross_amount.to_string(),
            "shares": request.shares.to_string(),
            "channel": request.channel,
            "settlement_time": request.settlement_time,
        });

        let ticket = self
            .request_approval(
                "redemption",
                ReferenceType::Redemption,
                request_id,
                "chain",
                data,
            )
            .await?;

        request.approval_ticket_id = Some(ticket.id);
        request.updated_at = get_current_time_in_millis();
        self.storage.set_redemption(&request).await?;
        Ok(ticket)
    }

    // Generic entry point: match the first rule, snapshot it into the ticket,
    // schedule the three SLA jobs (or auto-approve synchronously)
    pub async fn request_approval(
        &self,
        ticket_type: &str,
        reference_type: ReferenceType,
        reference_id: u64,
        requester: &str,
        request_data: Value,
    ) -> Result<ApprovalTicket, ApprovalError> {
        let rule = find_matching_rule(&self.rules, ticket_type, &request_data)
            .ok_or_else(|| ApprovalError::NoRuleMatched(ticket_type.to_string()))?
            .clone();

        let now = get_current_time_in_millis();
        let id = self.storage.next_ticket_id().await?;
        let mut auto = rule
            .auto_approve
            .as_ref()
            .map(|a| a.applies(&request_data))
            .unwrap_or(false);

        // While the off-chain gate is closed, STANDARD redemptions lose the
        // fast path and wait for a human decision
        if auto
            && request_data.get("channel").and_then(Value::as_str) == Some("STANDARD")
            && self
                .storage
                .get_flag(crate::risk::STANDARD_REDEMPTIONS_PAUSED_FLAG)
                .await?
        {
            debug!("auto-approve suspended while standard redemptions are paused");
            auto = false;
        }

        let mut ticket = ApprovalTicket {
            id,
            ticket_type: ticket_type.to_string(),
            reference_type,
            reference_id,
            requester: requester.to_string(),
            request_data,
            required_approvals: rule.total_required,
            current_approvals: 0,
            current_rejections: 0,
            sla_warning_at: now + rule.sla.warning_secs * 1_000,
            sla_deadline_at: now + rule.sla.deadline_secs * 1_000,
            escalation_at: now + rule.sla.escalation_secs * 1_000,
            escalated_at: None,
            escalated_to: None,
            status: TicketStatus::Pending,
            records: Vec::new(),
            resolved_by: None,
            resolved_at: None,
            created_at: now,
            updated_at: now,
            rule_snapshot: rule,
        };

        if auto {
            // Created directly terminal; result processing runs in-line
            ticket.records.push(ApprovalRecord {
                approver: "system".to_string(),
                role: ticket.rule_snapshot.approver_role,
                action: ApprovalAction::Approve,
                reason: Some("auto-approve rule matched".to_string()),
                timestamp: now,
            });
            ticket.current_approvals = ticket.required_approvals;
            ticket.force_resolve(TicketStatus::Approved, "system", now);
            self.storage.set_ticket(&ticket).await?;
            counter!("meridian_tickets_auto_approved").increment(1);
            info!("ticket {} auto-approved ({})", id, ticket.ticket_type);

            if let Err(e) = self.process_result(id).await {
                // Keep at-least-once semantics through the task queue
                warn!("inline result processing for ticket {} failed: {}", id, e);
                self.tasks
                    .submit(TaskPayload::ProcessApprovalResult { ticket_id: id })
                    .await?;
            }
            return Ok(ticket);
        }

        self.storage.set_ticket(&ticket).await?;
        self.tasks
            .defer(TaskPayload::SlaWarning { ticket_id: id }, ticket.sla_warning_at)
            .await?;
        self.tasks
            .defer(
                TaskPayload::SlaEscalation { ticket_id: id },
                ticket.escalation_at,
            )
            .await?;
        self.tasks
            .defer(
                TaskPayload::SlaDeadline { ticket_id: id },
                ticket.sla_deadline_at,
            )
            .await?;

        counter!("meridian_tickets_created").increment(1);
        info!(
            "ticket {} created for {} {} ({} approvals required)",
            id, ticket.reference_type, reference_id, ticket.required_approvals
        );
        Ok(ticket)
    }

    // Approve or reject under the row lock. Racing approvers serialize here
    // and see consistent counts.
    pub async fn act(
        &self,
        ticket_id: TicketId,
        approver: &str,
        role: ApproverRole,
        action: ApprovalAction,
        reason: Option<String>,
        custom_settlement_time: Option<u64>,
    ) -> Result<ApprovalTicket, ApprovalError> {
        let lock = self.row_lock(ticket_id);
        let _guard = lock.lock().await;

        let mut ticket = self
            .storage
            .get_ticket(ticket_id)
            .await?
            .ok_or(ApprovalError::TicketNotFound(ticket_id))?;

        let now = get_current_time_in_millis();
        let resolution = ticket.register_action(approver, role, action, reason, now)?;
        self.storage.set_ticket(&ticket).await?;

        // An approver may override the settlement date; it rides along into
        // the on-chain commit
        if action == ApprovalAction::Approve
            && ticket.reference_type == ReferenceType::Redemption
        {
            if let Some(settlement_time) = custom_settlement_time {
                if let Some(mut request) =
                    self.storage.get_redemption(ticket.reference_id).await?
                {
                    request.settlement_time = settlement_time;
                    request.updated_at = now;
                    self.storage.set_redemption(&request).await?;
                }
            }
        }

        if let Some(resolution) = resolution {
            debug!("ticket {} resolved: {:?}", ticket_id, resolution);
            counter!("meridian_tickets_resolved").increment(1);
            self.tasks.cancel_ticket_tasks(ticket_id).await?;
            self.tasks
                .submit(TaskPayload::ProcessApprovalResult { ticket_id })
                .await?;
        }

        Ok(ticket)
    }

    // Requester cancellation; never commits on-chain
    pub async fn cancel(
        &self,
        ticket_id: TicketId,
        requester: &str,
    ) -> Result<ApprovalTicket, ApprovalError> {
        let lock = self.row_lock(ticket_id);
        let _guard = lock.lock().await;

        let mut ticket = self
            .storage
            .get_ticket(ticket_id)
            .await?
            .ok_or(ApprovalError::TicketNotFound(ticket_id))?;
        let now = get_current_time_in_millis();
        ticket.cancel(requester, now)?;
        self.storage.set_ticket(&ticket).await?;
        self.tasks.cancel_ticket_tasks(ticket_id).await?;

        // off-chain cancellation only: release the linked entity
        match ticket.reference_type {
            ReferenceType::Redemption => {
                if let Some(mut request) =
                    self.storage.get_redemption(ticket.reference_id).await?
                {
                    if let Err(e) = request.transition(RedemptionStatus::Cancelled, now) {
                        warn!("cancel: {}", e);
                    } else {
                        self.storage.set_redemption(&request).await?;
                    }
                }
            }
            ReferenceType::Rebalance => {
                if let Some(mut plan) = self.storage.get_plan(ticket.reference_id).await? {
                    plan.status = PlanStatus::Cancelled;
                    plan.updated_at = now;
                    self.storage.set_plan(&plan).await?;
                }
            }
            ReferenceType::Report => {}
        }

        Ok(ticket)
    }

    // A ticket resolved directly on-chain (admin bypassing the engine)
    pub async fn resolve_reference_from_chain(
        &self,
        request_id: RequestId,
        approved: bool,
    ) -> Result<(), ApprovalError> {
        let Some(request) = self.storage.get_redemption(request_id).await? else {
            return Ok(());
        };
        let Some(ticket_id) = request.approval_ticket_id else {
            return Ok(());
        };

        let lock = self.row_lock(ticket_id);
        let _guard = lock.lock().await;
        let Some(mut ticket) = self.storage.get_ticket(ticket_id).await? else {
            return Ok(());
        };

        let status = if approved {
            TicketStatus::Approved
        } else {
            TicketStatus::Rejected
        };
        let now = get_current_time_in_millis();
        if ticket.force_resolve(status, "chain", now) {
            info!("ticket {} resolved from chain as {}", ticket_id, status);
            self.storage.set_ticket(&ticket).await?;
            self.tasks.cancel_ticket_tasks(ticket_id).await?;
        }
        Ok(())
    }

    // Result processor: commit the resolution to its reference. At-least-once;
    // idempotency rests on the contract rejecting duplicate approvals and on
    // plan status checks.
    pub async fn process_result(&self, ticket_id: TicketId) -> Result<(), ApprovalError> {
        let ticket = self
            .storage
            .get_ticket(ticket_id)
            .await?
            .ok_or(ApprovalError::TicketNotFound(ticket_id))?;

        if !ticket.status.is_terminal() {
            warn!("result processor called on live ticket {}", ticket_id);
            return Ok(());
        }
        if ticket.status == TicketStatus::Cancelled {
            return Ok(());
        }

        match ticket.reference_type {
            ReferenceType::Redemption => self.commit_redemption(&ticket).await,
            ReferenceType::Rebalance => self.commit_rebalance(&ticket).await,
            other => Err(ApprovalError::UnsupportedReference(other)),
        }
    }

    async fn commit_redemption(&self, ticket: &ApprovalTicket) -> Result<(), ApprovalError> {
        let request_id = ticket.reference_id;
        let request = self
            .storage
            .get_redemption(request_id)
            .await?
            .ok_or(ApprovalError::RedemptionNotFound(request_id))?;

        match ticket.status {
            TicketStatus::Approved => {
                let call = ChainCall::new(
                    self.vault_contract,
                    "approveRedemption",
                    json!({
                        "request_id": request_id,
                        "settlement_time": request.settlement_time,
                    }),
                )
                .with_amount(request.gross_amount);
                self.gateway
                    .send(&call, SignerRole::VipApprover, &self.signer_constraints)
                    .await?;
                info!("approveRedemption({}) committed", request_id);
            }
            TicketStatus::Rejected | TicketStatus::Expired => {
                let reason = ticket
                    .records
                    .iter()
                    .rev()
                    .find_map(|r| r.reason.clone())
                    .unwrap_or_else(|| "approval SLA expired".to_string());
                let call = ChainCall::new(
                    self.vault_contract,
                    "rejectRedemption",
                    json!({ "request_id": request_id, "reason": reason }),
                );
                self.gateway
                    .send(&call, SignerRole::VipApprover, &self.signer_constraints)
                    .await?;
                info!("rejectRedemption({}) committed", request_id);

                if ticket.status == TicketStatus::Expired {
                    // off-chain expiry is recorded immediately; the chain's
                    // own rejection event will find the request terminal
                    let now = get_current_time_in_millis();
                    let mut request = request;
                    if request.transition(RedemptionStatus::Expired, now).is_ok() {
                        self.storage.set_redemption(&request).await?;
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn commit_rebalance(&self, ticket: &ApprovalTicket) -> Result<(), ApprovalError> {
        let plan_id = ticket.reference_id;
        let mut plan = self.storage.expect_plan(plan_id).await?;
        let now = get_current_time_in_millis();

        match ticket.status {
            TicketStatus::Approved => {
                if plan.status == PlanStatus::PendingApproval {
                    plan.status = PlanStatus::Approved;
                    plan.updated_at = now;
                    self.storage.set_plan(&plan).await?;
                    info!("plan {} approved, handing to executor", plan_id);
                    let _ = self.plan_handoff.send(plan_id);
                }
            }
            TicketStatus::Rejected | TicketStatus::Expired => {
                if plan.status == PlanStatus::PendingApproval {
                    plan.status = PlanStatus::Cancelled;
                    plan.updated_at = now;
                    self.storage.set_plan(&plan).await?;
                    info!("plan {} cancelled by {}", plan_id, ticket.status);
                }
            }
            _ => {}
        }
        Ok(())
    }

    // SLA jobs fired by the task runtime
    pub async fn sla_warning(&self, ticket_id: TicketId) -> Result<(), ApprovalError> {
        let Some(ticket) = self.storage.get_ticket(ticket_id).await? else {
            return Ok(());
        };
        if ticket.status.is_terminal() {
            return Ok(());
        }
        self.notifier
            .notify(
                NotifyLevel::Warning,
                NotifyChannel::VipApprovers,
                "approval SLA warning",
                &format!(
                    "ticket {} ({} {}) is approaching its deadline",
                    ticket_id, ticket.reference_type, ticket.reference_id
                ),
            )
            .await;
        Ok(())
    }

    pub async fn sla_escalation(&self, ticket_id: TicketId) -> Result<(), ApprovalError> {
        let lock = self.row_lock(ticket_id);
        let _guard = lock.lock().await;
        let Some(mut ticket) = self.storage.get_ticket(ticket_id).await? else {
            return Ok(());
        };
        if ticket.status.is_terminal() {
            return Ok(());
        }
        let now = get_current_time_in_millis();
        ticket.mark_escalated(now);
        self.storage.set_ticket(&ticket).await?;
        let recipients = ticket
            .escalated_to
            .map(|role| role.to_string())
            .unwrap_or_else(|| "fund_manager".to_string());
        self.notifier
            .notify(
                NotifyLevel::Warning,
                NotifyChannel::FundManager,
                "approval escalated",
                &format!("ticket {} escalated to {}", ticket_id, recipients),
            )
            .await;
        Ok(())
    }

    pub async fn sla_deadline(&self, ticket_id: TicketId) -> Result<(), ApprovalError> {
        let lock = self.row_lock(ticket_id);
        let _guard = lock.lock().await;
        let Some(mut ticket) = self.storage.get_ticket(ticket_id).await? else {
            return Ok(());
        };
        if ticket.status.is_terminal() {
            return Ok(());
        }

        let now = get_current_time_in_millis();
        ticket.expire(now);
        self.storage.set_ticket(&ticket).await?;
        counter!("meridian_tickets_expired").increment(1);

        if ticket.rule_snapshot.sla.auto_reject {
            // rejection path of the result processor commits on-chain
            self.tasks
                .submit(TaskPayload::ProcessApprovalResult { ticket_id })
                .await?;
        } else {
            self.notifier
                .notify(
                    NotifyLevel::Critical,
                    NotifyChannel::Ops,
                    "approval SLA expired",
                    &format!(
                        "ticket {} ({} {}) expired with no action; no on-chain commit performed",
                        ticket_id, ticket.reference_type, ticket.reference_id
                    ),
                )
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::testing::MockChainGateway,
        core::storage::{RedemptionProvider, SledStorage, TaskStoreProvider, TicketProvider},
        notify::LogNotifier,
    };
    use meridian_common::{
        approval::default_rules,
        chain::AccountAddress,
        config::COIN_VALUE,
        fund::{RedemptionChannel, RedemptionRequest},
    };
    use tempdir::TempDir;

    struct Fixture {
        storage: Arc<SledStorage>,
        gateway: Arc<MockChainGateway>,
        engine: Arc<ApprovalEngine<SledStorage, MockChainGateway>>,
        _dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let dir = TempDir::new("meridian-approval").unwrap();
        let storage = Arc::new(SledStorage::open(dir.path()).unwrap());
        let gateway = Arc::new(MockChainGateway::new());
        let tasks = TaskRuntime::new(Arc::clone(&storage), 1);
        let (engine, _plans) = ApprovalEngine::new(
            Arc::clone(&storage),
            Arc::clone(&gateway),
            tasks,
            Arc::new(LogNotifier),
            default_rules(),
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

    async fn seed_redemption(fixture: &Fixture, request_id: u64, gross: u128) {
        fixture
            .storage
            .set_redemption(&RedemptionRequest {
                request_id,
                owner: AccountAddress::repeat_byte(1),
                receiver: AccountAddress::repeat_byte(1),
                shares: gross,
                gross_amount: gross,
                locked_nav: COIN_VALUE,
                estimated_fee: 0,
                request_time: 0,
                settlement_time: 0,
                channel: RedemptionChannel::Standard,
                requires_approval: true,
                window_id: None,
                voucher_token_id: None,
                status: meridian_common::fund::RedemptionStatus::PendingApproval,
                settled_amount: None,
                settled_fee: None,
                settled_at: None,
                approval_ticket_id: None,
                updated_at: 0,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn large_redemption_creates_ticket_with_sla_jobs() {
        let fixture = fixture().await;
        seed_redemption(&fixture, 43, 150_000 * COIN_VALUE).await;

        let ticket = fixture
            .engine
            .request_redemption_approval(43)
            .await
            .unwrap();
        assert_eq!(ticket.status, TicketStatus::Pending);
        assert_eq!(ticket.required_approvals, 1);
        assert_eq!(ticket.rule_snapshot.name, "large_redemption");

        // linked back to the request
        let request = fixture.storage.get_redemption(43).await.unwrap().unwrap();
        assert_eq!(request.approval_ticket_id, Some(ticket.id));

        // the three SLA jobs are durable
        let due = fixture
            .storage
            .due_tasks(ticket.sla_deadline_at + 1)
            .await
            .unwrap();
        let sla_jobs = due
            .iter()
            .filter(|t| t.payload.ticket_id() == Some(ticket.id))
            .count();
        assert_eq!(sla_jobs, 3);

        // calling again is idempotent
        let again = fixture
            .engine
            .request_redemption_approval(43)
            .await
            .unwrap();
        assert_eq!(again.id, ticket.id);
    }

    #[tokio::test]
    async fn small_flagged_redemption_is_auto_approved() {
        let fixture = fixture().await;
        seed_redemption(&fixture, 44, 5_000 * COIN_VALUE).await;

        let ticket = fixture
            .engine
            .request_redemption_approval(44)
            .await
            .unwrap();
        assert_eq!(ticket.status, TicketStatus::Approved);
        assert_eq!(ticket.resolved_by.as_deref(), Some("system"));
        // equivalent to a normal ticket receiving enough approvals
        assert_eq!(ticket.current_approvals, ticket.required_approvals);

        // the inline result processor committed on-chain
        assert_eq!(fixture.gateway.sent_methods(), vec!["approveRedemption"]);
    }

    #[tokio::test]
    async fn single_vip_approval_resolves_and_commits() {
        let fixture = fixture().await;
        seed_redemption(&fixture, 43, 150_000 * COIN_VALUE).await;
        let ticket = fixture
            .engine
            .request_redemption_approval(43)
            .await
            .unwrap();

        let resolved = fixture
            .engine
            .act(
                ticket.id,
                "alice",
                ApproverRole::VipApprover,
                ApprovalAction::Approve,
                None,
                None,
            )
            .await
            .unwrap();
        assert_eq!(resolved.status, TicketStatus::Approved);

        // result processor runs via the task queue; drive it directly here
        fixture.engine.process_result(ticket.id).await.unwrap();
        assert_eq!(fixture.gateway.sent_methods(), vec!["approveRedemption"]);

        // SLA jobs were cancelled
        let due = fixture
            .storage
            .due_tasks(ticket.sla_deadline_at + 1)
            .await
            .unwrap();
        assert!(due.iter().all(|t| t.payload.ticket_id() != Some(ticket.id)));
    }

    #[tokio::test]
    async fn racing_approvals_insert_exactly_one_record() {
        let fixture = fixture().await;
        seed_redemption(&fixture, 43, 150_000 * COIN_VALUE).await;
        let ticket = fixture
            .engine
            .request_redemption_approval(43)
            .await
            .unwrap();

        let engine_a = Arc::clone(&fixture.engine);
        let engine_b = Arc::clone(&fixture.engine);
        let id = ticket.id;
        let (a, b) = tokio::join!(
            engine_a.act(id, "alice", ApproverRole::VipApprover, ApprovalAction::Approve, None, None),
            engine_b.act(id, "alice", ApproverRole::VipApprover, ApprovalAction::Approve, None, None),
        );
        // the row lock serializes them: one wins, the duplicate is rejected
        assert!(a.is_ok() ^ b.is_ok());

        let stored = fixture.storage.get_ticket(id).await.unwrap().unwrap();
        assert_eq!(stored.records.len(), 1);
        assert_eq!(stored.status, TicketStatus::Approved);
    }

    #[tokio::test]
    async fn rejection_commits_reject_on_chain() {
        let fixture = fixture().await;
        seed_redemption(&fixture, 43, 150_000 * COIN_VALUE).await;
        let ticket = fixture
            .engine
            .request_redemption_approval(43)
            .await
            .unwrap();

        fixture
            .engine
            .act(
                ticket.id,
                "alice",
                ApproverRole::VipApprover,
                ApprovalAction::Reject,
                Some("kyc mismatch".to_string()),
                None,
            )
            .await
            .unwrap();
        fixture.engine.process_result(ticket.id).await.unwrap();

        let sent = fixture.gateway.sent_calls();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.method, "rejectRedemption");
        assert_eq!(sent[0].0.args["reason"], "kyc mismatch");
    }

    #[tokio::test]
    async fn deadline_without_auto_reject_expires_without_commit() {
        let fixture = fixture().await;
        seed_redemption(&fixture, 43, 150_000 * COIN_VALUE).await;
        let ticket = fixture
            .engine
            .request_redemption_approval(43)
            .await
            .unwrap();
        assert!(!ticket.rule_snapshot.sla.auto_reject);

        fixture.engine.sla_deadline(ticket.id).await.unwrap();
        let stored = fixture.storage.get_ticket(ticket.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TicketStatus::Expired);
        // no on-chain call was made
        assert!(fixture.gateway.sent_calls().is_empty());

        // a later deadline redelivery is a no-op
        fixture.engine.sla_deadline(ticket.id).await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_is_off_chain_only() {
        let fixture = fixture().await;
        seed_redemption(&fixture, 43, 150_000 * COIN_VALUE).await;
        let ticket = fixture
            .engine
            .request_redemption_approval(43)
            .await
            .unwrap();

        let cancelled = fixture.engine.cancel(ticket.id, "chain").await.unwrap();
        assert_eq!(cancelled.status, TicketStatus::Cancelled);
        assert!(fixture.gateway.sent_calls().is_empty());

        let request = fixture.storage.get_redemption(43).await.unwrap().unwrap();
        assert_eq!(
            request.status,
            meridian_common::fund::RedemptionStatus::Cancelled
        );

        // result processor skips cancelled tickets
        fixture.engine.process_result(ticket.id).await.unwrap();
        assert!(fixture.gateway.sent_calls().is_empty());
    }

    #[tokio::test]
    async fn unsupported_reference_is_surfaced() {
        let fixture = fixture().await;
        // a report-reference rule does not exist: matching fails first
        let result = fixture
            .engine
            .request_approval(
                "unknown_type",
                ReferenceType::Report,
                1,
                "ops",
                json!({}),
            )
            .await;
        assert!(matches!(result, Err(ApprovalError::NoRuleMatched(_))));
    }
}
