mod rule;

pub use rule::*;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display};
use thiserror::Error;

use crate::time::TimestampMillis;

pub type TicketId = u64;

// Human approver roles, distinct from chain signer roles
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApproverRole {
    VipApprover,
    FundManager,
    RiskOfficer,
    Admin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ApprovalAction {
    Approve,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketStatus {
    Pending,
    PartiallyApproved,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl TicketStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Approved | Self::Rejected | Self::Expired | Self::Cancelled
        )
    }
}

// What entity the ticket gates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ReferenceType {
    Redemption,
    Rebalance,
    Report,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approver: String,
    pub role: ApproverRole,
    pub action: ApprovalAction,
    pub reason: Option<String>,
    pub timestamp: TimestampMillis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketResolution {
    Approved,
    Rejected,
}

#[derive(Debug, Error)]
pub enum TicketStateError {
    #[error("ticket {0} is already resolved")]
    Terminal(TicketId),
    #[error("approver {approver} already acted on ticket {ticket_id}")]
    AlreadyActed { ticket_id: TicketId, approver: String },
    #[error("role {actual} cannot act on ticket {ticket_id}, requires {required}")]
    RoleNotAllowed {
        ticket_id: TicketId,
        required: ApproverRole,
        actual: ApproverRole,
    },
    #[error("ticket {0} cannot be cancelled in its current status")]
    NotCancellable(TicketId),
}

// One approval workflow instance. The engine owns persistence and row locking;
// everything here is the pure state machine so it stays unit-testable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalTicket {
    pub id: TicketId,
    pub ticket_type: String,
    pub reference_type: ReferenceType,
    pub reference_id: u64,
    pub requester: String,
    pub request_data: Value,
    pub rule_snapshot: ApprovalRule,
    pub required_approvals: u32,
    pub current_approvals: u32,
    pub current_rejections: u32,
    pub sla_warning_at: TimestampMillis,
    pub sla_deadline_at: TimestampMillis,
    pub escalation_at: TimestampMillis,
    pub escalated_at: Option<TimestampMillis>,
    pub escalated_to: Option<ApproverRole>,
    pub status: TicketStatus,
    // Append-only
    pub records: Vec<ApprovalRecord>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<TimestampMillis>,
    pub created_at: TimestampMillis,
    pub updated_at: TimestampMillis,
}

impl ApprovalTicket {
    // Apply one approve/reject action. Returns the resolution when this action
    // resolved the ticket. Caller must hold the ticket row lock.
    pub fn register_action(
        &mut self,
        approver: &str,
        role: ApproverRole,
        action: ApprovalAction,
        reason: Option<String>,
        now: TimestampMillis,
    ) -> Result<Option<TicketResolution>, TicketStateError> {
        if self.status.is_terminal() {
            return Err(TicketStateError::Terminal(self.id));
        }
        if self.records.iter().any(|r| r.approver == approver) {
            return Err(TicketStateError::AlreadyActed {
                ticket_id: self.id,
                approver: approver.to_string(),
            });
        }
        if role != self.rule_snapshot.approver_role && role != ApproverRole::Admin {
            return Err(TicketStateError::RoleNotAllowed {
                ticket_id: self.id,
                required: self.rule_snapshot.approver_role,
                actual: role,
            });
        }

        self.records.push(ApprovalRecord {
            approver: approver.to_string(),
            role,
            action,
            reason,
            timestamp: now,
        });
        self.updated_at = now;

        match action {
            ApprovalAction::Reject => {
                // Any rejection is terminal
                self.current_rejections += 1;
                self.resolve(TicketStatus::Rejected, approver, now);
                Ok(Some(TicketResolution::Rejected))
            }
            ApprovalAction::Approve => {
                self.current_approvals += 1;
                if self.current_approvals >= self.required_approvals {
                    self.resolve(TicketStatus::Approved, approver, now);
                    Ok(Some(TicketResolution::Approved))
                } else {
                    self.status = TicketStatus::PartiallyApproved;
                    Ok(None)
                }
            }
        }
    }

    // Requester-initiated cancellation; no on-chain side effect
    pub fn cancel(&mut self, requester: &str, now: TimestampMillis) -> Result<(), TicketStateError> {
        match self.status {
            TicketStatus::Pending | TicketStatus::PartiallyApproved => {
                self.resolve(TicketStatus::Cancelled, requester, now);
                Ok(())
            }
            _ => Err(TicketStateError::NotCancellable(self.id)),
        }
    }

    // Deadline lapse; only meaningful on a live ticket
    pub fn expire(&mut self, now: TimestampMillis) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.resolve(TicketStatus::Expired, "system", now);
        true
    }

    // Resolution observed on-chain (e.g. an admin acting directly on the
    // contract) rather than decided by this engine
    pub fn force_resolve(&mut self, status: TicketStatus, by: &str, now: TimestampMillis) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.resolve(status, by, now);
        true
    }

    pub fn mark_escalated(&mut self, now: TimestampMillis) {
        self.escalated_at = Some(now);
        self.escalated_to = self.rule_snapshot.sla.escalate_to;
        self.updated_at = now;
    }

    fn resolve(&mut self, status: TicketStatus, by: &str, now: TimestampMillis) {
        self.status = status;
        self.resolved_by = Some(by.to_string());
        self.resolved_at = Some(now);
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ticket(required: u32) -> ApprovalTicket {
        let rules = default_rules();
        ApprovalTicket {
            id: 1,
            ticket_type: "redemption".to_string(),
            reference_type: ReferenceType::Redemption,
            reference_id: 43,
            requester: "chain".to_string(),
            request_data: json!({}),
            rule_snapshot: rules[0].clone(),
            required_approvals: required,
            current_approvals: 0,
            current_rejections: 0,
            sla_warning_at: 0,
            sla_deadline_at: 0,
            escalation_at: 0,
            escalated_at: None,
            escalated_to: None,
            status: TicketStatus::Pending,
            records: Vec::new(),
            resolved_by: None,
            resolved_at: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn single_approval_resolves() {
        let mut t = ticket(1);
        let res = t
            .register_action("alice", ApproverRole::VipApprover, ApprovalAction::Approve, None, 10)
            .unwrap();
        assert_eq!(res, Some(TicketResolution::Approved));
        assert_eq!(t.status, TicketStatus::Approved);
        assert_eq!(t.resolved_by.as_deref(), Some("alice"));
    }

    #[test]
    fn multi_approval_partial_then_resolved() {
        let mut t = ticket(2);
        let res = t
            .register_action("alice", ApproverRole::VipApprover, ApprovalAction::Approve, None, 10)
            .unwrap();
        assert_eq!(res, None);
        assert_eq!(t.status, TicketStatus::PartiallyApproved);

        let res = t
            .register_action("bob", ApproverRole::VipApprover, ApprovalAction::Approve, None, 11)
            .unwrap();
        assert_eq!(res, Some(TicketResolution::Approved));
        assert!(t.current_approvals <= t.required_approvals);
    }

    #[test]
    fn rejection_is_terminal() {
        let mut t = ticket(2);
        let res = t
            .register_action(
                "alice",
                ApproverRole::VipApprover,
                ApprovalAction::Reject,
                Some("suspicious".to_string()),
                10,
            )
            .unwrap();
        assert_eq!(res, Some(TicketResolution::Rejected));
        assert!(matches!(
            t.register_action("bob", ApproverRole::VipApprover, ApprovalAction::Approve, None, 11),
            Err(TicketStateError::Terminal(_))
        ));
    }

    #[test]
    fn double_action_rejected() {
        let mut t = ticket(2);
        t.register_action("alice", ApproverRole::VipApprover, ApprovalAction::Approve, None, 10)
            .unwrap();
        assert!(matches!(
            t.register_action("alice", ApproverRole::VipApprover, ApprovalAction::Approve, None, 11),
            Err(TicketStateError::AlreadyActed { .. })
        ));
        assert_eq!(t.records.len(), 1);
    }

    #[test]
    fn wrong_role_rejected_but_admin_allowed() {
        let mut t = ticket(1);
        assert!(matches!(
            t.register_action("carol", ApproverRole::RiskOfficer, ApprovalAction::Approve, None, 10),
            Err(TicketStateError::RoleNotAllowed { .. })
        ));
        assert!(t
            .register_action("root", ApproverRole::Admin, ApprovalAction::Approve, None, 11)
            .unwrap()
            .is_some());
    }

    #[test]
    fn cancel_only_while_live() {
        let mut t = ticket(2);
        t.register_action("alice", ApproverRole::VipApprover, ApprovalAction::Approve, None, 10)
            .unwrap();
        t.cancel("chain", 12).unwrap();
        assert_eq!(t.status, TicketStatus::Cancelled);

        let mut resolved = ticket(1);
        resolved
            .register_action("alice", ApproverRole::VipApprover, ApprovalAction::Approve, None, 10)
            .unwrap();
        assert!(resolved.cancel("chain", 12).is_err());
    }

    #[test]
    fn expire_skips_terminal() {
        let mut t = ticket(1);
        assert!(t.expire(100));
        assert_eq!(t.status, TicketStatus::Expired);
        assert!(!t.expire(101));
    }
}
