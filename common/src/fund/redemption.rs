use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};
use thiserror::Error;

use crate::{
    chain::{AccountAddress, RequestId},
    fund::Amount,
    time::TimestampMillis,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum RedemptionChannel {
    Standard,
    Emergency,
    Scheduled,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum RedemptionStatus {
    Pending,
    PendingApproval,
    Approved,
    Settled,
    Rejected,
    Expired,
    Cancelled,
}

impl RedemptionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Settled | Self::Rejected | Self::Expired | Self::Cancelled
        )
    }

    // The redemption state machine. No edge leaves a terminal state.
    pub fn can_transition_to(&self, next: RedemptionStatus) -> bool {
        use RedemptionStatus::*;
        match (self, next) {
            (Pending, Settled) | (Pending, Cancelled) => true,
            (PendingApproval, Approved)
            | (PendingApproval, Rejected)
            | (PendingApproval, Expired)
            | (PendingApproval, Cancelled) => true,
            (Approved, Settled) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
#[error("invalid redemption transition {from} -> {to} for request {request_id}")]
pub struct InvalidRedemptionTransition {
    pub request_id: RequestId,
    pub from: RedemptionStatus,
    pub to: RedemptionStatus,
}

// Off-chain model of one on-chain redemption request.
// request_id is chain-assigned and unique; amounts are locked at request time
// against the NAV recorded on-chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionRequest {
    pub request_id: RequestId,
    pub owner: AccountAddress,
    pub receiver: AccountAddress,
    pub shares: Amount,
    pub gross_amount: Amount,
    pub locked_nav: Amount,
    pub estimated_fee: Amount,
    pub request_time: TimestampMillis,
    pub settlement_time: TimestampMillis,
    pub channel: RedemptionChannel,
    pub requires_approval: bool,
    pub window_id: Option<u64>,
    pub voucher_token_id: Option<u64>,
    pub status: RedemptionStatus,
    pub settled_amount: Option<Amount>,
    pub settled_fee: Option<Amount>,
    pub settled_at: Option<TimestampMillis>,
    pub approval_ticket_id: Option<u64>,
    pub updated_at: TimestampMillis,
}

impl RedemptionRequest {
    // Guarded status advance; idempotent when already in `next`
    pub fn transition(
        &mut self,
        next: RedemptionStatus,
        now: TimestampMillis,
    ) -> Result<bool, InvalidRedemptionTransition> {
        if self.status == next {
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(InvalidRedemptionTransition {
                request_id: self.request_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(status: RedemptionStatus) -> RedemptionRequest {
        RedemptionRequest {
            request_id: 42,
            owner: AccountAddress::repeat_byte(1),
            receiver: AccountAddress::repeat_byte(1),
            shares: 10,
            gross_amount: 10,
            locked_nav: 1,
            estimated_fee: 0,
            request_time: 0,
            settlement_time: 0,
            channel: RedemptionChannel::Standard,
            requires_approval: false,
            window_id: None,
            voucher_token_id: None,
            status,
            settled_amount: None,
            settled_fee: None,
            settled_at: None,
            approval_ticket_id: None,
            updated_at: 0,
        }
    }

    #[test]
    fn pending_settles() {
        let mut r = request(RedemptionStatus::Pending);
        assert!(r.transition(RedemptionStatus::Settled, 1).unwrap());
        assert_eq!(r.status, RedemptionStatus::Settled);
    }

    #[test]
    fn approval_path() {
        let mut r = request(RedemptionStatus::PendingApproval);
        assert!(r.transition(RedemptionStatus::Approved, 1).unwrap());
        assert!(r.transition(RedemptionStatus::Settled, 2).unwrap());
    }

    #[test]
    fn terminal_states_are_sticky() {
        for terminal in [
            RedemptionStatus::Settled,
            RedemptionStatus::Rejected,
            RedemptionStatus::Expired,
            RedemptionStatus::Cancelled,
        ] {
            let mut r = request(terminal);
            assert!(r.transition(RedemptionStatus::Pending, 1).is_err());
            assert!(r.transition(RedemptionStatus::Approved, 1).is_err());
        }
    }

    #[test]
    fn transition_to_same_state_is_idempotent() {
        let mut r = request(RedemptionStatus::Settled);
        assert!(!r.transition(RedemptionStatus::Settled, 1).unwrap());
    }

    #[test]
    fn pending_cannot_be_approved() {
        // approval only applies to requests that required it
        let mut r = request(RedemptionStatus::Pending);
        assert!(r.transition(RedemptionStatus::Approved, 1).is_err());
    }
}
