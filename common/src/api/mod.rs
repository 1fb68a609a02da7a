// Command surface types, shared between the daemon RPC server and clients.
// Every command carries an idempotency key and identifies its requester; the
// RBAC guard in front of these types is out of scope here.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

use crate::{
    approval::{ApproverRole, TicketStatus},
    chain::BlockNumber,
    rebalance::{PlanId, PlanStatus, RebalancePlan},
    risk::{ForecastHorizon, LiquidityForecast},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope<T> {
    pub idempotency_key: String,
    pub requester: String,
    #[serde(flatten)]
    pub command: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketActionRequest {
    pub ticket_id: u64,
    pub role: ApproverRole,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelTicketRequest {
    pub ticket_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutePlanRequest {
    pub plan_id: PlanId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerForecastRequest {
    pub horizon: ForecastHorizon,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResyncRequest {
    pub from_block: BlockNumber,
}

// In-flight or terminal outcome of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Accepted,
    Completed,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketActionResponse {
    pub status: CommandStatus,
    pub ticket_id: u64,
    pub ticket_status: TicketStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanResponse {
    pub status: CommandStatus,
    pub plan_id: Option<PlanId>,
    pub plan_status: Option<PlanStatus>,
    #[serde(default)]
    pub plan: Option<RebalancePlan>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastResponse {
    pub status: CommandStatus,
    pub forecast: LiquidityForecast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResyncResponse {
    pub status: CommandStatus,
    pub from_block: BlockNumber,
}

// Stable machine-readable codes, decoupled from internal error text
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiErrorCode {
    NoRuleMatched,
    UnsupportedReference,
    ValidationError,
    NotFound,
    AlreadyActed,
    TerminalState,
    SimulationFailed,
    ChainUnavailable,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
    // Terminal receipt status for on-chain commit failures
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_status: Option<bool>,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            receipt_status: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_flattens_command() {
        let envelope = CommandEnvelope {
            idempotency_key: "k-1".to_string(),
            requester: "ops".to_string(),
            command: CancelTicketRequest { ticket_id: 9 },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["idempotency_key"], "k-1");
        assert_eq!(json["ticket_id"], 9);
    }

    #[test]
    fn error_codes_are_stable_strings() {
        let err = ApiError::new(ApiErrorCode::NoRuleMatched, "no approval rule matched");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "NO_RULE_MATCHED");
    }
}
