mod lease;
mod queue;
mod runtime;

pub use lease::*;
pub use queue::*;
pub use runtime::*;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter};
use thiserror::Error;

use meridian_common::time::TimestampMillis;

use crate::core::error::StorageError;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("task {id} exhausted its {max_retries} retries: {last_error}")]
    RetriesExhausted {
        id: u64,
        max_retries: u32,
        last_error: String,
    },

    #[error("task runtime is shutting down")]
    ShuttingDown,
}

// Four levels, per-priority FIFO, no cross-priority ordering
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumIter,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskPriority {
    Critical,
    High,
    Normal,
    Low,
}

impl TaskPriority {
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Daily,
    Weekly,
    Monthly,
    PostIncident,
}

// Everything the workers know how to execute. Handlers must be idempotent:
// delivery is at-least-once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskPayload {
    SlaWarning { ticket_id: u64 },
    SlaEscalation { ticket_id: u64 },
    SlaDeadline { ticket_id: u64 },
    ProcessApprovalResult { ticket_id: u64 },
    ExecutePlan { plan_id: u64 },
    RiskIndicatorTick,
    LiquidityCheckTick,
    DeviationCheckTick,
    ForecastTick,
    OverdueLiabilityBatch { days_back: u32 },
    RetentionPrune,
    GenerateReport {
        #[serde(rename = "report_kind")]
        kind: ReportKind,
        reference: Option<u64>,
    },
}

impl TaskPayload {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SlaWarning { .. } => "sla_warning",
            Self::SlaEscalation { .. } => "sla_escalation",
            Self::SlaDeadline { .. } => "sla_deadline",
            Self::ProcessApprovalResult { .. } => "process_approval_result",
            Self::ExecutePlan { .. } => "execute_plan",
            Self::RiskIndicatorTick => "risk_indicator_tick",
            Self::LiquidityCheckTick => "liquidity_check_tick",
            Self::DeviationCheckTick => "deviation_check_tick",
            Self::ForecastTick => "forecast_tick",
            Self::OverdueLiabilityBatch { .. } => "overdue_liability_batch",
            Self::RetentionPrune => "retention_prune",
            Self::GenerateReport { .. } => "generate_report",
        }
    }

    // SLA jobs are cancelled together when their ticket resolves
    pub fn ticket_id(&self) -> Option<u64> {
        match self {
            Self::SlaWarning { ticket_id }
            | Self::SlaEscalation { ticket_id }
            | Self::SlaDeadline { ticket_id } => Some(*ticket_id),
            _ => None,
        }
    }

    pub fn default_priority(&self) -> TaskPriority {
        match self {
            Self::SlaDeadline { .. } | Self::ProcessApprovalResult { .. } => TaskPriority::Critical,
            Self::SlaWarning { .. } | Self::SlaEscalation { .. } | Self::ExecutePlan { .. } => {
                TaskPriority::High
            }
            Self::RiskIndicatorTick | Self::LiquidityCheckTick => TaskPriority::High,
            Self::DeviationCheckTick | Self::ForecastTick | Self::OverdueLiabilityBatch { .. } => {
                TaskPriority::Normal
            }
            Self::RetentionPrune | Self::GenerateReport { .. } => TaskPriority::Low,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: u64,
    pub priority: TaskPriority,
    pub payload: TaskPayload,
    // Absolute due time; tasks submitted for immediate execution carry `now`
    pub run_at: TimestampMillis,
    pub max_retries: u32,
    pub attempts: u32,
    pub created_at: TimestampMillis,
}

// Retained for 24h so redelivered tasks can be recognized as already done
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub finished_at: TimestampMillis,
    pub success: bool,
    pub detail: Option<String>,
}
