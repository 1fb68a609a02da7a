use thiserror::Error;

use meridian_common::{
    approval::TicketStateError,
    chain::DecodeError,
    fund::InvalidRedemptionTransition,
};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("lease '{0}' is held by another instance")]
    LeaseHeld(String),

    #[error("counter '{0}' overflowed")]
    CounterOverflow(&'static str),
}

impl StorageError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

// Top-level error for daemon components. Engine modules define their own
// error enums and convert into this at the task/command boundary.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Gateway(#[from] crate::chain::GatewayError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    TicketState(#[from] TicketStateError),

    #[error(transparent)]
    RedemptionState(#[from] InvalidRedemptionTransition),

    #[error(transparent)]
    Approval(#[from] crate::approval::ApprovalError),

    #[error(transparent)]
    Rebalance(#[from] crate::rebalance::RebalanceError),

    #[error(transparent)]
    Risk(#[from] crate::risk::RiskError),

    #[error(transparent)]
    Ingest(#[from] crate::ingest::IngestError),

    #[error(transparent)]
    Task(#[from] crate::tasks::TaskError),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Any(#[from] anyhow::Error),
}
