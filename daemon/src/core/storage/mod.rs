mod providers;
mod sled_store;

pub use providers::*;
pub use sled_store::SledStorage;

use primitive_types::H256;
use serde::{Deserialize, Serialize};

use meridian_common::{
    chain::{BlockNumber, EventId},
    fund::Amount,
    time::TimestampMillis,
};

// Last processed position for one watched contract, plus the block hash
// observed there so the next advance can detect a reorg
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_confirmed_block: BlockNumber,
    pub block_hash: H256,
    pub updated_at: TimestampMillis,
}

// Audit row written in the same commit as the handler's projection writes.
// Source of truth against replay once a dedup marker is evicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedEvent {
    pub event_id: EventId,
    pub name: String,
    pub processed_at: TimestampMillis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub actor: String,
    pub action: String,
    pub details: serde_json::Value,
    pub created_at: TimestampMillis,
}

// Aggregated gross flows per UTC day, feeding the historical rates used by
// the liquidity forecast
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DailyFlow {
    pub day: u64,
    pub deposits: Amount,
    pub redemptions: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: String,
    pub expires_at: TimestampMillis,
}

// Contract-side parameters echoed by config-update events; dashboards read
// them from here instead of the chain
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ChainParams {
    pub base_redemption_fee_bps: u64,
    pub emergency_penalty_fee_bps: u64,
    pub voucher_threshold_secs: u64,
    pub standard_quota_ratio_bps: u64,
    pub emergency_quota: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyIncident {
    pub id: u64,
    pub reason: String,
    pub started_at: TimestampMillis,
    pub closed_at: Option<TimestampMillis>,
}

impl EmergencyIncident {
    pub fn is_active(&self) -> bool {
        self.closed_at.is_none()
    }
}

// The full storage contract required by the daemon. Engines stay generic over
// it so tests can drive them against a temporary store.
pub trait Storage:
    CheckpointProvider
    + DedupProvider
    + ProcessedEventProvider
    + ProjectionProvider
    + RedemptionProvider
    + TicketProvider
    + PlanProvider
    + RiskProvider
    + AuditProvider
    + FlowStatsProvider
    + LeaseProvider
    + TaskStoreProvider
    + MetaProvider
    + IdempotencyProvider
    + Send
    + Sync
    + 'static
{
}

impl<T> Storage for T where
    T: CheckpointProvider
        + DedupProvider
        + ProcessedEventProvider
        + ProjectionProvider
        + RedemptionProvider
        + TicketProvider
        + PlanProvider
        + RiskProvider
        + AuditProvider
        + FlowStatsProvider
        + LeaseProvider
        + TaskStoreProvider
        + MetaProvider
        + IdempotencyProvider
        + Send
        + Sync
        + 'static
{
}
