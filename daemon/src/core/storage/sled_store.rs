use std::path::Path;

use log::{debug, info};
use serde::{de::DeserializeOwned, Serialize};
use sled::{Db, IVec, Tree};

use crate::core::error::StorageError;

// One tree per logical table
pub const TREE_CHECKPOINTS: &str = "checkpoints";
pub const TREE_DEDUP: &str = "dedup";
pub const TREE_EVENT_PROCESSED: &str = "event_processed";
pub const TREE_PROJECTION: &str = "fund_projection";
pub const TREE_HOLDINGS: &str = "holdings";
pub const TREE_REDEMPTIONS: &str = "redemption_requests";
pub const TREE_TICKETS: &str = "approval_tickets";
pub const TREE_PLANS: &str = "rebalance_plans";
pub const TREE_RISK_SNAPSHOTS: &str = "risk_snapshots";
pub const TREE_RISK_EVENTS: &str = "risk_events";
pub const TREE_AUDIT_LOGS: &str = "audit_logs";
pub const TREE_DAILY_FLOWS: &str = "daily_flows";
pub const TREE_LEASES: &str = "leases";
pub const TREE_TASKS: &str = "tasks";
pub const TREE_TASK_RESULTS: &str = "task_results";
pub const TREE_COUNTERS: &str = "counters";
pub const TREE_COMMON: &str = "common";
pub const TREE_IDEMPOTENCY: &str = "command_idempotency";

// Embedded store backing every provider trait. All values are serde-encoded;
// ordered keys are big-endian so range scans follow natural order.
pub struct SledStorage {
    db: Db,
    pub(super) checkpoints: Tree,
    pub(super) dedup: Tree,
    pub(super) event_processed: Tree,
    pub(super) projection: Tree,
    pub(super) holdings: Tree,
    pub(super) redemptions: Tree,
    pub(super) tickets: Tree,
    pub(super) plans: Tree,
    pub(super) risk_snapshots: Tree,
    pub(super) risk_events: Tree,
    pub(super) audit_logs: Tree,
    pub(super) daily_flows: Tree,
    pub(super) leases: Tree,
    pub(super) tasks: Tree,
    pub(super) task_results: Tree,
    pub(super) counters: Tree,
    pub(super) common: Tree,
    pub(super) idempotency: Tree,
}

impl SledStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        info!("Opening storage at {}", path.as_ref().display());
        let db = sled::open(path)?;

        Ok(Self {
            checkpoints: db.open_tree(TREE_CHECKPOINTS)?,
            dedup: db.open_tree(TREE_DEDUP)?,
            event_processed: db.open_tree(TREE_EVENT_PROCESSED)?,
            projection: db.open_tree(TREE_PROJECTION)?,
            holdings: db.open_tree(TREE_HOLDINGS)?,
            redemptions: db.open_tree(TREE_REDEMPTIONS)?,
            tickets: db.open_tree(TREE_TICKETS)?,
            plans: db.open_tree(TREE_PLANS)?,
            risk_snapshots: db.open_tree(TREE_RISK_SNAPSHOTS)?,
            risk_events: db.open_tree(TREE_RISK_EVENTS)?,
            audit_logs: db.open_tree(TREE_AUDIT_LOGS)?,
            daily_flows: db.open_tree(TREE_DAILY_FLOWS)?,
            leases: db.open_tree(TREE_LEASES)?,
            tasks: db.open_tree(TREE_TASKS)?,
            task_results: db.open_tree(TREE_TASK_RESULTS)?,
            counters: db.open_tree(TREE_COUNTERS)?,
            common: db.open_tree(TREE_COMMON)?,
            idempotency: db.open_tree(TREE_IDEMPOTENCY)?,
            db,
        })
    }

    pub async fn flush(&self) -> Result<(), StorageError> {
        let bytes = self.db.flush_async().await?;
        debug!("Flushed {} bytes to disk", bytes);
        Ok(())
    }

    // Monotonic id sequence per counter name
    pub(super) fn next_id(&self, name: &'static str) -> Result<u64, StorageError> {
        let ivec = self
            .counters
            .update_and_fetch(name, |current| {
                let next = match current {
                    Some(bytes) => u64::from_be_bytes(bytes.try_into().unwrap_or([0u8; 8])) + 1,
                    None => 1,
                };
                Some(next.to_be_bytes().to_vec())
            })?
            .ok_or(StorageError::CounterOverflow(name))?;
        Ok(u64::from_be_bytes(
            ivec.as_ref().try_into().unwrap_or([0u8; 8]),
        ))
    }

    pub(super) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
        Ok(serde_json::to_vec(value)?)
    }

    pub(super) fn decode<T: DeserializeOwned>(bytes: &IVec) -> Result<T, StorageError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub(super) fn get_decoded<T: DeserializeOwned>(
        tree: &Tree,
        key: &[u8],
    ) -> Result<Option<T>, StorageError> {
        match tree.get(key)? {
            Some(ivec) => Ok(Some(Self::decode(&ivec)?)),
            None => Ok(None),
        }
    }

    pub(super) fn put_encoded<T: Serialize>(
        tree: &Tree,
        key: &[u8],
        value: &T,
    ) -> Result<(), StorageError> {
        tree.insert(key, Self::encode(value)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    #[tokio::test]
    async fn counters_are_monotonic() {
        let dir = TempDir::new("meridian-storage").unwrap();
        let storage = SledStorage::open(dir.path()).unwrap();
        assert_eq!(storage.next_id("test").unwrap(), 1);
        assert_eq!(storage.next_id("test").unwrap(), 2);
        assert_eq!(storage.next_id("other").unwrap(), 1);
    }
}
