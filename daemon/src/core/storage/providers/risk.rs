use async_trait::async_trait;

use meridian_common::{
    risk::{RiskEvent, RiskSnapshot},
    time::TimestampMillis,
};

use crate::core::{error::StorageError, storage::SledStorage};

// Snapshot keys are timestamp(8) || seq(8), big-endian, so range scans walk
// the series in time order and same-millisecond snapshots never collide
fn snapshot_key(timestamp: TimestampMillis, seq: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&timestamp.to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

#[async_trait]
pub trait RiskProvider {
    async fn append_risk_snapshot(&self, snapshot: &RiskSnapshot) -> Result<(), StorageError>;

    // Most recent first
    async fn latest_risk_snapshots(&self, limit: usize) -> Result<Vec<RiskSnapshot>, StorageError>;

    async fn risk_snapshots_range(
        &self,
        from: TimestampMillis,
        to: TimestampMillis,
    ) -> Result<Vec<RiskSnapshot>, StorageError>;

    async fn prune_risk_snapshots_before(
        &self,
        cutoff: TimestampMillis,
    ) -> Result<usize, StorageError>;

    async fn next_risk_event_id(&self) -> Result<u64, StorageError>;

    async fn append_risk_event(&self, event: &RiskEvent) -> Result<(), StorageError>;
}

#[async_trait]
impl RiskProvider for SledStorage {
    async fn append_risk_snapshot(&self, snapshot: &RiskSnapshot) -> Result<(), StorageError> {
        let seq = self.next_id("risk_snapshot_seq")?;
        Self::put_encoded(
            &self.risk_snapshots,
            &snapshot_key(snapshot.timestamp, seq),
            snapshot,
        )
    }

    async fn latest_risk_snapshots(&self, limit: usize) -> Result<Vec<RiskSnapshot>, StorageError> {
        let mut snapshots = Vec::with_capacity(limit);
        for entry in self.risk_snapshots.iter().rev().take(limit) {
            let (_, value) = entry?;
            snapshots.push(Self::decode(&value)?);
        }
        Ok(snapshots)
    }

    async fn risk_snapshots_range(
        &self,
        from: TimestampMillis,
        to: TimestampMillis,
    ) -> Result<Vec<RiskSnapshot>, StorageError> {
        let start = snapshot_key(from, 0);
        let end = snapshot_key(to, u64::MAX);
        let mut snapshots = Vec::new();
        for entry in self.risk_snapshots.range(start.as_slice()..=end.as_slice()) {
            let (_, value) = entry?;
            snapshots.push(Self::decode(&value)?);
        }
        Ok(snapshots)
    }

    async fn prune_risk_snapshots_before(
        &self,
        cutoff: TimestampMillis,
    ) -> Result<usize, StorageError> {
        let end = snapshot_key(cutoff, 0);
        let mut pruned = 0;
        for entry in self.risk_snapshots.range(..end.as_slice()) {
            let (key, _) = entry?;
            self.risk_snapshots.remove(key)?;
            pruned += 1;
        }
        Ok(pruned)
    }

    async fn next_risk_event_id(&self) -> Result<u64, StorageError> {
        self.next_id("risk_event_id")
    }

    async fn append_risk_event(&self, event: &RiskEvent) -> Result<(), StorageError> {
        Self::put_encoded(&self.risk_events, &event.id.to_be_bytes(), event)
    }
}
