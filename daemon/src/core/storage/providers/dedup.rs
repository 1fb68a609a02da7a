use async_trait::async_trait;

use meridian_common::time::TimestampSeconds;

use crate::core::{error::StorageError, storage::SledStorage};

// TTL'd set of seen (tx_hash, log_index) keys. Owned by the ingestor.
#[async_trait]
pub trait DedupProvider {
    // Returns true when the key was fresh and is now marked, false on a hit.
    // An expired marker counts as fresh and is overwritten.
    async fn check_and_mark_dedup(
        &self,
        key: &str,
        now: TimestampSeconds,
        ttl: TimestampSeconds,
    ) -> Result<bool, StorageError>;

    async fn purge_expired_dedup(&self, now: TimestampSeconds) -> Result<usize, StorageError>;
}

#[async_trait]
impl DedupProvider for SledStorage {
    async fn check_and_mark_dedup(
        &self,
        key: &str,
        now: TimestampSeconds,
        ttl: TimestampSeconds,
    ) -> Result<bool, StorageError> {
        if let Some(existing) = self.dedup.get(key.as_bytes())? {
            let expires_at = u64::from_be_bytes(existing.as_ref().try_into().unwrap_or([0u8; 8]));
            if expires_at > now {
                return Ok(false);
            }
        }
        self.dedup
            .insert(key.as_bytes(), &(now + ttl).to_be_bytes())?;
        Ok(true)
    }

    async fn purge_expired_dedup(&self, now: TimestampSeconds) -> Result<usize, StorageError> {
        let mut purged = 0;
        for entry in self.dedup.iter() {
            let (key, value) = entry?;
            let expires_at = u64::from_be_bytes(value.as_ref().try_into().unwrap_or([0u8; 8]));
            if expires_at <= now {
                self.dedup.remove(key)?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}
