use async_trait::async_trait;
use log::trace;

use meridian_common::time::TimestampMillis;

use crate::core::{
    error::StorageError,
    storage::{LeaseRecord, SledStorage},
};

// TTL'd singleton leases built on compare-and-set. The holder string is the
// instance id; a replacement only wins once the previous lease lapsed.
#[async_trait]
pub trait LeaseProvider {
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl_ms: u64,
        now: TimestampMillis,
    ) -> Result<bool, StorageError>;

    // Renewal only succeeds for the current holder
    async fn renew_lease(
        &self,
        name: &str,
        holder: &str,
        ttl_ms: u64,
        now: TimestampMillis,
    ) -> Result<bool, StorageError>;

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StorageError>;

    async fn get_lease(&self, name: &str) -> Result<Option<LeaseRecord>, StorageError>;
}

#[async_trait]
impl LeaseProvider for SledStorage {
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        ttl_ms: u64,
        now: TimestampMillis,
    ) -> Result<bool, StorageError> {
        let key = name.as_bytes();
        let current = self.leases.get(key)?;
        if let Some(existing) = current.as_ref() {
            let record: LeaseRecord = Self::decode(existing)?;
            if record.expires_at > now && record.holder != holder {
                trace!("lease '{}' held by {}", name, record.holder);
                return Ok(false);
            }
        }

        let record = LeaseRecord {
            holder: holder.to_string(),
            expires_at: now + ttl_ms,
        };
        let encoded = Self::encode(&record)?;
        // CAS against the state we just read; a concurrent claimer wins the race
        let swapped = self
            .leases
            .compare_and_swap(key, current, Some(encoded))?
            .is_ok();
        Ok(swapped)
    }

    async fn renew_lease(
        &self,
        name: &str,
        holder: &str,
        ttl_ms: u64,
        now: TimestampMillis,
    ) -> Result<bool, StorageError> {
        let key = name.as_bytes();
        let Some(current) = self.leases.get(key)? else {
            return Ok(false);
        };
        let record: LeaseRecord = Self::decode(&current)?;
        if record.holder != holder {
            return Ok(false);
        }

        let renewed = LeaseRecord {
            holder: holder.to_string(),
            expires_at: now + ttl_ms,
        };
        let encoded = Self::encode(&renewed)?;
        let swapped = self
            .leases
            .compare_and_swap(key, Some(current), Some(encoded))?
            .is_ok();
        Ok(swapped)
    }

    async fn release_lease(&self, name: &str, holder: &str) -> Result<(), StorageError> {
        let key = name.as_bytes();
        if let Some(current) = self.leases.get(key)? {
            let record: LeaseRecord = Self::decode(&current)?;
            if record.holder == holder {
                let _ = self.leases.compare_and_swap(key, Some(current), None::<&[u8]>)?;
            }
        }
        Ok(())
    }

    async fn get_lease(&self, name: &str) -> Result<Option<LeaseRecord>, StorageError> {
        Self::get_decoded(&self.leases, name.as_bytes())
    }
}
