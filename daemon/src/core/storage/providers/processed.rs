use async_trait::async_trait;

use crate::core::{
    error::StorageError,
    storage::{ProcessedEvent, SledStorage},
};

// Audit table keyed by the dedup key; written in the same commit as the
// handler's projection writes
#[async_trait]
pub trait ProcessedEventProvider {
    async fn has_processed_event(&self, key: &str) -> Result<bool, StorageError>;

    async fn record_processed_event(&self, event: &ProcessedEvent) -> Result<(), StorageError>;

    async fn processed_event_count(&self) -> Result<usize, StorageError>;
}

#[async_trait]
impl ProcessedEventProvider for SledStorage {
    async fn has_processed_event(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.event_processed.contains_key(key.as_bytes())?)
    }

    async fn record_processed_event(&self, event: &ProcessedEvent) -> Result<(), StorageError> {
        Self::put_encoded(
            &self.event_processed,
            event.event_id.dedup_key().as_bytes(),
            event,
        )
    }

    async fn processed_event_count(&self) -> Result<usize, StorageError> {
        Ok(self.event_processed.len())
    }
}
