use async_trait::async_trait;
use serde_json::Value;

use crate::core::{error::StorageError, storage::SledStorage};

// Stored command responses, replayed when a client retries the same
// idempotency key
#[async_trait]
pub trait IdempotencyProvider {
    async fn get_command_response(&self, key: &str) -> Result<Option<Value>, StorageError>;

    async fn put_command_response(&self, key: &str, response: &Value) -> Result<(), StorageError>;
}

#[async_trait]
impl IdempotencyProvider for SledStorage {
    async fn get_command_response(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Self::get_decoded(&self.idempotency, key.as_bytes())
    }

    async fn put_command_response(&self, key: &str, response: &Value) -> Result<(), StorageError> {
        Self::put_encoded(&self.idempotency, key.as_bytes(), response)
    }
}
