use async_trait::async_trait;

use crate::core::{
    error::StorageError,
    storage::{AuditEntry, SledStorage},
};

#[async_trait]
pub trait AuditProvider {
    async fn next_audit_id(&self) -> Result<u64, StorageError>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StorageError>;
}

#[async_trait]
impl AuditProvider for SledStorage {
    async fn next_audit_id(&self) -> Result<u64, StorageError> {
        self.next_id("audit_id")
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<(), StorageError> {
        Self::put_encoded(&self.audit_logs, &entry.id.to_be_bytes(), entry)
    }
}
