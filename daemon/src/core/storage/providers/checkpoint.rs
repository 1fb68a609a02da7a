use async_trait::async_trait;
use primitive_types::H160;

use meridian_common::chain::ContractAddress;

use crate::core::{
    error::StorageError,
    storage::{Checkpoint, SledStorage},
};

// Written only by the ingestor while it holds the ingest lease
#[async_trait]
pub trait CheckpointProvider {
    async fn get_checkpoint(
        &self,
        contract: &ContractAddress,
    ) -> Result<Option<Checkpoint>, StorageError>;

    async fn set_checkpoint(
        &self,
        contract: &ContractAddress,
        checkpoint: &Checkpoint,
    ) -> Result<(), StorageError>;

    async fn all_checkpoints(&self) -> Result<Vec<(ContractAddress, Checkpoint)>, StorageError>;
}

#[async_trait]
impl CheckpointProvider for SledStorage {
    async fn get_checkpoint(
        &self,
        contract: &ContractAddress,
    ) -> Result<Option<Checkpoint>, StorageError> {
        Self::get_decoded(&self.checkpoints, contract.as_bytes())
    }

    async fn set_checkpoint(
        &self,
        contract: &ContractAddress,
        checkpoint: &Checkpoint,
    ) -> Result<(), StorageError> {
        Self::put_encoded(&self.checkpoints, contract.as_bytes(), checkpoint)
    }

    async fn all_checkpoints(&self) -> Result<Vec<(ContractAddress, Checkpoint)>, StorageError> {
        let mut checkpoints = Vec::new();
        for entry in self.checkpoints.iter() {
            let (key, value) = entry?;
            if key.len() != 20 {
                continue;
            }
            checkpoints.push((H160::from_slice(&key), Self::decode(&value)?));
        }
        Ok(checkpoints)
    }
}
