use async_trait::async_trait;

use meridian_common::{
    chain::RequestId,
    fund::{RedemptionRequest, RedemptionStatus},
    time::TimestampMillis,
};

use crate::core::{error::StorageError, storage::SledStorage};

#[async_trait]
pub trait RedemptionProvider {
    async fn get_redemption(
        &self,
        request_id: RequestId,
    ) -> Result<Option<RedemptionRequest>, StorageError>;

    async fn set_redemption(&self, request: &RedemptionRequest) -> Result<(), StorageError>;

    async fn list_redemptions_by_status(
        &self,
        status: RedemptionStatus,
    ) -> Result<Vec<RedemptionRequest>, StorageError>;

    // Non-terminal requests settling at or before the cutoff; callers apply
    // their own status filters on top
    async fn list_redemptions_settling_before(
        &self,
        cutoff: TimestampMillis,
    ) -> Result<Vec<RedemptionRequest>, StorageError>;

    async fn list_open_redemptions(&self) -> Result<Vec<RedemptionRequest>, StorageError>;
}

#[async_trait]
impl RedemptionProvider for SledStorage {
    async fn get_redemption(
        &self,
        request_id: RequestId,
    ) -> Result<Option<RedemptionRequest>, StorageError> {
        Self::get_decoded(&self.redemptions, &request_id.to_be_bytes())
    }

    async fn set_redemption(&self, request: &RedemptionRequest) -> Result<(), StorageError> {
        Self::put_encoded(&self.redemptions, &request.request_id.to_be_bytes(), request)
    }

    async fn list_redemptions_by_status(
        &self,
        status: RedemptionStatus,
    ) -> Result<Vec<RedemptionRequest>, StorageError> {
        let mut requests = Vec::new();
        for entry in self.redemptions.iter() {
            let (_, value) = entry?;
            let request: RedemptionRequest = Self::decode(&value)?;
            if request.status == status {
                requests.push(request);
            }
        }
        Ok(requests)
    }

    async fn list_redemptions_settling_before(
        &self,
        cutoff: TimestampMillis,
    ) -> Result<Vec<RedemptionRequest>, StorageError> {
        let mut requests = Vec::new();
        for entry in self.redemptions.iter() {
            let (_, value) = entry?;
            let request: RedemptionRequest = Self::decode(&value)?;
            if request.settlement_time <= cutoff {
                requests.push(request);
            }
        }
        Ok(requests)
    }

    async fn list_open_redemptions(&self) -> Result<Vec<RedemptionRequest>, StorageError> {
        let mut requests = Vec::new();
        for entry in self.redemptions.iter() {
            let (_, value) = entry?;
            let request: RedemptionRequest = Self::decode(&value)?;
            if !request.status.is_terminal() {
                requests.push(request);
            }
        }
        Ok(requests)
    }
}
