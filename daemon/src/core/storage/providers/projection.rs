use async_trait::async_trait;
use primitive_types::H160;

use meridian_common::{
    chain::ContractAddress,
    fund::{AssetHolding, FundProjection},
};

use crate::core::{error::StorageError, storage::SledStorage};

const FUND_KEY: &[u8] = b"fund";

// The read model. Written only by the event dispatcher and the rebalance
// executor's verification step.
#[async_trait]
pub trait ProjectionProvider {
    async fn get_fund_projection(&self) -> Result<FundProjection, StorageError>;

    async fn set_fund_projection(&self, projection: &FundProjection) -> Result<(), StorageError>;

    async fn get_holding(
        &self,
        asset: &ContractAddress,
    ) -> Result<Option<AssetHolding>, StorageError>;

    async fn set_holding(&self, holding: &AssetHolding) -> Result<(), StorageError>;

    async fn remove_holding(&self, asset: &ContractAddress) -> Result<(), StorageError>;

    async fn list_holdings(&self) -> Result<Vec<AssetHolding>, StorageError>;
}

#[async_trait]
impl ProjectionProvider for SledStorage {
    async fn get_fund_projection(&self) -> Result<FundProjection, StorageError> {
        Ok(Self::get_decoded(&self.projection, FUND_KEY)?.unwrap_or_default())
    }

    async fn set_fund_projection(&self, projection: &FundProjection) -> Result<(), StorageError> {
        Self::put_encoded(&self.projection, FUND_KEY, projection)
    }

    async fn get_holding(
        &self,
        asset: &ContractAddress,
    ) -> Result<Option<AssetHolding>, StorageError> {
        Self::get_decoded(&self.holdings, asset.as_bytes())
    }

    async fn set_holding(&self, holding: &AssetHolding) -> Result<(), StorageError> {
        Self::put_encoded(&self.holdings, holding.asset.as_bytes(), holding)
    }

    async fn remove_holding(&self, asset: &ContractAddress) -> Result<(), StorageError> {
        self.holdings.remove(asset.as_bytes())?;
        Ok(())
    }

    async fn list_holdings(&self) -> Result<Vec<AssetHolding>, StorageError> {
        let mut holdings = Vec::new();
        for entry in self.holdings.iter() {
            let (key, value) = entry?;
            if key.len() != 20 {
                continue;
            }
            let _asset = H160::from_slice(&key);
            holdings.push(Self::decode(&value)?);
        }
        Ok(holdings)
    }
}
