use async_trait::async_trait;

use meridian_common::time::{TimestampMillis, TimestampSeconds};

use crate::core::{
    error::StorageError,
    storage::{ChainParams, EmergencyIncident, SledStorage},
};

const INCIDENT_KEY: &[u8] = b"emergency_incident";
const CHAIN_PARAMS_KEY: &[u8] = b"chain_params";

// Small coordination flags and records with no table of their own
#[async_trait]
pub trait MetaProvider {
    async fn get_flag(&self, key: &str) -> Result<bool, StorageError>;

    async fn set_flag(&self, key: &str, value: bool) -> Result<(), StorageError>;

    async fn next_incident_id(&self) -> Result<u64, StorageError>;

    async fn get_incident(&self) -> Result<Option<EmergencyIncident>, StorageError>;

    async fn set_incident(&self, incident: &EmergencyIncident) -> Result<(), StorageError>;

    async fn get_chain_params(&self) -> Result<ChainParams, StorageError>;

    async fn set_chain_params(&self, params: &ChainParams) -> Result<(), StorageError>;

    // Timestamp of the last accepted NavUpdated event, feeding the oracle
    // staleness indicator
    async fn get_last_nav_update(&self) -> Result<Option<TimestampMillis>, StorageError>;

    async fn set_last_nav_update(&self, at: TimestampMillis) -> Result<(), StorageError>;

    // Cooldown markers suppressing duplicate alerts per source
    async fn get_alert_cooldown(&self, source: &str) -> Result<Option<TimestampSeconds>, StorageError>;

    async fn set_alert_cooldown(
        &self,
        source: &str,
        until: TimestampSeconds,
    ) -> Result<(), StorageError>;
}

#[async_trait]
impl MetaProvider for SledStorage {
    async fn get_flag(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self
            .common
            .get(format!("flag:{}", key).as_bytes())?
            .map(|v| v.as_ref() == b"1")
            .unwrap_or(false))
    }

    async fn set_flag(&self, key: &str, value: bool) -> Result<(), StorageError> {
        let stored: &[u8] = if value { b"1" } else { b"0" };
        self.common.insert(format!("flag:{}", key).as_bytes(), stored)?;
        Ok(())
    }

    async fn next_incident_id(&self) -> Result<u64, StorageError> {
        self.next_id("incident_id")
    }

    async fn get_incident(&self) -> Result<Option<EmergencyIncident>, StorageError> {
        Self::get_decoded(&self.common, INCIDENT_KEY)
    }

    async fn set_incident(&self, incident: &EmergencyIncident) -> Result<(), StorageError> {
        Self::put_encoded(&self.common, INCIDENT_KEY, incident)
    }

    async fn get_chain_params(&self) -> Result<ChainParams, StorageError> {
        Ok(Self::get_decoded(&self.common, CHAIN_PARAMS_KEY)?.unwrap_or_default())
    }

    async fn set_chain_params(&self, params: &ChainParams) -> Result<(), StorageError> {
        Self::put_encoded(&self.common, CHAIN_PARAMS_KEY, params)
    }

    async fn get_last_nav_update(&self) -> Result<Option<TimestampMillis>, StorageError> {
        Ok(self
            .common
            .get(b"last_nav_update")?
            .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap_or([0u8; 8]))))
    }

    async fn set_last_nav_update(&self, at: TimestampMillis) -> Result<(), StorageError> {
        self.common.insert(b"last_nav_update", &at.to_be_bytes())?;
        Ok(())
    }

    async fn get_alert_cooldown(
        &self,
        source: &str,
    ) -> Result<Option<TimestampSeconds>, StorageError> {
        Ok(self
            .common
            .get(format!("cooldown:{}", source).as_bytes())?
            .map(|v| u64::from_be_bytes(v.as_ref().try_into().unwrap_or([0u8; 8]))))
    }

    async fn set_alert_cooldown(
        &self,
        source: &str,
        until: TimestampSeconds,
    ) -> Result<(), StorageError> {
        self.common
            .insert(format!("cooldown:{}", source).as_bytes(), &until.to_be_bytes())?;
        Ok(())
    }
}
