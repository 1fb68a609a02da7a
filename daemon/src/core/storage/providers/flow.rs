use async_trait::async_trait;

use meridian_common::fund::Amount;

use crate::core::{
    error::StorageError,
    storage::{DailyFlow, SledStorage},
};

// Gross deposit/redemption volume per UTC day. Serialized behind the
// dispatcher so read-modify-write is race-free.
#[async_trait]
pub trait FlowStatsProvider {
    async fn record_daily_flow(
        &self,
        day: u64,
        deposit_delta: Amount,
        redemption_delta: Amount,
    ) -> Result<(), StorageError>;

    async fn daily_flows_range(&self, from_day: u64, to_day: u64)
        -> Result<Vec<DailyFlow>, StorageError>;
}

#[async_trait]
impl FlowStatsProvider for SledStorage {
    async fn record_daily_flow(
        &self,
        day: u64,
        deposit_delta: Amount,
        redemption_delta: Amount,
    ) -> Result<(), StorageError> {
        let key = day.to_be_bytes();
        let mut flow: DailyFlow = Self::get_decoded(&self.daily_flows, &key)?.unwrap_or(DailyFlow {
            day,
            deposits: 0,
            redemptions: 0,
        });
        flow.deposits = flow.deposits.saturating_add(deposit_delta);
        flow.redemptions = flow.redemptions.saturating_add(redemption_delta);
        Self::put_encoded(&self.daily_flows, &key, &flow)
    }

    async fn daily_flows_range(
        &self,
        from_day: u64,
        to_day: u64,
    ) -> Result<Vec<DailyFlow>, StorageError> {
        let mut flows = Vec::new();
        let start = from_day.to_be_bytes();
        let end = to_day.to_be_bytes();
        for entry in self.daily_flows.range(start.as_slice()..=end.as_slice()) {
            let (_, value) = entry?;
            flows.push(Self::decode(&value)?);
        }
        Ok(flows)
    }
}
