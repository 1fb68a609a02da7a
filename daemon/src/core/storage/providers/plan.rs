use async_trait::async_trait;

use meridian_common::rebalance::{PlanId, PlanStatus, RebalancePlan};

use crate::core::{error::StorageError, storage::SledStorage};

#[async_trait]
pub trait PlanProvider {
    async fn next_plan_id(&self) -> Result<PlanId, StorageError>;

    async fn get_plan(&self, id: PlanId) -> Result<Option<RebalancePlan>, StorageError>;

    async fn expect_plan(&self, id: PlanId) -> Result<RebalancePlan, StorageError>;

    async fn set_plan(&self, plan: &RebalancePlan) -> Result<(), StorageError>;

    async fn list_plans_by_status(
        &self,
        status: PlanStatus,
    ) -> Result<Vec<RebalancePlan>, StorageError>;
}

#[async_trait]
impl PlanProvider for SledStorage {
    async fn next_plan_id(&self) -> Result<PlanId, StorageError> {
        self.next_id("plan_id")
    }

    async fn get_plan(&self, id: PlanId) -> Result<Option<RebalancePlan>, StorageError> {
        Self::get_decoded(&self.plans, &id.to_be_bytes())
    }

    async fn expect_plan(&self, id: PlanId) -> Result<RebalancePlan, StorageError> {
        self.get_plan(id)
            .await?
            .ok_or_else(|| StorageError::not_found("plan", id))
    }

    async fn set_plan(&self, plan: &RebalancePlan) -> Result<(), StorageError> {
        Self::put_encoded(&self.plans, &plan.id.to_be_bytes(), plan)
    }

    async fn list_plans_by_status(
        &self,
        status: PlanStatus,
    ) -> Result<Vec<RebalancePlan>, StorageError> {
        let mut plans = Vec::new();
        for entry in self.plans.iter() {
            let (_, value) = entry?;
            let plan: RebalancePlan = Self::decode(&value)?;
            if plan.status == status {
                plans.push(plan);
            }
        }
        Ok(plans)
    }
}
