// Emergency driver: one instance per incident, enforced by an
// incident-scoped lease so rolling restarts never run two drivers.

use std::{sync::Arc, time::Duration};

use log::{error, info, warn};
use metrics::counter;
use serde_json::json;
use tokio::sync::Mutex;

use meridian_common::{
    chain::{ChainCall, ContractAddress, SendConstraints, SignerRole},
    config::{RECOVERY_CALM_SNAPSHOTS, RECOVERY_WATCHER_INTERVAL_SECS},
    fund::{Amount, Tier},
    risk::RiskLevel,
    time::get_current_time_in_millis,
};

use crate::{
    chain::ChainGateway,
    core::storage::{EmergencyIncident, Storage},
    notify::{Notifier, NotifyChannel, NotifyLevel},
    rebalance::RebalanceEngine,
    tasks::{LeaseKeeper, ReportKind, TaskPayload, TaskRuntime},
};

use super::RiskError;

pub struct EmergencyDriver<S: Storage, G: ChainGateway> {
    storage: Arc<S>,
    gateway: Arc<G>,
    rebalance: Arc<RebalanceEngine<S, G>>,
    tasks: Arc<TaskRuntime<S>>,
    notifier: Arc<dyn Notifier>,
    vault_contract: ContractAddress,
    constraints: SendConstraints,
    instance_id: String,
    watcher_interval: Duration,
    // serializes incident creation within this process
    starting: Mutex<()>,
}

impl<S: Storage, G: ChainGateway> EmergencyDriver<S, G> {
    pub fn new(
        storage: Arc<S>,
        gateway: Arc<G>,
        rebalance: Arc<RebalanceEngine<S, G>>,
        tasks: Arc<TaskRuntime<S>>,
        notifier: Arc<dyn Notifier>,
        vault_contract: ContractAddress,
        constraints: SendConstraints,
        instance_id: String,
    ) -> Arc<Self> {
        Self::with_watcher_interval(
            storage,
            gateway,
            rebalance,
            tasks,
            notifier,
            vault_contract,
            constraints,
            instance_id,
            Duration::from_secs(RECOVERY_WATCHER_INTERVAL_SECS),
        )
    }

    pub fn with_watcher_interval(
        storage: Arc<S>,
        gateway: Arc<G>,
        rebalance: Arc<RebalanceEngine<S, G>>,
        tasks: Arc<TaskRuntime<S>>,
        notifier: Arc<dyn Notifier>,
        vault_contract: ContractAddress,
        constraints: SendConstraints,
        instance_id: String,
        watcher_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            gateway,
            rebalance,
            tasks,
            notifier,
            vault_contract,
            constraints,
            instance_id,
            watcher_interval,
            starting: Mutex::new(()),
        })
    }

    // Open (or join) the emergency incident. `already_on_chain` skips the
    // mode commit when the trigger was the chain's own EmergencyModeChanged.
    // Returns the incident id, or None when another node drives it.
    pub async fn start_incident(
        &self,
        reason: &str,
        already_on_chain: bool,
    ) -> Result<Option<u64>, RiskError> {
        let _serialize = self.starting.lock().await;

        if let Some(incident) = self.storage.get_incident().await? {
            if incident.is_active() {
                info!("incident {} already active", incident.id);
                return Ok(Some(incident.id));
            }
        }

        let id = self.storage.next_incident_id().await?;
        let lease_name = format!("emergency_driver:{}", id);
        let Some(lease) = LeaseKeeper::try_acquire(
            Arc::clone(&self.storage),
            lease_name,
            self.instance_id.clone(),
        )
        .await?
        else {
            warn!("incident {} is driven by another instance", id);
            return Ok(None);
        };

        let incident = EmergencyIncident {
            id,
            reason: reason.to_string(),
            started_at: get_current_time_in_millis(),
            closed_at: None,
        };
        self.storage.set_incident(&incident).await?;
        counter!("meridian_emergency_incidents").increment(1);
        error!("EMERGENCY incident {} opened: {}", id, reason);

        // (a) + (b): mode commit and the critical page run concurrently
        let commit = async {
            if already_on_chain {
                return;
            }
            if let Err(e) = self.set_emergency_mode(true).await {
                error!("failed to commit emergency mode: {}", e);
            }
        };
        let page_message = format!("incident {}: {}", id, reason);
        let page = self.notifier.notify(
            NotifyLevel::Critical,
            NotifyChannel::Ops,
            "EMERGENCY MODE",
            &page_message,
        );
        tokio::join!(commit, page);

        // (c): cover the funding hole through the waterfall path
        match self.liquidity_gap().await {
            Ok(gap) if gap > 0 => {
                info!("incident {}: liquidity gap {}, running waterfall", id, gap);
                if let Err(e) = self.rebalance.emergency_waterfall(gap as u128).await {
                    error!("incident {} waterfall failed: {}", id, e);
                }
            }
            Ok(_) => info!("incident {}: no liquidity gap", id),
            Err(e) => error!("incident {} gap assessment failed: {}", id, e),
        }

        // (d): recovery watcher
        self.spawn_watcher(id, lease);
        Ok(Some(id))
    }

    // Resume the watcher for an incident left open by a previous process
    pub async fn resume_active_incident(self: &Arc<Self>) -> Result<(), RiskError> {
        let Some(incident) = self.storage.get_incident().await? else {
            return Ok(());
        };
        if !incident.is_active() {
            return Ok(());
        }
        let lease_name = format!("emergency_driver:{}", incident.id);
        let Some(lease) = LeaseKeeper::try_acquire(
            Arc::clone(&self.storage),
            lease_name,
            self.instance_id.clone(),
        )
        .await?
        else {
            return Ok(());
        };
        info!("resuming recovery watcher for incident {}", incident.id);
        self.spawn_watcher(incident.id, lease);
        Ok(())
    }

    fn spawn_watcher(&self, incident_id: u64, lease: Arc<LeaseKeeper<S>>) {
        let storage = Arc::clone(&self.storage);
        let gateway = Arc::clone(&self.gateway);
        let tasks = Arc::clone(&self.tasks);
        let notifier = Arc::clone(&self.notifier);
        let vault = self.vault_contract;
        let constraints = self.constraints;
        let interval = self.watcher_interval;

        tokio::spawn(async move {
            info!("recovery watcher for incident {} started", incident_id);
            loop {
                tokio::time::sleep(interval).await;
                if !lease.is_held() {
                    warn!("incident {} lease lost, watcher exiting", incident_id);
                    return;
                }

                // two consecutive calm snapshots close the incident
                let calm = match storage
                    .latest_risk_snapshots(RECOVERY_CALM_SNAPSHOTS as usize)
                    .await
                {
                    Ok(snapshots) => {
                        snapshots.len() >= RECOVERY_CALM_SNAPSHOTS as usize
                            && snapshots.iter().all(|s| s.risk_level <= RiskLevel::Elevated)
                    }
                    Err(e) => {
                        error!("watcher snapshot read failed: {}", e);
                        false
                    }
                };
                if !calm {
                    continue;
                }

                info!("incident {} recovered, lifting emergency mode", incident_id);
                let unset = ChainCall::new(vault, "setEmergencyMode", json!({ "enabled": false }));
                let unpause = ChainCall::new(vault, "unpause", json!({}));
                let mode_result = gateway.send(&unset, SignerRole::Admin, &constraints).await;
                let unpause_result = gateway.send(&unpause, SignerRole::Admin, &constraints).await;
                if let Err(e) = mode_result.and(unpause_result) {
                    error!("incident {} recovery commit failed: {}", incident_id, e);
                    continue;
                }

                if let Ok(Some(mut incident)) = storage.get_incident().await {
                    incident.closed_at = Some(get_current_time_in_millis());
                    let _ = storage.set_incident(&incident).await;
                }
                notifier
                    .notify(
                        NotifyLevel::Info,
                        NotifyChannel::Ops,
                        "emergency incident closed",
                        &format!("incident {} closed after sustained recovery", incident_id),
                    )
                    .await;
                if let Err(e) = tasks
                    .submit(TaskPayload::GenerateReport {
                        kind: ReportKind::PostIncident,
                        reference: Some(incident_id),
                    })
                    .await
                {
                    error!("failed to queue post-incident report: {}", e);
                }

                lease.release().await;
                return;
            }
        });
    }

    async fn set_emergency_mode(&self, enabled: bool) -> Result<(), RiskError> {
        let mode = ChainCall::new(
            self.vault_contract,
            "setEmergencyMode",
            json!({ "enabled": enabled }),
        );
        let pause = ChainCall::new(
            self.vault_contract,
            if enabled { "pause" } else { "unpause" },
            json!({}),
        );
        // both commits go out together; per-signer lanes serialize the nonce
        let (mode_result, pause_result) = tokio::join!(
            self.gateway.send(&mode, SignerRole::Admin, &self.constraints),
            self.gateway.send(&pause, SignerRole::Admin, &self.constraints),
        );
        mode_result?;
        pause_result?;
        Ok(())
    }

    async fn liquidity_gap(&self) -> Result<i128, RiskError> {
        use meridian_common::{config::PENDING_OUTFLOW_HORIZON_SECS, fund::RedemptionStatus};

        let projection = self.storage.get_fund_projection().await?;
        let available: Amount = projection.tier_value(Tier::L1) + projection.l2;
        let cutoff = get_current_time_in_millis() + PENDING_OUTFLOW_HORIZON_SECS * 1_000;
        let outflow: Amount = self
            .storage
            .list_redemptions_settling_before(cutoff)
            .await?
            .iter()
            .filter(|r| {
                !matches!(
                    r.status,
                    RedemptionStatus::Settled | RedemptionStatus::Cancelled
                )
            })
            .map(|r| r.gross_amount)
            .sum();
        Ok(outflow as i128 - available as i128)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::storage::{
            MetaProvider, ProjectionProvider, RedemptionProvider, TaskStoreProvider,
        },
        risk::tests::fixture,
    };
    use meridian_common::{
        chain::AccountAddress,
        fund::{FundProjection, RedemptionChannel, RedemptionRequest, RedemptionStatus},
        risk::{default_threshold_table, RiskIndicators, RiskSnapshot},
    };

    async fn seed_calm_snapshots(storage: &impl Storage, count: usize) {
        let healthy = RiskIndicators {
            l1_ratio: 0.15,
            l1_l2_ratio: 0.45,
            redemption_coverage: 2.0,
            liquidity_gap_7d: -0.02,
            ..Default::default()
        };
        for _ in 0..count {
            let snapshot = RiskSnapshot::evaluate(
                healthy,
                &default_threshold_table(),
                get_current_time_in_millis(),
                0,
            );
            storage.append_risk_snapshot(&snapshot).await.unwrap();
        }
    }

    #[tokio::test]
    async fn incident_commits_mode_and_runs_waterfall() {
        let fixture = fixture().await;
        fixture
            .storage
            .set_fund_projection(&FundProjection {
                total_assets: 10_000_000,
                l1_cash: 500_000,
                l2: 500_000,
                l3: 9_000_000,
                ..Default::default()
            })
            .await
            .unwrap();
        // a pending redemption larger than L1+L2 creates the gap
        fixture
            .storage
            .set_redemption(&RedemptionRequest {
                request_id: 1,
                owner: AccountAddress::repeat_byte(1),
                receiver: AccountAddress::repeat_byte(1),
                shares: 2_000_000,
                gross_amount: 2_000_000,
                locked_nav: 1,
                estimated_fee: 0,
                request_time: 0,
                settlement_time: get_current_time_in_millis() + 1_000,
                channel: RedemptionChannel::Emergency,
                requires_approval: false,
                window_id: None,
                voucher_token_id: None,
                status: RedemptionStatus::Pending,
                settled_amount: None,
                settled_fee: None,
                settled_at: None,
                approval_ticket_id: None,
                updated_at: 0,
            })
            .await
            .unwrap();

        let driver = fixture.engine.emergency_driver();
        let incident = driver
            .start_incident("critical liquidity alert", false)
            .await
            .unwrap();
        assert!(incident.is_some());

        let methods = fixture.gateway.sent_methods();
        assert!(methods.contains(&"setEmergencyMode".to_string()));
        assert!(methods.contains(&"pause".to_string()));
        // gap of 1.0M covered by the waterfall plan
        assert!(methods.contains(&"executeWaterfallLiquidation".to_string()));

        let stored = fixture.storage.get_incident().await.unwrap().unwrap();
        assert!(stored.is_active());
    }

    #[tokio::test]
    async fn second_start_joins_the_active_incident() {
        let fixture = fixture().await;
        let driver = fixture.engine.emergency_driver();
        let first = driver.start_incident("alert", false).await.unwrap().unwrap();
        let sends_after_first = fixture.gateway.sent_calls().len();

        let second = driver.start_incident("alert again", false).await.unwrap();
        assert_eq!(second, Some(first));
        // joining an active incident performs no new commits
        assert_eq!(fixture.gateway.sent_calls().len(), sends_after_first);
    }

    #[tokio::test]
    async fn watcher_closes_after_two_calm_snapshots() {
        let fixture = fixture().await;
        let driver = fixture.engine.emergency_driver();
        let incident = driver
            .start_incident("critical alert", true)
            .await
            .unwrap()
            .unwrap();

        // trigger was on-chain: no mode commit on open
        assert!(fixture.gateway.sent_calls().is_empty());

        seed_calm_snapshots(fixture.storage.as_ref(), 2).await;
        // watcher runs on a 50ms interval in tests
        tokio::time::sleep(Duration::from_millis(400)).await;

        let stored = fixture.storage.get_incident().await.unwrap().unwrap();
        assert_eq!(stored.id, incident);
        assert!(!stored.is_active());

        let methods = fixture.gateway.sent_methods();
        assert!(methods.contains(&"setEmergencyMode".to_string()));
        assert!(methods.contains(&"unpause".to_string()));

        // the post-incident report is queued
        let due = fixture
            .storage
            .due_tasks(get_current_time_in_millis() + 1)
            .await
            .unwrap();
        assert!(due.iter().any(|t| matches!(
            t.payload,
            TaskPayload::GenerateReport {
                kind: ReportKind::PostIncident,
                reference: Some(id)
            } if id == incident
        )));
    }
}
