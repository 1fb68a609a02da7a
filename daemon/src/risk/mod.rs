mod emergency;
mod forecast;

pub use emergency::*;
pub use forecast::*;

use std::sync::Arc;

use log::{debug, info, warn};
use metrics::{counter, gauge};
use thiserror::Error;

use meridian_common::{
    config::{PENDING_OUTFLOW_HORIZON_SECS, RISK_ALERT_COOLDOWN_SECS, SECONDS_PER_DAY},
    fund::{Amount, BasisPoints, FundProjection, RedemptionStatus, Tier, TierPolicy},
    rebalance::RebalanceTrigger,
    risk::{
        RiskEvent, RiskIndicators, RiskLevel, RiskSnapshot, ThresholdTable,
    },
    time::{get_current_time_in_millis, get_current_time_in_seconds},
};

use crate::{
    chain::{ChainGateway, GatewayError},
    core::{error::StorageError, storage::Storage},
    notify::{Notifier, NotifyChannel, NotifyLevel},
    rebalance::{RebalanceEngine, RebalanceError},
};

pub const STANDARD_REDEMPTIONS_PAUSED_FLAG: &str = "standard_redemptions_paused";

#[derive(Debug, Error)]
pub enum RiskError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Rebalance(#[from] RebalanceError),
}

// Periodic risk evaluation and the leveled response. The emergency driver
// (one per incident, lease-guarded) lives in the sibling module.
pub struct RiskEngine<S: Storage, G: ChainGateway> {
    storage: Arc<S>,
    rebalance: Arc<RebalanceEngine<S, G>>,
    emergency: Arc<EmergencyDriver<S, G>>,
    notifier: Arc<dyn Notifier>,
    thresholds: ThresholdTable,
    policy: TierPolicy,
}

impl<S: Storage, G: ChainGateway> RiskEngine<S, G> {
    pub fn new(
        storage: Arc<S>,
        rebalance: Arc<RebalanceEngine<S, G>>,
        emergency: Arc<EmergencyDriver<S, G>>,
        notifier: Arc<dyn Notifier>,
        thresholds: ThresholdTable,
        policy: TierPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            rebalance,
            emergency,
            notifier,
            thresholds,
            policy,
        })
    }

    pub fn emergency_driver(&self) -> &Arc<EmergencyDriver<S, G>> {
        &self.emergency
    }

    // One evaluation tick: compute all indicators, persist the snapshot, run
    // the leveled response
    pub async fn evaluate(&self) -> Result<RiskSnapshot, RiskError> {
        let projection = self.storage.get_fund_projection().await?;
        let indicators = self.compute_indicators(&projection).await?;
        let now = get_current_time_in_millis();
        let snapshot =
            RiskSnapshot::evaluate(indicators, &self.thresholds, now, projection.share_price);

        self.storage.append_risk_snapshot(&snapshot).await?;
        gauge!("meridian_risk_score").set(snapshot.score as f64);
        debug!(
            "risk tick: level {} score {}",
            snapshot.risk_level, snapshot.score
        );

        self.respond(&snapshot).await?;
        Ok(snapshot)
    }

    async fn respond(&self, snapshot: &RiskSnapshot) -> Result<(), RiskError> {
        match snapshot.risk_level {
            RiskLevel::Normal => {
                // recovery: resume standard redemptions once calm again
                if self
                    .storage
                    .get_flag(STANDARD_REDEMPTIONS_PAUSED_FLAG)
                    .await?
                {
                    info!("risk normalized, resuming standard redemption acceptance");
                    self.storage
                        .set_flag(STANDARD_REDEMPTIONS_PAUSED_FLAG, false)
                        .await?;
                }
            }
            RiskLevel::Elevated => {
                self.notify_with_cooldown(
                    "risk_elevated",
                    NotifyLevel::Warning,
                    NotifyChannel::Ops,
                    "risk level elevated",
                    &format!("risk score {}", snapshot.score),
                )
                .await?;

                let l1_low = self
                    .policy
                    .get(&Tier::L1)
                    .map(|b| b.low_bps)
                    .unwrap_or(1_000);
                if (snapshot.indicators.l1_ratio * 10_000.0) < l1_low as f64 {
                    debug!("L1 below floor, invoking rebalance with liquidity trigger");
                    self.rebalance.evaluate(RebalanceTrigger::Liquidity).await?;
                }
            }
            RiskLevel::High => {
                // pause new standard redemptions at the off-chain gate and
                // prepare the waterfall path
                if !self
                    .storage
                    .get_flag(STANDARD_REDEMPTIONS_PAUSED_FLAG)
                    .await?
                {
                    warn!("risk HIGH: pausing standard redemption acceptance off-chain");
                    self.storage
                        .set_flag(STANDARD_REDEMPTIONS_PAUSED_FLAG, true)
                        .await?;
                }
                self.rebalance.evaluate(RebalanceTrigger::Liquidity).await?;
                self.notify_with_cooldown(
                    "risk_high",
                    NotifyLevel::Warning,
                    NotifyChannel::FundManager,
                    "risk level HIGH",
                    &format!(
                        "score {}, standard redemption acceptance paused",
                        snapshot.score
                    ),
                )
                .await?;
            }
            RiskLevel::Critical => {
                counter!("meridian_risk_critical_ticks").increment(1);
                self.emergency
                    .start_incident("risk level CRITICAL", false)
                    .await?;
            }
        }
        Ok(())
    }

    // Duplicate liquidity alerts from the chain are suppressed within the
    // cooldown window
    pub async fn handle_liquidity_alert(
        &self,
        level: RiskLevel,
        ratio_bps: BasisPoints,
        available: Amount,
    ) -> Result<(), RiskError> {
        let now = get_current_time_in_seconds();
        let source = format!("liquidity_alert_{}", level);
        if let Some(until) = self.storage.get_alert_cooldown(&source).await? {
            if until > now {
                debug!("liquidity alert suppressed by cooldown");
                return Ok(());
            }
        }
        self.storage
            .set_alert_cooldown(&source, now + RISK_ALERT_COOLDOWN_SECS)
            .await?;

        let id = self.storage.next_risk_event_id().await?;
        self.storage
            .append_risk_event(&RiskEvent {
                id,
                level,
                source: "chain_alert".to_string(),
                message: format!(
                    "on-chain liquidity alert: ratio {}bp, available {}",
                    ratio_bps, available
                ),
                created_at: get_current_time_in_millis(),
            })
            .await?;
        self.notifier
            .notify(
                if level >= RiskLevel::Critical {
                    NotifyLevel::Critical
                } else {
                    NotifyLevel::Warning
                },
                NotifyChannel::Ops,
                "on-chain liquidity alert",
                &format!("ratio {}bp, available {}", ratio_bps, available),
            )
            .await;

        if level >= RiskLevel::Critical {
            self.emergency
                .start_incident("critical on-chain liquidity alert", false)
                .await?;
        }
        Ok(())
    }

    pub async fn record_risk_event(
        &self,
        level: RiskLevel,
        source: &str,
        message: &str,
    ) -> Result<(), RiskError> {
        let id = self.storage.next_risk_event_id().await?;
        self.storage
            .append_risk_event(&RiskEvent {
                id,
                level,
                source: source.to_string(),
                message: message.to_string(),
                created_at: get_current_time_in_millis(),
            })
            .await?;
        Ok(())
    }

    async fn notify_with_cooldown(
        &self,
        source: &str,
        level: NotifyLevel,
        channel: NotifyChannel,
        title: &str,
        body: &str,
    ) -> Result<(), RiskError> {
        let now = get_current_time_in_seconds();
        if let Some(until) = self.storage.get_alert_cooldown(source).await? {
            if until > now {
                return Ok(());
            }
        }
        self.storage
            .set_alert_cooldown(source, now + RISK_ALERT_COOLDOWN_SECS)
            .await?;
        self.notifier.notify(level, channel, title, body).await;
        Ok(())
    }

    // All indicators derive from the projection and pending-redemption tables
    async fn compute_indicators(
        &self,
        projection: &FundProjection,
    ) -> Result<RiskIndicators, RiskError> {
        let total = projection.total_assets;
        if total == 0 {
            return Ok(RiskIndicators {
                redemption_coverage: 10.0,
                liquidity_gap_7d: -1.0,
                ..Default::default()
            });
        }
        let totalf = total as f64;
        let l1 = projection.tier_value(Tier::L1) as f64;
        let l2 = projection.l2 as f64;
        let liability = projection.total_redemption_liability as f64;

        let now = get_current_time_in_millis();
        let cutoff = now + PENDING_OUTFLOW_HORIZON_SECS * 1_000;
        let settling = self.storage.list_redemptions_settling_before(cutoff).await?;
        let outflow_7d: Amount = settling
            .iter()
            .filter(|r| {
                !matches!(
                    r.status,
                    RedemptionStatus::Settled | RedemptionStatus::Cancelled
                )
            })
            .map(|r| r.gross_amount)
            .sum();

        let pending_approval: Amount = self
            .storage
            .list_redemptions_by_status(RedemptionStatus::PendingApproval)
            .await?
            .iter()
            .map(|r| r.gross_amount)
            .sum();

        // flows over the trailing week for velocity and the daily rate
        let today = get_current_time_in_seconds() / SECONDS_PER_DAY;
        let flows = self
            .storage
            .daily_flows_range(today.saturating_sub(6), today)
            .await?;
        let redemptions_7d: Amount = flows.iter().map(|f| f.redemptions).sum();
        let redemptions_today: Amount = flows
            .iter()
            .find(|f| f.day == today)
            .map(|f| f.redemptions)
            .unwrap_or(0);

        // price series out of the snapshot store
        let day_ago = now.saturating_sub(24 * 3_600 * 1_000);
        let recent = self.storage.risk_snapshots_range(day_ago, now).await?;
        let nav_volatility_24h = volatility(&recent);
        let asset_price_deviation = last_price_jump(&recent, projection.share_price);

        let oracle_staleness = match self.storage.get_last_nav_update().await? {
            Some(at) => now.saturating_sub(at) as f64 / 1_000.0,
            None => 0.0,
        };

        // concentration over tracked holdings
        let holdings = self.storage.list_holdings().await?;
        let balances: Vec<f64> = holdings.iter().map(|h| h.balance as f64).collect();
        let holdings_total: f64 = balances.iter().sum();
        let (single_asset, top3) = if holdings_total > 0.0 {
            let mut sorted = balances.clone();
            sorted.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
            (
                sorted[0] / holdings_total,
                sorted.iter().take(3).sum::<f64>() / holdings_total,
            )
        } else {
            (0.0, 0.0)
        };
        // largest single external manager position against the whole fund
        let counterparty = holdings
            .iter()
            .filter(|h| h.tier != Tier::L1)
            .map(|h| h.balance as f64 / totalf)
            .fold(0.0f64, f64::max);

        Ok(RiskIndicators {
            l1_ratio: l1 / totalf,
            l1_l2_ratio: (l1 + l2) / totalf,
            redemption_coverage: if liability > 0.0 {
                (l1 + l2) / liability
            } else {
                10.0
            },
            liquidity_gap_7d: (outflow_7d as f64 - (l1 + l2)) / totalf,
            nav_volatility_24h,
            asset_price_deviation,
            oracle_staleness,
            single_asset,
            top3,
            counterparty,
            daily_redemption_rate: redemptions_today as f64 / totalf,
            pending_approval_ratio: if liability > 0.0 {
                (pending_approval as f64 / liability).min(1.0)
            } else {
                0.0
            },
            redemption_velocity_7d: redemptions_7d as f64 / totalf,
        })
    }
}

fn volatility(snapshots: &[RiskSnapshot]) -> f64 {
    let prices: Vec<f64> = snapshots
        .iter()
        .filter(|s| s.share_price > 0)
        .map(|s| s.share_price as f64)
        .collect();
    if prices.len() < 2 {
        return 0.0;
    }
    let mean = prices.iter().sum::<f64>() / prices.len() as f64;
    if mean == 0.0 {
        return 0.0;
    }
    let variance =
        prices.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (prices.len() - 1) as f64;
    variance.sqrt() / mean
}

fn last_price_jump(snapshots: &[RiskSnapshot], current_price: u128) -> f64 {
    let previous = snapshots
        .iter()
        .rev()
        .find(|s| s.share_price > 0)
        .map(|s| s.share_price as f64);
    match previous {
        Some(prev) if prev > 0.0 && current_price > 0 => {
            (current_price as f64 - prev).abs() / prev
        }
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        approval::ApprovalEngine,
        chain::testing::MockChainGateway,
        core::storage::{MetaProvider, ProjectionProvider, RiskProvider, SledStorage},
        notify::LogNotifier,
        tasks::TaskRuntime,
    };
    use meridian_common::{
        approval::default_rules,
        chain::{ContractAddress, SendConstraints},
        fund::default_tier_policy,
        risk::default_threshold_table,
    };
    use tempdir::TempDir;

    pub(crate) struct Fixture {
        pub storage: Arc<SledStorage>,
        pub gateway: Arc<MockChainGateway>,
        pub engine: Arc<RiskEngine<SledStorage, MockChainGateway>>,
        pub _dir: TempDir,
    }

    pub(crate) async fn fixture() -> Fixture {
        fixture_with_watcher_interval(std::time::Duration::from_millis(50)).await
    }

    pub(crate) async fn fixture_with_watcher_interval(interval: std::time::Duration) -> Fixture {
        let dir = TempDir::new("meridian-risk").unwrap();
        let storage = Arc::new(SledStorage::open(dir.path()).unwrap());
        let gateway = Arc::new(MockChainGateway::new());
        let tasks = TaskRuntime::new(Arc::clone(&storage), 1);
        let (approval, _plans) = ApprovalEngine::new(
            Arc::clone(&storage),
            Arc::clone(&gateway),
            Arc::clone(&tasks),
            Arc::new(LogNotifier),
            default_rules(),
            ContractAddress::repeat_byte(0xee),
            SendConstraints::unrestricted(),
        );
        let rebalance = RebalanceEngine::new(
            Arc::clone(&storage),
            Arc::clone(&gateway),
            approval,
            Arc::new(LogNotifier),
            default_tier_policy(),
            1_000,
            u128::MAX,
            ContractAddress::repeat_byte(0xee),
            SendConstraints::unrestricted(),
        );
        let emergency = EmergencyDriver::with_watcher_interval(
            Arc::clone(&storage),
            Arc::clone(&gateway),
            Arc::clone(&rebalance),
            Arc::clone(&tasks),
            Arc::new(LogNotifier),
            ContractAddress::repeat_byte(0xee),
            SendConstraints::unrestricted(),
            "test-node".to_string(),
            interval,
        );
        let engine = RiskEngine::new(
            Arc::clone(&storage),
            rebalance,
            emergency,
            Arc::new(LogNotifier),
            default_threshold_table(),
            default_tier_policy(),
        );
        Fixture {
            storage,
            gateway,
            engine,
            _dir: dir,
        }
    }

    async fn seed_projection(fixture: &Fixture, l1: u128, l2: u128, l3: u128, liability: u128) {
        let total = l1 + l2 + l3;
        fixture
            .storage
            .set_fund_projection(&FundProjection {
                total_assets: total - liability,
                l1_cash: l1,
                l2,
                l3,
                total_redemption_liability: liability,
                share_price: 1_000_000_000_000_000_000,
                ..Default::default()
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn healthy_fund_evaluates_normal() {
        let fixture = fixture().await;
        seed_projection(&fixture, 1_500_000, 3_000_000, 5_500_000, 100_000).await;

        let snapshot = fixture.engine.evaluate().await.unwrap();
        assert_eq!(snapshot.risk_level, RiskLevel::Normal);
        assert!(snapshot.indicators.l1_ratio > 0.14);

        // snapshot persisted to the time series
        let latest = fixture.storage.latest_risk_snapshots(1).await.unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].risk_level, RiskLevel::Normal);
    }

    #[tokio::test]
    async fn level_is_max_indicator_severity() {
        let fixture = fixture().await;
        // L1 ratio ~3%: critical on that single indicator
        seed_projection(&fixture, 300_000, 4_200_000, 5_500_000, 100_000).await;
        let snapshot = fixture.engine.evaluate().await.unwrap();
        assert_eq!(snapshot.risk_level, RiskLevel::Critical);
    }

    #[tokio::test]
    async fn high_level_pauses_standard_redemptions() {
        let fixture = fixture().await;
        // L1 at ~6%: HIGH on the l1_ratio indicator
        seed_projection(&fixture, 600_000, 3_900_000, 5_500_000, 100_000).await;
        let snapshot = fixture.engine.evaluate().await.unwrap();
        assert_eq!(snapshot.risk_level, RiskLevel::High);
        assert!(fixture
            .storage
            .get_flag(STANDARD_REDEMPTIONS_PAUSED_FLAG)
            .await
            .unwrap());

        // back to healthy: the gate reopens
        seed_projection(&fixture, 1_500_000, 3_000_000, 5_500_000, 100_000).await;
        let snapshot = fixture.engine.evaluate().await.unwrap();
        assert_eq!(snapshot.risk_level, RiskLevel::Normal);
        assert!(!fixture
            .storage
            .get_flag(STANDARD_REDEMPTIONS_PAUSED_FLAG)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn duplicate_alerts_suppressed_within_cooldown() {
        let fixture = fixture().await;
        seed_projection(&fixture, 1_500_000, 3_000_000, 5_500_000, 100_000).await;

        fixture
            .engine
            .handle_liquidity_alert(RiskLevel::High, 900, 1_000)
            .await
            .unwrap();
        fixture
            .engine
            .handle_liquidity_alert(RiskLevel::High, 880, 900)
            .await
            .unwrap();

        // only the first alert produced a risk event
        let cooldown = fixture
            .storage
            .get_alert_cooldown("liquidity_alert_HIGH")
            .await
            .unwrap();
        assert!(cooldown.is_some());
    }
}
