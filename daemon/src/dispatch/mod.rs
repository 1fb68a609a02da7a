mod handlers;

pub use handlers::apply_event;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use log::{debug, error, warn};
use metrics::counter;
use thiserror::Error;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};

use meridian_common::{
    chain::{ContractAddress, RequestId},
    fund::{Amount, BasisPoints, SignedAmount},
    rebalance::RebalanceTrigger,
    risk::RiskLevel,
};

use crate::{
    core::{error::StorageError, storage::Storage},
    ingest::{EventEnvelope, EventQueue},
};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

// Side effects handlers cannot perform themselves: tickets belong to the
// approval engine, plans to the rebalance engine, incidents to the risk
// engine. The node routes these after the projection commit.
#[derive(Debug, Clone)]
pub enum SideEffect {
    RequestApproval {
        request_id: RequestId,
    },
    TicketReferenceResolved {
        request_id: RequestId,
        approved: bool,
    },
    WakeRiskEvaluator,
    TriggerRebalance {
        trigger: RebalanceTrigger,
    },
    EmergencyModeChanged {
        enabled: bool,
    },
    LiquidityAlert {
        level: RiskLevel,
        ratio_bps: BasisPoints,
        available: Amount,
    },
    RaiseRiskEvent {
        level: RiskLevel,
        source: String,
        message: String,
    },
    InvariantViolated {
        drift: SignedAmount,
    },
}

// Routes events from the priority queue into per-contract sequential lanes.
// The lane preserves (block, log_index) order per contract; priority only
// decides which contract's backlog is served first.
pub struct EventDispatcher<S: Storage> {
    storage: Arc<S>,
    queue: Arc<EventQueue>,
    effects: mpsc::UnboundedSender<SideEffect>,
    lanes: Mutex<HashMap<ContractAddress, mpsc::UnboundedSender<EventEnvelope>>>,
    // Tripped on a projection-invariant violation; manual intervention only
    halted: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Storage> EventDispatcher<S> {
    pub fn new(
        storage: Arc<S>,
        queue: Arc<EventQueue>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SideEffect>) {
        let (effects, receiver) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                storage,
                queue,
                effects,
                lanes: Mutex::new(HashMap::new()),
                halted: Arc::new(AtomicBool::new(false)),
                tasks: Mutex::new(Vec::new()),
            }),
            receiver,
        )
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    // Fatal conditions stop handling until manually cleared
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn clear_halt(&self) {
        self.halted.store(false, Ordering::SeqCst);
    }

    pub async fn start(self: &Arc<Self>) {
        let zelf = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let envelope = zelf.queue.pop().await;
                if zelf.is_halted() {
                    warn!(
                        "dispatcher halted, requeueing {}",
                        envelope.record.event_id()
                    );
                    zelf.queue.push(envelope);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
                zelf.route_to_lane(envelope).await;
            }
        });
        self.tasks.lock().await.push(handle);
    }

    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        for handle in tasks.drain(..) {
            handle.abort();
        }
    }

    async fn route_to_lane(self: &Arc<Self>, envelope: EventEnvelope) {
        let contract = envelope.record.contract;
        let mut lanes = self.lanes.lock().await;
        let sender = lanes.entry(contract).or_insert_with(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            let zelf = Arc::clone(self);
            // lane workers end when their sender is dropped with the dispatcher
            tokio::spawn(async move { zelf.lane_worker(contract, receiver).await });
            sender
        });
        if sender.send(envelope).is_err() {
            error!("lane for {:x} is gone", contract);
            lanes.remove(&contract);
        }
    }

    async fn lane_worker(
        self: Arc<Self>,
        contract: ContractAddress,
        mut receiver: mpsc::UnboundedReceiver<EventEnvelope>,
    ) {
        debug!("lane for contract {:x} started", contract);
        while let Some(envelope) = receiver.recv().await {
            if self.is_halted() {
                warn!("dropping handling while halted: {}", envelope.record.event_id());
                continue;
            }
            self.handle_with_retry(&envelope).await;
        }
        debug!("lane for contract {:x} stopped", contract);
    }

    // Storage hiccups must not lose a confirmed event; retry a few times
    // before surfacing an operational error
    async fn handle_with_retry(&self, envelope: &EventEnvelope) {
        let mut attempt = 0u32;
        loop {
            match apply_event(self.storage.as_ref(), &envelope.record, &envelope.event).await {
                Ok(effects) => {
                    counter!("meridian_events_dispatched").increment(1);
                    for effect in effects {
                        if let SideEffect::InvariantViolated { drift } = &effect {
                            error!(
                                "projection invariant violated (drift {}), halting dispatcher",
                                drift
                            );
                            self.halt();
                        }
                        if self.effects.send(effect).is_err() {
                            warn!("effect router is gone");
                        }
                    }
                    return;
                }
                Err(e) if attempt < 3 => {
                    attempt += 1;
                    warn!(
                        "handler for {} failed (attempt {}): {}",
                        envelope.record.event_id(),
                        attempt,
                        e
                    );
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                Err(e) => {
                    counter!("meridian_events_dropped").increment(1);
                    error!(
                        "handler for {} failed permanently: {}",
                        envelope.record.event_id(),
                        e
                    );
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::{ProjectionProvider, RedemptionProvider, SledStorage};
    use meridian_common::{
        chain::{ChainEvent, LogRecord, TxHash},
        fund::RedemptionStatus,
    };
    use primitive_types::H256;
    use serde_json::json;
    use tempdir::TempDir;

    fn record(block: u64, log_index: u32, name: &str, args: serde_json::Value) -> LogRecord {
        LogRecord {
            tx_hash: TxHash::from_low_u64_be(block * 100 + log_index as u64),
            log_index,
            block_number: block,
            block_time: 1_700_000_000,
            contract: ContractAddress::repeat_byte(3),
            topic0: H256::zero(),
            name: name.to_string(),
            args,
        }
    }

    async fn storage() -> (Arc<SledStorage>, TempDir) {
        let dir = TempDir::new("meridian-dispatch").unwrap();
        (Arc::new(SledStorage::open(dir.path()).unwrap()), dir)
    }

    async fn apply(storage: &SledStorage, record: &LogRecord) -> Vec<SideEffect> {
        let event = ChainEvent::decode(record).unwrap();
        apply_event(storage, record, &event).await.unwrap()
    }

    #[tokio::test]
    async fn deposit_updates_projection_and_replays_are_noops() {
        let (storage, _dir) = storage().await;
        let rec = record(
            10,
            0,
            "DepositProcessed",
            json!({
                "owner": "0x0101010101010101010101010101010101010101",
                "assets": "5000",
                "shares": "5000"
            }),
        );

        apply(&storage, &rec).await;
        let projection = storage.get_fund_projection().await.unwrap();
        assert_eq!(projection.total_assets, 5_000);
        assert_eq!(projection.l1_cash, 5_000);
        assert_eq!(projection.invariant_drift(), 0);

        // replaying the exact same (tx_hash, log_index) changes nothing
        apply(&storage, &rec).await;
        let replayed = storage.get_fund_projection().await.unwrap();
        assert_eq!(replayed.total_assets, 5_000);
        assert_eq!(replayed.l1_cash, 5_000);
    }

    #[tokio::test]
    async fn redemption_lifecycle_standard_channel() {
        let (storage, _dir) = storage().await;

        apply(
            &storage,
            &record(
                5,
                0,
                "DepositProcessed",
                json!({
                    "owner": "0x0101010101010101010101010101010101010101",
                    "assets": "100000",
                    "shares": "100000"
                }),
            ),
        )
        .await;

        let effects = apply(
            &storage,
            &record(
                10,
                0,
                "RedemptionRequested",
                json!({
                    "request_id": 42,
                    "owner": "0x0101010101010101010101010101010101010101",
                    "receiver": "0x0101010101010101010101010101010101010101",
                    "shares": "10000",
                    "gross_amount": "10500",
                    "locked_nav": "1",
                    "estimated_fee": "0",
                    "channel": "STANDARD",
                    "requires_approval": false,
                    "settlement_time": 1_701_000_000_000u64
                }),
            ),
        )
        .await;
        // no approval needed, but 10.5% of assets is a large flow
        assert!(effects
            .iter()
            .any(|e| matches!(e, SideEffect::TriggerRebalance { .. })));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, SideEffect::RequestApproval { .. })));

        let request = storage.get_redemption(42).await.unwrap().unwrap();
        assert_eq!(request.status, RedemptionStatus::Pending);

        // liability recognized on-chain, then settlement pays out
        apply(
            &storage,
            &record(11, 0, "DailyLiabilityAdded", json!({"amount": "10500", "day": 19700})),
        )
        .await;
        apply(
            &storage,
            &record(
                12,
                0,
                "RedemptionSettled",
                json!({"request_id": 42, "net_amount": "10400", "fee": "100"}),
            ),
        )
        .await;

        let request = storage.get_redemption(42).await.unwrap().unwrap();
        assert_eq!(request.status, RedemptionStatus::Settled);
        assert_eq!(request.settled_fee, Some(100));

        let projection = storage.get_fund_projection().await.unwrap();
        assert_eq!(projection.total_redemption_liability, 0);
        assert_eq!(projection.withdrawable_fees, 100);
        assert_eq!(projection.l1_cash, 100_000 - 10_400);
        assert_eq!(projection.invariant_drift(), 0);
    }

    #[tokio::test]
    async fn approval_flagged_redemption_requests_a_ticket() {
        let (storage, _dir) = storage().await;
        let effects = apply(
            &storage,
            &record(
                20,
                0,
                "RedemptionRequested",
                json!({
                    "request_id": 43,
                    "owner": "0x0202020202020202020202020202020202020202",
                    "receiver": "0x0202020202020202020202020202020202020202",
                    "shares": "150000",
                    "gross_amount": "150000",
                    "locked_nav": "1",
                    "estimated_fee": "0",
                    "channel": "STANDARD",
                    "requires_approval": true,
                    "settlement_time": 1_701_000_000_000u64
                }),
            ),
        )
        .await;

        assert!(effects
            .iter()
            .any(|e| matches!(e, SideEffect::RequestApproval { request_id: 43 })));
        let request = storage.get_redemption(43).await.unwrap().unwrap();
        assert_eq!(request.status, RedemptionStatus::PendingApproval);
    }

    #[tokio::test]
    async fn nav_update_wakes_risk_and_absorbs_revaluation() {
        let (storage, _dir) = storage().await;
        apply(
            &storage,
            &record(
                5,
                0,
                "DepositProcessed",
                json!({
                    "owner": "0x0101010101010101010101010101010101010101",
                    "assets": "1000",
                    "shares": "1000"
                }),
            ),
        )
        .await;

        let effects = apply(
            &storage,
            &record(
                6,
                0,
                "NavUpdated",
                json!({"share_price": "1050000000000000000", "total_assets": "1050"}),
            ),
        )
        .await;
        assert!(effects
            .iter()
            .any(|e| matches!(e, SideEffect::WakeRiskEvaluator)));

        let projection = storage.get_fund_projection().await.unwrap();
        assert_eq!(projection.total_assets, 1_050);
        // the 50 unit mark-up landed in L3
        assert_eq!(projection.l3, 50);
        assert_eq!(projection.invariant_drift(), 0);
    }

    #[tokio::test]
    async fn emergency_mode_event_produces_effect() {
        let (storage, _dir) = storage().await;
        let effects = apply(
            &storage,
            &record(7, 0, "EmergencyModeChanged", json!({"enabled": true})),
        )
        .await;
        assert!(effects
            .iter()
            .any(|e| matches!(e, SideEffect::EmergencyModeChanged { enabled: true })));
        assert!(storage.get_fund_projection().await.unwrap().emergency_mode);
    }

    #[tokio::test]
    async fn waterfall_respects_max_tier() {
        let (storage, _dir) = storage().await;
        // seed tiers via purchases
        apply(
            &storage,
            &record(
                5,
                0,
                "DepositProcessed",
                json!({
                    "owner": "0x0101010101010101010101010101010101010101",
                    "assets": "1000",
                    "shares": "1000"
                }),
            ),
        )
        .await;
        apply(
            &storage,
            &record(
                6,
                0,
                "AssetPurchased",
                json!({
                    "asset": "0x0303030303030303030303030303030303030303",
                    "tier": "L2",
                    "usdt_amount": "400",
                    "amount_received": "400"
                }),
            ),
        )
        .await;

        // raise 300 with liquidation capped at L2
        apply(
            &storage,
            &record(
                7,
                0,
                "WaterfallLiquidation",
                json!({"amount_needed": "300", "amount_raised": "300", "max_tier": "L2"}),
            ),
        )
        .await;

        let projection = storage.get_fund_projection().await.unwrap();
        assert_eq!(projection.l2, 100);
        assert_eq!(projection.l3, 0);
        assert_eq!(projection.l1_cash, 600 + 300);
        assert_eq!(projection.invariant_drift(), 0);
    }
}
