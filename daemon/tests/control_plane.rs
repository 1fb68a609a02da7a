// End-to-end scenarios over a full node wired against the in-memory chain
// gateway: events flow chain -> ingestor -> dispatcher -> engines, and
// engine decisions flow back out as signed writes.

use std::{sync::Arc, time::Duration};

use primitive_types::H256;
use serde_json::json;
use tempdir::TempDir;

use meridian_common::{
    approval::{default_rules, ApprovalAction, ApproverRole, TicketStatus},
    chain::{ContractAddress, LogRecord, SendConstraints, TxHash},
    config::COIN_VALUE,
    fund::{default_tier_policy, RedemptionStatus},
    risk::default_threshold_table,
};
use meridian_daemon::{
    chain::testing::MockChainGateway,
    core::storage::{
        MetaProvider, ProjectionProvider, RedemptionProvider, SledStorage, TicketProvider,
    },
    node::{Node, NodeSettings},
    notify::LogNotifier,
};

fn vault() -> ContractAddress {
    ContractAddress::repeat_byte(0xee)
}

fn settings() -> NodeSettings {
    NodeSettings {
        contracts: vec![vault()],
        vault_contract: vault(),
        genesis_block: 0,
        confirmations: 15,
        polling_interval: Duration::from_millis(50),
        batch_size: 1_000,
        instance_id: "itest-node".to_string(),
        rules: default_rules(),
        policy: default_tier_policy(),
        thresholds: default_threshold_table(),
        min_rebalance_amount: 10_000 * COIN_VALUE,
        approval_threshold: 50_000 * COIN_VALUE,
        constraints: SendConstraints::unrestricted(),
        overdue_days_back: 30,
        task_workers: 2,
    }
}

struct Harness {
    node: Arc<Node<SledStorage, MockChainGateway>>,
    gateway: Arc<MockChainGateway>,
    _dir: TempDir,
}

// The node is not started yet: tests seed the chain first so the poller's
// initial pass sees every log, then push later phases at fresh heights.
fn build_node() -> Harness {
    let dir = TempDir::new("meridian-itest").unwrap();
    let storage = Arc::new(SledStorage::open(dir.path()).unwrap());
    let gateway = Arc::new(MockChainGateway::new());
    gateway.set_head(100);

    let node = Node::new(
        storage,
        Arc::clone(&gateway),
        Arc::new(LogNotifier),
        settings(),
    );
    Harness {
        node,
        gateway,
        _dir: dir,
    }
}

fn log(block: u64, log_index: u32, name: &str, args: serde_json::Value) -> LogRecord {
    LogRecord {
        tx_hash: TxHash::from_low_u64_be(block * 1_000 + log_index as u64),
        log_index,
        block_number: block,
        block_time: 1_700_000_000 + block,
        contract: vault(),
        topic0: H256::zero(),
        name: name.to_string(),
        args,
    }
}

async fn settle(harness: &Harness) {
    // let the poller, lanes and task workers drain
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if harness.node.ingestor.queue().is_empty() && harness.node.tasks.queue_len() == 0 {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
}

fn owner_json() -> serde_json::Value {
    json!("0x0101010101010101010101010101010101010101")
}

fn deposit_log(block: u64, amount: u128) -> LogRecord {
    log(
        block,
        0,
        "DepositProcessed",
        json!({
            "owner": owner_json(),
            "assets": amount.to_string(),
            "shares": amount.to_string()
        }),
    )
}

#[tokio::test]
async fn standard_redemption_settles_without_approval() {
    let harness = build_node();
    harness.gateway.push_log(deposit_log(10, 1_000_000 * COIN_VALUE));
    harness.gateway.push_log(log(
        20,
        0,
        "RedemptionRequested",
        json!({
            "request_id": 42,
            "owner": owner_json(),
            "receiver": owner_json(),
            "shares": (10_000 * COIN_VALUE).to_string(),
            "gross_amount": (10_500 * COIN_VALUE).to_string(),
            "locked_nav": COIN_VALUE.to_string(),
            "estimated_fee": "0",
            "channel": "STANDARD",
            "requires_approval": false,
            "settlement_time": 1_701_000_000_000u64
        }),
    ));

    harness.node.start().await.unwrap();
    settle(&harness).await;

    let request = harness
        .node
        .storage
        .get_redemption(42)
        .await
        .unwrap()
        .expect("request projected");
    assert_eq!(request.status, RedemptionStatus::Pending);
    assert!(request.approval_ticket_id.is_none());

    // later on-chain: liability recognized, then the settlement lands
    harness.gateway.push_log(log(
        90,
        0,
        "DailyLiabilityAdded",
        json!({
            "amount": (10_500 * COIN_VALUE).to_string(),
            "day": 19_700
        }),
    ));
    harness.gateway.push_log(log(
        91,
        0,
        "RedemptionSettled",
        json!({
            "request_id": 42,
            "net_amount": (10_400 * COIN_VALUE).to_string(),
            "fee": (100 * COIN_VALUE).to_string()
        }),
    ));
    harness.gateway.set_head(120);
    settle(&harness).await;

    let request = harness
        .node
        .storage
        .get_redemption(42)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status, RedemptionStatus::Settled);
    assert_eq!(request.settled_fee, Some(100 * COIN_VALUE));

    let projection = harness.node.storage.get_fund_projection().await.unwrap();
    assert_eq!(projection.invariant_drift(), 0);
    assert_eq!(projection.withdrawable_fees, 100 * COIN_VALUE);

    harness.node.stop().await;
}

#[tokio::test]
async fn large_redemption_approval_commits_on_chain() {
    let harness = build_node();
    harness
        .gateway
        .push_log(deposit_log(10, 10_000_000 * COIN_VALUE));
    harness.gateway.push_log(log(
        20,
        0,
        "RedemptionRequested",
        json!({
            "request_id": 43,
            "owner": owner_json(),
            "receiver": owner_json(),
            "shares": (150_000 * COIN_VALUE).to_string(),
            "gross_amount": (150_000 * COIN_VALUE).to_string(),
            "locked_nav": COIN_VALUE.to_string(),
            "estimated_fee": "0",
            "channel": "STANDARD",
            "requires_approval": true,
            "settlement_time": 1_701_000_000_000u64
        }),
    ));

    harness.node.start().await.unwrap();
    settle(&harness).await;

    // the flagged request produced a VIP ticket
    let request = harness
        .node
        .storage
        .get_redemption(43)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status, RedemptionStatus::PendingApproval);
    let ticket_id = request.approval_ticket_id.expect("ticket linked");
    let ticket = harness
        .node
        .storage
        .get_ticket(ticket_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ticket.status, TicketStatus::Pending);
    assert_eq!(ticket.required_approvals, 1);

    // a single VIP approval resolves the ticket and commits on-chain
    harness
        .node
        .approval
        .act(
            ticket_id,
            "vip-alice",
            ApproverRole::VipApprover,
            ApprovalAction::Approve,
            None,
            None,
        )
        .await
        .unwrap();
    settle(&harness).await;

    assert!(harness
        .gateway
        .sent_methods()
        .contains(&"approveRedemption".to_string()));

    // the chain acknowledges with its own event
    harness.gateway.push_log(log(
        90,
        0,
        "RedemptionApproved",
        json!({ "request_id": 43 }),
    ));
    harness.gateway.set_head(120);
    settle(&harness).await;

    let request = harness
        .node
        .storage
        .get_redemption(43)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.status, RedemptionStatus::Approved);

    harness.node.stop().await;
}

#[tokio::test]
async fn critical_alert_opens_emergency_incident() {
    let harness = build_node();
    harness
        .gateway
        .push_log(deposit_log(10, 1_000_000 * COIN_VALUE));
    harness.gateway.push_log(log(
        20,
        0,
        "CriticalLiquidityAlert",
        json!({
            "ratio_bps": 900,
            "threshold_bps": 1000,
            "available": (90_000 * COIN_VALUE).to_string()
        }),
    ));

    harness.node.start().await.unwrap();
    settle(&harness).await;

    let incident = harness
        .node
        .storage
        .get_incident()
        .await
        .unwrap()
        .expect("incident opened");
    assert!(incident.is_active());

    let methods = harness.gateway.sent_methods();
    assert!(methods.contains(&"setEmergencyMode".to_string()));
    assert!(methods.contains(&"pause".to_string()));

    harness.node.stop().await;
}

#[tokio::test]
async fn replayed_events_do_not_change_the_projection() {
    let harness = build_node();
    let deposit = deposit_log(10, 500_000 * COIN_VALUE);
    harness.gateway.push_log(deposit.clone());

    harness.node.start().await.unwrap();
    settle(&harness).await;

    let before = harness.node.storage.get_fund_projection().await.unwrap();
    assert_eq!(before.total_assets, 500_000 * COIN_VALUE);

    // the same log observed again via the push path
    harness.gateway.publish(deposit).await;
    settle(&harness).await;

    let after = harness.node.storage.get_fund_projection().await.unwrap();
    assert_eq!(after.total_assets, before.total_assets);
    assert_eq!(after.l1_cash, before.l1_cash);

    harness.node.stop().await;
}
