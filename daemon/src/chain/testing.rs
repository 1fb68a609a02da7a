// In-memory gateway used by engine unit tests and the integration suite.
// Scriptable: tests seed logs, head position, simulation outcomes and send
// failures, then observe every write the engines perform.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use primitive_types::H256;
use serde_json::Value;
use tokio::sync::mpsc;

use meridian_common::chain::{
    BlockNumber, ChainCall, ContractAddress, LogRecord, SendConstraints, SignerRole,
    SimulationOutcome, TxHash, TxReceipt,
};

use super::{ChainGateway, GatewayError};

#[derive(Default)]
pub struct MockChainGateway {
    head: AtomicU64,
    tx_counter: AtomicU64,
    logs: Mutex<Vec<LogRecord>>,
    block_hashes: Mutex<HashMap<BlockNumber, H256>>,
    call_results: Mutex<HashMap<String, Value>>,
    simulations: Mutex<HashMap<String, SimulationOutcome>>,
    send_failures: Mutex<VecDeque<GatewayError>>,
    sent: Mutex<Vec<(ChainCall, SignerRole)>>,
    subscribers: Mutex<Vec<mpsc::Sender<LogRecord>>>,
}

impl MockChainGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_head(&self, head: BlockNumber) {
        self.head.store(head, Ordering::SeqCst);
    }

    pub fn set_block_hash(&self, number: BlockNumber, hash: H256) {
        self.block_hashes.lock().unwrap().insert(number, hash);
    }

    pub fn push_log(&self, record: LogRecord) {
        self.logs.lock().unwrap().push(record);
    }

    // Publish to live subscriptions, mimicking a WS push
    pub async fn publish(&self, record: LogRecord) {
        let senders = self.subscribers.lock().unwrap().clone();
        for sender in senders {
            let _ = sender.send(record.clone()).await;
        }
    }

    pub fn set_call_result(&self, method: &str, result: Value) {
        self.call_results
            .lock()
            .unwrap()
            .insert(method.to_string(), result);
    }

    pub fn set_simulation(&self, method: &str, outcome: SimulationOutcome) {
        self.simulations
            .lock()
            .unwrap()
            .insert(method.to_string(), outcome);
    }

    // The next send consumes this failure instead of succeeding
    pub fn fail_next_send(&self, error: GatewayError) {
        self.send_failures.lock().unwrap().push_back(error);
    }

    pub fn sent_calls(&self) -> Vec<(ChainCall, SignerRole)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(call, _)| call.method.clone())
            .collect()
    }
}

#[async_trait]
impl ChainGateway for MockChainGateway {
    async fn get_head(&self) -> Result<BlockNumber, GatewayError> {
        Ok(self.head.load(Ordering::SeqCst))
    }

    async fn get_block_hash(&self, number: BlockNumber) -> Result<Option<H256>, GatewayError> {
        Ok(self.block_hashes.lock().unwrap().get(&number).copied())
    }

    async fn get_logs(
        &self,
        contracts: &[ContractAddress],
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<LogRecord>, GatewayError> {
        let logs = self.logs.lock().unwrap();
        Ok(logs
            .iter()
            .filter(|log| {
                log.block_number >= from
                    && log.block_number <= to
                    && contracts.contains(&log.contract)
            })
            .cloned()
            .collect())
    }

    async fn subscribe_logs(
        &self,
        _contracts: &[ContractAddress],
        _from: BlockNumber,
    ) -> Result<mpsc::Receiver<LogRecord>, GatewayError> {
        let (sender, receiver) = mpsc::channel(64);
        self.subscribers.lock().unwrap().push(sender);
        Ok(receiver)
    }

    async fn call(
        &self,
        call: &ChainCall,
        _block: Option<BlockNumber>,
    ) -> Result<Value, GatewayError> {
        Ok(self
            .call_results
            .lock()
            .unwrap()
            .get(&call.method)
            .cloned()
            .unwrap_or(Value::Null))
    }

    async fn simulate(&self, call: &ChainCall) -> Result<SimulationOutcome, GatewayError> {
        Ok(self
            .simulations
            .lock()
            .unwrap()
            .get(&call.method)
            .cloned()
            .unwrap_or(SimulationOutcome::Success {
                output: Value::Null,
                predicted_slippage_bps: 0,
                estimated_gas: 21_000,
            }))
    }

    async fn send(
        &self,
        call: &ChainCall,
        signer: SignerRole,
        _constraints: &SendConstraints,
    ) -> Result<TxReceipt, GatewayError> {
        if let Some(error) = self.send_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        self.sent.lock().unwrap().push((call.clone(), signer));
        let nonce = self.tx_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TxReceipt {
            tx_hash: TxHash::from_low_u64_be(nonce),
            block_number: self.head.load(Ordering::SeqCst),
            success: true,
            gas_used: 21_000,
        })
    }
}
