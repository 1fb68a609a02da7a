use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace, warn};
use primitive_types::H256;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use meridian_common::chain::{
    BlockNumber, ChainCall, ContractAddress, LogRecord, SendConstraints, SignerRole,
    SimulationOutcome, TxHash, TxReceipt,
};

use super::{ChainGateway, GatewayError, JsonRpcClient, LogSubscription, SignerService};

// How long a submitted transaction may wait for its confirmed receipt
const RECEIPT_TIMEOUT_SECS: u64 = 300;
const RECEIPT_POLL_INTERVAL_SECS: u64 = 3;

#[derive(Debug, Deserialize)]
struct ReceiptView {
    block_number: BlockNumber,
    block_hash: H256,
    success: bool,
    gas_used: u64,
}

// Production gateway: JSON-RPC over HTTP for reads, WebSocket for push logs,
// the external key service for writes.
pub struct HttpChainGateway {
    rpc: JsonRpcClient,
    ws_url: String,
    signer: SignerService,
    confirmations: u64,
}

impl HttpChainGateway {
    pub fn new(rpc_url: String, ws_url: String, signer_url: String, confirmations: u64) -> Self {
        Self {
            rpc: JsonRpcClient::new(rpc_url),
            ws_url,
            signer: SignerService::new(signer_url),
            confirmations,
        }
    }

    async fn get_receipt(&self, tx_hash: &TxHash) -> Result<Option<ReceiptView>, GatewayError> {
        self.rpc
            .call("get_transaction_receipt", &json!({ "tx_hash": tx_hash }))
            .await
    }

    // Poll until the receipt is `confirmations` blocks deep. A receipt that
    // was seen and then vanishes means the tx fell out of the canonical chain.
    async fn wait_for_confirmation(&self, tx_hash: TxHash) -> Result<TxReceipt, GatewayError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(RECEIPT_TIMEOUT_SECS);
        let mut seen: Option<ReceiptView> = None;

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(GatewayError::SendTimeout(tx_hash));
            }

            match self.get_receipt(&tx_hash).await {
                Ok(Some(receipt)) => {
                    let head = self.get_head().await?;
                    if head >= receipt.block_number + self.confirmations {
                        if !receipt.success {
                            return Err(GatewayError::ReceiptFailed(tx_hash));
                        }
                        return Ok(TxReceipt {
                            tx_hash,
                            block_number: receipt.block_number,
                            success: receipt.success,
                            gas_used: receipt.gas_used,
                        });
                    }
                    trace!(
                        "tx {:x} at block {}, waiting for depth {}",
                        tx_hash,
                        receipt.block_number,
                        self.confirmations
                    );
                    seen = Some(receipt);
                }
                Ok(None) => {
                    if seen.is_some() {
                        warn!("tx {:x} disappeared from the canonical chain", tx_hash);
                        return Err(GatewayError::ReorgDropped(tx_hash));
                    }
                }
                Err(e) if e.is_transient() => {
                    debug!("receipt poll for {:x} failed transiently: {}", tx_hash, e);
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(Duration::from_secs(RECEIPT_POLL_INTERVAL_SECS)).await;
        }
    }
}

#[async_trait]
impl ChainGateway for HttpChainGateway {
    async fn get_head(&self) -> Result<BlockNumber, GatewayError> {
        self.rpc.call("get_head", &json!({})).await
    }

    async fn get_block_hash(&self, number: BlockNumber) -> Result<Option<H256>, GatewayError> {
        self.rpc
            .call("get_block_hash", &json!({ "block_number": number }))
            .await
    }

    async fn get_logs(
        &self,
        contracts: &[ContractAddress],
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<LogRecord>, GatewayError> {
        self.rpc
            .call(
                "get_logs",
                &json!({
                    "contracts": contracts,
                    "from_block": from,
                    "to_block": to,
                }),
            )
            .await
    }

    async fn subscribe_logs(
        &self,
        contracts: &[ContractAddress],
        from: BlockNumber,
    ) -> Result<mpsc::Receiver<LogRecord>, GatewayError> {
        LogSubscription::open(self.ws_url.clone(), contracts.to_vec(), from).await
    }

    async fn call(
        &self,
        call: &ChainCall,
        block: Option<BlockNumber>,
    ) -> Result<Value, GatewayError> {
        self.rpc
            .call(
                "call_contract",
                &json!({
                    "contract": call.contract,
                    "method": call.method,
                    "args": call.args,
                    "block": block,
                }),
            )
            .await
    }

    async fn simulate(&self, call: &ChainCall) -> Result<SimulationOutcome, GatewayError> {
        self.rpc
            .call(
                "simulate_contract",
                &json!({
                    "contract": call.contract,
                    "method": call.method,
                    "args": call.args,
                }),
            )
            .await
    }

    async fn send(
        &self,
        call: &ChainCall,
        signer: SignerRole,
        constraints: &SendConstraints,
    ) -> Result<TxReceipt, GatewayError> {
        self.signer.authorize(signer, call.amount, constraints)?;

        // Per (contract, signer) serialization prevents nonce conflicts
        let lane = self.signer.lane(call.contract, signer);
        let _guard = lane.lock().await;

        let tx_hash = self.signer.submit(call, signer).await?;
        self.wait_for_confirmation(tx_hash).await
    }
}
