mod breaker;
mod gateway;
mod rpc_client;
mod signer;
pub mod testing;
mod ws;

pub use breaker::*;
pub use gateway::*;
pub use rpc_client::*;
pub use signer::*;
pub use ws::*;

use async_trait::async_trait;
use primitive_types::H256;
use thiserror::Error;
use tokio::sync::mpsc;

use meridian_common::chain::{
    BlockNumber, ChainCall, ContractAddress, LogRecord, SendConstraints, SignerRole,
    SimulationOutcome, TxHash, TxReceipt,
};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("transient rpc error: {0}")]
    TransientRpc(String),

    #[error("rpc call timed out")]
    RpcTimeout,

    #[error("rpc rate limited")]
    RpcRateLimited,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("circuit breaker is open")]
    BreakerOpen,

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("invalid rpc response: {0}")]
    InvalidResponse(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("transaction dropped by reorg: {0:x}")]
    ReorgDropped(TxHash),

    #[error("rejected by signing policy: {0}")]
    RejectedByPolicy(String),

    #[error("send timed out waiting for receipt of {0:x}")]
    SendTimeout(TxHash),

    #[error("transaction {0:x} reverted on-chain")]
    ReceiptFailed(TxHash),

    #[error("signer nonce exhausted")]
    NonceExhausted,

    #[error("simulation reverted: {0}")]
    SimulationReverted(String),
}

impl GatewayError {
    // Transient errors are retried by callers within their budget
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::TransientRpc(_)
                | Self::RpcTimeout
                | Self::RpcRateLimited
                | Self::DeadlineExceeded
                | Self::SendTimeout(_)
                | Self::NonceExhausted
        )
    }
}

// Typed read/write facade over the chain. Engines and tests swap transports
// behind this trait.
#[async_trait]
pub trait ChainGateway: Send + Sync + 'static {
    async fn get_head(&self) -> Result<BlockNumber, GatewayError>;

    async fn get_block_hash(&self, number: BlockNumber) -> Result<Option<H256>, GatewayError>;

    // Batched range fetch; the polling fallback and gap recovery path
    async fn get_logs(
        &self,
        contracts: &[ContractAddress],
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<LogRecord>, GatewayError>;

    // Push subscription, an optimization over the poller. The stream ends on
    // disconnect; the caller decides whether to resubscribe.
    async fn subscribe_logs(
        &self,
        contracts: &[ContractAddress],
        from: BlockNumber,
    ) -> Result<mpsc::Receiver<LogRecord>, GatewayError>;

    async fn call(
        &self,
        call: &ChainCall,
        block: Option<BlockNumber>,
    ) -> Result<serde_json::Value, GatewayError>;

    // Dry-run against latest state
    async fn simulate(&self, call: &ChainCall) -> Result<SimulationOutcome, GatewayError>;

    // Signed write through the key service; returns after the configured
    // confirmation depth
    async fn send(
        &self,
        call: &ChainCall,
        signer: SignerRole,
        constraints: &SendConstraints,
    ) -> Result<TxReceipt, GatewayError>;
}
