mod event;

pub use event::*;

use primitive_types::{H160, H256};
use serde::{Deserialize, Serialize};
use std::fmt;
use strum::{AsRefStr, Display, EnumIter};

use crate::time::{TimestampMillis, TimestampSeconds};

// On-chain identifiers
pub type ContractAddress = H160;
pub type AccountAddress = H160;
pub type TxHash = H256;
pub type BlockNumber = u64;

// Chain-assigned redemption request identifier
pub type RequestId = u64;

// Identity of a single emitted log, unique across the chain.
// Ordering follows (block_number, log_index) so per-contract event order is
// exactly chain order once confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub block_number: BlockNumber,
    pub log_index: u32,
    pub tx_hash: TxHash,
}

impl EventId {
    pub fn new(block_number: BlockNumber, log_index: u32, tx_hash: TxHash) -> Self {
        Self {
            block_number,
            log_index,
            tx_hash,
        }
    }

    // Stable dedup key, also used for the processed-event audit row
    pub fn dedup_key(&self) -> String {
        format!("{:x}:{}", self.tx_hash, self.log_index)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}#{} (block {})",
            self.tx_hash, self.log_index, self.block_number
        )
    }
}

// A raw log record as returned by the chain gateway, decoded args included.
// `name` is the event name resolved from topic0 against the contract ABI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub tx_hash: TxHash,
    pub log_index: u32,
    pub block_number: BlockNumber,
    pub block_time: TimestampSeconds,
    pub contract: ContractAddress,
    pub topic0: H256,
    pub name: String,
    pub args: serde_json::Value,
}

impl LogRecord {
    pub fn event_id(&self) -> EventId {
        EventId::new(self.block_number, self.log_index, self.tx_hash)
    }
}

// Roles under which the key service signs writes
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumIter,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SignerRole {
    Admin,
    VipApprover,
    Rebalancer,
}

// hot: single-sig low limits, warm: 2/3 multisig, cold: 3/5 multisig
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SignerTier {
    Hot,
    Warm,
    Cold,
}

// Caps enforced by the external key service on each send.
// The gateway checks them client-side first to fail fast with RejectedByPolicy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SendConstraints {
    pub per_tx_cap: u128,
    pub daily_cap: u128,
}

impl SendConstraints {
    pub fn unrestricted() -> Self {
        Self {
            per_tx_cap: u128::MAX,
            daily_cap: u128::MAX,
        }
    }
}

// Receipt returned once a send reached the configured confirmation depth
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_hash: TxHash,
    pub block_number: BlockNumber,
    pub success: bool,
    pub gas_used: u64,
}

// A contract write request, passed to the gateway send path.
// `amount` is the monetary size of the call for signing-policy purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainCall {
    pub contract: ContractAddress,
    pub method: String,
    pub args: serde_json::Value,
    #[serde(default, with = "crate::serde_utils::amount_string")]
    pub amount: u128,
}

impl ChainCall {
    pub fn new(contract: ContractAddress, method: impl Into<String>, args: serde_json::Value) -> Self {
        Self {
            contract,
            method: method.into(),
            args,
            amount: 0,
        }
    }

    pub fn with_amount(mut self, amount: u128) -> Self {
        self.amount = amount;
        self
    }
}

// Outcome of a dry-run against latest state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SimulationOutcome {
    Success {
        output: serde_json::Value,
        // Predicted execution slippage for swaps/redemptions, bps
        predicted_slippage_bps: u64,
        estimated_gas: u64,
    },
    Reverted {
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BlockRef {
    pub number: BlockNumber,
    pub hash: H256,
    pub timestamp: TimestampMillis,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_orders_by_block_then_log_index() {
        let a = EventId::new(10, 5, TxHash::zero());
        let b = EventId::new(10, 6, TxHash::zero());
        let c = EventId::new(11, 0, TxHash::zero());
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn dedup_key_is_stable() {
        let id = EventId::new(1, 3, TxHash::repeat_byte(0xab));
        let again = EventId::new(9, 3, TxHash::repeat_byte(0xab));
        // the key ignores the block number on purpose: a log re-seen at a
        // different height must still dedup
        assert_eq!(id.dedup_key(), again.dedup_key());
    }
}
