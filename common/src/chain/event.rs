use serde::{Deserialize, Serialize};
use strum::Display;
use thiserror::Error;

use crate::{
    chain::{AccountAddress, ContractAddress, LogRecord, RequestId},
    fund::{Amount, BasisPoints, RedemptionChannel, Tier},
    time::{TimestampMillis, TimestampSeconds},
};

// Queue priority assigned per event kind. Per-priority FIFO only, no
// cross-priority ordering - handlers stay commutative across contracts.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum EventPriority {
    Critical,
    High,
    Normal,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    #[error("invalid args for event '{event}': {source}")]
    InvalidArgs {
        event: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositProcessed {
    pub owner: AccountAddress,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub assets: Amount,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub shares: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharesDelta {
    pub request_id: RequestId,
    pub owner: AccountAddress,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub shares: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionFeeDelta {
    pub request_id: RequestId,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub fee: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavUpdated {
    #[serde(with = "crate::serde_utils::amount_string")]
    pub share_price: Amount,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub total_assets: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionRequested {
    pub request_id: RequestId,
    pub owner: AccountAddress,
    pub receiver: AccountAddress,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub shares: Amount,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub gross_amount: Amount,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub locked_nav: Amount,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub estimated_fee: Amount,
    pub channel: RedemptionChannel,
    pub requires_approval: bool,
    pub settlement_time: TimestampMillis,
    #[serde(default)]
    pub window_id: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionSettled {
    pub request_id: RequestId,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub net_amount: Amount,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub fee: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionApproved {
    pub request_id: RequestId,
    #[serde(default)]
    pub settlement_time: Option<TimestampMillis>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedemptionRejected {
    pub request_id: RequestId,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityAlert {
    pub ratio_bps: BasisPoints,
    pub threshold_bps: BasisPoints,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub available: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetAdded {
    pub asset: ContractAddress,
    pub tier: Tier,
    pub target_allocation_bps: BasisPoints,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetAllocationUpdated {
    pub asset: ContractAddress,
    pub target_allocation_bps: BasisPoints,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetPurchased {
    pub asset: ContractAddress,
    pub tier: Tier,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub usdt_amount: Amount,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub amount_received: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetRedeemed {
    pub asset: ContractAddress,
    pub tier: Tier,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub amount: Amount,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub usdt_received: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaterfallLiquidation {
    #[serde(with = "crate::serde_utils::amount_string")]
    pub amount_needed: Amount,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub amount_raised: Amount,
    pub max_tier: Tier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferPoolRebalanced {
    pub from_tier: Tier,
    pub to_tier: Tier,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub amount: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeCollected {
    #[serde(with = "crate::serde_utils::amount_string")]
    pub amount: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoucherMinted {
    pub request_id: RequestId,
    pub token_id: u64,
    pub owner: AccountAddress,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyLiabilityAdded {
    #[serde(with = "crate::serde_utils::amount_string")]
    pub amount: Amount,
    pub day: TimestampSeconds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiabilityRemoved {
    #[serde(default)]
    pub request_id: Option<RequestId>,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub amount: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementWaterfallTriggered {
    pub window_id: u64,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub amount: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeRateUpdated {
    pub fee_bps: BasisPoints,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoucherThresholdUpdated {
    pub threshold: TimestampSeconds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApprovalShares {
    pub owner: AccountAddress,
    #[serde(with = "crate::serde_utils::amount_string")]
    pub shares: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyQuota {
    #[serde(with = "crate::serde_utils::amount_string")]
    pub quota: Amount,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardQuotaRatioUpdated {
    pub ratio_bps: BasisPoints,
}

// The closed set of chain events this control plane understands.
// Anything else decodes to UnknownEvent and is skipped at warn level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ChainEvent {
    DepositProcessed(DepositProcessed),
    SharesLocked(SharesDelta),
    SharesUnlocked(SharesDelta),
    SharesBurned(SharesDelta),
    RedemptionFeeAdded(RedemptionFeeDelta),
    RedemptionFeeReduced(RedemptionFeeDelta),
    NavUpdated(NavUpdated),
    EmergencyModeChanged { enabled: bool },
    RedemptionRequested(RedemptionRequested),
    RedemptionSettled(RedemptionSettled),
    RedemptionApproved(RedemptionApproved),
    RedemptionRejected(RedemptionRejected),
    LowLiquidityAlert(LiquidityAlert),
    CriticalLiquidityAlert(LiquidityAlert),
    AssetAdded(AssetAdded),
    AssetRemoved { asset: ContractAddress },
    AssetAllocationUpdated(AssetAllocationUpdated),
    AssetPurchased(AssetPurchased),
    AssetRedeemed(AssetRedeemed),
    WaterfallLiquidation(WaterfallLiquidation),
    BufferPoolRebalanced(BufferPoolRebalanced),
    ManagementFeeCollected(FeeCollected),
    PerformanceFeeCollected(FeeCollected),
    VoucherMinted(VoucherMinted),
    DailyLiabilityAdded(DailyLiabilityAdded),
    LiabilityRemoved(LiabilityRemoved),
    SettlementWaterfallTriggered(SettlementWaterfallTriggered),
    BaseRedemptionFeeUpdated(FeeRateUpdated),
    EmergencyPenaltyFeeUpdated(FeeRateUpdated),
    VoucherThresholdUpdated(VoucherThresholdUpdated),
    PendingApprovalSharesAdded(PendingApprovalShares),
    PendingApprovalSharesRemoved(PendingApprovalShares),
    PendingApprovalSharesConverted(PendingApprovalShares),
    EmergencyQuotaRefreshed(EmergencyQuota),
    EmergencyQuotaRestored(EmergencyQuota),
    LockedMintAssetsReset,
    StandardQuotaRatioUpdated(StandardQuotaRatioUpdated),
}

macro_rules! decode_args {
    ($record: expr, $variant: path) => {
        $variant(
            serde_json::from_value($record.args.clone()).map_err(|e| DecodeError::InvalidArgs {
                event: $record.name.clone(),
                source: e,
            })?,
        )
    };
}

impl ChainEvent {
    // Decode a gateway log record against the known event set
    pub fn decode(record: &LogRecord) -> Result<Self, DecodeError> {
        let event = match record.name.as_str() {
            "DepositProcessed" => decode_args!(record, Self::DepositProcessed),
            "SharesLocked" => decode_args!(record, Self::SharesLocked),
            "SharesUnlocked" => decode_args!(record, Self::SharesUnlocked),
            "SharesBurned" => decode_args!(record, Self::SharesBurned),
            "RedemptionFeeAdded" => decode_args!(record, Self::RedemptionFeeAdded),
            "RedemptionFeeReduced" => decode_args!(record, Self::RedemptionFeeReduced),
            "NavUpdated" => decode_args!(record, Self::NavUpdated),
            "EmergencyModeChanged" => {
                #[derive(Deserialize)]
                struct Args {
                    enabled: bool,
                }
                let args: Args = serde_json::from_value(record.args.clone()).map_err(|e| {
                    DecodeError::InvalidArgs {
                        event: record.name.clone(),
                        source: e,
                    }
                })?;
                Self::EmergencyModeChanged {
                    enabled: args.enabled,
                }
            }
            "RedemptionRequested" => decode_args!(record, Self::RedemptionRequested),
            "RedemptionSettled" => decode_args!(record, Self::RedemptionSettled),
            "RedemptionApproved" => decode_args!(record, Self::RedemptionApproved),
            "RedemptionRejected" => decode_args!(record, Self::RedemptionRejected),
            "LowLiquidityAlert" => decode_args!(record, Self::LowLiquidityAlert),
            "CriticalLiquidityAlert" => decode_args!(record, Self::CriticalLiquidityAlert),
            "AssetAdded" => decode_args!(record, Self::AssetAdded),
            "AssetRemoved" => {
                #[derive(Deserialize)]
                struct Args {
                    asset: ContractAddress,
                }
                let args: Args = serde_json::from_value(record.args.clone()).map_err(|e| {
                    DecodeError::InvalidArgs {
                        event: record.name.clone(),
                        source: e,
                    }
                })?;
                Self::AssetRemoved { asset: args.asset }
            }
            "AssetAllocationUpdated" => decode_args!(record, Self::AssetAllocationUpdated),
            "AssetPurchased" => decode_args!(record, Self::AssetPurchased),
            "AssetRedeemed" => decode_args!(record, Self::AssetRedeemed),
            "WaterfallLiquidation" => decode_args!(record, Self::WaterfallLiquidation),
            "BufferPoolRebalanced" => decode_args!(record, Self::BufferPoolRebalanced),
            "ManagementFeeCollected" => decode_args!(record, Self::ManagementFeeCollected),
            "PerformanceFeeCollected" => decode_args!(record, Self::PerformanceFeeCollected),
            "VoucherMinted" => decode_args!(record, Self::VoucherMinted),
            "DailyLiabilityAdded" => decode_args!(record, Self::DailyLiabilityAdded),
            "LiabilityRemoved" => decode_args!(record, Self::LiabilityRemoved),
            "SettlementWaterfallTriggered" => {
                decode_args!(record, Self::SettlementWaterfallTriggered)
            }
            "BaseRedemptionFeeUpdated" => decode_args!(record, Self::BaseRedemptionFeeUpdated),
            "EmergencyPenaltyFeeUpdated" => decode_args!(record, Self::EmergencyPenaltyFeeUpdated),
            "VoucherThresholdUpdated" => decode_args!(record, Self::VoucherThresholdUpdated),
            "PendingApprovalSharesAdded" => decode_args!(record, Self::PendingApprovalSharesAdded),
            "PendingApprovalSharesRemoved" => {
                decode_args!(record, Self::PendingApprovalSharesRemoved)
            }
            "PendingApprovalSharesConverted" => {
                decode_args!(record, Self::PendingApprovalSharesConverted)
            }
            "EmergencyQuotaRefreshed" => decode_args!(record, Self::EmergencyQuotaRefreshed),
            "EmergencyQuotaRestored" => decode_args!(record, Self::EmergencyQuotaRestored),
            "LockedMintAssetsReset" => Self::LockedMintAssetsReset,
            "StandardQuotaRatioUpdated" => decode_args!(record, Self::StandardQuotaRatioUpdated),
            other => return Err(DecodeError::UnknownEvent(other.to_string())),
        };

        Ok(event)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::DepositProcessed(_) => "DepositProcessed",
            Self::SharesLocked(_) => "SharesLocked",
            Self::SharesUnlocked(_) => "SharesUnlocked",
            Self::SharesBurned(_) => "SharesBurned",
            Self::RedemptionFeeAdded(_) => "RedemptionFeeAdded",
            Self::RedemptionFeeReduced(_) => "RedemptionFeeReduced",
            Self::NavUpdated(_) => "NavUpdated",
            Self::EmergencyModeChanged { .. } => "EmergencyModeChanged",
            Self::RedemptionRequested(_) => "RedemptionRequested",
            Self::RedemptionSettled(_) => "RedemptionSettled",
            Self::RedemptionApproved(_) => "RedemptionApproved",
            Self::RedemptionRejected(_) => "RedemptionRejected",
            Self::LowLiquidityAlert(_) => "LowLiquidityAlert",
            Self::CriticalLiquidityAlert(_) => "CriticalLiquidityAlert",
            Self::AssetAdded(_) => "AssetAdded",
            Self::AssetRemoved { .. } => "AssetRemoved",
            Self::AssetAllocationUpdated(_) => "AssetAllocationUpdated",
            Self::AssetPurchased(_) => "AssetPurchased",
            Self::AssetRedeemed(_) => "AssetRedeemed",
            Self::WaterfallLiquidation(_) => "WaterfallLiquidation",
            Self::BufferPoolRebalanced(_) => "BufferPoolRebalanced",
            Self::ManagementFeeCollected(_) => "ManagementFeeCollected",
            Self::PerformanceFeeCollected(_) => "PerformanceFeeCollected",
            Self::VoucherMinted(_) => "VoucherMinted",
            Self::DailyLiabilityAdded(_) => "DailyLiabilityAdded",
            Self::LiabilityRemoved(_) => "LiabilityRemoved",
            Self::SettlementWaterfallTriggered(_) => "SettlementWaterfallTriggered",
            Self::BaseRedemptionFeeUpdated(_) => "BaseRedemptionFeeUpdated",
            Self::EmergencyPenaltyFeeUpdated(_) => "EmergencyPenaltyFeeUpdated",
            Self::VoucherThresholdUpdated(_) => "VoucherThresholdUpdated",
            Self::PendingApprovalSharesAdded(_) => "PendingApprovalSharesAdded",
            Self::PendingApprovalSharesRemoved(_) => "PendingApprovalSharesRemoved",
            Self::PendingApprovalSharesConverted(_) => "PendingApprovalSharesConverted",
            Self::EmergencyQuotaRefreshed(_) => "EmergencyQuotaRefreshed",
            Self::EmergencyQuotaRestored(_) => "EmergencyQuotaRestored",
            Self::LockedMintAssetsReset => "LockedMintAssetsReset",
            Self::StandardQuotaRatioUpdated(_) => "StandardQuotaRatioUpdated",
        }
    }

    // Dispatch priority for the ingestion queue
    pub fn priority(&self) -> EventPriority {
        match self {
            Self::EmergencyModeChanged { .. }
            | Self::CriticalLiquidityAlert(_)
            | Self::LowLiquidityAlert(_) => EventPriority::Critical,
            Self::RedemptionRequested(_)
            | Self::VoucherMinted(_)
            | Self::SettlementWaterfallTriggered(_)
            | Self::NavUpdated(_)
            | Self::BaseRedemptionFeeUpdated(_)
            | Self::EmergencyPenaltyFeeUpdated(_) => EventPriority::High,
            _ => EventPriority::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TxHash;
    use primitive_types::H256;
    use serde_json::json;

    fn record(name: &str, args: serde_json::Value) -> LogRecord {
        LogRecord {
            tx_hash: TxHash::repeat_byte(7),
            log_index: 0,
            block_number: 100,
            block_time: 1_700_000_000,
            contract: ContractAddress::repeat_byte(2),
            topic0: H256::zero(),
            name: name.to_string(),
            args,
        }
    }

    #[test]
    fn decode_redemption_requested() {
        let rec = record(
            "RedemptionRequested",
            json!({
                "request_id": 42,
                "owner": "0x0101010101010101010101010101010101010101",
                "receiver": "0x0101010101010101010101010101010101010101",
                "shares": "10000000000000000000000",
                "gross_amount": "10500000000000000000000",
                "locked_nav": "1050000000000000000",
                "estimated_fee": "0",
                "channel": "STANDARD",
                "requires_approval": false,
                "settlement_time": 1_700_604_800_000u64
            }),
        );
        let event = ChainEvent::decode(&rec).unwrap();
        match event {
            ChainEvent::RedemptionRequested(ref r) => {
                assert_eq!(r.request_id, 42);
                assert!(!r.requires_approval);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(event.priority(), EventPriority::High);
    }

    #[test]
    fn decode_unknown_event() {
        let rec = record("SomethingNew", json!({}));
        assert!(matches!(
            ChainEvent::decode(&rec),
            Err(DecodeError::UnknownEvent(_))
        ));
    }

    #[test]
    fn decode_bad_args() {
        let rec = record("NavUpdated", json!({"share_price": "not-a-number"}));
        assert!(matches!(
            ChainEvent::decode(&rec),
            Err(DecodeError::InvalidArgs { .. })
        ));
    }

    #[test]
    fn priorities_match_policy() {
        let critical = record("EmergencyModeChanged", json!({"enabled": true}));
        assert_eq!(
            ChainEvent::decode(&critical).unwrap().priority(),
            EventPriority::Critical
        );

        let normal = record(
            "DepositProcessed",
            json!({
                "owner": "0x0101010101010101010101010101010101010101",
                "assets": "1000",
                "shares": "1000"
            }),
        );
        assert_eq!(
            ChainEvent::decode(&normal).unwrap().priority(),
            EventPriority::Normal
        );
    }
}
