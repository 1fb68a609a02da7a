// Per-event projection handlers. Every handler is idempotent: the processed
// row keyed by (tx_hash, log_index) guards replays even after dedup markers
// expire, and all monetary updates preserve the projection identity
//   l1_cash + l1_yield + l2 + l3 - liability - withdrawable_fees = total_assets

use log::{debug, trace, warn};

use meridian_common::{
    chain::{ChainEvent, LogRecord, RequestId},
    config::{BPS_DENOMINATOR, DRIFT_TOLERANCE_BPS, LARGE_FLOW_TRIGGER_BPS, SECONDS_PER_DAY},
    fund::{
        AssetHolding, FundProjection, RedemptionRequest, RedemptionStatus, Tier,
    },
    rebalance::RebalanceTrigger,
    risk::RiskLevel,
    time::{get_current_time_in_millis, TimestampMillis},
};

use crate::core::storage::{ProcessedEvent, Storage};

use super::{DispatchError, SideEffect};

// Apply one confirmed event inside a single logical commit: projection and
// entity writes first, the processed audit row last. Returns side effects for
// the router (ticket creation, risk wakes, rebalance triggers).
pub async fn apply_event<S: Storage>(
    storage: &S,
    record: &LogRecord,
    event: &ChainEvent,
) -> Result<Vec<SideEffect>, DispatchError> {
    let key = record.event_id().dedup_key();
    if storage.has_processed_event(&key).await? {
        trace!("event {} already processed, replay is a no-op", record.event_id());
        return Ok(Vec::new());
    }

    let now = get_current_time_in_millis();
    let mut ctx = HandlerContext {
        storage,
        record,
        now,
        effects: Vec::new(),
        projection: storage.get_fund_projection().await?,
        projection_dirty: false,
    };

    ctx.apply(event).await?;

    let mut effects = ctx.effects;
    if ctx.projection_dirty {
        ctx.projection.last_block = record.block_number;
        ctx.projection.updated_at = now;

        // Recompute the accounting identity on every commit
        let drift = ctx.projection.invariant_drift();
        let tolerance =
            (ctx.projection.total_assets / BPS_DENOMINATOR as u128) * DRIFT_TOLERANCE_BPS as u128;
        if drift.unsigned_abs() > tolerance {
            effects.push(SideEffect::InvariantViolated { drift });
        }

        storage.set_fund_projection(&ctx.projection).await?;
    }

    storage
        .record_processed_event(&ProcessedEvent {
            event_id: record.event_id(),
            name: event.name().to_string(),
            processed_at: now,
        })
        .await?;

    Ok(effects)
}

struct HandlerContext<'a, S: Storage> {
    storage: &'a S,
    record: &'a LogRecord,
    now: TimestampMillis,
    effects: Vec<SideEffect>,
    projection: FundProjection,
    projection_dirty: bool,
}

impl<'a, S: Storage> HandlerContext<'a, S> {
    async fn apply(&mut self, event: &ChainEvent) -> Result<(), DispatchError> {
        use ChainEvent::*;
        match event {
            DepositProcessed(deposit) => {
                self.projection.l1_cash = self.projection.l1_cash.saturating_add(deposit.assets);
                self.projection.total_assets =
                    self.projection.total_assets.saturating_add(deposit.assets);
                self.projection_dirty = true;
                self.record_flow(deposit.assets, 0).await?;
                self.check_large_flow(deposit.assets);
            }

            SharesLocked(delta) => {
                self.projection.total_locked_shares =
                    self.projection.total_locked_shares.saturating_add(delta.shares);
                self.projection_dirty = true;
            }
            SharesUnlocked(delta) | SharesBurned(delta) => {
                self.projection.total_locked_shares =
                    self.projection.total_locked_shares.saturating_sub(delta.shares);
                self.projection_dirty = true;
            }

            PendingApprovalSharesAdded(pending) => {
                self.projection.pending_approval_shares = self
                    .projection
                    .pending_approval_shares
                    .saturating_add(pending.shares);
                self.projection_dirty = true;
            }
            PendingApprovalSharesRemoved(pending) => {
                self.projection.pending_approval_shares = self
                    .projection
                    .pending_approval_shares
                    .saturating_sub(pending.shares);
                self.projection_dirty = true;
            }
            PendingApprovalSharesConverted(pending) => {
                self.projection.pending_approval_shares = self
                    .projection
                    .pending_approval_shares
                    .saturating_sub(pending.shares);
                self.projection.total_locked_shares =
                    self.projection.total_locked_shares.saturating_add(pending.shares);
                self.projection_dirty = true;
            }

            RedemptionFeeAdded(fee) => {
                // a slice of recognized liability reclassified as fee income
                self.projection.withdrawable_fees =
                    self.projection.withdrawable_fees.saturating_add(fee.fee);
                self.projection.total_redemption_liability = self
                    .projection
                    .total_redemption_liability
                    .saturating_sub(fee.fee);
                self.projection_dirty = true;
                self.update_request(fee.request_id, |request| {
                    request.estimated_fee = request.estimated_fee.saturating_add(fee.fee);
                })
                .await?;
            }
            RedemptionFeeReduced(fee) => {
                self.projection.withdrawable_fees =
                    self.projection.withdrawable_fees.saturating_sub(fee.fee);
                self.projection.total_redemption_liability = self
                    .projection
                    .total_redemption_liability
                    .saturating_add(fee.fee);
                self.projection_dirty = true;
                self.update_request(fee.request_id, |request| {
                    request.estimated_fee = request.estimated_fee.saturating_sub(fee.fee);
                })
                .await?;
            }

            NavUpdated(nav) => {
                self.projection.share_price = nav.share_price;
                // Revaluation flows through the mark-to-market tier so the
                // identity keeps holding against the chain's total
                let derived = self.projection.l1_cash as i128
                    + self.projection.l1_yield as i128
                    + self.projection.l2 as i128
                    + self.projection.l3 as i128
                    - self.projection.total_redemption_liability as i128
                    - self.projection.withdrawable_fees as i128;
                let delta = nav.total_assets as i128 - derived;
                self.projection.l3 = (self.projection.l3 as i128 + delta).max(0) as u128;
                self.projection.total_assets = nav.total_assets;
                self.projection_dirty = true;
                self.storage.set_last_nav_update(self.now).await?;
                self.effects.push(SideEffect::WakeRiskEvaluator);
                self.effects.push(SideEffect::TriggerRebalance {
                    trigger: RebalanceTrigger::NavUpdated,
                });
            }

            EmergencyModeChanged { enabled } => {
                self.projection.emergency_mode = *enabled;
                self.projection_dirty = true;
                self.effects
                    .push(SideEffect::EmergencyModeChanged { enabled: *enabled });
            }

            RedemptionRequested(requested) => {
                if self
                    .storage
                    .get_redemption(requested.request_id)
                    .await?
                    .is_some()
                {
                    debug!("redemption {} already known", requested.request_id);
                } else {
                    let status = if requested.requires_approval {
                        RedemptionStatus::PendingApproval
                    } else {
                        RedemptionStatus::Pending
                    };
                    self.storage
                        .set_redemption(&RedemptionRequest {
                            request_id: requested.request_id,
                            owner: requested.owner,
                            receiver: requested.receiver,
                            shares: requested.shares,
                            gross_amount: requested.gross_amount,
                            locked_nav: requested.locked_nav,
                            estimated_fee: requested.estimated_fee,
                            request_time: self.record.block_time * 1_000,
                            settlement_time: requested.settlement_time,
                            channel: requested.channel,
                            requires_approval: requested.requires_approval,
                            window_id: requested.window_id,
                            voucher_token_id: None,
                            status,
                            settled_amount: None,
                            settled_fee: None,
                            settled_at: None,
                            approval_ticket_id: None,
                            updated_at: self.now,
                        })
                        .await?;
                    if requested.requires_approval {
                        self.effects.push(SideEffect::RequestApproval {
                            request_id: requested.request_id,
                        });
                    }
                    self.check_large_flow(requested.gross_amount);
                }
            }

            RedemptionApproved(approved) => {
                self.transition_request(approved.request_id, RedemptionStatus::Approved)
                    .await?;
                if let Some(settlement_time) = approved.settlement_time {
                    self.update_request(approved.request_id, |request| {
                        request.settlement_time = settlement_time;
                    })
                    .await?;
                }
                self.effects.push(SideEffect::TicketReferenceResolved {
                    request_id: approved.request_id,
                    approved: true,
                });
            }

            RedemptionRejected(rejected) => {
                self.transition_request(rejected.request_id, RedemptionStatus::Rejected)
                    .await?;
                self.effects.push(SideEffect::TicketReferenceResolved {
                    request_id: rejected.request_id,
                    approved: false,
                });
            }

            RedemptionSettled(settled) => {
                let gross = settled.net_amount.saturating_add(settled.fee);
                let now = self.now;
                self.transition_request(settled.request_id, RedemptionStatus::Settled)
                    .await?;
                self.update_request(settled.request_id, |request| {
                    request.settled_amount = Some(settled.net_amount);
                    request.settled_fee = Some(settled.fee);
                    request.settled_at = Some(now);
                })
                .await?;

                // liability was recognized at request time; settlement pays
                // cash out and realizes the fee
                self.projection.l1_cash =
                    self.projection.l1_cash.saturating_sub(settled.net_amount);
                self.projection.total_redemption_liability = self
                    .projection
                    .total_redemption_liability
                    .saturating_sub(gross);
                self.projection.withdrawable_fees =
                    self.projection.withdrawable_fees.saturating_add(settled.fee);
                self.projection_dirty = true;
                self.record_flow(0, gross).await?;
            }

            VoucherMinted(voucher) => {
                self.update_request(voucher.request_id, |request| {
                    request.voucher_token_id = Some(voucher.token_id);
                })
                .await?;
            }

            LowLiquidityAlert(alert) => {
                self.effects.push(SideEffect::LiquidityAlert {
                    level: RiskLevel::High,
                    ratio_bps: alert.ratio_bps,
                    available: alert.available,
                });
            }
            CriticalLiquidityAlert(alert) => {
                self.effects.push(SideEffect::LiquidityAlert {
                    level: RiskLevel::Critical,
                    ratio_bps: alert.ratio_bps,
                    available: alert.available,
                });
            }

            DailyLiabilityAdded(liability) => {
                self.projection.total_redemption_liability = self
                    .projection
                    .total_redemption_liability
                    .saturating_add(liability.amount);
                self.projection.total_assets =
                    self.projection.total_assets.saturating_sub(liability.amount);
                self.projection_dirty = true;
            }
            LiabilityRemoved(liability) => {
                self.projection.total_redemption_liability = self
                    .projection
                    .total_redemption_liability
                    .saturating_sub(liability.amount);
                self.projection.total_assets =
                    self.projection.total_assets.saturating_add(liability.amount);
                self.projection_dirty = true;
            }

            SettlementWaterfallTriggered(waterfall) => {
                self.effects.push(SideEffect::RaiseRiskEvent {
                    level: RiskLevel::Elevated,
                    source: "settlement".to_string(),
                    message: format!(
                        "settlement waterfall triggered for window {} over {}",
                        waterfall.window_id, waterfall.amount
                    ),
                });
            }

            AssetAdded(added) => {
                self.storage
                    .set_holding(&AssetHolding {
                        asset: added.asset,
                        tier: added.tier,
                        balance: 0,
                        target_allocation_bps: added.target_allocation_bps,
                        updated_at: self.now,
                    })
                    .await?;
            }
            AssetRemoved { asset } => {
                self.storage.remove_holding(asset).await?;
            }
            AssetAllocationUpdated(updated) => {
                if let Some(mut holding) = self.storage.get_holding(&updated.asset).await? {
                    holding.target_allocation_bps = updated.target_allocation_bps;
                    holding.updated_at = self.now;
                    self.storage.set_holding(&holding).await?;
                } else {
                    warn!("allocation update for unknown asset {:x}", updated.asset);
                }
            }

            AssetPurchased(purchase) => {
                self.projection.l1_cash =
                    self.projection.l1_cash.saturating_sub(purchase.usdt_amount);
                let value = self.projection.tier_value(purchase.tier);
                self.projection
                    .set_tier_value(purchase.tier, value.saturating_add(purchase.usdt_amount));
                self.projection_dirty = true;

                let mut holding = self
                    .storage
                    .get_holding(&purchase.asset)
                    .await?
                    .unwrap_or(AssetHolding {
                        asset: purchase.asset,
                        tier: purchase.tier,
                        balance: 0,
                        target_allocation_bps: 0,
                        updated_at: self.now,
                    });
                holding.balance = holding.balance.saturating_add(purchase.amount_received);
                holding.updated_at = self.now;
                self.storage.set_holding(&holding).await?;
            }

            AssetRedeemed(redeemed) => {
                let value = self.projection.tier_value(redeemed.tier);
                self.projection
                    .set_tier_value(redeemed.tier, value.saturating_sub(redeemed.usdt_received));
                self.projection.l1_cash =
                    self.projection.l1_cash.saturating_add(redeemed.usdt_received);
                self.projection_dirty = true;

                if let Some(mut holding) = self.storage.get_holding(&redeemed.asset).await? {
                    holding.balance = holding.balance.saturating_sub(redeemed.amount);
                    holding.updated_at = self.now;
                    self.storage.set_holding(&holding).await?;
                }
            }

            WaterfallLiquidation(waterfall) => {
                // drain shallow tiers first, never deeper than max_tier
                let mut remaining = waterfall.amount_raised;
                for tier in [Tier::L2, Tier::L3] {
                    if tier > waterfall.max_tier || remaining == 0 {
                        continue;
                    }
                    let value = self.projection.tier_value(tier);
                    let taken = value.min(remaining);
                    self.projection.set_tier_value(tier, value - taken);
                    remaining -= taken;
                }
                self.projection.l1_cash = self
                    .projection
                    .l1_cash
                    .saturating_add(waterfall.amount_raised);
                self.projection_dirty = true;
            }

            BufferPoolRebalanced(rebalanced) => {
                let from = self.projection.tier_value(rebalanced.from_tier);
                self.projection
                    .set_tier_value(rebalanced.from_tier, from.saturating_sub(rebalanced.amount));
                let to = self.projection.tier_value(rebalanced.to_tier);
                self.projection
                    .set_tier_value(rebalanced.to_tier, to.saturating_add(rebalanced.amount));
                self.projection_dirty = true;
            }

            ManagementFeeCollected(fee) | PerformanceFeeCollected(fee) => {
                self.projection.withdrawable_fees =
                    self.projection.withdrawable_fees.saturating_add(fee.amount);
                self.projection.total_assets =
                    self.projection.total_assets.saturating_sub(fee.amount);
                self.projection_dirty = true;
            }

            BaseRedemptionFeeUpdated(updated) => {
                let mut params = self.storage.get_chain_params().await?;
                params.base_redemption_fee_bps = updated.fee_bps;
                self.storage.set_chain_params(&params).await?;
            }
            EmergencyPenaltyFeeUpdated(updated) => {
                let mut params = self.storage.get_chain_params().await?;
                params.emergency_penalty_fee_bps = updated.fee_bps;
                self.storage.set_chain_params(&params).await?;
            }
            VoucherThresholdUpdated(updated) => {
                let mut params = self.storage.get_chain_params().await?;
                params.voucher_threshold_secs = updated.threshold;
                self.storage.set_chain_params(&params).await?;
            }
            StandardQuotaRatioUpdated(updated) => {
                let mut params = self.storage.get_chain_params().await?;
                params.standard_quota_ratio_bps = updated.ratio_bps;
                self.storage.set_chain_params(&params).await?;
            }
            EmergencyQuotaRefreshed(quota) | EmergencyQuotaRestored(quota) => {
                let mut params = self.storage.get_chain_params().await?;
                params.emergency_quota = quota.quota;
                self.storage.set_chain_params(&params).await?;
            }
            LockedMintAssetsReset => {
                debug!("locked mint assets reset at {}", self.record.event_id());
            }
        }

        Ok(())
    }

    async fn update_request<F>(&mut self, request_id: RequestId, f: F) -> Result<(), DispatchError>
    where
        F: FnOnce(&mut RedemptionRequest),
    {
        match self.storage.get_redemption(request_id).await? {
            Some(mut request) => {
                f(&mut request);
                request.updated_at = self.now;
                self.storage.set_redemption(&request).await?;
            }
            None => warn!(
                "event {} references unknown redemption {}",
                self.record.event_id(),
                request_id
            ),
        }
        Ok(())
    }

    // Guarded advance; an out-of-order chain history is logged and skipped
    // rather than wedging the lane
    async fn transition_request(
        &mut self,
        request_id: RequestId,
        next: RedemptionStatus,
    ) -> Result<(), DispatchError> {
        match self.storage.get_redemption(request_id).await? {
            Some(mut request) => match request.transition(next, self.now) {
                Ok(_) => self.storage.set_redemption(&request).await?,
                Err(e) => warn!("skipping transition: {}", e),
            },
            None => warn!(
                "event {} references unknown redemption {}",
                self.record.event_id(),
                request_id
            ),
        }
        Ok(())
    }

    async fn record_flow(
        &mut self,
        deposit: u128,
        redemption: u128,
    ) -> Result<(), DispatchError> {
        let day = self.record.block_time / SECONDS_PER_DAY;
        self.storage.record_daily_flow(day, deposit, redemption).await?;
        Ok(())
    }

    fn check_large_flow(&mut self, amount: u128) {
        if self.projection.total_assets == 0 {
            return;
        }
        let ratio_bps = amount.saturating_mul(BPS_DENOMINATOR as u128) / self.projection.total_assets;
        if ratio_bps >= LARGE_FLOW_TRIGGER_BPS as u128 {
            self.effects.push(SideEffect::TriggerRebalance {
                trigger: RebalanceTrigger::LargeFlow,
            });
        }
    }
}
