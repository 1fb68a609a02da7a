// Shared constants for the control plane.
// Amounts are fixed-point integers in the fund's base unit, ratios are basis points.

use crate::time::{TimestampMillis, TimestampSeconds};

// The fund's unit of account carries 18 fractional digits
pub const COIN_DECIMALS: u8 = 18;
// One unit in base representation (10^18)
pub const COIN_VALUE: u128 = 1_000_000_000_000_000_000;

// 1 bp = 1/10_000
pub const BPS_DENOMINATOR: u64 = 10_000;

// Millis per second, it is used to prevent having random 1000 values anywhere
pub const MILLIS_PER_SECOND: u64 = 1000;
pub const SECONDS_PER_DAY: u64 = 86_400;

// Chain ingestion rules
// Minimum blocks behind head required before an event is accepted
pub const DEFAULT_CONFIRMATIONS: u64 = 15;
// Poller interval, it is the correctness path - the WS subscription is an optimization only
pub const DEFAULT_POLLING_INTERVAL_MS: TimestampMillis = 3_000;
// Maximum block range requested in one get_logs call
pub const DEFAULT_LOGS_BATCH_SIZE: u64 = 1_000;
// How many times get_logs is retried before the ingestor pauses and alerts
pub const GET_LOGS_MAX_ATTEMPTS: u32 = 10;
// WebSocket reconnect backoff bounds
pub const WS_RECONNECT_BASE_MS: TimestampMillis = 1_000;
pub const WS_RECONNECT_CAP_MS: TimestampMillis = 30_000;

// Checkpoint is flushed when either bound is hit
pub const CHECKPOINT_FLUSH_EVENTS: u64 = 100;
pub const CHECKPOINT_FLUSH_INTERVAL_MS: TimestampMillis = 5_000;

// Dedup markers expire after 7 days; the processed-event table stays as the
// second line of defense once a marker is evicted
pub const DEDUP_TTL_SECONDS: TimestampSeconds = 7 * SECONDS_PER_DAY;

// Singleton coordination
pub const LEASE_RENEW_INTERVAL_SECS: u64 = 15;
pub const LEASE_TTL_SECS: u64 = 30;

// External call deadlines
pub const RPC_DEADLINE_SECS: u64 = 30;
pub const SIGNER_DEADLINE_SECS: u64 = 60;
pub const STORAGE_DEADLINE_SECS: u64 = 10;

// Circuit breaker: trips when the failure rate over the last window exceeds the
// threshold, stays open for the cooldown, then half-opens on a single probe
pub const BREAKER_WINDOW: usize = 100;
pub const BREAKER_FAILURE_RATE_BPS: u64 = 2_000;
pub const BREAKER_OPEN_SECS: u64 = 30;

// Task runtime
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const RETRY_DELAY_BASE_MS: TimestampMillis = 1_000;
pub const RETRY_DELAY_CAP_MS: TimestampMillis = 30_000;
// Completed task results are retained for idempotency checks
pub const TASK_RESULT_RETENTION_SECS: TimestampSeconds = SECONDS_PER_DAY;

// Rebalancing
// Actions below this absolute amount are dropped from generated plans
pub const DEFAULT_MIN_REBALANCE_AMOUNT: u128 = 10_000 * COIN_VALUE;
// Plans above this total require an approval ticket before execution
pub const DEFAULT_APPROVAL_THRESHOLD: u128 = 50_000 * COIN_VALUE;
// Gateway send attempt budget per action
pub const SEND_ATTEMPT_BUDGET: u32 = 3;
// Slippage ceiling applied when a planner action does not carry its own
pub const DEFAULT_MAX_SLIPPAGE_BPS: u64 = 200;
// Post-simulation / post-execution tolerated drift against the target state
pub const DRIFT_TOLERANCE_BPS: u64 = 100;
// Confirmed outflow within this horizon is checked against L1 + L2
pub const PENDING_OUTFLOW_HORIZON_SECS: TimestampSeconds = 7 * SECONDS_PER_DAY;
// Waterfall preparation triggers when outflow exceeds this share of L1 + L2
pub const PENDING_OUTFLOW_ALERT_BPS: u64 = 8_000;

// A single deposit or redemption at or above this share of total assets
// counts as a large flow and triggers the rebalance evaluator
pub const LARGE_FLOW_TRIGGER_BPS: u64 = 100;

// Risk engine
pub const MONTE_CARLO_TRIALS: u32 = 1_000;
// Duplicate liquidity alerts are suppressed within this cooldown
pub const RISK_ALERT_COOLDOWN_SECS: TimestampSeconds = 3_600;
// Recovery watcher cadence and the consecutive calm snapshots required to
// terminate an emergency incident
pub const RECOVERY_WATCHER_INTERVAL_SECS: u64 = 300;
pub const RECOVERY_CALM_SNAPSHOTS: u32 = 2;
// Snapshot cadence per risk level
pub const SNAPSHOT_INTERVAL_NORMAL_SECS: u64 = 60;
// Risk snapshots retention for the time-series store
pub const SNAPSHOT_RETENTION_DAYS: u64 = 90;

// Overdue liability batch
pub const DEFAULT_OVERDUE_DAYS_BACK: u32 = 30;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coin_value_matches_decimals() {
        assert_eq!(COIN_VALUE, 10u128.pow(COIN_DECIMALS as u32));
    }

    #[test]
    fn breaker_threshold_is_a_ratio() {
        assert!(BREAKER_FAILURE_RATE_BPS < BPS_DENOMINATOR);
    }
}
