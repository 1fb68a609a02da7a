use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use primitive_types::H160;
use serde::Deserialize;

use meridian_common::{
    approval::{default_rules, ApprovalRule},
    chain::SendConstraints,
    config::{
        DEFAULT_APPROVAL_THRESHOLD, DEFAULT_CONFIRMATIONS, DEFAULT_LOGS_BATCH_SIZE,
        DEFAULT_MIN_REBALANCE_AMOUNT, DEFAULT_OVERDUE_DAYS_BACK, DEFAULT_POLLING_INTERVAL_MS,
    },
    fund::{default_tier_policy, TierPolicy},
    risk::{default_threshold_table, ThresholdTable},
};

use crate::node::NodeSettings;

// SECURITY: command endpoints can move funds through the approval path, so
// the default bind is loopback only. Expose deliberately, behind the gateway.
pub const DEFAULT_RPC_BIND_ADDRESS: &str = "127.0.0.1:8484";
pub const DEFAULT_STORAGE_PATH: &str = "meridian-db";

#[derive(Parser)]
#[clap(version, about = "Meridian off-chain control plane daemon")]
pub struct Config {
    // Chain endpoints
    #[clap(long, default_value = "http://127.0.0.1:8545")]
    pub chain_rpc_url: String,

    #[clap(long, default_value = "ws://127.0.0.1:8546")]
    pub chain_ws_url: String,

    // External key service signing writes on our behalf
    #[clap(long, default_value = "http://127.0.0.1:7766")]
    pub key_service_url: String,

    // Vault contract (hex address); also the default watched contract
    #[clap(long)]
    pub vault_contract: String,

    // Additional watched contracts (hex addresses)
    #[clap(long)]
    pub watched_contracts: Vec<String>,

    #[clap(long, default_value_t = 0)]
    pub genesis_block: u64,

    #[clap(long, default_value_t = DEFAULT_CONFIRMATIONS)]
    pub confirmations: u64,

    #[clap(long, default_value_t = DEFAULT_POLLING_INTERVAL_MS)]
    pub polling_interval_ms: u64,

    #[clap(long, default_value_t = DEFAULT_LOGS_BATCH_SIZE)]
    pub batch_size: u64,

    #[clap(long, default_value = DEFAULT_STORAGE_PATH)]
    pub storage_path: PathBuf,

    #[clap(long, default_value = DEFAULT_RPC_BIND_ADDRESS)]
    pub rpc_bind_address: String,

    // Prometheus exporter bind; disabled when unset
    #[clap(long)]
    pub prometheus_bind_address: Option<String>,

    // Stable identity used for leases; defaults to host:pid
    #[clap(long)]
    pub instance_id: Option<String>,

    #[clap(long)]
    pub task_workers: Option<usize>,

    #[clap(long, default_value_t = DEFAULT_MIN_REBALANCE_AMOUNT)]
    pub min_rebalance_amount: u128,

    #[clap(long, default_value_t = DEFAULT_APPROVAL_THRESHOLD)]
    pub approval_threshold: u128,

    // Signing caps mirrored from the key service policy
    #[clap(long, default_value_t = u128::MAX)]
    pub signer_per_tx_cap: u128,

    #[clap(long, default_value_t = u128::MAX)]
    pub signer_daily_cap: u128,

    #[clap(long, default_value_t = DEFAULT_OVERDUE_DAYS_BACK)]
    pub overdue_days_back: u32,

    // JSON file overriding the rule table, tier policy and risk thresholds
    #[clap(long)]
    pub config_file: Option<PathBuf>,

    #[clap(long, default_value = "info")]
    pub log_level: String,
}

// Optional file-based overrides; unknown keys are rejected
#[derive(Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    approval_rules: Option<Vec<ApprovalRule>>,
    #[serde(default)]
    tier_policy: Option<TierPolicy>,
    #[serde(default)]
    risk_thresholds: Option<ThresholdTable>,
}

impl Config {
    pub fn build_settings(&self) -> Result<NodeSettings> {
        let vault_contract = parse_address(&self.vault_contract)
            .context("invalid --vault-contract address")?;
        let mut contracts = vec![vault_contract];
        for raw in &self.watched_contracts {
            let address = parse_address(raw).context("invalid --watched-contracts address")?;
            if !contracts.contains(&address) {
                contracts.push(address);
            }
        }

        let file: FileConfig = match &self.config_file {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => FileConfig::default(),
        };

        let instance_id = self.instance_id.clone().unwrap_or_else(|| {
            format!(
                "{}:{}",
                hostname().unwrap_or_else(|| "meridian".to_string()),
                std::process::id()
            )
        });

        Ok(NodeSettings {
            contracts,
            vault_contract,
            genesis_block: self.genesis_block,
            confirmations: self.confirmations,
            polling_interval: Duration::from_millis(self.polling_interval_ms),
            batch_size: self.batch_size,
            instance_id,
            rules: file.approval_rules.unwrap_or_else(default_rules),
            policy: file.tier_policy.unwrap_or_else(default_tier_policy),
            thresholds: file.risk_thresholds.unwrap_or_else(default_threshold_table),
            min_rebalance_amount: self.min_rebalance_amount,
            approval_threshold: self.approval_threshold,
            constraints: SendConstraints {
                per_tx_cap: self.signer_per_tx_cap,
                daily_cap: self.signer_daily_cap,
            },
            overdue_days_back: self.overdue_days_back,
            task_workers: self.task_workers.unwrap_or_else(|| num_cpus::get().min(8)),
        })
    }
}

fn parse_address(raw: &str) -> Result<H160> {
    let trimmed = raw.trim_start_matches("0x");
    let bytes = hex::decode(trimmed).context("address is not valid hex")?;
    anyhow::ensure!(bytes.len() == 20, "address must be 20 bytes");
    Ok(H160::from_slice(&bytes))
}

fn hostname() -> Option<String> {
    std::env::var("HOSTNAME").ok()
}
