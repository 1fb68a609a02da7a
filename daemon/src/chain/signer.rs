use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use log::{debug, trace};
use serde_json::json;
use tokio::{sync::Mutex, time::timeout};

use meridian_common::{
    chain::{ChainCall, ContractAddress, SendConstraints, SignerRole, TxHash},
    config::{SECONDS_PER_DAY, SIGNER_DEADLINE_SECS},
    fund::Amount,
    time::get_current_time_in_seconds,
};

use super::GatewayError;

// Client for the external key service. Keys never touch this process: the
// service signs and broadcasts, we authorize per call and track caps
// client-side to fail fast before the round-trip.
pub struct SignerService {
    client: reqwest::Client,
    url: String,
    deadline: Duration,
    // One serialized lane per (contract, signer) to prevent nonce conflicts
    lanes: DashMap<(ContractAddress, SignerRole), Arc<Mutex<()>>>,
    // (utc day, spent) per signer role
    daily_spend: DashMap<SignerRole, (u64, Amount)>,
}

impl SignerService {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            deadline: Duration::from_secs(SIGNER_DEADLINE_SECS),
            lanes: DashMap::new(),
            daily_spend: DashMap::new(),
        }
    }

    // Serialization lane for a (contract, signer) pair
    pub fn lane(&self, contract: ContractAddress, signer: SignerRole) -> Arc<Mutex<()>> {
        self.lanes
            .entry((contract, signer))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // Client-side cap check mirroring the key service policy. The service
    // remains authoritative; this only avoids a doomed round-trip.
    pub fn authorize(
        &self,
        signer: SignerRole,
        amount: Amount,
        constraints: &SendConstraints,
    ) -> Result<(), GatewayError> {
        if amount > constraints.per_tx_cap {
            return Err(GatewayError::RejectedByPolicy(format!(
                "amount {} exceeds per-tx cap {}",
                amount, constraints.per_tx_cap
            )));
        }

        let today = get_current_time_in_seconds() / SECONDS_PER_DAY;
        let mut entry = self.daily_spend.entry(signer).or_insert((today, 0));
        let (day, spent) = *entry;
        let spent = if day == today { spent } else { 0 };

        let total = spent.saturating_add(amount);
        if total > constraints.daily_cap {
            return Err(GatewayError::RejectedByPolicy(format!(
                "daily cap {} exhausted for signer {}",
                constraints.daily_cap, signer
            )));
        }
        *entry = (today, total);
        Ok(())
    }

    // Sign and broadcast through the key service; returns the tx hash.
    // Receipt tracking is the gateway's job.
    pub async fn submit(
        &self,
        call: &ChainCall,
        signer: SignerRole,
    ) -> Result<TxHash, GatewayError> {
        trace!("submitting {} via {}", call.method, signer);
        let body = json!({
            "contract": call.contract,
            "method": call.method,
            "args": call.args,
            "signer": signer,
        });

        let request = self.client.post(&self.url).json(&body).send();
        let response = match timeout(self.deadline, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => return Err(GatewayError::RpcTimeout),
            Ok(Err(e)) => return Err(GatewayError::TransientRpc(e.to_string())),
            Err(_) => return Err(GatewayError::DeadlineExceeded),
        };

        match response.status().as_u16() {
            403 => {
                let reason = response.text().await.unwrap_or_default();
                return Err(GatewayError::RejectedByPolicy(reason));
            }
            409 => return Err(GatewayError::NonceExhausted),
            status if status >= 500 => {
                return Err(GatewayError::TransientRpc(format!(
                    "key service returned {}",
                    status
                )))
            }
            _ => {}
        }

        #[derive(serde::Deserialize)]
        struct SubmitResponse {
            tx_hash: TxHash,
        }

        let submitted: SubmitResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
        debug!("{} submitted as {:x}", call.method, submitted.tx_hash);
        Ok(submitted.tx_hash)
    }
}
