use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use log::trace;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tokio::time::timeout;

use meridian_common::config::RPC_DEADLINE_SECS;

use super::{CircuitBreaker, GatewayError};

const JSON_RPC_VERSION: &str = "2.0";

// JSON-RPC over HTTP with a per-call deadline and a shared circuit breaker.
// Every outcome feeds the breaker so a degraded endpoint trips quickly.
pub struct JsonRpcClient {
    client: reqwest::Client,
    url: String,
    deadline: Duration,
    breaker: CircuitBreaker,
    request_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(url: String) -> Self {
        Self::with(url, Duration::from_secs(RPC_DEADLINE_SECS))
    }

    pub fn with(url: String, deadline: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
            deadline,
            breaker: CircuitBreaker::new("rpc"),
            request_id: AtomicU64::new(0),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn call<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<R, GatewayError> {
        self.breaker.permit()?;
        let result = self.call_inner(method, params).await;
        self.breaker.record(result.is_ok());
        result
    }

    async fn call_inner<P: Serialize, R: DeserializeOwned>(
        &self,
        method: &str,
        params: &P,
    ) -> Result<R, GatewayError> {
        trace!("rpc call: {}", method);
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let body = json!({
            "jsonrpc": JSON_RPC_VERSION,
            "id": id,
            "method": method,
            "params": params,
        });

        let request = self.client.post(&self.url).json(&body).send();
        let response = match timeout(self.deadline, request).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_timeout() => return Err(GatewayError::RpcTimeout),
            Ok(Err(e)) => return Err(GatewayError::TransientRpc(e.to_string())),
            Err(_) => return Err(GatewayError::DeadlineExceeded),
        };

        if response.status().as_u16() == 429 {
            return Err(GatewayError::RpcRateLimited);
        }
        if response.status().is_server_error() {
            return Err(GatewayError::TransientRpc(format!(
                "server returned {}",
                response.status()
            )));
        }

        let envelope: Value = match timeout(self.deadline, response.json()).await {
            Ok(Ok(envelope)) => envelope,
            Ok(Err(e)) => return Err(GatewayError::InvalidResponse(e.to_string())),
            Err(_) => return Err(GatewayError::DeadlineExceeded),
        };

        if let Some(error) = envelope.get("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(GatewayError::Rpc { code, message });
        }

        let result = envelope
            .get("result")
            .ok_or_else(|| GatewayError::InvalidResponse("missing result".to_string()))?;
        serde_json::from_value(result.clone())
            .map_err(|e| GatewayError::InvalidResponse(e.to_string()))
    }
}
