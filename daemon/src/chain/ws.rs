use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite_wasm::{connect, Message};

use meridian_common::{
    chain::{BlockNumber, ContractAddress, LogRecord},
    config::{WS_RECONNECT_BASE_MS, WS_RECONNECT_CAP_MS},
};

use super::GatewayError;

// Push-log subscription over WebSocket. Strictly an optimization: the poller
// remains the correctness path, so this task reconnects forever with
// exponential backoff and never gives up on behalf of the ingestor.
pub struct LogSubscription;

impl LogSubscription {
    // Spawns the subscription pump and returns the receiving half.
    // The channel closes only when the receiver is dropped.
    pub async fn open(
        ws_url: String,
        contracts: Vec<ContractAddress>,
        from_block: BlockNumber,
    ) -> Result<mpsc::Receiver<LogRecord>, GatewayError> {
        let (sender, receiver) = mpsc::channel(1024);

        tokio::spawn(async move {
            let mut backoff = WS_RECONNECT_BASE_MS;
            let mut resume_from = from_block;
            loop {
                match Self::pump(&ws_url, &contracts, resume_from, &sender).await {
                    Ok(last_seen) => {
                        // Clean close; resume where the stream stopped
                        resume_from = last_seen;
                        backoff = WS_RECONNECT_BASE_MS;
                    }
                    Err(e) => {
                        warn!("log subscription lost: {}", e);
                    }
                }

                if sender.is_closed() {
                    debug!("log subscription receiver dropped, stopping");
                    break;
                }

                tokio::time::sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(WS_RECONNECT_CAP_MS);
            }
        });

        Ok(receiver)
    }

    async fn pump(
        ws_url: &str,
        contracts: &[ContractAddress],
        from_block: BlockNumber,
        sender: &mpsc::Sender<LogRecord>,
    ) -> Result<BlockNumber, GatewayError> {
        info!("Opening log subscription from block {}", from_block);
        let mut stream = connect(ws_url)
            .await
            .map_err(|e| GatewayError::WebSocket(e.to_string()))?;

        let subscribe = json!({
            "method": "subscribe_logs",
            "params": {
                "contracts": contracts,
                "from_block": from_block,
            }
        });
        stream
            .send(Message::text(subscribe.to_string()))
            .await
            .map_err(|e| GatewayError::WebSocket(e.to_string()))?;

        let mut last_seen = from_block;
        while let Some(message) = stream.next().await {
            let message = message.map_err(|e| GatewayError::WebSocket(e.to_string()))?;
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                _ => continue,
            };

            let record: LogRecord = match serde_json::from_str(&text) {
                Ok(record) => record,
                Err(e) => {
                    // Skip malformed frames, the poller will pick the log up
                    error!("undecodable subscription frame: {}", e);
                    continue;
                }
            };

            last_seen = record.block_number;
            if sender.send(record).await.is_err() {
                debug!("subscription receiver closed");
                break;
            }
        }

        Ok(last_seen)
    }
}
