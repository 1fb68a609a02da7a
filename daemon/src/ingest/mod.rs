mod queue;

pub use queue::*;

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use log::{debug, error, info, trace, warn};
use lru::LruCache;
use metrics::counter;
use primitive_types::H256;
use rand::Rng;
use thiserror::Error;
use tokio::{
    select,
    sync::{Mutex, Notify},
    task::JoinHandle,
    time::sleep,
};

use meridian_common::{
    chain::{BlockNumber, ChainEvent, ContractAddress, DecodeError, LogRecord},
    config::{
        CHECKPOINT_FLUSH_EVENTS, CHECKPOINT_FLUSH_INTERVAL_MS, DEDUP_TTL_SECONDS,
        GET_LOGS_MAX_ATTEMPTS, RISK_ALERT_COOLDOWN_SECS,
    },
    risk::{RiskEvent, RiskLevel},
    time::{get_current_time_in_millis, get_current_time_in_seconds},
};

use crate::{
    chain::{ChainGateway, GatewayError},
    core::{
        error::StorageError,
        storage::{Checkpoint, Storage},
    },
    notify::{Notifier, NotifyChannel, NotifyLevel},
    tasks::LeaseKeeper,
};

pub const INGEST_LEASE: &str = "event_ingestor";

// Hot-path cache in front of the persistent dedup set
const RECENT_EVENTS_CACHE_SIZE: usize = 4_096;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("reorg detected on {contract:x} at block {block}")]
    ReorgDetected {
        contract: ContractAddress,
        block: BlockNumber,
    },

    #[error("ingestor is halted, resync required")]
    Halted,
}

struct Cursor {
    last_block: BlockNumber,
    block_hash: Option<H256>,
    // events enqueued since this cursor was last persisted
    dirty_events: u64,
}

// Singleton event ingestion service. Owns checkpoint and dedup records under
// the ingest lease; delivers every confirmed event exactly once to the
// dispatcher queue in per-contract (block, log_index) order.
pub struct EventIngestor<S: Storage, G: ChainGateway> {
    storage: Arc<S>,
    gateway: Arc<G>,
    queue: Arc<EventQueue>,
    notifier: Arc<dyn Notifier>,
    contracts: Vec<ContractAddress>,
    genesis_block: BlockNumber,
    confirmations: u64,
    polling_interval: Duration,
    batch_size: u64,
    instance_id: String,
    // ReorgDetected or an operator action; only resync clears it
    halted: AtomicBool,
    reload_cursors: AtomicBool,
    observed_head: AtomicU64,
    // recently seen dedup keys, saving a store read when the subscription
    // and the poller deliver the same log back to back
    recent: StdMutex<LruCache<String, ()>>,
    wake: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Storage, G: ChainGateway> EventIngestor<S, G> {
    pub fn new(
        storage: Arc<S>,
        gateway: Arc<G>,
        queue: Arc<EventQueue>,
        notifier: Arc<dyn Notifier>,
        contracts: Vec<ContractAddress>,
        genesis_block: BlockNumber,
        confirmations: u64,
        polling_interval: Duration,
        batch_size: u64,
        instance_id: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            storage,
            gateway,
            queue,
            notifier,
            contracts,
            genesis_block,
            confirmations,
            polling_interval,
            batch_size,
            instance_id,
            halted: AtomicBool::new(false),
            reload_cursors: AtomicBool::new(false),
            observed_head: AtomicU64::new(0),
            recent: StdMutex::new(LruCache::new(
                NonZeroUsize::new(RECENT_EVENTS_CACHE_SIZE).expect("cache size is non-zero"),
            )),
            wake: Notify::new(),
            task: Mutex::new(None),
        })
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }

    // Operator-driven recovery: rewind every contract cursor and clear the
    // halt. Dedup markers and processed rows make the replay idempotent.
    pub async fn resync(&self, from_block: BlockNumber) -> Result<(), IngestError> {
        info!("resync requested from block {}", from_block);
        let now = get_current_time_in_millis();
        let last = from_block.saturating_sub(1);
        let hash = self.gateway.get_block_hash(last).await?;
        for contract in &self.contracts {
            self.storage
                .set_checkpoint(
                    contract,
                    &Checkpoint {
                        last_confirmed_block: last,
                        block_hash: hash.unwrap_or_else(H256::zero),
                        updated_at: now,
                    },
                )
                .await?;
        }
        self.halted.store(false, Ordering::SeqCst);
        self.reload_cursors.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        Ok(())
    }

    pub async fn start(self: &Arc<Self>) {
        let zelf = Arc::clone(self);
        *self.task.lock().await = Some(tokio::spawn(async move {
            loop {
                // Singleton: only the lease holder may advance checkpoints.
                // Losing the lease drops us back here to re-acquire.
                let lease = match LeaseKeeper::acquire(
                    Arc::clone(&zelf.storage),
                    INGEST_LEASE,
                    zelf.instance_id.clone(),
                )
                .await
                {
                    Ok(lease) => lease,
                    Err(e) => {
                        error!("failed to acquire ingest lease: {}", e);
                        sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                };

                // Returns on lease loss; loop back and contend for the lease
                // again as the replacement instance
                zelf.run_under_lease(&lease).await;
                lease.release().await;
            }
        }));
    }

    pub async fn stop(&self) {
        if let Some(handle) = self.task.lock().await.take() {
            handle.abort();
        }
    }

    async fn run_under_lease(self: &Arc<Self>, lease: &Arc<LeaseKeeper<S>>) {
        let mut cursors = match self.load_cursors().await {
            Ok(cursors) => cursors,
            Err(e) => {
                error!("failed to load checkpoints: {}", e);
                return;
            }
        };

        self.spawn_subscription().await;
        let mut last_flush = get_current_time_in_millis();

        loop {
            if !lease.is_held() {
                error!("ingest lease lost, stopping checkpoint advancement");
                return;
            }

            if self.reload_cursors.swap(false, Ordering::SeqCst) {
                match self.load_cursors().await {
                    Ok(reloaded) => cursors = reloaded,
                    Err(e) => error!("failed to reload checkpoints: {}", e),
                }
            }

            if !self.is_halted() {
                if let Err(e) = self.poll_pass(&mut cursors).await {
                    match e {
                        IngestError::ReorgDetected { contract, block } => {
                            self.enter_reorg_halt(contract, block).await;
                        }
                        e => warn!("poll pass failed: {}", e),
                    }
                }

                let now = get_current_time_in_millis();
                let dirty: u64 = cursors.values().map(|c| c.dirty_events).sum();
                if dirty >= CHECKPOINT_FLUSH_EVENTS
                    || now.saturating_sub(last_flush) >= CHECKPOINT_FLUSH_INTERVAL_MS
                {
                    if let Err(e) = self.flush_checkpoints(&mut cursors).await {
                        error!("checkpoint flush failed: {}", e);
                    } else {
                        last_flush = now;
                    }
                }
            }

            select! {
                _ = sleep(self.polling_interval) => {},
                _ = self.wake.notified() => {
                    trace!("ingestor woken early");
                },
            }
        }
    }

    async fn load_cursors(&self) -> Result<HashMap<ContractAddress, Cursor>, IngestError> {
        let mut cursors = HashMap::new();
        for contract in &self.contracts {
            let cursor = match self.storage.get_checkpoint(contract).await? {
                Some(checkpoint) => Cursor {
                    last_block: checkpoint.last_confirmed_block,
                    block_hash: Some(checkpoint.block_hash),
                    dirty_events: 0,
                },
                None => Cursor {
                    last_block: self.genesis_block,
                    block_hash: None,
                    dirty_events: 0,
                },
            };
            debug!("contract {:x} resumes from block {}", contract, cursor.last_block);
            cursors.insert(*contract, cursor);
        }
        Ok(cursors)
    }

    // The subscription is an optimization: confirmed pushes are processed
    // directly, anything else just wakes the poller early. Correctness always
    // rests on the poller.
    async fn spawn_subscription(self: &Arc<Self>) {
        let from = self.genesis_block;
        let mut receiver = match self.gateway.subscribe_logs(&self.contracts, from).await {
            Ok(receiver) => receiver,
            Err(e) => {
                warn!("log subscription unavailable, poller only: {}", e);
                return;
            }
        };

        let zelf = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(record) = receiver.recv().await {
                let head = zelf.observed_head.load(Ordering::SeqCst);
                if record.block_number + zelf.confirmations <= head && !zelf.is_halted() {
                    if let Err(e) = zelf.process_candidate(&record).await {
                        warn!("subscription candidate failed: {}", e);
                    }
                }
                zelf.wake.notify_one();
            }
            debug!("log subscription stream ended");
        });
    }

    async fn poll_pass(
        &self,
        cursors: &mut HashMap<ContractAddress, Cursor>,
    ) -> Result<(), IngestError> {
        let head = self.gateway.get_head().await?;
        self.observed_head.store(head, Ordering::SeqCst);
        let confirmed_head = head.saturating_sub(self.confirmations);

        for contract in &self.contracts {
            let cursor = cursors.get_mut(contract).expect("cursor exists");
            if confirmed_head <= cursor.last_block {
                continue;
            }

            // Reorg probe: the block we checkpointed must still be canonical
            if let Some(stored_hash) = cursor.block_hash {
                if stored_hash != H256::zero() {
                    if let Some(current) = self.gateway.get_block_hash(cursor.last_block).await? {
                        if current != stored_hash {
                            return Err(IngestError::ReorgDetected {
                                contract: *contract,
                                block: cursor.last_block,
                            });
                        }
                    }
                }
            }

            let from = cursor.last_block + 1;
            let to = confirmed_head.min(cursor.last_block + self.batch_size);
            let mut logs = self.fetch_logs_with_retry(contract, from, to).await?;
            logs.sort_by_key(|log| (log.block_number, log.log_index));

            for log in &logs {
                if self.process_candidate(log).await? {
                    cursor.dirty_events += 1;
                }
            }

            cursor.last_block = to;
            cursor.block_hash = self.gateway.get_block_hash(to).await?;
            // mark dirty even without events so the checkpoint still advances
            cursor.dirty_events = cursor.dirty_events.max(1);
        }

        Ok(())
    }

    async fn fetch_logs_with_retry(
        &self,
        contract: &ContractAddress,
        from: BlockNumber,
        to: BlockNumber,
    ) -> Result<Vec<LogRecord>, IngestError> {
        let mut attempt = 0u32;
        loop {
            match self.gateway.get_logs(&[*contract], from, to).await {
                Ok(logs) => return Ok(logs),
                Err(e) if e.is_transient() && attempt + 1 < GET_LOGS_MAX_ATTEMPTS => {
                    attempt += 1;
                    let backoff = 200u64.saturating_mul(1 << attempt.min(6));
                    let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
                    warn!(
                        "get_logs [{}, {}] failed (attempt {}/{}): {}",
                        from, to, attempt, GET_LOGS_MAX_ATTEMPTS, e
                    );
                    sleep(Duration::from_millis(backoff + jitter)).await;
                }
                Err(e) => {
                    self.alert_fetch_exhausted(&e).await;
                    return Err(e.into());
                }
            }
        }
    }

    async fn alert_fetch_exhausted(&self, error: &GatewayError) {
        let now = get_current_time_in_seconds();
        let cooldown = self
            .storage
            .get_alert_cooldown("ingest_get_logs")
            .await
            .ok()
            .flatten();
        if cooldown.map(|until| until > now).unwrap_or(false) {
            return;
        }
        let _ = self
            .storage
            .set_alert_cooldown("ingest_get_logs", now + RISK_ALERT_COOLDOWN_SECS)
            .await;
        self.notifier
            .notify(
                NotifyLevel::Critical,
                NotifyChannel::Ops,
                "event ingestion degraded",
                &format!("log fetch retries exhausted, advancement paused: {}", error),
            )
            .await;
    }

    // Decode, dedup and enqueue one candidate. Returns true when the event
    // was enqueued for dispatch.
    async fn process_candidate(&self, record: &LogRecord) -> Result<bool, IngestError> {
        let event = match ChainEvent::decode(record) {
            Ok(event) => event,
            Err(DecodeError::UnknownEvent(name)) => {
                // Never blocks the checkpoint
                warn!("unknown event '{}' at {}", name, record.event_id());
                counter!("meridian_events_unknown").increment(1);
                return Ok(false);
            }
            Err(e @ DecodeError::InvalidArgs { .. }) => {
                warn!("undecodable event at {}: {}", record.event_id(), e);
                counter!("meridian_events_undecodable").increment(1);
                return Ok(false);
            }
        };

        let key = record.event_id().dedup_key();
        if self
            .recent
            .lock()
            .expect("recent cache lock poisoned")
            .contains(&key)
        {
            trace!("dedup cache hit for {}", record.event_id());
            counter!("meridian_events_dedup_hits").increment(1);
            return Ok(false);
        }

        let fresh = self
            .storage
            .check_and_mark_dedup(&key, get_current_time_in_seconds(), DEDUP_TTL_SECONDS)
            .await?;
        if !fresh {
            trace!("dedup hit for {}", record.event_id());
            counter!("meridian_events_dedup_hits").increment(1);
            return Ok(false);
        }
        self.recent
            .lock()
            .expect("recent cache lock poisoned")
            .put(key, ());

        counter!("meridian_events_ingested").increment(1);
        self.queue.push(EventEnvelope {
            record: record.clone(),
            event,
        });
        Ok(true)
    }

    async fn flush_checkpoints(
        &self,
        cursors: &mut HashMap<ContractAddress, Cursor>,
    ) -> Result<(), IngestError> {
        let now = get_current_time_in_millis();
        for (contract, cursor) in cursors.iter_mut() {
            if cursor.dirty_events == 0 {
                continue;
            }
            self.storage
                .set_checkpoint(
                    contract,
                    &Checkpoint {
                        last_confirmed_block: cursor.last_block,
                        block_hash: cursor.block_hash.unwrap_or_else(H256::zero),
                        updated_at: now,
                    },
                )
                .await?;
            trace!(
                "checkpoint {:x} advanced to block {}",
                contract,
                cursor.last_block
            );
            cursor.dirty_events = 0;
        }
        Ok(())
    }

    // Halt-and-alert: no automatic reorg recovery, an operator must resync
    async fn enter_reorg_halt(&self, contract: ContractAddress, block: BlockNumber) {
        error!(
            "REORG DETECTED on contract {:x} at block {}, halting ingestion",
            contract, block
        );
        self.halted.store(true, Ordering::SeqCst);
        counter!("meridian_reorg_incidents").increment(1);

        let now = get_current_time_in_millis();
        if let Ok(id) = self.storage.next_risk_event_id().await {
            let _ = self
                .storage
                .append_risk_event(&RiskEvent {
                    id,
                    level: RiskLevel::Critical,
                    source: "ingestor".to_string(),
                    message: format!(
                        "reorg detected on {:x} at block {}, checkpoint frozen",
                        contract, block
                    ),
                    created_at: now,
                })
                .await;
        }
        self.notifier
            .notify(
                NotifyLevel::Critical,
                NotifyChannel::Ops,
                "reorg detected",
                &format!(
                    "contract {:x} block {} no longer canonical; ingestion halted until resync",
                    contract, block
                ),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chain::testing::MockChainGateway,
        core::storage::{CheckpointProvider, SledStorage},
        notify::LogNotifier,
    };
    use meridian_common::chain::TxHash;
    use serde_json::json;
    use tempdir::TempDir;

    fn contract() -> ContractAddress {
        ContractAddress::repeat_byte(0xaa)
    }

    fn log(block: BlockNumber, log_index: u32, name: &str, args: serde_json::Value) -> LogRecord {
        LogRecord {
            tx_hash: TxHash::from_low_u64_be(block as u64 * 1_000 + log_index as u64),
            log_index,
            block_number: block,
            block_time: 0,
            contract: contract(),
            topic0: H256::zero(),
            name: name.to_string(),
            args,
        }
    }

    fn deposit_log(block: BlockNumber, log_index: u32) -> LogRecord {
        log(
            block,
            log_index,
            "DepositProcessed",
            json!({
                "owner": "0x0101010101010101010101010101010101010101",
                "assets": "1000",
                "shares": "1000"
            }),
        )
    }

    async fn ingestor(
        gateway: Arc<MockChainGateway>,
        dir: &TempDir,
    ) -> Arc<EventIngestor<SledStorage, MockChainGateway>> {
        let storage = Arc::new(SledStorage::open(dir.path()).unwrap());
        EventIngestor::new(
            storage,
            gateway,
            Arc::new(EventQueue::new()),
            Arc::new(LogNotifier),
            vec![contract()],
            0,
            15,
            Duration::from_millis(50),
            1_000,
            "test-node".to_string(),
        )
    }

    #[tokio::test]
    async fn confirmation_boundary_is_respected() {
        let dir = TempDir::new("meridian-ingest").unwrap();
        let gateway = Arc::new(MockChainGateway::new());
        gateway.set_head(100);
        // block 85 == head - confirmations: accepted
        gateway.push_log(deposit_log(85, 0));
        // block 86 is one too fresh: deferred
        gateway.push_log(deposit_log(86, 0));

        let ingestor = ingestor(Arc::clone(&gateway), &dir).await;
        let mut cursors = ingestor.load_cursors().await.unwrap();
        ingestor.poll_pass(&mut cursors).await.unwrap();

        assert_eq!(ingestor.queue.len(), 1);
        let envelope = ingestor.queue.try_pop().unwrap();
        assert_eq!(envelope.record.block_number, 85);

        // once the head advances the deferred block is picked up
        gateway.set_head(101);
        ingestor.poll_pass(&mut cursors).await.unwrap();
        assert_eq!(ingestor.queue.len(), 1);
        assert_eq!(ingestor.queue.try_pop().unwrap().record.block_number, 86);
    }

    #[tokio::test]
    async fn duplicate_logs_are_dropped() {
        let dir = TempDir::new("meridian-ingest").unwrap();
        let gateway = Arc::new(MockChainGateway::new());
        gateway.set_head(100);
        gateway.push_log(deposit_log(50, 0));

        let ingestor = ingestor(Arc::clone(&gateway), &dir).await;
        let mut cursors = ingestor.load_cursors().await.unwrap();
        ingestor.poll_pass(&mut cursors).await.unwrap();
        assert_eq!(ingestor.queue.len(), 1);
        ingestor.queue.try_pop();

        // the same log re-observed is a dedup hit
        let again = ingestor.process_candidate(&deposit_log(50, 0)).await.unwrap();
        assert!(!again);
        assert!(ingestor.queue.is_empty());
    }

    #[tokio::test]
    async fn events_enqueue_in_block_then_log_order() {
        let dir = TempDir::new("meridian-ingest").unwrap();
        let gateway = Arc::new(MockChainGateway::new());
        gateway.set_head(100);
        gateway.push_log(deposit_log(40, 1));
        gateway.push_log(deposit_log(39, 0));
        gateway.push_log(deposit_log(40, 0));

        let ingestor = ingestor(Arc::clone(&gateway), &dir).await;
        let mut cursors = ingestor.load_cursors().await.unwrap();
        ingestor.poll_pass(&mut cursors).await.unwrap();

        let order: Vec<(BlockNumber, u32)> = std::iter::from_fn(|| ingestor.queue.try_pop())
            .map(|e| (e.record.block_number, e.record.log_index))
            .collect();
        assert_eq!(order, vec![(39, 0), (40, 0), (40, 1)]);
    }

    #[tokio::test]
    async fn checkpoint_is_non_decreasing_and_persisted() {
        let dir = TempDir::new("meridian-ingest").unwrap();
        let gateway = Arc::new(MockChainGateway::new());
        gateway.set_head(100);
        gateway.set_block_hash(85, H256::repeat_byte(1));
        gateway.push_log(deposit_log(50, 0));

        let ingestor = ingestor(Arc::clone(&gateway), &dir).await;
        let mut cursors = ingestor.load_cursors().await.unwrap();
        ingestor.poll_pass(&mut cursors).await.unwrap();
        ingestor.flush_checkpoints(&mut cursors).await.unwrap();

        let checkpoint = ingestor
            .storage
            .get_checkpoint(&contract())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.last_confirmed_block, 85);

        // nothing new: checkpoint stays put
        ingestor.poll_pass(&mut cursors).await.unwrap();
        ingestor.flush_checkpoints(&mut cursors).await.unwrap();
        let second = ingestor
            .storage
            .get_checkpoint(&contract())
            .await
            .unwrap()
            .unwrap();
        assert!(second.last_confirmed_block >= checkpoint.last_confirmed_block);
    }

    #[tokio::test]
    async fn reorg_halts_ingestion_until_resync() {
        let dir = TempDir::new("meridian-ingest").unwrap();
        let gateway = Arc::new(MockChainGateway::new());
        gateway.set_head(100);
        gateway.set_block_hash(85, H256::repeat_byte(1));

        let ingestor = ingestor(Arc::clone(&gateway), &dir).await;
        let mut cursors = ingestor.load_cursors().await.unwrap();
        ingestor.poll_pass(&mut cursors).await.unwrap();
        ingestor.flush_checkpoints(&mut cursors).await.unwrap();

        // the checkpointed block's hash changes: canonical chain moved
        gateway.set_block_hash(85, H256::repeat_byte(2));
        gateway.set_head(120);
        let result = ingestor.poll_pass(&mut cursors).await;
        assert!(matches!(result, Err(IngestError::ReorgDetected { block: 85, .. })));

        ingestor.enter_reorg_halt(contract(), 85).await;
        assert!(ingestor.is_halted());

        // operator resync rewinds and clears the halt
        gateway.set_block_hash(79, H256::repeat_byte(7));
        ingestor.resync(80).await.unwrap();
        assert!(!ingestor.is_halted());
        let checkpoint = ingestor
            .storage
            .get_checkpoint(&contract())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.last_confirmed_block, 79);
    }
}
