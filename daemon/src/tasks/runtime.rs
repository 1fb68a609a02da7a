use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, error, trace, warn};
use metrics::counter;
use rand::Rng;
use tokio::{
    select,
    sync::{watch, Mutex},
    task::JoinHandle,
    time::interval,
};

use meridian_common::{
    config::{
        DEFAULT_MAX_RETRIES, RETRY_DELAY_BASE_MS, RETRY_DELAY_CAP_MS, TASK_RESULT_RETENTION_SECS,
    },
    time::{get_current_time_in_millis, TimestampMillis},
};

use crate::core::{error::CoreError, storage::Storage};

use super::{Task, TaskError, TaskOutcome, TaskPayload, TaskQueue};

const SCHEDULER_TICK_MS: u64 = 500;

// Implemented by the node wiring; routes payloads to the owning engine.
// Handlers must be idempotent, delivery is at-least-once.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn handle(&self, payload: &TaskPayload) -> Result<(), CoreError>;
}

struct PeriodicSpec {
    payload: TaskPayload,
    interval: Duration,
    next_run: TimestampMillis,
}

// At-least-once task execution over the durable task store. Deferred tasks
// (SLA timers included) survive restarts; periodic beats re-register on boot.
pub struct TaskRuntime<S: Storage> {
    storage: Arc<S>,
    queue: Arc<TaskQueue>,
    in_flight: Mutex<HashSet<u64>>,
    periodics: Mutex<Vec<PeriodicSpec>>,
    workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl<S: Storage> TaskRuntime<S> {
    pub fn new(storage: Arc<S>, workers: usize) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            storage,
            queue: Arc::new(TaskQueue::new()),
            in_flight: Mutex::new(HashSet::new()),
            periodics: Mutex::new(Vec::new()),
            workers: workers.max(1),
            handles: Mutex::new(Vec::new()),
            shutdown,
        })
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    // Persist and enqueue for immediate execution
    pub async fn submit(&self, payload: TaskPayload) -> Result<u64, TaskError> {
        let now = get_current_time_in_millis();
        let task = self.build_task(payload, now).await?;
        let id = task.id;
        self.storage.put_task(&task).await?;
        self.in_flight.lock().await.insert(id);
        self.queue.push(task);
        Ok(id)
    }

    // Persist for execution at `run_at`; the scheduler picks it up when due.
    // This is the restart-safe home of SLA timers.
    pub async fn defer(
        &self,
        payload: TaskPayload,
        run_at: TimestampMillis,
    ) -> Result<u64, TaskError> {
        let mut task = self.build_task(payload, get_current_time_in_millis()).await?;
        task.run_at = run_at;
        let id = task.id;
        self.storage.put_task(&task).await?;
        trace!("deferred task {} '{}' until {}", id, task.payload.name(), run_at);
        Ok(id)
    }

    pub async fn cancel_ticket_tasks(&self, ticket_id: u64) -> Result<usize, TaskError> {
        Ok(self.storage.cancel_ticket_tasks(ticket_id).await?)
    }

    // Periodic beats re-register on every boot; only their payloads need to
    // be idempotent, not their phase
    pub async fn register_periodic(&self, payload: TaskPayload, every: Duration) {
        let next_run = get_current_time_in_millis() + every.as_millis() as u64;
        self.periodics.lock().await.push(PeriodicSpec {
            payload,
            interval: every,
            next_run,
        });
    }

    async fn build_task(
        &self,
        payload: TaskPayload,
        now: TimestampMillis,
    ) -> Result<Task, TaskError> {
        let id = self.storage.next_task_id().await?;
        Ok(Task {
            id,
            priority: payload.default_priority(),
            run_at: now,
            max_retries: DEFAULT_MAX_RETRIES,
            attempts: 0,
            created_at: now,
            payload,
        })
    }

    pub async fn start(self: &Arc<Self>, handler: Arc<dyn TaskHandler>) {
        let mut handles = self.handles.lock().await;

        // Scheduler: moves due tasks from the store into the dispatch queue
        {
            let zelf = Arc::clone(self);
            let mut shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let mut tick = interval(Duration::from_millis(SCHEDULER_TICK_MS));
                loop {
                    select! {
                        _ = tick.tick() => {
                            if let Err(e) = zelf.scheduler_pass().await {
                                error!("scheduler pass failed: {}", e);
                            }
                        },
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("task scheduler stopped");
            }));
        }

        // Workers
        for worker_id in 0..self.workers {
            let zelf = Arc::clone(self);
            let handler = Arc::clone(&handler);
            let mut shutdown = self.shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    select! {
                        task = zelf.queue.pop() => {
                            zelf.process(task, handler.as_ref()).await;
                        },
                        _ = shutdown.changed() => break,
                    }
                }
                debug!("task worker #{} stopped", worker_id);
            }));
        }
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let mut handles = self.handles.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }

    async fn scheduler_pass(&self) -> Result<(), TaskError> {
        let now = get_current_time_in_millis();

        // Fire periodic beats
        {
            let mut periodics = self.periodics.lock().await;
            for spec in periodics.iter_mut() {
                if now >= spec.next_run {
                    spec.next_run = now + spec.interval.as_millis() as u64;
                    let payload = spec.payload.clone();
                    if let Err(e) = self.submit(payload).await {
                        error!("failed to submit periodic task: {}", e);
                    }
                }
            }
        }

        // Promote due deferred tasks
        let due = self.storage.due_tasks(now).await?;
        if !due.is_empty() {
            let mut in_flight = self.in_flight.lock().await;
            for task in due {
                if in_flight.insert(task.id) {
                    trace!("promoting due task {} '{}'", task.id, task.payload.name());
                    self.queue.push(task);
                }
            }
        }
        Ok(())
    }

    async fn process(&self, mut task: Task, handler: &dyn TaskHandler) {
        // Redelivery check against retained results
        match self.storage.get_task_result(task.id).await {
            Ok(Some(outcome)) if outcome.success => {
                debug!("task {} already completed, dropping redelivery", task.id);
                let _ = self.storage.remove_task(task.run_at, task.id).await;
                self.in_flight.lock().await.remove(&task.id);
                return;
            }
            Err(e) => warn!("idempotency check for task {} failed: {}", task.id, e),
            _ => {}
        }

        let name = task.payload.name();
        let result = handler.handle(&task.payload).await;
        let now = get_current_time_in_millis();

        match result {
            Ok(()) => {
                counter!("meridian_tasks_completed").increment(1);
                let outcome = TaskOutcome {
                    finished_at: now,
                    success: true,
                    detail: None,
                };
                if let Err(e) = self.storage.put_task_result(task.id, &outcome).await {
                    warn!("failed to persist result of task {}: {}", task.id, e);
                }
                let _ = self.storage.remove_task(task.run_at, task.id).await;
            }
            Err(e) => {
                task.attempts += 1;
                if task.attempts > task.max_retries {
                    counter!("meridian_tasks_failed").increment(1);
                    error!(
                        "task {} '{}' exhausted {} retries: {}",
                        task.id, name, task.max_retries, e
                    );
                    let outcome = TaskOutcome {
                        finished_at: now,
                        success: false,
                        detail: Some(e.to_string()),
                    };
                    let _ = self.storage.put_task_result(task.id, &outcome).await;
                    let _ = self.storage.remove_task(task.run_at, task.id).await;
                } else {
                    let delay = retry_delay(task.attempts);
                    warn!(
                        "task {} '{}' failed (attempt {}/{}), retrying in {}ms: {}",
                        task.id, name, task.attempts, task.max_retries, delay, e
                    );
                    let _ = self.storage.remove_task(task.run_at, task.id).await;
                    task.run_at = now + delay;
                    if let Err(e) = self.storage.put_task(&task).await {
                        error!("failed to reschedule task {}: {}", task.id, e);
                    }
                }
            }
        }

        self.in_flight.lock().await.remove(&task.id);
    }

    // Daily retention pass over completed results
    pub async fn purge_stale_results(&self) -> Result<usize, TaskError> {
        let cutoff =
            get_current_time_in_millis().saturating_sub(TASK_RESULT_RETENTION_SECS * 1_000);
        Ok(self.storage.purge_task_results_before(cutoff).await?)
    }
}

// Exponential backoff with jitter, capped
fn retry_delay(attempt: u32) -> u64 {
    let base = RETRY_DELAY_BASE_MS.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(16));
    let capped = base.min(RETRY_DELAY_CAP_MS);
    let jitter = rand::thread_rng().gen_range(0..=RETRY_DELAY_BASE_MS / 2);
    capped + jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::SledStorage;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempdir::TempDir;

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(&self, _payload: &TaskPayload) -> Result<(), CoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                Err(CoreError::InvariantViolation("induced failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    async fn runtime_with(
        fail_first: u32,
    ) -> (Arc<TaskRuntime<SledStorage>>, Arc<CountingHandler>, TempDir) {
        let dir = TempDir::new("meridian-tasks").unwrap();
        let storage = Arc::new(SledStorage::open(dir.path()).unwrap());
        let runtime = TaskRuntime::new(storage, 2);
        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first,
        });
        runtime.start(handler.clone() as Arc<dyn TaskHandler>).await;
        (runtime, handler, dir)
    }

    #[tokio::test]
    async fn submitted_task_executes_once() {
        let (runtime, handler, _dir) = runtime_with(0).await;
        runtime.submit(TaskPayload::RiskIndicatorTick).await.unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        runtime.stop().await;
    }

    #[tokio::test]
    async fn failed_task_is_retried() {
        let (runtime, handler, _dir) = runtime_with(1).await;
        runtime.submit(TaskPayload::LiquidityCheckTick).await.unwrap();

        // first attempt fails, retry lands after the backoff base
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(handler.calls.load(Ordering::SeqCst) >= 2);
        runtime.stop().await;
    }

    #[tokio::test]
    async fn deferred_task_waits_for_due_time() {
        let (runtime, handler, _dir) = runtime_with(0).await;
        let run_at = get_current_time_in_millis() + 700;
        runtime
            .defer(TaskPayload::ForecastTick, run_at)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        runtime.stop().await;
    }

    #[tokio::test]
    async fn cancelled_sla_tasks_never_fire() {
        let (runtime, handler, _dir) = runtime_with(0).await;
        let run_at = get_current_time_in_millis() + 600;
        runtime
            .defer(TaskPayload::SlaWarning { ticket_id: 9 }, run_at)
            .await
            .unwrap();
        runtime
            .defer(TaskPayload::SlaDeadline { ticket_id: 9 }, run_at)
            .await
            .unwrap();

        let cancelled = runtime.cancel_ticket_tasks(9).await.unwrap();
        assert_eq!(cancelled, 2);

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        runtime.stop().await;
    }
}
