use async_trait::async_trait;

use meridian_common::time::TimestampMillis;

use crate::{
    core::{error::StorageError, storage::SledStorage},
    tasks::{Task, TaskOutcome},
};

// Deferred tasks keyed by run_at(8) || id(8) so the scheduler pops in due
// order. Restart-safe home of SLA timers and periodic beats.
fn task_key(run_at: TimestampMillis, id: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&run_at.to_be_bytes());
    key[8..].copy_from_slice(&id.to_be_bytes());
    key
}

#[async_trait]
pub trait TaskStoreProvider {
    async fn next_task_id(&self) -> Result<u64, StorageError>;

    async fn put_task(&self, task: &Task) -> Result<(), StorageError>;

    async fn remove_task(&self, run_at: TimestampMillis, id: u64) -> Result<(), StorageError>;

    // Tasks whose run_at has lapsed, in due order
    async fn due_tasks(&self, now: TimestampMillis) -> Result<Vec<Task>, StorageError>;

    // Best-effort cancellation of the SLA jobs of a resolved ticket
    async fn cancel_ticket_tasks(&self, ticket_id: u64) -> Result<usize, StorageError>;

    async fn put_task_result(&self, id: u64, outcome: &TaskOutcome) -> Result<(), StorageError>;

    async fn get_task_result(&self, id: u64) -> Result<Option<TaskOutcome>, StorageError>;

    async fn purge_task_results_before(
        &self,
        cutoff: TimestampMillis,
    ) -> Result<usize, StorageError>;
}

#[async_trait]
impl TaskStoreProvider for SledStorage {
    async fn next_task_id(&self) -> Result<u64, StorageError> {
        self.next_id("task_id")
    }

    async fn put_task(&self, task: &Task) -> Result<(), StorageError> {
        Self::put_encoded(&self.tasks, &task_key(task.run_at, task.id), task)
    }

    async fn remove_task(&self, run_at: TimestampMillis, id: u64) -> Result<(), StorageError> {
        self.tasks.remove(task_key(run_at, id))?;
        Ok(())
    }

    async fn due_tasks(&self, now: TimestampMillis) -> Result<Vec<Task>, StorageError> {
        let end = task_key(now, u64::MAX);
        let mut due = Vec::new();
        for entry in self.tasks.range(..=end.as_slice()) {
            let (_, value) = entry?;
            due.push(Self::decode(&value)?);
        }
        Ok(due)
    }

    async fn cancel_ticket_tasks(&self, ticket_id: u64) -> Result<usize, StorageError> {
        let mut cancelled = 0;
        for entry in self.tasks.iter() {
            let (key, value) = entry?;
            let task: Task = Self::decode(&value)?;
            if task.payload.ticket_id() == Some(ticket_id) {
                self.tasks.remove(key)?;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn put_task_result(&self, id: u64, outcome: &TaskOutcome) -> Result<(), StorageError> {
        Self::put_encoded(&self.task_results, &id.to_be_bytes(), outcome)
    }

    async fn get_task_result(&self, id: u64) -> Result<Option<TaskOutcome>, StorageError> {
        Self::get_decoded(&self.task_results, &id.to_be_bytes())
    }

    async fn purge_task_results_before(
        &self,
        cutoff: TimestampMillis,
    ) -> Result<usize, StorageError> {
        let mut purged = 0;
        for entry in self.task_results.iter() {
            let (key, value) = entry?;
            let outcome: TaskOutcome = Self::decode(&value)?;
            if outcome.finished_at < cutoff {
                self.task_results.remove(key)?;
                purged += 1;
            }
        }
        Ok(purged)
    }
}
