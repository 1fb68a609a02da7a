use std::{collections::VecDeque, sync::Mutex};

use tokio::sync::Notify;

use super::{Task, TaskPriority};

struct Lanes {
    critical: VecDeque<Task>,
    high: VecDeque<Task>,
    normal: VecDeque<Task>,
    low: VecDeque<Task>,
}

impl Lanes {
    fn lane_mut(&mut self, priority: TaskPriority) -> &mut VecDeque<Task> {
        match priority {
            TaskPriority::Critical => &mut self.critical,
            TaskPriority::High => &mut self.high,
            TaskPriority::Normal => &mut self.normal,
            TaskPriority::Low => &mut self.low,
        }
    }
}

// In-memory dispatch queue in front of the workers: per-priority FIFO,
// higher priorities always drain first. Durability lives in the task store,
// not here.
pub struct TaskQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                critical: VecDeque::new(),
                high: VecDeque::new(),
                normal: VecDeque::new(),
                low: VecDeque::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, task: Task) {
        {
            let mut lanes = self.lanes.lock().expect("queue lock poisoned");
            lanes.lane_mut(task.priority).push_back(task);
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<Task> {
        let mut lanes = self.lanes.lock().expect("queue lock poisoned");
        for priority in TaskPriority::ALL {
            if let Some(task) = lanes.lane_mut(priority).pop_front() {
                return Some(task);
            }
        }
        None
    }

    // Blocks until a task is available
    pub async fn pop(&self) -> Task {
        loop {
            if let Some(task) = self.try_pop() {
                return task;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        let lanes = self.lanes.lock().expect("queue lock poisoned");
        lanes.critical.len() + lanes.high.len() + lanes.normal.len() + lanes.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::TaskPayload;

    fn task(id: u64, priority: TaskPriority) -> Task {
        Task {
            id,
            priority,
            payload: TaskPayload::RiskIndicatorTick,
            run_at: 0,
            max_retries: 3,
            attempts: 0,
            created_at: 0,
        }
    }

    #[test]
    fn priorities_drain_in_order() {
        let queue = TaskQueue::new();
        queue.push(task(1, TaskPriority::Low));
        queue.push(task(2, TaskPriority::Critical));
        queue.push(task(3, TaskPriority::Normal));
        queue.push(task(4, TaskPriority::Critical));

        let order: Vec<u64> = std::iter::from_fn(|| queue.try_pop()).map(|t| t.id).collect();
        assert_eq!(order, vec![2, 4, 3, 1]);
    }

    #[test]
    fn fifo_within_priority() {
        let queue = TaskQueue::new();
        for id in 0..5 {
            queue.push(task(id, TaskPriority::High));
        }
        let order: Vec<u64> = std::iter::from_fn(|| queue.try_pop()).map(|t| t.id).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn pop_waits_for_push() {
        let queue = std::sync::Arc::new(TaskQueue::new());
        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await.id })
        };
        tokio::task::yield_now().await;
        queue.push(task(7, TaskPriority::Normal));
        assert_eq!(popper.await.unwrap(), 7);
    }
}
