use std::{collections::VecDeque, sync::Mutex};

use tokio::sync::Notify;

use meridian_common::chain::{ChainEvent, EventPriority, LogRecord};

// One decoded, confirmed, deduplicated event on its way to the dispatcher
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub record: LogRecord,
    pub event: ChainEvent,
}

struct Lanes {
    critical: VecDeque<EventEnvelope>,
    high: VecDeque<EventEnvelope>,
    normal: VecDeque<EventEnvelope>,
}

// Priority queue between ingestor and dispatcher. Per-priority FIFO; the
// ingestor enqueues per contract in (block, log_index) order and the
// dispatcher's per-contract lanes keep that order through handling.
pub struct EventQueue {
    lanes: Mutex<Lanes>,
    notify: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                critical: VecDeque::new(),
                high: VecDeque::new(),
                normal: VecDeque::new(),
            }),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, envelope: EventEnvelope) {
        {
            let mut lanes = self.lanes.lock().expect("event queue lock poisoned");
            let lane = match envelope.event.priority() {
                EventPriority::Critical => &mut lanes.critical,
                EventPriority::High => &mut lanes.high,
                EventPriority::Normal => &mut lanes.normal,
            };
            lane.push_back(envelope);
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<EventEnvelope> {
        let mut lanes = self.lanes.lock().expect("event queue lock poisoned");
        lanes
            .critical
            .pop_front()
            .or_else(|| lanes.high.pop_front())
            .or_else(|| lanes.normal.pop_front())
    }

    pub async fn pop(&self) -> EventEnvelope {
        loop {
            if let Some(envelope) = self.try_pop() {
                return envelope;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        let lanes = self.lanes.lock().expect("event queue lock poisoned");
        lanes.critical.len() + lanes.high.len() + lanes.normal.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_common::chain::{ContractAddress, TxHash};
    use primitive_types::H256;
    use serde_json::json;

    fn envelope(name: &str, args: serde_json::Value, log_index: u32) -> EventEnvelope {
        let record = LogRecord {
            tx_hash: TxHash::repeat_byte(1),
            log_index,
            block_number: 5,
            block_time: 0,
            contract: ContractAddress::repeat_byte(9),
            topic0: H256::zero(),
            name: name.to_string(),
            args,
        };
        let event = ChainEvent::decode(&record).unwrap();
        EventEnvelope { record, event }
    }

    #[test]
    fn critical_events_jump_the_queue() {
        let queue = EventQueue::new();
        queue.push(envelope(
            "DepositProcessed",
            json!({
                "owner": "0x0101010101010101010101010101010101010101",
                "assets": "100",
                "shares": "100"
            }),
            0,
        ));
        queue.push(envelope("EmergencyModeChanged", json!({"enabled": true}), 1));

        assert_eq!(
            queue.try_pop().unwrap().event.name(),
            "EmergencyModeChanged"
        );
        assert_eq!(queue.try_pop().unwrap().event.name(), "DepositProcessed");
    }
}
