//! Queue Store.
//!
//! Named FIFO queues holding pending messages, the in-flight set awaiting
//! acknowledgment and each queue's dead letters. Queues are created on first
//! use and live for the lifetime of the store.
//!
//! Locking:
//! - the queue map and the message-location index are `DashMap`s
//! - each `Queue` serialises its own mutations behind a mutex, so
//!   `enqueue`, `dequeue`, `acknowledge` and the expiry scan on one queue
//!   never interleave, while different queues proceed independently

pub mod fifo;

pub use fifo::{Delivery, DeliveryTag, Queue, QueueStats};

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::core::message::{Message, MessageId, MessageState, QueueName};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a dequeued message may stay unacknowledged.
    pub ack_timeout: Duration,
    /// Delivery attempts before a message is dead-lettered.
    pub max_deliveries: u32,
    pub dead_letter_suffix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(30),
            max_deliveries: 5,
            dead_letter_suffix: ".dlq".to_string(),
        }
    }
}

/// What a call to [`QueueStore::requeue_expired`] changed.
#[derive(Debug, Default)]
pub struct RequeueReport {
    /// Queues that received messages back on their pending tail.
    pub requeued: Vec<QueueName>,
    pub requeued_messages: usize,
    pub dead_lettered: Vec<MessageId>,
}

#[derive(Debug)]
pub struct QueueStore {
    config: StoreConfig,
    queues: DashMap<QueueName, Arc<Queue>>,
    /// Message id → queue currently holding it.
    locations: DashMap<MessageId, QueueName>,
}

impl QueueStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            queues: DashMap::new(),
            locations: DashMap::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn get(&self, name: &QueueName) -> Option<Arc<Queue>> {
        self.queues.get(name).map(|entry| Arc::clone(&*entry))
    }

    pub fn get_or_create(&self, name: &QueueName) -> Arc<Queue> {
        if let Some(existing) = self.queues.get(name) {
            return Arc::clone(&*existing);
        }

        // Insert only if not already present (handles race)
        let entry = self.queues.entry(name.clone()).or_insert_with(|| {
            debug!(queue = %name, "creating queue");
            Arc::new(Queue::new(name.clone()))
        });
        Arc::clone(&*entry)
    }

    /// Appends `message` to the pending tail of `name`, creating the queue if
    /// needed.
    pub fn enqueue(&self, name: &QueueName, mut message: Message) -> MessageId {
        let queue = self.get_or_create(name);
        message.queue = name.clone();
        let id = message.id;
        self.locations.insert(id, name.clone());
        queue.enqueue(message)
    }

    /// Pops the head of `name` and marks it in flight until now + ack timeout.
    pub fn dequeue(&self, name: &QueueName) -> Option<Delivery> {
        self.get(name)?
            .dequeue(Instant::now(), self.config.ack_timeout)
    }

    /// Acknowledges an in-flight message by id. Unknown or already
    /// acknowledged ids return `false`.
    pub fn acknowledge(&self, id: &MessageId) -> bool {
        let Some(name) = self.locations.get(id).map(|entry| entry.value().clone()) else {
            return false;
        };
        let acked = self.get(&name).is_some_and(|queue| queue.acknowledge(id));
        if acked {
            self.locations.remove(id);
        }
        acked
    }

    /// Acknowledges `delivery` only if it is still the message's current
    /// delivery; a stale delivery whose message was already redelivered
    /// returns `false`.
    pub fn acknowledge_delivery(&self, delivery: &Delivery) -> bool {
        let id = delivery.message.id;
        let acked = self
            .get(&delivery.message.queue)
            .is_some_and(|queue| queue.acknowledge_tagged(&id, delivery.tag));
        if acked {
            self.locations.remove(&id);
        }
        acked
    }

    /// Returns overdue in-flight messages to their queue's tail, or moves
    /// them to the dead-letter sibling once their delivery budget is spent.
    pub fn requeue_expired(&self, now: Instant) -> RequeueReport {
        // Snapshot first: dead-lettering inserts into `queues`.
        let queues: Vec<Arc<Queue>> = self
            .queues
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut report = RequeueReport::default();
        for queue in queues {
            let batch = queue.take_expired(now, self.config.max_deliveries);
            if batch.requeued > 0 {
                report.requeued_messages += batch.requeued;
                report.requeued.push(queue.name().clone());
            }
            if batch.dead.is_empty() {
                continue;
            }

            let sibling = queue
                .name()
                .dead_letter_sibling(&self.config.dead_letter_suffix);
            let dead_queue = self.get_or_create(&sibling);
            for message in batch.dead {
                warn!(
                    queue = %queue.name(),
                    message_id = %message.id,
                    deliveries = message.delivery_count,
                    "message dead-lettered"
                );
                self.locations.insert(message.id, sibling.clone());
                report.dead_lettered.push(message.id);
                dead_queue.push_dead(message);
            }
        }
        report
    }

    /// Dead messages of `name`, read from its dead-letter sibling.
    pub fn dead_letters(&self, name: &QueueName) -> Vec<Message> {
        let sibling = name.dead_letter_sibling(&self.config.dead_letter_suffix);
        self.get(&sibling)
            .map(|queue| queue.dead_letters())
            .unwrap_or_default()
    }

    pub fn drain_dead_letters(&self, name: &QueueName) -> Vec<Message> {
        let sibling = name.dead_letter_sibling(&self.config.dead_letter_suffix);
        let drained = self
            .get(&sibling)
            .map(|queue| queue.drain_dead())
            .unwrap_or_default();
        for message in &drained {
            self.locations.remove(&message.id);
        }
        drained
    }

    pub fn state_of(&self, id: &MessageId) -> Option<MessageState> {
        let name = self.locations.get(id).map(|entry| entry.value().clone())?;
        self.get(&name)?.state_of(id)
    }

    pub fn pending_len(&self, name: &QueueName) -> usize {
        self.get(name).map_or(0, |queue| queue.pending_len())
    }

    pub fn queue_stats(&self, name: &QueueName) -> Option<QueueStats> {
        self.get(name).map(|queue| queue.stats())
    }

    /// Queues that currently hold pending messages.
    pub fn non_empty_queues(&self) -> Vec<QueueName> {
        self.queues
            .iter()
            .filter(|entry| entry.value().pending_len() > 0)
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    pub fn totals(&self) -> QueueStats {
        self.queues
            .iter()
            .map(|entry| entry.value().stats())
            .fold(QueueStats::default(), |acc, s| QueueStats {
                pending: acc.pending + s.pending,
                in_flight: acc.in_flight + s.in_flight,
                dead: acc.dead + s.dead,
            })
    }
}

impl Default for QueueStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}
