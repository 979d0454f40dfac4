use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::core::message::{Message, MessageId, MessageState, QueueName};

/// Identifies one dequeue of a message. A redelivery gets a fresh tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// A message handed out by `dequeue`, awaiting acknowledgment.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub tag: DeliveryTag,
    pub deadline: Instant,
}

/// Outcome of one expiry scan over a queue.
#[derive(Debug, Default)]
pub(crate) struct ExpiredBatch {
    pub requeued: usize,
    pub dead: Vec<Message>,
}

/// Counts for a single queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pending: usize,
    pub in_flight: usize,
    pub dead: usize,
}

#[derive(Debug)]
struct InFlightEntry {
    message: Message,
    tag: DeliveryTag,
    deadline: Instant,
}

#[derive(Debug)]
struct QueueInner {
    next_tag: u64,
    pending: VecDeque<Message>,
    inflight: HashMap<MessageId, InFlightEntry>,
    dead: VecDeque<Message>,
}

/// One named FIFO queue. Every mutation goes through the queue's own lock, so
/// operations on different queues never contend.
#[derive(Debug)]
pub struct Queue {
    name: QueueName,
    /// Set while the queue sits in the ready channel.
    scheduled: AtomicBool,
    inner: Mutex<QueueInner>,
}

impl Queue {
    pub(crate) fn new(name: QueueName) -> Self {
        Self {
            name,
            scheduled: AtomicBool::new(false),
            inner: Mutex::new(QueueInner {
                next_tag: 1,
                pending: VecDeque::new(),
                inflight: HashMap::new(),
                dead: VecDeque::new(),
            }),
        }
    }

    pub fn name(&self) -> &QueueName {
        &self.name
    }

    pub(crate) fn enqueue(&self, mut message: Message) -> MessageId {
        message.state = MessageState::Pending;
        let id = message.id;
        self.inner.lock().pending.push_back(message);
        id
    }

    pub(crate) fn dequeue(&self, now: Instant, ack_timeout: Duration) -> Option<Delivery> {
        let mut inner = self.inner.lock();
        let mut message = inner.pending.pop_front()?;
        message.state = MessageState::InFlight;

        let tag = DeliveryTag(inner.next_tag);
        inner.next_tag = inner.next_tag.wrapping_add(1);
        let deadline = now + ack_timeout;

        inner.inflight.insert(
            message.id,
            InFlightEntry {
                message: message.clone(),
                tag,
                deadline,
            },
        );

        Some(Delivery {
            message,
            tag,
            deadline,
        })
    }

    /// Removes an in-flight message regardless of which delivery it belongs to.
    pub(crate) fn acknowledge(&self, id: &MessageId) -> bool {
        self.inner.lock().inflight.remove(id).is_some()
    }

    /// Removes an in-flight message only if `tag` is still its current delivery.
    pub(crate) fn acknowledge_tagged(&self, id: &MessageId, tag: DeliveryTag) -> bool {
        let mut inner = self.inner.lock();
        match inner.inflight.get(id) {
            Some(entry) if entry.tag == tag => {
                inner.inflight.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Moves every in-flight message whose deadline has passed back to the
    /// pending tail, or out to the returned dead list once it has used up
    /// `max_deliveries` attempts.
    pub(crate) fn take_expired(&self, now: Instant, max_deliveries: u32) -> ExpiredBatch {
        let mut inner = self.inner.lock();

        let mut expired: Vec<(DeliveryTag, MessageId)> = inner
            .inflight
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, entry)| (entry.tag, *id))
            .collect();
        // Oldest delivery first keeps the requeue order stable.
        expired.sort_unstable_by_key(|(tag, _)| *tag);

        let mut batch = ExpiredBatch::default();
        for (_, id) in expired {
            let Some(entry) = inner.inflight.remove(&id) else {
                continue;
            };
            let mut message = entry.message;
            message.delivery_count = message.delivery_count.saturating_add(1);

            if message.delivery_count >= max_deliveries {
                message.state = MessageState::Dead;
                batch.dead.push(message);
            } else {
                message.state = MessageState::Pending;
                inner.pending.push_back(message);
                batch.requeued += 1;
            }
        }
        batch
    }

    pub(crate) fn push_dead(&self, mut message: Message) {
        message.state = MessageState::Dead;
        message.queue = self.name.clone();
        self.inner.lock().dead.push_back(message);
    }

    pub fn dead_letters(&self) -> Vec<Message> {
        self.inner.lock().dead.iter().cloned().collect()
    }

    pub(crate) fn drain_dead(&self) -> Vec<Message> {
        self.inner.lock().dead.drain(..).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn inflight_len(&self) -> usize {
        self.inner.lock().inflight.len()
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        QueueStats {
            pending: inner.pending.len(),
            in_flight: inner.inflight.len(),
            dead: inner.dead.len(),
        }
    }

    /// Current state of a message held by this queue, if any.
    pub fn state_of(&self, id: &MessageId) -> Option<MessageState> {
        let inner = self.inner.lock();
        if inner.inflight.contains_key(id) {
            Some(MessageState::InFlight)
        } else if inner.pending.iter().any(|m| m.id == *id) {
            Some(MessageState::Pending)
        } else if inner.dead.iter().any(|m| m.id == *id) {
            Some(MessageState::Dead)
        } else {
            None
        }
    }

    /// Returns `true` if the caller should announce this queue as ready.
    pub(crate) fn mark_scheduled(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn clear_scheduled(&self) {
        self.scheduled.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn message(queue: &Queue, body: &'static str) -> Message {
        Message::new(queue.name().clone(), Bytes::from_static(body.as_bytes()), None)
    }

    #[test]
    fn dequeue_is_fifo_and_marks_inflight() {
        let queue = Queue::new(QueueName::new("q"));
        let a = queue.enqueue(message(&queue, "a"));
        let b = queue.enqueue(message(&queue, "b"));

        let now = Instant::now();
        let first = queue.dequeue(now, TIMEOUT).expect("first");
        assert_eq!(first.message.id, a);
        assert_eq!(first.message.state, MessageState::InFlight);
        assert_eq!(first.deadline, now + TIMEOUT);
        assert_eq!(queue.state_of(&a), Some(MessageState::InFlight));
        assert_eq!(queue.state_of(&b), Some(MessageState::Pending));

        let second = queue.dequeue(now, TIMEOUT).expect("second");
        assert_eq!(second.message.id, b);
        assert_ne!(first.tag, second.tag);
        assert!(queue.dequeue(now, TIMEOUT).is_none());
    }

    #[test]
    fn acknowledge_twice_is_a_noop() {
        let queue = Queue::new(QueueName::new("q"));
        let id = queue.enqueue(message(&queue, "x"));
        queue.dequeue(Instant::now(), TIMEOUT).expect("delivery");

        assert!(queue.acknowledge(&id));
        assert!(!queue.acknowledge(&id));
        assert_eq!(queue.stats(), QueueStats::default());
    }

    #[test]
    fn stale_tag_cannot_acknowledge_redelivery() {
        let queue = Queue::new(QueueName::new("q"));
        let id = queue.enqueue(message(&queue, "x"));
        let now = Instant::now();
        let first = queue.dequeue(now, TIMEOUT).expect("first delivery");

        let batch = queue.take_expired(now + TIMEOUT, 5);
        assert_eq!(batch.requeued, 1);
        let second = queue.dequeue(now + TIMEOUT, TIMEOUT).expect("redelivery");
        assert_eq!(second.message.id, id);
        assert_eq!(second.message.delivery_count, 1);

        assert!(!queue.acknowledge_tagged(&id, first.tag));
        assert!(queue.acknowledge_tagged(&id, second.tag));
    }

    #[test]
    fn expired_message_goes_to_tail() {
        let queue = Queue::new(QueueName::new("q"));
        let a = queue.enqueue(message(&queue, "a"));
        let now = Instant::now();
        queue.dequeue(now, TIMEOUT).expect("a");
        let b = queue.enqueue(message(&queue, "b"));

        // Not yet due.
        assert_eq!(queue.take_expired(now, 5).requeued, 0);

        assert_eq!(queue.take_expired(now + TIMEOUT, 5).requeued, 1);
        let next = queue.dequeue(now + TIMEOUT, TIMEOUT).expect("b first");
        assert_eq!(next.message.id, b);
        let last = queue.dequeue(now + TIMEOUT, TIMEOUT).expect("a last");
        assert_eq!(last.message.id, a);
    }

    #[test]
    fn expired_batch_requeues_in_delivery_order() {
        let queue = Queue::new(QueueName::new("q"));
        let ids: Vec<MessageId> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|body| queue.enqueue(message(&queue, body)))
            .collect();
        let now = Instant::now();
        for _ in &ids {
            queue.dequeue(now, TIMEOUT).expect("delivery");
        }

        assert_eq!(queue.take_expired(now + TIMEOUT, 5).requeued, 4);
        let order: Vec<MessageId> = std::iter::from_fn(|| queue.dequeue(now + TIMEOUT, TIMEOUT))
            .map(|d| d.message.id)
            .collect();
        assert_eq!(order, ids);
    }

    #[test]
    fn exhausted_message_is_returned_dead() {
        let queue = Queue::new(QueueName::new("q"));
        let id = queue.enqueue(message(&queue, "x"));
        let mut now = Instant::now();

        for attempt in 1..=2 {
            queue.dequeue(now, TIMEOUT).expect("delivery");
            now += TIMEOUT;
            let batch = queue.take_expired(now, 3);
            assert_eq!(batch.requeued, 1, "attempt {attempt}");
        }

        queue.dequeue(now, TIMEOUT).expect("last delivery");
        now += TIMEOUT;
        let batch = queue.take_expired(now, 3);
        assert_eq!(batch.requeued, 0);
        assert_eq!(batch.dead.len(), 1);
        assert_eq!(batch.dead[0].id, id);
        assert_eq!(batch.dead[0].delivery_count, 3);
        assert_eq!(batch.dead[0].state, MessageState::Dead);
        assert_eq!(queue.state_of(&id), None);
    }

    #[test]
    fn scheduled_flag_deduplicates() {
        let queue = Queue::new(QueueName::new("q"));
        assert!(queue.mark_scheduled());
        assert!(!queue.mark_scheduled());
        queue.clear_scheduled();
        assert!(queue.mark_scheduled());
    }
}
