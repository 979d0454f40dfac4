//! Broker.
//!
//! The single write entry point for new messages, the owner of consumer
//! registrations and the place where request/response pairs are correlated.
//!
//! The broker itself never runs callbacks. It hands out [`Dispatch`]es
//! (one message, one claimed consumer) through [`Broker::next_dispatch`] and
//! takes them back with [`Broker::complete`]; the delivery pool drives that
//! loop. Queues with dispatchable work are announced on a ready channel, with
//! a per-queue flag so each queue is queued at most once.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::core::consumer::{Consumer, ConsumerRegistry, Registration, RegistrationHandle};
use crate::core::correlation::{Correlations, ReplyConsumer};
use crate::core::error::{BrokerError, BrokerResult};
use crate::core::message::{CorrelationId, Message, MessageId, MessageState, QueueName};
use crate::core::observer::{DispatchInfo, DispatchObserver, DispatchOutcome, TracingObserver};
use crate::core::queue::{Delivery, QueueStats, QueueStore, RequeueReport, StoreConfig};

pub const MAX_QUEUE_NAME_LEN: usize = 255;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Redelivery timeout for unacknowledged messages.
    pub ack_timeout: Duration,
    /// Delivery attempts before a message is dead-lettered.
    pub max_deliveries: u32,
    pub dead_letter_suffix: String,
    /// Implicit channel carrying replies to `request`.
    pub reply_queue: String,
    /// Consecutive failed dispatches before a consumer is evicted; 0 disables.
    pub consumer_failure_limit: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(30),
            max_deliveries: 5,
            dead_letter_suffix: ".dlq".to_string(),
            reply_queue: "relaymq.replies".to_string(),
            consumer_failure_limit: 0,
        }
    }
}

impl BrokerConfig {
    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            ack_timeout: self.ack_timeout,
            max_deliveries: self.max_deliveries,
            dead_letter_suffix: self.dead_letter_suffix.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub queues: usize,
    pub pending: usize,
    pub in_flight: usize,
    pub dead: usize,
    pub consumers: usize,
    pub waiting_requests: usize,
    pub published_total: u64,
    pub acknowledged_total: u64,
    pub failed_total: u64,
    pub redelivered_total: u64,
    pub dead_lettered_total: u64,
    pub orphaned_replies: u64,
}

/// One message handed to one claimed consumer.
#[derive(Debug)]
pub struct Dispatch {
    delivery: Delivery,
    registration: Arc<Registration>,
}

impl Dispatch {
    pub fn message(&self) -> &Message {
        &self.delivery.message
    }

    pub fn consumer(&self) -> &Arc<dyn Consumer> {
        self.registration.consumer()
    }

    pub fn handle(&self) -> RegistrationHandle {
        self.registration.handle()
    }

    /// Acknowledgment deadline of this delivery.
    pub fn deadline(&self) -> Instant {
        self.delivery.deadline
    }

    pub fn info(&self) -> DispatchInfo {
        DispatchInfo {
            queue: self.delivery.message.queue.clone(),
            message_id: self.delivery.message.id,
            consumer: self.registration.handle(),
            delivery_count: self.delivery.message.delivery_count,
        }
    }
}

pub struct Broker {
    config: BrokerConfig,
    store: QueueStore,
    consumers: ConsumerRegistry,
    correlations: Arc<Correlations>,
    observer: Arc<dyn DispatchObserver>,
    ready_tx: flume::Sender<QueueName>,
    ready_rx: flume::Receiver<QueueName>,
    reply_queue: QueueName,
    reply_handle: RegistrationHandle,
    published_total: AtomicU64,
    acknowledged_total: AtomicU64,
    failed_total: AtomicU64,
    redelivered_total: AtomicU64,
    dead_lettered_total: AtomicU64,
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("config", &self.config)
            .field("queues", &self.store.queue_count())
            .field("consumers", &self.consumers.count())
            .finish_non_exhaustive()
    }
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver::default()))
    }

    pub fn with_observer(config: BrokerConfig, observer: Arc<dyn DispatchObserver>) -> Self {
        let store = QueueStore::new(config.store_config());
        let consumers = ConsumerRegistry::new();
        let correlations = Arc::new(Correlations::new());

        let reply_queue = QueueName::new(config.reply_queue.clone());
        store.get_or_create(&reply_queue);
        let reply_handle = consumers.register(
            &reply_queue,
            Arc::new(ReplyConsumer::new(correlations.clone())),
        );

        let (ready_tx, ready_rx) = flume::unbounded();

        Self {
            config,
            store,
            consumers,
            correlations,
            observer,
            ready_tx,
            ready_rx,
            reply_queue,
            reply_handle,
            published_total: AtomicU64::new(0),
            acknowledged_total: AtomicU64::new(0),
            failed_total: AtomicU64::new(0),
            redelivered_total: AtomicU64::new(0),
            dead_lettered_total: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn store(&self) -> &QueueStore {
        &self.store
    }

    pub fn observer(&self) -> &Arc<dyn DispatchObserver> {
        &self.observer
    }

    pub fn reply_queue(&self) -> &QueueName {
        &self.reply_queue
    }

    /// Checks that `name` is a usable, non-reserved queue name.
    pub fn validate_queue_name(&self, name: &str) -> BrokerResult<QueueName> {
        if name.is_empty() {
            return Err(BrokerError::InvalidArgument(
                "queue name must not be empty".to_string(),
            ));
        }
        if name.len() > MAX_QUEUE_NAME_LEN {
            return Err(BrokerError::InvalidArgument(format!(
                "queue name longer than {MAX_QUEUE_NAME_LEN} bytes"
            )));
        }
        if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(BrokerError::InvalidArgument(format!(
                "queue name '{}' contains whitespace or control characters",
                name.escape_debug()
            )));
        }
        if name == self.config.reply_queue || name.ends_with(&self.config.dead_letter_suffix) {
            return Err(BrokerError::InvalidArgument(format!(
                "queue name '{name}' is reserved"
            )));
        }
        Ok(QueueName::new(name))
    }

    /// Publishes `payload` to `queue`, creating the queue if needed.
    pub fn publish(
        &self,
        queue: &str,
        payload: Bytes,
        correlation_id: Option<CorrelationId>,
    ) -> BrokerResult<MessageId> {
        let name = self.validate_queue_name(queue)?;
        Ok(self.enqueue(name, payload, correlation_id))
    }

    #[tracing::instrument(level = "trace", skip(self, payload))]
    fn enqueue(
        &self,
        queue: QueueName,
        payload: Bytes,
        correlation_id: Option<CorrelationId>,
    ) -> MessageId {
        let message = Message::new(queue.clone(), payload, correlation_id);
        let id = self.store.enqueue(&queue, message);
        self.published_total.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %queue, message_id = %id, "published");
        self.signal(&queue);
        id
    }

    /// Registers `consumer` on `queue`. Registering the same `Arc` twice on
    /// one queue returns the existing handle.
    pub fn register_consumer(
        &self,
        queue: &str,
        consumer: Arc<dyn Consumer>,
    ) -> BrokerResult<RegistrationHandle> {
        let name = self.validate_queue_name(queue)?;
        self.store.get_or_create(&name);
        let handle = self.consumers.register(&name, consumer);
        info!(queue = %name, consumer = %handle, "consumer registered");
        self.signal(&name);
        Ok(handle)
    }

    /// Removes a registration; `false` if the handle is unknown. Deliveries
    /// already running on it finish or expire normally.
    pub fn unregister_consumer(&self, handle: RegistrationHandle) -> bool {
        if handle == self.reply_handle {
            warn!(consumer = %handle, "refusing to unregister the reply channel consumer");
            return false;
        }
        match self.consumers.unregister(handle) {
            Some(registration) => {
                info!(queue = %registration.queue(), consumer = %handle, "consumer unregistered");
                true
            }
            None => false,
        }
    }

    /// Publishes `payload` with a fresh correlation id and waits for the
    /// matching reply. On timeout the request message stays queued and a
    /// reply arriving later is discarded.
    pub async fn request(
        &self,
        queue: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> BrokerResult<Bytes> {
        let name = self.validate_queue_name(queue)?;
        let correlation_id = CorrelationId::generate();
        let waiter = self.correlations.register(correlation_id.clone());
        // Covers callers that drop this future before it resolves.
        let _guard = self.correlations.cancel_on_drop(correlation_id.clone());
        self.enqueue(name.clone(), payload, Some(correlation_id.clone()));

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(reply)) => Ok(reply.payload),
            Ok(Err(_)) | Err(_) => {
                debug!(queue = %name, correlation_id = %correlation_id, "request timed out");
                Err(BrokerError::Timeout {
                    queue: name.to_string(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    /// Replies to `original` on the reply channel.
    pub fn reply(&self, original: &Message, payload: Bytes) -> BrokerResult<MessageId> {
        let correlation_id = original.correlation_id.clone().ok_or_else(|| {
            BrokerError::InvalidArgument(format!(
                "message {} carries no correlation id",
                original.id
            ))
        })?;
        Ok(self.reply_to(correlation_id, payload))
    }

    pub fn reply_to(&self, correlation_id: CorrelationId, payload: Bytes) -> MessageId {
        self.enqueue(self.reply_queue.clone(), payload, Some(correlation_id))
    }

    /// Acknowledges an in-flight message by id; `false` if unknown or
    /// already acknowledged.
    pub fn acknowledge(&self, id: &MessageId) -> bool {
        let acked = self.store.acknowledge(id);
        if acked {
            self.acknowledged_total.fetch_add(1, Ordering::Relaxed);
        }
        acked
    }

    /// Pairs the head of `queue` with its earliest-registered idle consumer.
    pub fn next_dispatch(&self, queue: &QueueName) -> Option<Dispatch> {
        let target = self.store.get(queue)?;
        if target.pending_len() == 0 {
            return None;
        }
        let registration = self.consumers.claim_idle(queue)?;

        match self.store.dequeue(queue) {
            Some(delivery) => Some(Dispatch {
                delivery,
                registration,
            }),
            None => {
                registration.release();
                if target.pending_len() > 0 {
                    self.signal(queue);
                }
                None
            }
        }
    }

    /// Settles a dispatch. Success acknowledges the delivery; failure leaves
    /// the message in flight until its deadline so the expiry scan requeues
    /// it.
    pub fn complete(&self, dispatch: Dispatch, outcome: &DispatchOutcome) {
        let Dispatch {
            delivery,
            registration,
        } = dispatch;
        let queue = delivery.message.queue.clone();

        match outcome {
            DispatchOutcome::Acknowledged => {
                registration.record_success();
                if self.store.acknowledge_delivery(&delivery) {
                    self.acknowledged_total.fetch_add(1, Ordering::Relaxed);
                } else {
                    debug!(
                        queue = %queue,
                        message_id = %delivery.message.id,
                        "late success ignored, delivery no longer current"
                    );
                }
            }
            DispatchOutcome::Failed(reason) => {
                self.record_failure(&delivery, &registration, reason.clone());
            }
            DispatchOutcome::TimedOut(after) => {
                self.record_failure(
                    &delivery,
                    &registration,
                    format!("no result within {} ms", after.as_millis()),
                );
            }
        }

        registration.release();
        if self.store.pending_len(&queue) > 0 {
            self.signal(&queue);
        }
    }

    fn record_failure(&self, delivery: &Delivery, registration: &Registration, reason: String) {
        self.failed_total.fetch_add(1, Ordering::Relaxed);
        let error = BrokerError::DeliveryFailed {
            message_id: delivery.message.id,
            reason,
        };
        debug!(queue = %delivery.message.queue, consumer = %registration.handle(), %error);

        let streak = registration.record_failure();
        let limit = self.config.consumer_failure_limit;
        if limit > 0 && streak >= limit && registration.handle() != self.reply_handle {
            warn!(
                queue = %registration.queue(),
                consumer = %registration.handle(),
                failures = streak,
                "consumer failed health check, unregistering"
            );
            self.consumers.unregister(registration.handle());
        }
    }

    /// Requeues overdue in-flight messages and dead-letters exhausted ones.
    pub fn requeue_expired(&self, now: Instant) -> RequeueReport {
        let report = self.store.requeue_expired(now);
        self.redelivered_total
            .fetch_add(report.requeued_messages as u64, Ordering::Relaxed);
        self.dead_lettered_total
            .fetch_add(report.dead_lettered.len() as u64, Ordering::Relaxed);
        for queue in &report.requeued {
            self.signal(queue);
        }
        report
    }

    /// Periodic housekeeping: expiry scan, then re-announce every queue that
    /// has pending work and at least one consumer.
    pub fn maintenance_tick(&self, now: Instant) -> RequeueReport {
        let report = self.requeue_expired(now);
        for queue in self.store.non_empty_queues() {
            if self.consumers.has_consumers(&queue) {
                self.signal(&queue);
            }
        }
        report
    }

    pub(crate) fn signal(&self, queue: &QueueName) {
        let Some(target) = self.store.get(queue) else {
            return;
        };
        if target.mark_scheduled() && self.ready_tx.send(queue.clone()).is_err() {
            target.clear_scheduled();
        }
    }

    /// Clears the ready flag of `queue` before a worker inspects it, so any
    /// later state change announces it again.
    pub(crate) fn take_ready(&self, queue: &QueueName) {
        if let Some(target) = self.store.get(queue) {
            target.clear_scheduled();
        }
    }

    pub(crate) fn ready_receiver(&self) -> flume::Receiver<QueueName> {
        self.ready_rx.clone()
    }

    pub fn dead_letters(&self, queue: &str) -> Vec<Message> {
        self.store.dead_letters(&QueueName::new(queue))
    }

    pub fn drain_dead_letters(&self, queue: &str) -> Vec<Message> {
        self.store.drain_dead_letters(&QueueName::new(queue))
    }

    /// State of a message still held by the broker. `None` means the id is
    /// unknown, acknowledged, or drained from a dead-letter queue.
    pub fn message_state(&self, id: &MessageId) -> Option<MessageState> {
        self.store.state_of(id)
    }

    pub fn queue_stats(&self, queue: &str) -> BrokerResult<QueueStats> {
        self.store
            .queue_stats(&QueueName::new(queue))
            .ok_or_else(|| BrokerError::NotFound(format!("queue '{queue}'")))
    }

    pub fn consumers_on(&self, queue: &str) -> Vec<RegistrationHandle> {
        self.consumers.consumers_on(&QueueName::new(queue))
    }

    pub fn in_flight_count(&self) -> usize {
        self.store.totals().in_flight
    }

    pub fn stats(&self) -> BrokerStats {
        let totals = self.store.totals();
        BrokerStats {
            queues: self.store.queue_count(),
            pending: totals.pending,
            in_flight: totals.in_flight,
            dead: totals.dead,
            consumers: self.consumers.count(),
            waiting_requests: self.correlations.waiting(),
            published_total: self.published_total.load(Ordering::Relaxed),
            acknowledged_total: self.acknowledged_total.load(Ordering::Relaxed),
            failed_total: self.failed_total.load(Ordering::Relaxed),
            redelivered_total: self.redelivered_total.load(Ordering::Relaxed),
            dead_lettered_total: self.dead_lettered_total.load(Ordering::Relaxed),
            orphaned_replies: self.correlations.orphaned_total(),
        }
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}
