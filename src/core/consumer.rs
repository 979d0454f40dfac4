//! Consumer registrations and competing-consumer selection.
//!
//! Each queue keeps its registrations in registration order. Selecting a
//! consumer claims the earliest-registered idle one with a compare-and-swap on
//! its `busy` flag, so a consumer never runs two dispatches at once.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use thiserror::Error;

use crate::core::message::{Message, QueueName};

/// Error returned by a consumer callback. The delivery is treated as failed
/// and the message is redelivered after its acknowledgment deadline.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct ConsumerError(String);

impl ConsumerError {
    pub fn new<S: Into<String>>(reason: S) -> Self {
        Self(reason.into())
    }
}

impl From<String> for ConsumerError {
    fn from(reason: String) -> Self {
        Self(reason)
    }
}

impl From<&str> for ConsumerError {
    fn from(reason: &str) -> Self {
        Self(reason.to_owned())
    }
}

pub type ConsumeResult = Result<(), ConsumerError>;

/// Caller-supplied message handler.
///
/// Any `Fn(Message) -> impl Future<Output = ConsumeResult>` closure is a
/// `Consumer`.
pub trait Consumer: Send + Sync + 'static {
    fn consume(&self, message: Message) -> BoxFuture<'static, ConsumeResult>;
}

impl<F, Fut> Consumer for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ConsumeResult> + Send + 'static,
{
    fn consume(&self, message: Message) -> BoxFuture<'static, ConsumeResult> {
        (self)(message).boxed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationHandle(u64);

impl RegistrationHandle {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegistrationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

pub struct Registration {
    handle: RegistrationHandle,
    queue: QueueName,
    consumer: Arc<dyn Consumer>,
    registered_at: Instant,
    busy: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("handle", &self.handle)
            .field("queue", &self.queue)
            .field("registered_at", &self.registered_at)
            .field("busy", &self.busy.load(Ordering::Relaxed))
            .finish()
    }
}

impl Registration {
    pub fn handle(&self) -> RegistrationHandle {
        self.handle
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn registered_at(&self) -> Instant {
        self.registered_at
    }

    pub fn consumer(&self) -> &Arc<dyn Consumer> {
        &self.consumer
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn try_claim(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.busy.store(false, Ordering::Release);
    }

    /// Returns the failure streak including this failure.
    pub(crate) fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub(crate) fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
    }
}

fn same_consumer(a: &Arc<dyn Consumer>, b: &Arc<dyn Consumer>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    by_queue: RwLock<HashMap<QueueName, Vec<Arc<Registration>>>>,
    handles: RwLock<HashMap<RegistrationHandle, Arc<Registration>>>,
    next_handle: AtomicU64,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `consumer` on `queue`. Registering the same consumer handle
    /// twice on a queue returns the existing registration.
    pub fn register(&self, queue: &QueueName, consumer: Arc<dyn Consumer>) -> RegistrationHandle {
        let mut by_queue = self.by_queue.write();
        let list = by_queue.entry(queue.clone()).or_default();

        if let Some(existing) = list.iter().find(|r| same_consumer(&r.consumer, &consumer)) {
            return existing.handle;
        }

        let handle = RegistrationHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1);
        let registration = Arc::new(Registration {
            handle,
            queue: queue.clone(),
            consumer,
            registered_at: Instant::now(),
            busy: AtomicBool::new(false),
            consecutive_failures: AtomicU32::new(0),
        });
        list.push(registration.clone());
        self.handles.write().insert(handle, registration);
        handle
    }

    /// Removes a registration. Dispatches already handed to it run on.
    pub fn unregister(&self, handle: RegistrationHandle) -> Option<Arc<Registration>> {
        let registration = self.handles.write().remove(&handle)?;
        let mut by_queue = self.by_queue.write();
        if let Some(list) = by_queue.get_mut(&registration.queue) {
            list.retain(|r| r.handle != handle);
            if list.is_empty() {
                by_queue.remove(&registration.queue);
            }
        }
        Some(registration)
    }

    /// Claims the earliest-registered idle consumer on `queue`.
    pub fn claim_idle(&self, queue: &QueueName) -> Option<Arc<Registration>> {
        let by_queue = self.by_queue.read();
        by_queue
            .get(queue)?
            .iter()
            .find(|r| r.try_claim())
            .cloned()
    }

    pub fn get(&self, handle: RegistrationHandle) -> Option<Arc<Registration>> {
        self.handles.read().get(&handle).cloned()
    }

    pub fn has_consumers(&self, queue: &QueueName) -> bool {
        self.by_queue
            .read()
            .get(queue)
            .is_some_and(|list| !list.is_empty())
    }

    pub fn consumers_on(&self, queue: &QueueName) -> Vec<RegistrationHandle> {
        self.by_queue
            .read()
            .get(queue)
            .map(|list| list.iter().map(|r| r.handle).collect())
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.handles.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Arc<dyn Consumer> {
        Arc::new(|_msg: Message| async { Ok::<(), ConsumerError>(()) })
    }

    #[test]
    fn same_callback_registers_once() {
        let registry = ConsumerRegistry::new();
        let queue = QueueName::new("q");
        let consumer = noop();

        let a = registry.register(&queue, consumer.clone());
        let b = registry.register(&queue, consumer);
        assert_eq!(a, b);
        assert_eq!(registry.count(), 1);

        let c = registry.register(&queue, noop());
        assert_ne!(a, c);
        assert_eq!(registry.consumers_on(&queue), vec![a, c]);
    }

    #[test]
    fn earliest_idle_consumer_wins() {
        let registry = ConsumerRegistry::new();
        let queue = QueueName::new("q");
        let first = registry.register(&queue, noop());
        let second = registry.register(&queue, noop());

        let claimed = registry.claim_idle(&queue).expect("first idle");
        assert_eq!(claimed.handle(), first);

        let next = registry.claim_idle(&queue).expect("second idle");
        assert_eq!(next.handle(), second);

        assert!(registry.claim_idle(&queue).is_none());

        claimed.release();
        assert_eq!(registry.claim_idle(&queue).map(|r| r.handle()), Some(first));
    }

    #[test]
    fn unregister_unknown_handle_is_none() {
        let registry = ConsumerRegistry::new();
        let queue = QueueName::new("q");
        let handle = registry.register(&queue, noop());

        assert!(registry.unregister(handle).is_some());
        assert!(registry.unregister(handle).is_none());
        assert!(!registry.has_consumers(&queue));
        assert!(registry.claim_idle(&queue).is_none());
    }

    #[test]
    fn failure_streak_resets_on_success() {
        let registry = ConsumerRegistry::new();
        let queue = QueueName::new("q");
        let handle = registry.register(&queue, noop());
        let reg = registry.get(handle).expect("registered");

        assert_eq!(reg.record_failure(), 1);
        assert_eq!(reg.record_failure(), 2);
        reg.record_success();
        assert_eq!(reg.record_failure(), 1);
    }
}
