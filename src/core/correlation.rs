//! Request/response correlation.
//!
//! `request` parks on a oneshot receiver keyed by its correlation id. Replies
//! travel through the reply queue like any other message and are handed to
//! the waiter by [`ReplyConsumer`], which the broker registers on that queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::consumer::{ConsumeResult, Consumer};
use crate::core::message::{CorrelationId, Message};

#[derive(Debug, Default)]
pub struct Correlations {
    waiters: DashMap<CorrelationId, oneshot::Sender<Message>>,
    orphaned: AtomicU64,
}

impl Correlations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: CorrelationId) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(id, tx);
        rx
    }

    pub fn cancel(&self, id: &CorrelationId) {
        self.waiters.remove(id);
    }

    /// Cancels the waiter for `id` when the returned guard is dropped, however
    /// the waiting future ends.
    pub fn cancel_on_drop(&self, id: CorrelationId) -> WaiterGuard<'_> {
        WaiterGuard {
            correlations: self,
            id,
        }
    }

    /// Hands `reply` to the request waiting on its correlation id. Returns
    /// `false` for orphaned replies (no id, unknown id, or the requester has
    /// already given up).
    pub fn complete(&self, reply: Message) -> bool {
        let waiter = reply
            .correlation_id
            .as_ref()
            .and_then(|id| self.waiters.remove(id))
            .map(|(_, tx)| tx);

        let delivered = match waiter {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        };
        if !delivered {
            self.orphaned.fetch_add(1, Ordering::Relaxed);
        }
        delivered
    }

    pub fn waiting(&self) -> usize {
        self.waiters.len()
    }

    pub fn orphaned_total(&self) -> u64 {
        self.orphaned.load(Ordering::Relaxed)
    }
}

/// Removes a registered waiter on drop.
#[derive(Debug)]
pub struct WaiterGuard<'a> {
    correlations: &'a Correlations,
    id: CorrelationId,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.correlations.cancel(&self.id);
    }
}

/// Consumer bound to the reply queue. Orphaned replies are acknowledged and
/// dropped.
pub(crate) struct ReplyConsumer {
    correlations: Arc<Correlations>,
}

impl ReplyConsumer {
    pub(crate) fn new(correlations: Arc<Correlations>) -> Self {
        Self { correlations }
    }
}

impl Consumer for ReplyConsumer {
    fn consume(&self, message: Message) -> BoxFuture<'static, ConsumeResult> {
        let id = message.id;
        let correlation = message.correlation_id.clone();
        if self.correlations.complete(message) {
            debug!(message_id = %id, "reply matched");
        } else {
            warn!(
                message_id = %id,
                correlation_id = ?correlation,
                "discarding orphaned reply"
            );
        }
        async { Ok(()) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::QueueName;
    use bytes::Bytes;

    fn reply(correlation: Option<&str>, body: &'static str) -> Message {
        Message::new(
            QueueName::new("replies"),
            Bytes::from_static(body.as_bytes()),
            correlation.map(CorrelationId::from),
        )
    }

    #[tokio::test]
    async fn matching_reply_reaches_waiter() {
        let correlations = Correlations::new();
        let rx = correlations.register(CorrelationId::from("abc"));
        assert_eq!(correlations.waiting(), 1);

        assert!(correlations.complete(reply(Some("abc"), "pong")));
        let got = rx.await.expect("reply");
        assert_eq!(got.payload_str(), Some("pong"));
        assert_eq!(correlations.waiting(), 0);
    }

    #[test]
    fn mismatched_or_missing_id_is_orphaned() {
        let correlations = Correlations::new();
        let _rx = correlations.register(CorrelationId::from("abc"));

        assert!(!correlations.complete(reply(Some("other"), "pong")));
        assert!(!correlations.complete(reply(None, "pong")));
        assert_eq!(correlations.orphaned_total(), 2);
        assert_eq!(correlations.waiting(), 1);
    }

    #[test]
    fn reply_after_cancel_is_orphaned() {
        let correlations = Correlations::new();
        let id = CorrelationId::from("abc");
        let _rx = correlations.register(id.clone());
        correlations.cancel(&id);

        assert!(!correlations.complete(reply(Some("abc"), "late")));
        assert_eq!(correlations.orphaned_total(), 1);
    }

    #[test]
    fn dropped_guard_removes_waiter() {
        let correlations = Correlations::new();
        let id = CorrelationId::from("abc");
        let rx = correlations.register(id.clone());
        let guard = correlations.cancel_on_drop(id);
        assert_eq!(correlations.waiting(), 1);

        drop(rx);
        drop(guard);
        assert_eq!(correlations.waiting(), 0);
        assert!(!correlations.complete(reply(Some("abc"), "late")));
    }
}
