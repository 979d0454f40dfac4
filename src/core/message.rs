use bytes::Bytes;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Opaque unique message identifier, assigned at publish time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(Uuid);

impl MessageId {
    pub(crate) fn generate() -> Self {
        MessageId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Links a request to its eventual response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Fresh random correlation id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        CorrelationId(s.to_owned())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueName(String);

impl QueueName {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the dead-letter sibling of this queue.
    pub fn dead_letter_sibling(&self, suffix: &str) -> QueueName {
        QueueName(format!("{}{}", self.0, suffix))
    }
}

impl fmt::Display for QueueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for QueueName {
    fn from(s: &str) -> Self {
        QueueName(s.to_owned())
    }
}

impl From<String> for QueueName {
    fn from(s: String) -> Self {
        QueueName(s)
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Lifecycle of a message. `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageState {
    Pending,
    InFlight,
    /// Logical end state only. An acknowledged message is dropped from its
    /// queue at once, so no stored message carries it and
    /// [`Broker::message_state`](crate::Broker::message_state) reports `None`.
    Acknowledged,
    Dead,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub id: MessageId,
    pub queue: QueueName,
    pub correlation_id: Option<CorrelationId>,
    pub payload: Bytes,
    /// Expired delivery attempts so far; never decreases.
    pub delivery_count: u32,
    pub state: MessageState,
    /// Milliseconds since the UNIX epoch.
    pub published_at: u64,
}

impl Message {
    pub(crate) fn new(
        queue: QueueName,
        payload: Bytes,
        correlation_id: Option<CorrelationId>,
    ) -> Self {
        Self {
            id: MessageId::generate(),
            queue,
            correlation_id,
            payload,
            delivery_count: 0,
            state: MessageState::Pending,
            published_at: current_timestamp(),
        }
    }

    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_starts_pending_with_zero_deliveries() {
        let msg = Message::new(QueueName::new("orders"), Bytes::from_static(b"hi"), None);
        assert_eq!(msg.state, MessageState::Pending);
        assert_eq!(msg.delivery_count, 0);
        assert_eq!(msg.payload_str(), Some("hi"));
        assert!(msg.published_at > 0);
    }

    #[test]
    fn message_ids_are_unique() {
        let a = MessageId::generate();
        let b = MessageId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn dead_letter_sibling_appends_suffix() {
        let q = QueueName::new("orders");
        assert_eq!(q.dead_letter_sibling(".dlq").as_str(), "orders.dlq");
    }
}
