use thiserror::Error;

use crate::core::message::MessageId;

/// Errors surfaced by the dispatch core.
///
/// Publisher-facing calls only ever return `InvalidArgument` or `Timeout`.
/// `DeliveryFailed` is reported to observers and recovered internally through
/// expiry and redelivery. Exhausting the delivery budget is not an error: the
/// message moves to `MessageState::Dead`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("request on queue '{queue}' timed out after {timeout_ms} ms")]
    Timeout { queue: String, timeout_ms: u64 },

    #[error("delivery of message {message_id} failed: {reason}")]
    DeliveryFailed {
        message_id: MessageId,
        reason: String,
    },
}

pub type BrokerResult<T> = Result<T, BrokerError>;
