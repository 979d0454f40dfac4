pub mod broker;
pub mod consumer;
pub mod correlation;
pub mod error;
pub mod message;
pub mod observer;
pub mod queue;

pub use broker::{Broker, BrokerConfig, BrokerStats, Dispatch};
pub use consumer::{ConsumeResult, Consumer, ConsumerError, RegistrationHandle};
pub use error::{BrokerError, BrokerResult};
pub use message::{CorrelationId, Message, MessageId, MessageState, QueueName};
pub use observer::{DispatchInfo, DispatchObserver, DispatchOutcome, NoopObserver, TracingObserver};
pub use queue::{QueueStats, QueueStore};
