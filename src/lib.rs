//! RelayMQ – an in-process message dispatch core: named FIFO queues,
//! competing consumers, acknowledgment with redelivery and dead-lettering,
//! and request/reply over correlated messages.
//!
//! This crate exports
//!  * `core`        – messages, the queue store, the broker
//!  * `delivery`    – the worker pool that runs consumer callbacks
//!  * `client`      – the produce/consume facade
//!  * `integration` – persistence and payload-codec capabilities for callers
//!  * `config`      – TOML + environment runtime configuration

// ───────────────────────────────────────────────────────────
// Public modules
// ───────────────────────────────────────────────────────────
pub mod client;
pub mod config;
pub mod core;
pub mod delivery;
pub mod integration;
pub mod logging;

// ───────────────────────────────────────────────────────────
// Re-exports
// ───────────────────────────────────────────────────────────
pub use crate::client::Client;
pub use crate::config::{Config, ConfigError};
pub use crate::core::{
    Broker, BrokerConfig, BrokerError, BrokerResult, BrokerStats, ConsumeResult, Consumer,
    ConsumerError, CorrelationId, DispatchObserver, Message, MessageId, MessageState,
    NoopObserver, QueueName, RegistrationHandle, TracingObserver,
};
pub use crate::delivery::{DeliveryPool, PoolConfig};
