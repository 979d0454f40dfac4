//! Dispatch instrumentation hooks.
//!
//! The broker calls an injected [`DispatchObserver`] around every callback
//! invocation. [`TracingObserver`] logs entry and elapsed time at a chosen
//! level; [`NoopObserver`] does nothing.

use std::time::Duration;

use tracing::Level;

use crate::core::consumer::RegistrationHandle;
use crate::core::message::{MessageId, QueueName};

#[derive(Debug, Clone)]
pub struct DispatchInfo {
    pub queue: QueueName,
    pub message_id: MessageId,
    pub consumer: RegistrationHandle,
    /// Expired attempts before this one.
    pub delivery_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Acknowledged,
    Failed(String),
    TimedOut(Duration),
}

impl DispatchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DispatchOutcome::Acknowledged)
    }
}

pub trait DispatchObserver: Send + Sync + 'static {
    fn on_dispatch_start(&self, _info: &DispatchInfo) {}

    fn on_dispatch_end(&self, _info: &DispatchInfo, _outcome: &DispatchOutcome, _elapsed: Duration) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl DispatchObserver for NoopObserver {}

#[derive(Debug, Clone, Copy)]
pub struct TracingObserver {
    level: Level,
}

impl TracingObserver {
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    pub fn level(&self) -> Level {
        self.level
    }
}

impl Default for TracingObserver {
    fn default() -> Self {
        Self::new(Level::DEBUG)
    }
}

// `tracing` macros need the level at compile time.
macro_rules! event_at {
    ($level:expr, $($arg:tt)+) => {{
        let level = $level;
        if level == Level::ERROR {
            tracing::error!($($arg)+)
        } else if level == Level::WARN {
            tracing::warn!($($arg)+)
        } else if level == Level::INFO {
            tracing::info!($($arg)+)
        } else if level == Level::DEBUG {
            tracing::debug!($($arg)+)
        } else {
            tracing::trace!($($arg)+)
        }
    }};
}

impl DispatchObserver for TracingObserver {
    fn on_dispatch_start(&self, info: &DispatchInfo) {
        event_at!(
            self.level,
            queue = %info.queue,
            message_id = %info.message_id,
            consumer = %info.consumer,
            delivery_count = info.delivery_count,
            "entering dispatch"
        );
    }

    fn on_dispatch_end(&self, info: &DispatchInfo, outcome: &DispatchOutcome, elapsed: Duration) {
        event_at!(
            self.level,
            queue = %info.queue,
            message_id = %info.message_id,
            consumer = %info.consumer,
            outcome = ?outcome,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "leaving dispatch"
        );
    }
}

/// Parses `error|warn|info|debug|trace` (case-insensitive).
pub fn parse_level(raw: &str) -> Option<Level> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}
