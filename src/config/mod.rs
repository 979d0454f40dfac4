//! TOML + environment configuration.
//!
//! Precedence: built-in defaults, then the file, then `RELAYMQ_*` variables.

use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::core::broker::BrokerConfig;
use crate::core::observer::parse_level;
use crate::delivery::PoolConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("config parse error: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BrokerSection {
    pub ack_timeout_ms: u64,
    pub max_deliveries: u32,
    pub dead_letter_suffix: String,
    pub reply_queue: String,
    pub consumer_failure_limit: u32,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 30_000,
            max_deliveries: 5,
            dead_letter_suffix: ".dlq".to_string(),
            reply_queue: "relaymq.replies".to_string(),
            consumer_failure_limit: 0,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DeliverySection {
    pub workers: usize,
    pub dispatch_timeout_ms: u64,
    pub maintenance_interval_ms: u64,
    pub drain_timeout_ms: u64,
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            workers: 4,
            dispatch_timeout_ms: 10_000,
            maintenance_interval_ms: 200,
            drain_timeout_ms: 2_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingSection {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Level of the per-dispatch entering/leaving lines.
    pub dispatch_level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dispatch_level: "debug".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerSection,
    pub delivery: DeliverySection,
    pub logging: LoggingSection,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Loads from `path`, else `RELAYMQ_CONFIG`, else defaults; then applies
    /// environment overrides and validates.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let env_path = env::var("RELAYMQ_CONFIG").ok();
        let effective_path = path.map(|s| s.to_string()).or(env_path);

        let mut config = match effective_path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse("RELAYMQ_ACK_TIMEOUT_MS")? {
            self.broker.ack_timeout_ms = v;
        }
        if let Some(v) = env_parse("RELAYMQ_MAX_DELIVERIES")? {
            self.broker.max_deliveries = v;
        }
        if let Some(v) = env_parse("RELAYMQ_WORKERS")? {
            self.delivery.workers = v;
        }
        if let Some(v) = env_parse("RELAYMQ_DISPATCH_TIMEOUT_MS")? {
            self.delivery.dispatch_timeout_ms = v;
        }
        if let Ok(v) = env::var("RELAYMQ_LOG_LEVEL") {
            self.logging.level = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| -> Result<(), ConfigError> {
            Err(ConfigError::Invalid(msg.to_string()))
        };

        if self.broker.ack_timeout_ms == 0 {
            return invalid("broker.ack_timeout_ms must be > 0");
        }
        if self.broker.max_deliveries == 0 {
            return invalid("broker.max_deliveries must be > 0");
        }
        if self.broker.dead_letter_suffix.is_empty() {
            return invalid("broker.dead_letter_suffix must not be empty");
        }
        if self.broker.reply_queue.is_empty() {
            return invalid("broker.reply_queue must not be empty");
        }
        if self.delivery.workers == 0 {
            return invalid("delivery.workers must be > 0");
        }
        if self.delivery.dispatch_timeout_ms == 0 || self.delivery.maintenance_interval_ms == 0 {
            return invalid("delivery timeouts must be > 0");
        }
        // A callback still running when its ack deadline passes would be
        // redelivered to a second consumer.
        if self.broker.ack_timeout_ms <= self.delivery.dispatch_timeout_ms {
            return invalid("broker.ack_timeout_ms must exceed delivery.dispatch_timeout_ms");
        }
        if parse_level(&self.logging.dispatch_level).is_none() {
            return Err(ConfigError::Invalid(format!(
                "logging.dispatch_level '{}' is not a level",
                self.logging.dispatch_level
            )));
        }
        Ok(())
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            ack_timeout: Duration::from_millis(self.broker.ack_timeout_ms),
            max_deliveries: self.broker.max_deliveries,
            dead_letter_suffix: self.broker.dead_letter_suffix.clone(),
            reply_queue: self.broker.reply_queue.clone(),
            consumer_failure_limit: self.broker.consumer_failure_limit,
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            workers: self.delivery.workers,
            dispatch_timeout: Duration::from_millis(self.delivery.dispatch_timeout_ms),
            maintenance_interval: Duration::from_millis(self.delivery.maintenance_interval_ms),
            drain_timeout: Duration::from_millis(self.delivery.drain_timeout_ms),
        }
    }
}

fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::Parse(format!("{key}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().expect("defaults validate");
        let broker = config.broker_config();
        assert_eq!(broker.ack_timeout, Duration::from_secs(30));
        assert_eq!(broker.max_deliveries, 5);
        assert_eq!(broker.reply_queue, "relaymq.replies");
        assert_eq!(config.pool_config().workers, 4);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
            [broker]
            max_deliveries = 2

            [delivery]
            workers = 8
            "#,
        )
        .expect("parse");
        assert_eq!(config.broker.max_deliveries, 2);
        assert_eq!(config.broker.dead_letter_suffix, ".dlq");
        assert_eq!(config.delivery.workers, 8);
        assert_eq!(config.delivery.dispatch_timeout_ms, 10_000);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = Config::from_toml("[delivery]\nworkers = 0\n").expect("parse");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn ack_timeout_must_exceed_dispatch_timeout() {
        let config =
            Config::from_toml("[broker]\nack_timeout_ms = 100\n[delivery]\ndispatch_timeout_ms = 5000\n")
                .expect("parse");
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let equal =
            Config::from_toml("[broker]\nack_timeout_ms = 500\n[delivery]\ndispatch_timeout_ms = 500\n")
                .expect("parse");
        assert!(matches!(equal.validate(), Err(ConfigError::Invalid(_))));

        let ok = Config::from_toml("[broker]\nack_timeout_ms = 501\n[delivery]\ndispatch_timeout_ms = 500\n")
            .expect("parse");
        ok.validate().expect("ack outlives dispatch");
    }

    #[test]
    fn malformed_toml_is_a_toml_error() {
        assert!(matches!(
            Config::from_toml("[broker\nmax_deliveries = 1"),
            Err(ConfigError::Toml(_))
        ));
    }
}
