//! Delivery Worker Pool.
//!
//! A fixed set of tokio tasks pulls ready queues from the broker and runs
//! consumer callbacks, each under its own deadline, next to one maintenance
//! task that requeues expired deliveries.

mod worker;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info, warn};

use crate::core::broker::Broker;
use crate::core::error::{BrokerError, BrokerResult};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    /// Per-dispatch callback deadline.
    pub dispatch_timeout: Duration,
    pub maintenance_interval: Duration,
    /// How long `shutdown` waits for in-flight deliveries to settle.
    pub drain_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            dispatch_timeout: Duration::from_secs(10),
            maintenance_interval: Duration::from_millis(200),
            drain_timeout: Duration::from_secs(2),
        }
    }
}

/// Running worker pool. Dropping it stops the tasks without draining; call
/// [`DeliveryPool::shutdown`] for an orderly stop.
#[derive(Debug)]
pub struct DeliveryPool {
    broker: Arc<Broker>,
    config: PoolConfig,
    shutdown_tx: watch::Sender<bool>,
    /// Stopped separately so expired deliveries still settle while draining.
    maintenance_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
    maintenance: Option<JoinHandle<()>>,
}

impl DeliveryPool {
    /// Spawns the workers and the maintenance task on the current tokio
    /// runtime.
    ///
    /// `dispatch_timeout` must be shorter than the broker's ack timeout, so a
    /// callback is cancelled before its message can be redelivered.
    pub fn start(broker: Arc<Broker>, config: PoolConfig) -> BrokerResult<Self> {
        let ack_timeout = broker.config().ack_timeout;
        if config.dispatch_timeout >= ack_timeout {
            return Err(BrokerError::InvalidArgument(format!(
                "dispatch timeout {:?} must be shorter than ack timeout {:?}",
                config.dispatch_timeout, ack_timeout
            )));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (maintenance_tx, maintenance_rx) = watch::channel(false);
        let ready = broker.ready_receiver();
        let count = config.workers.max(1);

        let workers = (0..count)
            .map(|id| {
                tokio::spawn(worker::run_worker(
                    id,
                    broker.clone(),
                    ready.clone(),
                    config.dispatch_timeout,
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        let maintenance = tokio::spawn(worker::run_maintenance(
            broker.clone(),
            config.maintenance_interval,
            maintenance_rx,
        ));

        let dispatch_timeout_ms =
            u64::try_from(config.dispatch_timeout.as_millis()).unwrap_or(u64::MAX);
        info!(
            workers = count,
            dispatch_timeout_ms,
            "delivery pool started"
        );

        Ok(Self {
            broker,
            config,
            shutdown_tx,
            maintenance_tx,
            workers,
            maintenance: Some(maintenance),
        })
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    /// Stops the pool: each worker finishes its current dispatch, then
    /// in-flight deliveries get up to `drain_timeout` to settle while the
    /// maintenance task keeps requeueing expired ones. Pending messages stay
    /// queued. Returns the number of deliveries still in flight.
    pub async fn shutdown(mut self) -> usize {
        self.shutdown_tx.send_replace(true);

        for handle in std::mem::take(&mut self.workers) {
            if let Err(e) = handle.await {
                error!("delivery worker ended abnormally: {e}");
            }
        }

        let start = Instant::now();
        let mut remaining = self.broker.in_flight_count();
        while remaining > 0 && start.elapsed() < self.config.drain_timeout {
            time::sleep(Duration::from_millis(50)).await;
            remaining = self.broker.in_flight_count();
        }

        self.maintenance_tx.send_replace(true);
        if let Some(handle) = self.maintenance.take() {
            if let Err(e) = handle.await {
                error!("maintenance task ended abnormally: {e}");
            }
        }

        if remaining > 0 {
            warn!(in_flight = remaining, "shutdown drain timed out");
        } else {
            info!("delivery pool stopped");
        }
        remaining
    }
}

impl Drop for DeliveryPool {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        self.maintenance_tx.send_replace(true);
    }
}
