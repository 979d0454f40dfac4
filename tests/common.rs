#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use relaymq::{Broker, BrokerConfig, Client, DeliveryPool, NoopObserver, PoolConfig};

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        relaymq::logging::init_logging("warn");
    });
}

/// Broker + running pool with short timers for tests.
pub fn start(broker_config: BrokerConfig, pool_config: PoolConfig) -> (Client, DeliveryPool) {
    init_logging();
    let broker = Arc::new(Broker::with_observer(broker_config, Arc::new(NoopObserver)));
    let pool = DeliveryPool::start(broker.clone(), pool_config).expect("start pool");
    (Client::new(broker), pool)
}

pub fn fast_broker() -> BrokerConfig {
    BrokerConfig {
        ack_timeout: Duration::from_millis(100),
        max_deliveries: 3,
        ..BrokerConfig::default()
    }
}

/// Dispatch timeout stays below `fast_broker`'s ack timeout.
pub fn fast_pool(workers: usize) -> PoolConfig {
    PoolConfig {
        workers,
        dispatch_timeout: Duration::from_millis(50),
        maintenance_interval: Duration::from_millis(10),
        drain_timeout: Duration::from_millis(500),
    }
}

/// Polls `check` until it holds or `within` elapses.
pub async fn wait_until<F>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + within;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Runs `fut` and panics if it does not finish within `within`.
pub async fn within<T>(within: Duration, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(within, fut).await {
        Ok(v) => v,
        Err(_) => panic!("operation did not finish within {within:?}"),
    }
}
