use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::core::broker::{Broker, Dispatch};
use crate::core::message::QueueName;
use crate::core::observer::DispatchOutcome;

/// One pool worker: waits for a ready queue, pairs its head with an idle
/// consumer and runs the callback. Returns once shutdown is signalled; a
/// dispatch already started is finished first.
pub(crate) async fn run_worker(
    id: usize,
    broker: Arc<Broker>,
    ready: flume::Receiver<QueueName>,
    dispatch_timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker = id, "delivery worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let queue = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            next = ready.recv_async() => match next {
                Ok(queue) => queue,
                Err(_) => break,
            },
        };

        broker.take_ready(&queue);
        let Some(dispatch) = broker.next_dispatch(&queue) else {
            continue;
        };

        // Another idle consumer may take the next message meanwhile.
        if broker.store().pending_len(&queue) > 0 {
            broker.signal(&queue);
        }

        execute(&broker, dispatch, dispatch_timeout).await;
    }
    debug!(worker = id, "delivery worker stopped");
}

/// Runs one dispatch under `dispatch_timeout` and settles it with the broker.
///
/// The callback runs in its own task. When the deadline passes the task is
/// aborted, so it can never run alongside a redelivery of the same message.
pub(crate) async fn execute(broker: &Broker, dispatch: Dispatch, dispatch_timeout: Duration) {
    let info = dispatch.info();
    let observer = broker.observer();
    observer.on_dispatch_start(&info);
    let started = Instant::now();

    let message = dispatch.message().clone();
    let call = catch_unwind(AssertUnwindSafe(|| dispatch.consumer().consume(message)));

    let outcome = match call {
        Ok(future) => {
            let mut task = tokio::spawn(future);
            match time::timeout(dispatch_timeout, &mut task).await {
                Ok(Ok(Ok(()))) => DispatchOutcome::Acknowledged,
                Ok(Ok(Err(e))) => DispatchOutcome::Failed(e.to_string()),
                Ok(Err(join)) if join.is_panic() => {
                    DispatchOutcome::Failed("consumer panicked".to_string())
                }
                Ok(Err(join)) => DispatchOutcome::Failed(join.to_string()),
                Err(_) => {
                    task.abort();
                    DispatchOutcome::TimedOut(dispatch_timeout)
                }
            }
        }
        Err(_) => DispatchOutcome::Failed("consumer panicked".to_string()),
    };

    observer.on_dispatch_end(&info, &outcome, started.elapsed());
    broker.complete(dispatch, &outcome);
}

/// Periodic expiry scan and ready-queue sweep.
pub(crate) async fn run_maintenance(
    broker: Arc<Broker>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let report = broker.maintenance_tick(Instant::now());
                if report.requeued_messages > 0 || !report.dead_lettered.is_empty() {
                    debug!(
                        requeued = report.requeued_messages,
                        dead_lettered = report.dead_lettered.len(),
                        "expired deliveries processed"
                    );
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    error!("pool dropped without shutdown signal");
                }
                break;
            }
        }
    }
    info!("maintenance task stopped");
}
