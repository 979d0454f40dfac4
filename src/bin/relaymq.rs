//! Demo CLI for RelayMQ.
//!
//! Runs an in-process broker with a delivery pool and drives it through the
//! client facade: `demo` performs one request against an echo responder,
//! `pump` pushes a batch through competing consumers and prints the stats.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};

use relaymq::core::observer::parse_level;
use relaymq::logging::init_logging;
use relaymq::{Broker, Client, Config, ConsumerError, DeliveryPool, Message, TracingObserver};

#[derive(Debug, Parser)]
#[command(name = "relaymq", version, about = "RelayMQ in-process dispatch demo")]
pub struct Cli {
    /// Path to a relaymq.toml (falls back to RELAYMQ_CONFIG, then defaults)
    #[arg(short, long)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Subscribe an echo responder and send it one request
    Demo {
        /// Service queue name
        #[arg(short, long, default_value = "messaging")]
        queue: String,
        /// Request payload
        #[arg(default_value = "Hello, World!")]
        message: String,
        /// Request timeout in milliseconds
        #[arg(long, default_value_t = 5_000)]
        timeout_ms: u64,
    },

    /// Publish a batch to competing consumers and report once drained
    Pump {
        #[arg(short, long, default_value = "jobs")]
        queue: String,
        /// Messages to publish
        #[arg(short = 'n', long, default_value_t = 1_000)]
        messages: usize,
        /// Consumers registered on the queue
        #[arg(short = 'k', long, default_value_t = 4)]
        consumers: usize,
        /// Fail every n-th delivery (0 = never)
        #[arg(long, default_value_t = 0)]
        fail_every: usize,
        /// Give up waiting for the queue to drain after this many milliseconds
        #[arg(long, default_value_t = 60_000)]
        wait_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_logging(&config.logging.level);

    let dispatch_level = parse_level(&config.logging.dispatch_level).unwrap_or(Level::DEBUG);
    let broker = Arc::new(Broker::with_observer(
        config.broker_config(),
        Arc::new(TracingObserver::new(dispatch_level)),
    ));
    let pool = DeliveryPool::start(broker.clone(), config.pool_config())?;
    let client = Client::new(broker.clone());

    let result = match cli.command {
        Command::Demo {
            queue,
            message,
            timeout_ms,
        } => run_demo(&client, &queue, message, Duration::from_millis(timeout_ms)).await,
        Command::Pump {
            queue,
            messages,
            consumers,
            fail_every,
            wait_ms,
        } => {
            run_pump(
                &client,
                &queue,
                messages,
                consumers,
                fail_every,
                Duration::from_millis(wait_ms),
            )
            .await
        }
    };

    let left = pool.shutdown().await;
    let stats = broker.stats();
    println!("{stats:#?}");
    if left > 0 {
        warn!(in_flight = left, "exiting with deliveries still in flight");
    }
    result
}

async fn run_demo(
    client: &Client,
    queue: &str,
    message: String,
    timeout: Duration,
) -> anyhow::Result<()> {
    let responder = client.clone();
    client.subscribe(queue, move |msg: Message| {
        let responder = responder.clone();
        async move {
            let text = msg.payload_str().unwrap_or("<binary>").to_string();
            info!(message_id = %msg.id, "responder received: {text}");
            responder
                .reply(&msg, format!("Server response: {text}"))
                .map(|_| ())
                .map_err(|e| ConsumerError::new(e.to_string()))
        }
    })?;

    let reply = client.request(queue, message, timeout).await?;
    println!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}

async fn run_pump(
    client: &Client,
    queue: &str,
    messages: usize,
    consumers: usize,
    fail_every: usize,
    wait: Duration,
) -> anyhow::Result<()> {
    let deliveries = Arc::new(AtomicUsize::new(0));
    for _ in 0..consumers.max(1) {
        let deliveries = deliveries.clone();
        client.subscribe(queue, move |_msg: Message| {
            let n = deliveries.fetch_add(1, Ordering::Relaxed) + 1;
            async move {
                if fail_every > 0 && n % fail_every == 0 {
                    return Err(ConsumerError::new(format!("injected failure on delivery {n}")));
                }
                Ok(())
            }
        })?;
    }

    let started = Instant::now();
    for i in 0..messages {
        client.publish(queue, format!("message-{i}"))?;
    }
    info!(messages, consumers, "published batch");

    let broker = client.broker();
    let deadline = started + wait;
    loop {
        let stats = broker.queue_stats(queue)?;
        if stats.pending == 0 && stats.in_flight == 0 {
            break;
        }
        if Instant::now() >= deadline {
            warn!(?stats, "queue did not drain in time");
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    println!(
        "{} deliveries for {} messages in {:?}",
        deliveries.load(Ordering::Relaxed),
        messages,
        started.elapsed()
    );
    Ok(())
}
