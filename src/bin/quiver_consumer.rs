//! quiver-consumer: standalone queue consumer
//!
//! Consumes one RabbitMQ queue and applies each event to the configured
//! target, with bounded retry and dead-lettering.
//!
//! ## Configuration
//! - `config.yaml`, the positional path argument, or `QUIVER_CONFIG`
//! - `QUIVER__*` overrides (e.g. `QUIVER__CONSUMER__QUEUE=sales.queue`)
//! - `RABBITMQ_HOST/PORT/USER/PASSWORD/VHOST` as broker defaults
//! - `QUIVER_LOG` / `QUIVER_LOG_FORMAT` for logging
//!
//! ## Shutdown
//! SIGINT and SIGTERM stop the consumer after the message in flight.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use quiver::broker::{AmqpTransport, ConnectionManager};
use quiver::config::{Config, IdempotencyType, TargetType};
use quiver::consumer::Consumer;
use quiver::handler::{EffectHandler, HttpEffectHandler, NotificationHandler};
use quiver::idempotency::{IdempotencyStore, InMemoryIdempotencyStore};
use quiver::utils::bootstrap::{init_tracing, shutdown_signal};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Configuration file (YAML).
    config: Option<String>,

    /// Queue to consume (overrides consumer.queue).
    #[arg(long)]
    queue: Option<String>,

    /// Prefetch count (overrides consumer.prefetch_count).
    #[arg(long)]
    prefetch: Option<u16>,

    /// Stop after this many seconds, 0 for no limit (overrides consumer.run_timeout_secs).
    #[arg(long)]
    timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = CliArgs::parse();

    let mut config = Config::load(args.config.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;
    if let Some(queue) = args.queue {
        config.consumer.queue = queue;
    }
    if let Some(prefetch) = args.prefetch {
        config.consumer.prefetch_count = prefetch;
    }
    if let Some(timeout) = args.timeout {
        config.consumer.run_timeout_secs = Some(timeout);
    }
    config.validate()?;

    info!(queue = %config.consumer.queue, "Starting quiver-consumer");

    let handler = build_handler(&config)?;
    let store = build_store(&config).await?;

    let connection = ConnectionManager::new(
        AmqpTransport::new(),
        config.broker.endpoint(),
        config.consumer.reconnect.strategy(),
    );
    let mut consumer = Consumer::new(connection, handler, config.consumer.options());
    if let Some(store) = store {
        consumer = consumer.with_idempotency_store(store);
    }

    let stop = consumer.stop_handle();
    tokio::spawn({
        let stop = stop.clone();
        async move {
            shutdown_signal().await;
            stop.stop();
        }
    });
    if let Some(timeout) = config.consumer.run_timeout() {
        stop.stop_after(timeout);
    }

    consumer.run().await?;
    info!("quiver-consumer exited");
    Ok(())
}

fn build_handler(config: &Config) -> Result<Box<dyn EffectHandler>, Box<dyn std::error::Error>> {
    match config.target.target_type {
        TargetType::Notification => Ok(Box::new(NotificationHandler::new())),
        TargetType::Http => {
            let url = config
                .target
                .url
                .clone()
                .ok_or("target.url is required for the http target")?;
            info!(url = %url, "Forwarding events over HTTP");
            let handler =
                HttpEffectHandler::new(url, Duration::from_secs(config.target.timeout_secs))?;
            Ok(Box::new(handler))
        }
    }
}

async fn build_store(
    config: &Config,
) -> Result<Option<Arc<dyn IdempotencyStore>>, Box<dyn std::error::Error>> {
    match config.idempotency.store_type {
        IdempotencyType::None => Ok(None),
        IdempotencyType::Memory => Ok(Some(Arc::new(InMemoryIdempotencyStore::with_capacity(
            config.idempotency.memory.capacity,
        )))),
        #[cfg(feature = "redis")]
        IdempotencyType::Redis => {
            let redis = &config.idempotency.redis;
            let store = quiver::idempotency::RedisIdempotencyStore::new(
                &redis.url,
                Some(&redis.key_prefix),
                Some(Duration::from_secs(redis.ttl_secs)),
            )
            .await?;
            Ok(Some(Arc::new(store)))
        }
        #[cfg(not(feature = "redis"))]
        IdempotencyType::Redis => {
            Err("idempotency type 'redis' requires the redis feature".into())
        }
    }
}
