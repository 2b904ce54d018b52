//! Delivery loop.
//!
//! This module contains:
//! - `Consumer`: connects, subscribes with manual acknowledgment, and feeds
//!   deliveries one at a time to the `MessageProcessor`
//! - `StopHandle`: cooperative shutdown signal
//! - `ConsumerError`: the errors that end `Consumer::run`
//!
//! Connection-class transport errors (and the end of the delivery stream)
//! trigger a reconnect followed by QoS and a fresh subscription. Other
//! transport errors are logged and the loop continues after a short pause.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::broker::{
    BrokerHandle, ConnectionManager, MessageEnvelope, Reconnected, Transport, TransportError,
};
use crate::handler::EffectHandler;
use crate::idempotency::IdempotencyStore;

pub mod processor;
pub mod retry;

pub use processor::{MessageProcessor, ProcessingOutcome};
pub use retry::{retry_count, RetryPolicy, DEFAULT_MAX_RETRIES};

/// Deliveries in flight before the broker waits for an ack.
pub const DEFAULT_PREFETCH_COUNT: u16 = 1;

/// Pause after a transport error that does not require a reconnect.
pub const DEFAULT_ERROR_PAUSE: Duration = Duration::from_millis(100);

/// Errors that end [`Consumer::run`].
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("failed to connect to broker: {0}")]
    ConnectFailed(#[source] TransportError),

    #[error("failed to reconnect to broker: {0}")]
    ReconnectFailed(#[source] TransportError),

    #[error("failed to subscribe: {0}")]
    Subscribe(#[source] TransportError),

    #[error("transport error: {0}")]
    Transport(#[source] TransportError),
}

/// Delivery loop settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub queue: String,
    pub consumer_tag: String,
    pub prefetch_count: u16,
    /// Zero retries the wait immediately.
    pub error_pause: Duration,
    pub max_retries: u32,
}

impl ConsumerOptions {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            consumer_tag: format!("quiver-{}", uuid::Uuid::new_v4().simple()),
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            error_pause: DEFAULT_ERROR_PAUSE,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_error_pause(mut self, error_pause: Duration) -> Self {
        self.error_pause = error_pause;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Signals a running consumer to stop after its current message.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    /// Stop the consumer once `timeout` has elapsed.
    pub fn stop_after(&self, timeout: Duration) -> tokio::task::JoinHandle<()> {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            info!(timeout_secs = timeout.as_secs(), "Run timeout reached, stopping consumer");
            handle.stop();
        })
    }
}

enum Wait {
    Stopped,
    Delivery(MessageEnvelope),
    Failed(TransportError),
    Ended,
}

/// Single-queue consumer.
pub struct Consumer<T: Transport, H> {
    connection: ConnectionManager<T>,
    processor: MessageProcessor<H>,
    options: ConsumerOptions,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl<T: Transport, H: EffectHandler> Consumer<T, H> {
    pub fn new(connection: ConnectionManager<T>, handler: H, options: ConsumerOptions) -> Self {
        let processor = MessageProcessor::new(options.queue.clone(), handler)
            .with_retry_policy(RetryPolicy::new(options.max_retries));
        let (stop_tx, stop_rx) = watch::channel(false);

        Self {
            connection,
            processor,
            options,
            stop_tx: Arc::new(stop_tx),
            stop_rx,
        }
    }

    pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.processor = self.processor.with_idempotency_store(store);
        self
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    pub fn connection(&self) -> &ConnectionManager<T> {
        &self.connection
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    /// Request a stop. The message being processed, if any, completes first.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Connect, subscribe and process deliveries until stopped.
    ///
    /// The connection is closed on every exit path, including a panic
    /// unwinding out of the effect handler.
    pub async fn run(&mut self) -> Result<(), ConsumerError> {
        let result = AssertUnwindSafe(self.consume()).catch_unwind().await;
        self.connection.close().await;

        match result {
            Ok(Ok(())) => {
                info!(queue = %self.options.queue, "Consumer stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                error!(queue = %self.options.queue, error = %e, "Consumer failed");
                Err(e)
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    async fn consume(&mut self) -> Result<(), ConsumerError> {
        self.connection
            .connect()
            .await
            .map_err(ConsumerError::ConnectFailed)?;
        info!(
            queue = %self.options.queue,
            host = %self.connection.endpoint().host,
            port = self.connection.endpoint().port,
            "Consumer connected to broker"
        );
        self.start_consuming().await?;

        loop {
            match self.wait().await? {
                Wait::Stopped => return Ok(()),
                Wait::Delivery(envelope) => {
                    let handle = self
                        .connection
                        .handle()
                        .ok_or_else(|| ConsumerError::Transport(not_connected()))?;
                    self.processor.process(&envelope, handle).await;
                }
                Wait::Failed(e) if e.is_connection_class() => {
                    warn!(queue = %self.options.queue, error = %e, "Connection error, reconnecting");
                    self.recover().await?;
                }
                Wait::Failed(e) => {
                    warn!(queue = %self.options.queue, error = %e, "Error while waiting for messages");
                    self.pause().await;
                }
                Wait::Ended => {
                    warn!(queue = %self.options.queue, "Delivery stream ended, reconnecting");
                    self.recover().await?;
                }
            }
        }
    }

    /// Wait for the next delivery or a stop request.
    async fn wait(&mut self) -> Result<Wait, ConsumerError> {
        if *self.stop_rx.borrow() {
            return Ok(Wait::Stopped);
        }
        let handle = self
            .connection
            .handle_mut()
            .ok_or_else(|| ConsumerError::Transport(not_connected()))?;

        tokio::select! {
            biased;
            _ = self.stop_rx.changed() => Ok(Wait::Stopped),
            next = handle.next_delivery() => Ok(match next {
                Some(Ok(envelope)) => Wait::Delivery(envelope),
                Some(Err(e)) => Wait::Failed(e),
                None => Wait::Ended,
            }),
        }
    }

    /// Apply QoS and register the subscription on the current handle.
    async fn start_consuming(&mut self) -> Result<(), ConsumerError> {
        let handle = self
            .connection
            .handle_mut()
            .ok_or_else(|| ConsumerError::Subscribe(not_connected()))?;

        handle
            .set_prefetch(self.options.prefetch_count)
            .await
            .map_err(ConsumerError::Subscribe)?;
        handle
            .subscribe(&self.options.queue, &self.options.consumer_tag)
            .await
            .map_err(ConsumerError::Subscribe)?;

        info!(
            queue = %self.options.queue,
            prefetch = self.options.prefetch_count,
            consumer_tag = %self.options.consumer_tag,
            "Consumer started"
        );
        Ok(())
    }

    /// Reconnect and subscribe again. A stop during the reconnect leaves the
    /// consumer disconnected; the next `wait` observes the stop.
    async fn recover(&mut self) -> Result<(), ConsumerError> {
        match self
            .connection
            .reconnect(&mut self.stop_rx)
            .await
            .map_err(ConsumerError::ReconnectFailed)?
        {
            Reconnected::Connected => self.start_consuming().await,
            Reconnected::Stopped => Ok(()),
        }
    }

    async fn pause(&mut self) {
        if self.options.error_pause.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(self.options.error_pause) => {}
            _ = self.stop_rx.changed() => {}
        }
    }
}

fn not_connected() -> TransportError {
    TransportError::connection_lost("no live broker connection")
}
