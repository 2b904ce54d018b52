//! Broker connection manager.
//!
//! Owns the single live [`BrokerHandle`] of a consumer. The handle is replaced
//! (old one closed first) on reconnect and released by [`ConnectionManager::close`].
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Disconnected -> Connecting -> Connected
//!                                                                      \-> Failed
//! ```

use std::time::Duration;

use backon::BackoffBuilder;
use tokio::sync::watch;
use tracing::{error, info, warn};

use super::{BrokerEndpoint, BrokerHandle, Transport, TransportError};
use crate::utils::retry::reconnect_backoff;

/// Delay before the single reconnect attempt of the fixed strategy.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// A reconnect gave up. Terminal.
    Failed,
}

/// How `reconnect()` waits before reopening the connection.
///
/// Both strategies give up after their last attempt; the error is returned to
/// the caller rather than looping forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectStrategy {
    /// Wait `delay`, then make one attempt.
    Fixed { delay: Duration },
    /// Up to `max_attempts` attempts with jittered exponential delays.
    Exponential {
        min_delay: Duration,
        max_delay: Duration,
        max_attempts: usize,
    },
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self::Fixed {
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// How a [`ConnectionManager::reconnect`] ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconnected {
    /// A new handle is live.
    Connected,
    /// A stop was requested before a new handle was opened.
    Stopped,
}

/// Owner of the consumer's connection/channel pair.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    endpoint: BrokerEndpoint,
    strategy: ReconnectStrategy,
    handle: Option<T::Handle>,
    state: ConnectionState,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, endpoint: BrokerEndpoint, strategy: ReconnectStrategy) -> Self {
        Self {
            transport,
            endpoint,
            strategy,
            handle: None,
            state: ConnectionState::Disconnected,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    pub fn handle(&self) -> Option<&T::Handle> {
        self.handle.as_ref()
    }

    pub fn handle_mut(&mut self) -> Option<&mut T::Handle> {
        self.handle.as_mut()
    }

    /// Open a connection and channel. Not retried here.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        if let Some(mut previous) = self.handle.take() {
            previous.close().await;
        }

        self.state = ConnectionState::Connecting;
        match self.transport.connect(&self.endpoint).await {
            Ok(handle) => {
                self.handle = Some(handle);
                self.state = ConnectionState::Connected;
                info!(
                    host = %self.endpoint.host,
                    port = self.endpoint.port,
                    vhost = %self.endpoint.vhost,
                    "Connected to broker"
                );
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Failed;
                error!(
                    host = %self.endpoint.host,
                    port = self.endpoint.port,
                    error = %e,
                    "Failed to connect to broker"
                );
                Err(e)
            }
        }
    }

    /// Close the current handle, wait per the strategy, then connect again.
    ///
    /// `stop` is checked before every attempt and interrupts every delay; once
    /// it reads `true` no further connection is opened.
    pub async fn reconnect(
        &mut self,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<Reconnected, TransportError> {
        info!(host = %self.endpoint.host, "Attempting to reconnect to broker");
        self.close().await;

        let result = match self.strategy.clone() {
            ReconnectStrategy::Fixed { delay } => self.attempt_after(delay, stop).await,
            ReconnectStrategy::Exponential {
                min_delay,
                max_delay,
                max_attempts,
            } => {
                let backoff = reconnect_backoff(min_delay, max_delay, max_attempts).build();
                let mut result = Err(TransportError::connection_lost(
                    "reconnect made no attempts",
                ));

                for (attempt, delay) in backoff.enumerate() {
                    result = self.attempt_after(delay, stop).await;
                    match &result {
                        Ok(_) => break,
                        Err(e) => warn!(
                            attempt = attempt + 1,
                            max_attempts = max_attempts,
                            backoff_ms = %delay.as_millis(),
                            error = %e,
                            "Reconnect attempt failed"
                        ),
                    }
                }
                result
            }
        };

        match &result {
            Ok(Reconnected::Stopped) => {
                self.state = ConnectionState::Disconnected;
                info!("Stop requested, abandoning reconnect");
            }
            Ok(Reconnected::Connected) => {}
            Err(e) => {
                self.state = ConnectionState::Failed;
                error!(error = %e, "Failed to reconnect");
            }
        }
        result
    }

    async fn attempt_after(
        &mut self,
        delay: Duration,
        stop: &mut watch::Receiver<bool>,
    ) -> Result<Reconnected, TransportError> {
        tokio::select! {
            biased;
            _ = stop_requested(stop) => return Ok(Reconnected::Stopped),
            _ = tokio::time::sleep(delay) => {}
        }
        if *stop.borrow() {
            return Ok(Reconnected::Stopped);
        }
        self.connect().await.map(|()| Reconnected::Connected)
    }

    /// Release the handle. Close errors are swallowed; safe to call repeatedly.
    pub async fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            handle.close().await;
        }
        if self.state != ConnectionState::Failed {
            self.state = ConnectionState::Disconnected;
        }
    }
}

/// Resolve once `stop` reads `true`. Never resolves if the sender is gone.
async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
