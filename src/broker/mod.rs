//! Broker transport seam.
//!
//! This module contains:
//! - `BrokerEndpoint`: immutable connection parameters
//! - `Transport` / `BrokerHandle` / `Acknowledger` traits: the wire operations
//!   the consumer relies on
//! - `MessageEnvelope`: one delivery as the consumer sees it
//! - `TransportError`: transport failures tagged with a closed category
//! - `ConnectionManager`: owner of the single live handle
//! - Implementations: AMQP (lapin), Mock

use std::fmt;

use async_trait::async_trait;
use lapin::types::FieldTable;

// Implementation modules
pub mod amqp;
pub mod connection;
mod endpoint;
pub mod mock;

// Re-exports
pub use amqp::{AmqpHandle, AmqpTransport};
pub use connection::{ConnectionManager, ConnectionState, ReconnectStrategy, Reconnected};
pub use endpoint::BrokerEndpoint;
pub use mock::{MockTransport, RecordingAcker};

// ============================================================================
// Errors
// ============================================================================

/// Category of a transport failure, assigned by the transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Socket closed, reset, or the connection/channel is no longer usable.
    ConnectionLost,
    /// Heartbeat missed or an operation exceeded its deadline.
    Timeout,
    /// The broker closed the channel or connection with an AMQP error.
    ProtocolError,
    /// Anything else. The handle is assumed to still be usable.
    Other,
}

impl TransportErrorKind {
    /// Connection-class errors invalidate the handle and require a reconnect.
    pub fn is_connection_class(self) -> bool {
        !matches!(self, Self::Other)
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::ConnectionLost => "connection lost",
            Self::Timeout => "timeout",
            Self::ProtocolError => "protocol error",
            Self::Other => "transport error",
        };
        f.write_str(label)
    }
}

/// A failure reported by the broker transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ConnectionLost, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::ProtocolError, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Other, message)
    }

    pub fn is_connection_class(&self) -> bool {
        self.kind.is_connection_class()
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Broker-assigned handle identifying a delivery on its channel.
pub type DeliveryTag = u64;

/// A single delivery, read-only to the consumer.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    /// Raw message body.
    pub body: Vec<u8>,
    /// Opaque tag used only for ack/nack.
    pub delivery_tag: DeliveryTag,
    /// Application headers, including the broker-maintained `x-death` history.
    pub headers: FieldTable,
    /// Publisher-assigned message id, if any.
    pub message_id: Option<String>,
    /// Set by the broker when this delivery was requeued at least once.
    pub redelivered: bool,
}

impl MessageEnvelope {
    pub fn new(delivery_tag: DeliveryTag, body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            delivery_tag,
            headers: FieldTable::default(),
            message_id: None,
            redelivered: false,
        }
    }

    pub fn with_headers(mut self, headers: FieldTable) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// Terminal disposition sent to the broker for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Nack { requeue: bool },
}

// ============================================================================
// Traits
// ============================================================================

/// Settles deliveries on the channel they arrived on.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: DeliveryTag) -> Result<(), TransportError>;

    async fn nack(&self, delivery_tag: DeliveryTag, requeue: bool) -> Result<(), TransportError>;

    /// Apply a disposition with the matching ack/nack call.
    async fn settle(
        &self,
        delivery_tag: DeliveryTag,
        disposition: Disposition,
    ) -> Result<(), TransportError> {
        match disposition {
            Disposition::Ack => self.ack(delivery_tag).await,
            Disposition::Nack { requeue } => self.nack(delivery_tag, requeue).await,
        }
    }
}

/// A live connection + channel pair.
///
/// Exclusively owned by [`ConnectionManager`]; the delivery loop borrows it
/// between waits to issue QoS, consume and ack/nack calls.
#[async_trait]
pub trait BrokerHandle: Acknowledger {
    /// Limit unacknowledged deliveries in flight to this consumer.
    async fn set_prefetch(&mut self, prefetch_count: u16) -> Result<(), TransportError>;

    /// Register a manual-acknowledgment subscription on `queue`.
    async fn subscribe(&mut self, queue: &str, consumer_tag: &str) -> Result<(), TransportError>;

    /// Wait for the next delivery.
    ///
    /// `None` means the delivery stream ended (consumer cancelled or channel
    /// closed) and the handle cannot deliver anything else.
    async fn next_delivery(&mut self) -> Option<Result<MessageEnvelope, TransportError>>;

    /// Close channel then connection. Errors are swallowed.
    async fn close(&mut self);
}

/// Opens broker handles.
#[async_trait]
pub trait Transport: Send + Sync {
    type Handle: BrokerHandle + 'static;

    async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<Self::Handle, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_class_kinds() {
        assert!(TransportError::connection_lost("reset by peer").is_connection_class());
        assert!(TransportError::timeout("missed heartbeat").is_connection_class());
        assert!(TransportError::protocol("CHANNEL_ERROR").is_connection_class());
        assert!(!TransportError::other("unexpected frame").is_connection_class());
    }

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::connection_lost("broken pipe");
        assert_eq!(err.to_string(), "connection lost: broken pipe");
    }

    #[test]
    fn test_envelope_builder() {
        let envelope = MessageEnvelope::new(7, b"{}".to_vec()).with_message_id("m-1");
        assert_eq!(envelope.delivery_tag, 7);
        assert_eq!(envelope.message_id.as_deref(), Some("m-1"));
        assert!(envelope.headers.inner().is_empty());
        assert!(!envelope.redelivered);
    }
}
