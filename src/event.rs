//! Decoded events and their kinds.
//!
//! A message body must be a JSON object carrying string `event_name` and
//! `event_id` fields and an optional nested `payload`. Anything else fails to
//! decode, and a body that fails to decode is never retried.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Errors raised while decoding a message body.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid event JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("field '{0}' must not be empty")]
    EmptyField(&'static str),
}

/// An event parsed from a message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedEvent {
    pub event_name: String,
    /// Idempotency key.
    pub event_id: String,
    #[serde(default = "empty_payload")]
    pub payload: Value,
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

impl DecodedEvent {
    pub fn new(event_name: impl Into<String>, event_id: impl Into<String>, payload: Value) -> Self {
        Self {
            event_name: event_name.into(),
            event_id: event_id.into(),
            payload,
        }
    }

    /// Parse a raw message body.
    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        let event: DecodedEvent = serde_json::from_slice(body)?;
        if event.event_name.trim().is_empty() {
            return Err(DecodeError::EmptyField("event_name"));
        }
        if event.event_id.trim().is_empty() {
            return Err(DecodeError::EmptyField("event_id"));
        }
        Ok(event)
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_name(&self.event_name)
    }
}

/// Event names exchanged between the services.
///
/// Handlers match on this exhaustively, so adding a kind is checked at compile
/// time wherever events are routed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    UserRegistered,
    OrderCreated,
    OrderConfirmed,
    OrderCancelled,
    StockReserved,
    StockInsufficient,
    StockDepleted,
    PaymentApproved,
    PaymentFailed,
    ShipmentDispatched,
    ShipmentDelivered,
    Unknown(String),
}

impl EventKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "auth.user.registered" => Self::UserRegistered,
            "sales.order.created" => Self::OrderCreated,
            "sales.order.confirmed" => Self::OrderConfirmed,
            "sales.order.cancelled" => Self::OrderCancelled,
            "inventory.stock.reserved" => Self::StockReserved,
            "inventory.stock.insufficient" => Self::StockInsufficient,
            "inventory.stock.depleted" => Self::StockDepleted,
            "financial.payment.approved" => Self::PaymentApproved,
            "financial.payment.failed" => Self::PaymentFailed,
            "logistics.shipment.dispatched" => Self::ShipmentDispatched,
            "logistics.shipment.delivered" => Self::ShipmentDelivered,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::UserRegistered => "auth.user.registered",
            Self::OrderCreated => "sales.order.created",
            Self::OrderConfirmed => "sales.order.confirmed",
            Self::OrderCancelled => "sales.order.cancelled",
            Self::StockReserved => "inventory.stock.reserved",
            Self::StockInsufficient => "inventory.stock.insufficient",
            Self::StockDepleted => "inventory.stock.depleted",
            Self::PaymentApproved => "financial.payment.approved",
            Self::PaymentFailed => "financial.payment.failed",
            Self::ShipmentDispatched => "logistics.shipment.dispatched",
            Self::ShipmentDelivered => "logistics.shipment.delivered",
            Self::Unknown(name) => name,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
