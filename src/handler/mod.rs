//! Effect handlers.
//!
//! This module contains:
//! - `EffectHandler` trait: applies one decoded event to the owning service
//! - `HandlerError`: business vs transient failure categories
//! - Implementations: per-queue routers (financial, inventory, sales,
//!   notification) and an HTTP forwarder

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::event::DecodedEvent;

// Implementation modules
pub mod financial;
pub mod http;
pub mod inventory;
pub mod notification;
pub mod sales;

// Re-exports
pub use financial::{FinancialHandler, NewReceivable, ReceivablesPort};
pub use http::HttpEffectHandler;
pub use inventory::{InventoryHandler, StockPort, StockReservation};
pub use notification::NotificationHandler;
pub use sales::{OrderStatus, OrderStatusPort, SalesHandler};

/// Failure reported by an effect handler.
///
/// The variant is the whole classification: business failures are dead-lettered
/// at once, transient failures are retried up to the retry ceiling.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    /// Invalid arguments, violated domain invariants or logic errors.
    /// Deterministic for this input.
    #[error("business failure: {0}")]
    Business(String),

    /// Timeouts, connectivity, resource exhaustion.
    #[error("transient failure: {0}")]
    Transient(String),
}

impl HandlerError {
    pub fn business(reason: impl Into<String>) -> Self {
        Self::Business(reason.into())
    }

    pub fn transient(cause: impl Into<String>) -> Self {
        Self::Transient(cause.into())
    }

    pub fn is_business(&self) -> bool {
        matches!(self, Self::Business(_))
    }
}

/// Applies a decoded event.
///
/// Invoked at most once per delivery, but a delivery can be redelivered: without
/// an idempotency store the handler must tolerate seeing the same `event_id`
/// more than once.
#[async_trait]
pub trait EffectHandler: Send + Sync {
    async fn handle(&self, event: &DecodedEvent) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: EffectHandler + ?Sized> EffectHandler for Box<H> {
    async fn handle(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        (**self).handle(event).await
    }
}

#[async_trait]
impl<H: EffectHandler + ?Sized> EffectHandler for Arc<H> {
    async fn handle(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        (**self).handle(event).await
    }
}

// ============================================================================
// Payload helpers
// ============================================================================

/// Identifier field that may arrive as a JSON string or number.
pub(crate) fn optional_id(payload: &Value, field: &str) -> Option<String> {
    match payload.get(field)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn required_id(payload: &Value, field: &str) -> Result<String, HandlerError> {
    optional_id(payload, field)
        .ok_or_else(|| HandlerError::business(format!("{} is required in payload", field)))
}

/// Numeric field that may arrive as a JSON number or numeric string.
pub(crate) fn number_field(value: &Value, field: &str) -> Option<f64> {
    match value.get(field)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
