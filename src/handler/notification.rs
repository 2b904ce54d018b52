//! Notification queue handler.
//!
//! Delivery channels (email, SMS) are not wired in; the handler logs the
//! notification it would send for each event.

use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, warn};

use super::{optional_id, EffectHandler, HandlerError};
use crate::event::{DecodedEvent, EventKind};

pub const NOTIFICATION_QUEUE: &str = "notification.queue";

/// Logs a customer-facing notification for each known event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NotificationHandler;

impl NotificationHandler {
    pub fn new() -> Self {
        Self
    }
}

fn text_or<'a>(payload: &'a Value, field: &str, fallback: &'a str) -> &'a str {
    payload
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback)
}

/// Message that would be sent for `event`, or `None` when nothing is sent.
pub(crate) fn render(event: &DecodedEvent) -> Option<String> {
    let payload = &event.payload;
    let order = optional_id(payload, "order_id").unwrap_or_else(|| "unknown".to_string());

    let message = match event.kind() {
        EventKind::UserRegistered => format!(
            "Sending welcome email to: {} <{}>",
            text_or(payload, "name", "User"),
            text_or(payload, "email", "unknown")
        ),
        EventKind::OrderCreated => format!("Sending order confirmation for: #{}", order),
        EventKind::OrderConfirmed => {
            format!("Sending order confirmed notification for: #{}", order)
        }
        EventKind::OrderCancelled => {
            format!("Sending order cancelled notification for: #{}", order)
        }
        EventKind::PaymentApproved => {
            format!("Sending payment approved notification for: #{}", order)
        }
        EventKind::PaymentFailed => format!("Sending payment failed notification for: #{}", order),
        EventKind::ShipmentDispatched => format!(
            "Sending shipment dispatched notification for: #{} (Tracking: {})",
            order,
            text_or(payload, "tracking_code", "N/A")
        ),
        EventKind::ShipmentDelivered => {
            format!("Sending shipment delivered notification for: #{}", order)
        }
        EventKind::StockReserved
        | EventKind::StockInsufficient
        | EventKind::StockDepleted
        | EventKind::Unknown(_) => return None,
    };
    Some(message)
}

#[async_trait]
impl EffectHandler for NotificationHandler {
    async fn handle(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        match render(event) {
            Some(message) => info!(event_name = %event.event_name, "{}", message),
            None => warn!(
                queue = NOTIFICATION_QUEUE,
                event_name = %event.event_name,
                "Unhandled event"
            ),
        }
        Ok(())
    }
}
