//! Sales queue handler.
//!
//! Consumes `sales.queue` and moves orders through their lifecycle in
//! response to inventory, payment and logistics outcomes.

use std::fmt;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{optional_id, required_id, EffectHandler, HandlerError};
use crate::event::{DecodedEvent, EventKind};

pub const SALES_QUEUE: &str = "sales.queue";

/// Order status set in reaction to another service's event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    PendingPayment,
    Paid,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingPayment => "PENDING_PAYMENT",
            Self::Paid => "PAID",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order use cases of the sales service.
#[async_trait]
pub trait OrderStatusPort: Send + Sync {
    async fn update_status(
        &self,
        order_id: &str,
        status: OrderStatus,
        reason: &str,
    ) -> Result<(), HandlerError>;

    async fn complete_order(&self, order_id: &str) -> Result<(), HandlerError>;
}

/// Routes sales events to an [`OrderStatusPort`].
pub struct SalesHandler<P> {
    port: P,
}

impl<P: OrderStatusPort> SalesHandler<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    async fn transition(
        &self,
        event: &DecodedEvent,
        status: OrderStatus,
        reason: &str,
    ) -> Result<(), HandlerError> {
        let order_id = required_id(&event.payload, "order_id")?;
        match status {
            OrderStatus::Cancelled => warn!(order_id = %order_id, reason, "Cancelling order"),
            _ => info!(order_id = %order_id, status = %status, reason, "Updating order status"),
        }
        self.port.update_status(&order_id, status, reason).await
    }
}

#[async_trait]
impl<P: OrderStatusPort> EffectHandler for SalesHandler<P> {
    async fn handle(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        match event.kind() {
            EventKind::StockReserved => {
                self.transition(event, OrderStatus::PendingPayment, "Stock reserved successfully")
                    .await
            }
            EventKind::StockInsufficient => {
                self.transition(event, OrderStatus::Cancelled, "Insufficient stock")
                    .await
            }
            EventKind::PaymentApproved => {
                self.transition(event, OrderStatus::Paid, "Payment approved")
                    .await
            }
            EventKind::PaymentFailed => {
                self.transition(event, OrderStatus::Cancelled, "Payment failed")
                    .await
            }
            EventKind::StockDepleted => {
                let product_id = optional_id(&event.payload, "product_id");
                warn!(product_id = ?product_id, "Stock depleted for product");
                Ok(())
            }
            EventKind::ShipmentDelivered => {
                let order_id = required_id(&event.payload, "order_id")?;
                info!(order_id = %order_id, "Shipment delivered - completing order");
                self.port.complete_order(&order_id).await
            }
            EventKind::UserRegistered
            | EventKind::OrderCreated
            | EventKind::OrderConfirmed
            | EventKind::OrderCancelled
            | EventKind::ShipmentDispatched
            | EventKind::Unknown(_) => {
                warn!(
                    queue = SALES_QUEUE,
                    event_name = %event.event_name,
                    "Unhandled event"
                );
                Ok(())
            }
        }
    }
}
