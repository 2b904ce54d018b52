//! Inventory queue handler.
//!
//! Consumes `inventory.queue`:
//! - `sales.order.created` -> reserve stock for each item
//! - `sales.order.cancelled` -> release the order's reservations
//! - `sales.order.confirmed` -> commit the reservations

use async_trait::async_trait;
use serde_json::Value;
use tracing::{error, info, warn};

use super::{number_field, optional_id, required_id, EffectHandler, HandlerError};
use crate::event::{DecodedEvent, EventKind};

pub const INVENTORY_QUEUE: &str = "inventory.queue";

/// One line of stock to hold for an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockReservation {
    pub product_id: String,
    pub quantity: u32,
    pub order_id: String,
    pub reference: String,
}

/// Stock use cases of the inventory service.
#[async_trait]
pub trait StockPort: Send + Sync {
    async fn reserve(&self, reservation: StockReservation) -> Result<(), HandlerError>;

    async fn release(&self, order_id: &str) -> Result<(), HandlerError>;

    async fn commit(&self, order_id: &str) -> Result<(), HandlerError>;
}

/// Routes inventory events to a [`StockPort`].
pub struct InventoryHandler<P> {
    port: P,
}

impl<P: StockPort> InventoryHandler<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    async fn order_created(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        let order_id = required_id(&event.payload, "order_id")?;
        let items = match event.payload.get("items").and_then(Value::as_array) {
            Some(items) if !items.is_empty() => items,
            _ => {
                warn!(order_id = %order_id, "Order created without items");
                return Ok(());
            }
        };

        info!(order_id = %order_id, items_count = items.len(), "Reserving stock for order");

        for item in items {
            let Some(reservation) = reservation_from(item, &order_id) else {
                warn!(order_id = %order_id, item = %item, "Invalid item in order");
                continue;
            };
            let product_id = reservation.product_id.clone();
            let quantity = reservation.quantity;

            if let Err(e) = self.port.reserve(reservation).await {
                error!(
                    order_id = %order_id,
                    product_id = %product_id,
                    quantity = quantity,
                    error = %e,
                    "Failed to reserve stock"
                );
                return Err(e);
            }
            info!(order_id = %order_id, product_id = %product_id, quantity = quantity, "Stock reserved");
        }
        Ok(())
    }

    async fn order_cancelled(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        let order_id = required_id(&event.payload, "order_id")?;
        info!(order_id = %order_id, "Releasing stock for cancelled order");
        self.port.release(&order_id).await.inspect_err(|e| {
            error!(order_id = %order_id, error = %e, "Failed to release stock");
        })
    }

    async fn order_confirmed(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        let order_id = required_id(&event.payload, "order_id")?;
        info!(order_id = %order_id, "Committing stock reservation for confirmed order");
        self.port.commit(&order_id).await.inspect_err(|e| {
            error!(order_id = %order_id, error = %e, "Failed to commit stock reservation");
        })
    }
}

/// A reservation for `item`, or `None` when it lacks a product or a positive
/// quantity.
fn reservation_from(item: &Value, order_id: &str) -> Option<StockReservation> {
    let product_id = optional_id(item, "product_id")?;
    let quantity = number_field(item, "quantity")?;
    if quantity < 1.0 || quantity > u32::MAX as f64 {
        return None;
    }

    Some(StockReservation {
        product_id,
        quantity: quantity as u32,
        order_id: order_id.to_string(),
        reference: format!("Order {}", order_id),
    })
}

#[async_trait]
impl<P: StockPort> EffectHandler for InventoryHandler<P> {
    async fn handle(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        match event.kind() {
            EventKind::OrderCreated => self.order_created(event).await,
            EventKind::OrderCancelled => self.order_cancelled(event).await,
            EventKind::OrderConfirmed => self.order_confirmed(event).await,
            EventKind::UserRegistered
            | EventKind::StockReserved
            | EventKind::StockInsufficient
            | EventKind::StockDepleted
            | EventKind::PaymentApproved
            | EventKind::PaymentFailed
            | EventKind::ShipmentDispatched
            | EventKind::ShipmentDelivered
            | EventKind::Unknown(_) => {
                warn!(
                    queue = INVENTORY_QUEUE,
                    event_name = %event.event_name,
                    "Unhandled event"
                );
                Ok(())
            }
        }
    }
}
