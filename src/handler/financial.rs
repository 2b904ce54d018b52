//! Financial queue handler.
//!
//! Consumes `financial.queue`:
//! - `sales.order.created` -> create an account receivable
//! - `sales.order.confirmed` -> confirm the receivable
//! - `logistics.shipment.dispatched` -> move the due date after delivery

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use tracing::{info, warn};

use super::{number_field, optional_id, required_id, EffectHandler, HandlerError};
use crate::event::{DecodedEvent, EventKind};

/// Queue this handler is deployed against.
pub const FINANCIAL_QUEUE: &str = "financial.queue";

/// Days between order creation and receivable due date.
const PAYMENT_TERM_DAYS: u64 = 30;

/// Days between delivery and the rescheduled due date.
const POST_DELIVERY_TERM_DAYS: u64 = 7;

/// Receivable to open for a new order.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReceivable {
    pub customer_id: String,
    pub amount: f64,
    pub due_date: NaiveDate,
    pub description: String,
    /// Order id the receivable settles.
    pub reference: String,
}

/// Receivables use cases of the financial service.
#[async_trait]
pub trait ReceivablesPort: Send + Sync {
    async fn create_receivable(&self, receivable: NewReceivable) -> Result<(), HandlerError>;

    async fn confirm_receivable(&self, order_id: &str) -> Result<(), HandlerError>;

    async fn reschedule_due_date(
        &self,
        order_id: &str,
        due_date: NaiveDate,
    ) -> Result<(), HandlerError>;
}

/// Routes financial events to a [`ReceivablesPort`].
pub struct FinancialHandler<P> {
    port: P,
}

impl<P: ReceivablesPort> FinancialHandler<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    async fn order_created(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        let payload = &event.payload;
        let (order_id, customer_id) = match (
            optional_id(payload, "order_id"),
            optional_id(payload, "customer_id"),
        ) {
            (Some(order), Some(customer)) => (order, customer),
            _ => {
                return Err(HandlerError::business(
                    "order_id and customer_id are required in payload",
                ))
            }
        };

        let amount = order_total(payload);
        let today = Utc::now().date_naive();

        info!(
            order_id = %order_id,
            customer_id = %customer_id,
            total_amount = amount,
            "Creating account receivable for order"
        );

        self.port
            .create_receivable(NewReceivable {
                customer_id,
                amount,
                due_date: due_date_from(today),
                description: format!("Order #{}", order_id),
                reference: order_id.clone(),
            })
            .await?;

        info!(order_id = %order_id, "Account receivable created");
        Ok(())
    }

    async fn order_confirmed(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        let order_id = required_id(&event.payload, "order_id")?;
        info!(order_id = %order_id, "Order confirmed - confirming account receivable");
        self.port.confirm_receivable(&order_id).await
    }

    async fn shipment_dispatched(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        let order_id = required_id(&event.payload, "order_id")?;

        let Some(raw) = event
            .payload
            .get("estimated_delivery_date")
            .and_then(|v| v.as_str())
        else {
            warn!(order_id = %order_id, "Shipment dispatched without estimated delivery date");
            return Ok(());
        };

        let delivery = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| {
            HandlerError::business(format!(
                "estimated_delivery_date '{}' is not YYYY-MM-DD: {}",
                raw, e
            ))
        })?;
        let due_date = delivery
            .checked_add_days(Days::new(POST_DELIVERY_TERM_DAYS))
            .ok_or_else(|| HandlerError::business("estimated_delivery_date out of range"))?;

        info!(
            order_id = %order_id,
            estimated_delivery_date = %delivery,
            due_date = %due_date,
            "Shipment dispatched - updating receivable due date"
        );
        self.port.reschedule_due_date(&order_id, due_date).await
    }
}

/// `total_amount`, or the sum of `quantity * unit_price` over `items` when the
/// total is absent or zero.
fn order_total(payload: &serde_json::Value) -> f64 {
    let total = number_field(payload, "total_amount").unwrap_or(0.0);
    if total != 0.0 {
        return total;
    }

    payload
        .get("items")
        .and_then(|items| items.as_array())
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    number_field(item, "quantity").unwrap_or(0.0)
                        * number_field(item, "unit_price").unwrap_or(0.0)
                })
                .sum()
        })
        .unwrap_or(0.0)
}

fn due_date_from(today: NaiveDate) -> NaiveDate {
    today
        .checked_add_days(Days::new(PAYMENT_TERM_DAYS))
        .unwrap_or(NaiveDate::MAX)
}

#[async_trait]
impl<P: ReceivablesPort> EffectHandler for FinancialHandler<P> {
    async fn handle(&self, event: &DecodedEvent) -> Result<(), HandlerError> {
        match event.kind() {
            EventKind::OrderCreated => self.order_created(event).await,
            EventKind::OrderConfirmed => self.order_confirmed(event).await,
            EventKind::ShipmentDispatched => self.shipment_dispatched(event).await,
            EventKind::UserRegistered
            | EventKind::OrderCancelled
            | EventKind::StockReserved
            | EventKind::StockInsufficient
            | EventKind::StockDepleted
            | EventKind::PaymentApproved
            | EventKind::PaymentFailed
            | EventKind::ShipmentDelivered
            | EventKind::Unknown(_) => {
                warn!(
                    queue = FINANCIAL_QUEUE,
                    event_name = %event.event_name,
                    "Unhandled event"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Create(NewReceivable),
        Confirm(String),
        Reschedule(String, NaiveDate),
    }

    #[derive(Default)]
    struct RecordingPort {
        calls: Mutex<Vec<Call>>,
        fail_with: Option<HandlerError>,
    }

    #[async_trait]
    impl ReceivablesPort for RecordingPort {
        async fn create_receivable(&self, receivable: NewReceivable) -> Result<(), HandlerError> {
            self.calls.lock().await.push(Call::Create(receivable));
            self.fail_with.clone().map_or(Ok(()), Err)
        }

        async fn confirm_receivable(&self, order_id: &str) -> Result<(), HandlerError> {
            self.calls.lock().await.push(Call::Confirm(order_id.to_string()));
            Ok(())
        }

        async fn reschedule_due_date(
            &self,
            order_id: &str,
            due_date: NaiveDate,
        ) -> Result<(), HandlerError> {
            self.calls
                .lock()
                .await
                .push(Call::Reschedule(order_id.to_string(), due_date));
            Ok(())
        }
    }

    fn event(name: &str, payload: serde_json::Value) -> DecodedEvent {
        DecodedEvent::new(name, "evt-1", payload)
    }

    #[tokio::test]
    async fn test_order_created_opens_receivable() {
        let handler = FinancialHandler::new(RecordingPort::default());
        let payload = json!({"order_id": "o-1", "customer_id": "c-9", "total_amount": 150.0});

        handler
            .handle(&event("sales.order.created", payload))
            .await
            .unwrap();

        let calls = handler.port.calls.lock().await;
        let Call::Create(receivable) = &calls[0] else {
            panic!("expected create call, got {:?}", calls[0]);
        };
        assert_eq!(receivable.customer_id, "c-9");
        assert_eq!(receivable.amount, 150.0);
        assert_eq!(receivable.description, "Order #o-1");
        assert_eq!(receivable.reference, "o-1");
    }

    #[tokio::test]
    async fn test_order_created_requires_ids() {
        let handler = FinancialHandler::new(RecordingPort::default());

        let err = handler
            .handle(&event("sales.order.created", json!({"order_id": "o-1"})))
            .await
            .unwrap_err();

        assert!(err.is_business());
        assert!(handler.port.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_port_failure_propagates() {
        let port = RecordingPort {
            fail_with: Some(HandlerError::transient("database unavailable")),
            ..Default::default()
        };
        let handler = FinancialHandler::new(port);
        let payload = json!({"order_id": "o-1", "customer_id": "c-9", "total_amount": 10});

        let err = handler
            .handle(&event("sales.order.created", payload))
            .await
            .unwrap_err();

        assert_eq!(err, HandlerError::transient("database unavailable"));
    }

    #[test]
    fn test_total_computed_from_items_when_zero() {
        let payload = json!({
            "total_amount": 0,
            "items": [
                {"quantity": 2, "unit_price": 10.5},
                {"quantity": "3", "unit_price": 1}
            ]
        });
        assert_eq!(order_total(&payload), 24.0);
    }

    #[test]
    fn test_explicit_total_wins() {
        let payload = json!({"total_amount": 99.9, "items": [{"quantity": 1, "unit_price": 5}]});
        assert_eq!(order_total(&payload), 99.9);
    }

    #[test]
    fn test_due_date_is_thirty_days_out() {
        let today = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(
            due_date_from(today),
            NaiveDate::from_ymd_opt(2024, 2, 14).unwrap()
        );
    }

    #[tokio::test]
    async fn test_shipment_dispatched_reschedules_after_delivery() {
        let handler = FinancialHandler::new(RecordingPort::default());
        let payload = json!({"order_id": "o-2", "estimated_delivery_date": "2024-03-01"});

        handler
            .handle(&event("logistics.shipment.dispatched", payload))
            .await
            .unwrap();

        assert_eq!(
            handler.port.calls.lock().await.as_slice(),
            &[Call::Reschedule(
                "o-2".to_string(),
                NaiveDate::from_ymd_opt(2024, 3, 8).unwrap()
            )]
        );
    }

    #[tokio::test]
    async fn test_bad_delivery_date_is_business_failure() {
        let handler = FinancialHandler::new(RecordingPort::default());
        let payload = json!({"order_id": "o-2", "estimated_delivery_date": "next tuesday"});

        let err = handler
            .handle(&event("logistics.shipment.dispatched", payload))
            .await
            .unwrap_err();

        assert!(err.is_business());
    }

    #[tokio::test]
    async fn test_order_confirmed_confirms_receivable() {
        let handler = FinancialHandler::new(RecordingPort::default());

        handler
            .handle(&event("sales.order.confirmed", json!({"order_id": 77})))
            .await
            .unwrap();

        assert_eq!(
            handler.port.calls.lock().await.as_slice(),
            &[Call::Confirm("77".to_string())]
        );
    }

    #[tokio::test]
    async fn test_unhandled_event_succeeds() {
        let handler = FinancialHandler::new(RecordingPort::default());

        handler
            .handle(&event("crm.lead.created", json!({})))
            .await
            .unwrap();

        assert!(handler.port.calls.lock().await.is_empty());
    }
}
