//! Per-delivery processing state machine.
//!
//! ```text
//! decode --fail--> DeadLettered
//!   |
//! seen? --yes--> DuplicateSkipped
//!   |
//! handle --ok--> mark --> Processed
//!   |
//!   +--business--> DeadLettered
//!   +--transient-> RetryPolicy (Requeued | DeadLettered)
//! ```
//!
//! Every path ends in exactly one ack or nack.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::retry::{retry_count, RetryPolicy};
use crate::broker::{Acknowledger, Disposition, MessageEnvelope};
use crate::event::DecodedEvent;
use crate::handler::{EffectHandler, HandlerError};
use crate::idempotency::IdempotencyStore;

/// Bytes of an undecodable body included in logs.
const BODY_PREVIEW_BYTES: usize = 500;

/// Terminal result of processing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Processed,
    DuplicateSkipped,
    Requeued,
    DeadLettered,
}

impl ProcessingOutcome {
    pub fn disposition(self) -> Disposition {
        match self {
            Self::Processed | Self::DuplicateSkipped => Disposition::Ack,
            Self::Requeued => Disposition::Nack { requeue: true },
            Self::DeadLettered => Disposition::Nack { requeue: false },
        }
    }
}

/// Decodes, deduplicates and dispatches deliveries for one queue.
pub struct MessageProcessor<H> {
    queue: String,
    handler: H,
    store: Option<Arc<dyn IdempotencyStore>>,
    policy: RetryPolicy,
}

impl<H: EffectHandler> MessageProcessor<H> {
    pub fn new(queue: impl Into<String>, handler: H) -> Self {
        Self {
            queue: queue.into(),
            handler,
            store: None,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Process one delivery and settle it on `acker`.
    ///
    /// A failed ack/nack is logged and not retried: the delivery stays
    /// unacknowledged and the broker redelivers it once the channel is gone.
    pub async fn process<A>(&self, envelope: &MessageEnvelope, acker: &A) -> ProcessingOutcome
    where
        A: Acknowledger + ?Sized,
    {
        let message_id = envelope
            .message_id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple()));

        let outcome = self.evaluate(envelope, &message_id).await;

        if let Err(e) = acker
            .settle(envelope.delivery_tag, outcome.disposition())
            .await
        {
            error!(
                queue = %self.queue,
                message_id = %message_id,
                delivery_tag = envelope.delivery_tag,
                outcome = ?outcome,
                error = %e,
                "Failed to settle message"
            );
        }
        outcome
    }

    /// Decide the outcome for a delivery without settling it.
    async fn evaluate(&self, envelope: &MessageEnvelope, message_id: &str) -> ProcessingOutcome {
        let started = Instant::now();
        let retries = retry_count(&envelope.headers);

        info!(
            queue = %self.queue,
            message_id = %message_id,
            delivery_tag = envelope.delivery_tag,
            redelivered = envelope.redelivered,
            retry_count = retries,
            "Processing message"
        );

        let event = match DecodedEvent::decode(&envelope.body) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    queue = %self.queue,
                    message_id = %message_id,
                    error = %e,
                    body = %body_preview(&envelope.body),
                    "Invalid JSON in message"
                );
                return ProcessingOutcome::DeadLettered;
            }
        };

        if self.already_processed(&event.event_id).await {
            info!(
                queue = %self.queue,
                message_id = %message_id,
                event_id = %event.event_id,
                "Event already processed, skipping"
            );
            return ProcessingOutcome::DuplicateSkipped;
        }

        match self.handler.handle(&event).await {
            Ok(()) => {
                self.mark_processed(&event.event_id).await;
                info!(
                    queue = %self.queue,
                    message_id = %message_id,
                    event_name = %event.event_name,
                    event_id = %event.event_id,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Message processed successfully"
                );
                ProcessingOutcome::Processed
            }
            Err(err) => {
                let outcome = self.policy.decide(&err, &envelope.headers);
                self.log_failure(&event, message_id, &err, outcome, retries);
                outcome
            }
        }
    }

    async fn already_processed(&self, event_id: &str) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.has_processed(event_id).await {
            Ok(seen) => seen,
            Err(e) => {
                warn!(
                    queue = %self.queue,
                    event_id = %event_id,
                    error = %e,
                    "Idempotency lookup failed, processing as new"
                );
                false
            }
        }
    }

    async fn mark_processed(&self, event_id: &str) {
        let Some(store) = &self.store else {
            return;
        };
        match store.mark_processed(event_id).await {
            Ok(()) => debug!(event_id = %event_id, "Event marked processed"),
            Err(e) => error!(
                queue = %self.queue,
                event_id = %event_id,
                error = %e,
                "Failed to mark event processed"
            ),
        }
    }

    fn log_failure(
        &self,
        event: &DecodedEvent,
        message_id: &str,
        err: &HandlerError,
        outcome: ProcessingOutcome,
        retries: u32,
    ) {
        match (err, outcome) {
            (HandlerError::Business(_), _) => error!(
                queue = %self.queue,
                message_id = %message_id,
                event_name = %event.event_name,
                error = %err,
                "Business logic error - sending to DLQ"
            ),
            (HandlerError::Transient(_), ProcessingOutcome::Requeued) => warn!(
                queue = %self.queue,
                message_id = %message_id,
                event_name = %event.event_name,
                retry_count = retries,
                max_retries = self.policy.max_retries,
                error = %err,
                "Transient error - requeuing message"
            ),
            (HandlerError::Transient(_), _) => error!(
                queue = %self.queue,
                message_id = %message_id,
                event_name = %event.event_name,
                retry_count = retries,
                max_retries = self.policy.max_retries,
                error = %err,
                "Max retries exceeded - sending to DLQ"
            ),
        }
    }
}

fn body_preview(body: &[u8]) -> String {
    let end = body.len().min(BODY_PREVIEW_BYTES);
    String::from_utf8_lossy(&body[..end]).into_owned()
}
