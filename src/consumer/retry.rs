//! Retry and dead-letter policy.
//!
//! The retry count is not stored by the consumer. RabbitMQ appends to the
//! `x-death` header each time a message is dead-lettered and comes back, and
//! the policy reads the `count` of the most recent entry on every delivery.

use lapin::types::{AMQPValue, FieldTable};

use super::processor::ProcessingOutcome;
use crate::handler::HandlerError;

/// Transient failures allowed before a message is dead-lettered.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Broker-maintained dead-letter history header.
pub const DEATH_HEADER: &str = "x-death";

/// Requeue-or-dead-letter decision for failed deliveries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Outcome for a delivery whose handler failed with `error`.
    ///
    /// Business failures are dead-lettered immediately. Transient failures
    /// are requeued until the death count reaches `max_retries`.
    pub fn decide(&self, error: &HandlerError, headers: &FieldTable) -> ProcessingOutcome {
        match error {
            HandlerError::Business(_) => ProcessingOutcome::DeadLettered,
            HandlerError::Transient(_) if retry_count(headers) >= self.max_retries => {
                ProcessingOutcome::DeadLettered
            }
            HandlerError::Transient(_) => ProcessingOutcome::Requeued,
        }
    }
}

/// `count` of the first `x-death` entry, or 0 when the header is absent or
/// not shaped as expected.
pub fn retry_count(headers: &FieldTable) -> u32 {
    let Some(AMQPValue::FieldArray(deaths)) = header(headers, DEATH_HEADER) else {
        return 0;
    };
    let Some(AMQPValue::FieldTable(latest)) = deaths.as_slice().first() else {
        return 0;
    };
    header(latest, "count").and_then(as_count).unwrap_or(0)
}

fn header<'a>(table: &'a FieldTable, name: &str) -> Option<&'a AMQPValue> {
    table
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == name)
        .map(|(_, value)| value)
}

fn as_count(value: &AMQPValue) -> Option<u32> {
    let count: i128 = match *value {
        AMQPValue::ShortShortInt(n) => n.into(),
        AMQPValue::ShortShortUInt(n) => n.into(),
        AMQPValue::ShortInt(n) => n.into(),
        AMQPValue::ShortUInt(n) => n.into(),
        AMQPValue::LongInt(n) => n.into(),
        AMQPValue::LongUInt(n) => n.into(),
        AMQPValue::LongLongInt(n) => n.into(),
        _ => return None,
    };
    Some(u32::try_from(count.max(0)).unwrap_or(u32::MAX))
}
