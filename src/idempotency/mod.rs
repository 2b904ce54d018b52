//! Idempotency store.
//!
//! Records the `event_id`s whose effects have been applied so redeliveries can
//! be acknowledged without calling the effect handler again.
//!
//! This module contains:
//! - `IdempotencyStore` trait
//! - `StoreError`
//! - Implementations: in-memory, Redis (feature `redis`)

use async_trait::async_trait;

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::{InMemoryIdempotencyStore, DEFAULT_MEMORY_CAPACITY};
#[cfg(feature = "redis")]
pub use self::redis::RedisIdempotencyStore;

/// Errors raised by idempotency store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Set of processed event ids.
///
/// `mark_processed` is called only after the effect handler succeeded. A
/// failure between the effect and the mark leaves a window in which a
/// redelivery re-applies the effect.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Whether `event_id` has been marked processed.
    async fn has_processed(&self, event_id: &str) -> Result<bool, StoreError>;

    /// Record `event_id` as processed. Marking twice is not an error.
    async fn mark_processed(&self, event_id: &str) -> Result<(), StoreError>;
}
