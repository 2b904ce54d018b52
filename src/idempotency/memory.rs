//! In-memory idempotency store. Contents are lost on restart.
//!
//! Holds at most `capacity` ids; marking a new id beyond that evicts the
//! oldest one.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{IdempotencyStore, StoreError};

/// Default number of remembered event ids.
pub const DEFAULT_MEMORY_CAPACITY: usize = 100_000;

#[derive(Default)]
struct Seen {
    ids: HashSet<String>,
    order: VecDeque<String>,
}

pub struct InMemoryIdempotencyStore {
    seen: RwLock<Seen>,
    capacity: usize,
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_MEMORY_CAPACITY)
    }
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store remembering at most `capacity` ids (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: RwLock::new(Seen::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub async fn len(&self) -> usize {
        self.seen.read().await.ids.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.seen.read().await.ids.is_empty()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn has_processed(&self, event_id: &str) -> Result<bool, StoreError> {
        Ok(self.seen.read().await.ids.contains(event_id))
    }

    async fn mark_processed(&self, event_id: &str) -> Result<(), StoreError> {
        let mut seen = self.seen.write().await;
        if !seen.ids.insert(event_id.to_string()) {
            return Ok(());
        }
        seen.order.push_back(event_id.to_string());

        while seen.order.len() > self.capacity {
            if let Some(oldest) = seen.order.pop_front() {
                seen.ids.remove(&oldest);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mark_then_seen() {
        let store = InMemoryIdempotencyStore::new();

        assert!(!store.has_processed("evt-1").await.unwrap());
        store.mark_processed("evt-1").await.unwrap();

        assert!(store.has_processed("evt-1").await.unwrap());
        assert!(!store.has_processed("evt-2").await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_twice_is_noop() {
        let store = InMemoryIdempotencyStore::new();

        store.mark_processed("evt-1").await.unwrap();
        store.mark_processed("evt-1").await.unwrap();

        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_oldest_id_evicted_at_capacity() {
        let store = InMemoryIdempotencyStore::with_capacity(3);

        for id in ["evt-1", "evt-2", "evt-3", "evt-4"] {
            store.mark_processed(id).await.unwrap();
        }

        assert_eq!(store.len().await, 3);
        assert!(!store.has_processed("evt-1").await.unwrap());
        assert!(store.has_processed("evt-2").await.unwrap());
        assert!(store.has_processed("evt-4").await.unwrap());
    }

    #[tokio::test]
    async fn test_many_events_stay_bounded() {
        let store = InMemoryIdempotencyStore::with_capacity(1_000);

        for i in 0..20_000 {
            store.mark_processed(&format!("evt-{}", i)).await.unwrap();
        }

        assert_eq!(store.len().await, 1_000);
        assert!(store.has_processed("evt-19999").await.unwrap());
        assert!(!store.has_processed("evt-18999").await.unwrap());
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        assert_eq!(InMemoryIdempotencyStore::with_capacity(0).capacity(), 1);
    }
}
