//! Redis idempotency store.
//!
//! Key format: `{prefix}:processed:{event_id}`. Keys expire after the
//! configured TTL so the set does not grow without bound.

use std::time::Duration;

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use tracing::{debug, info};

use super::{IdempotencyStore, StoreError};

/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "quiver";

/// Default retention for processed markers.
pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
    key_prefix: String,
    ttl: Duration,
}

impl RedisIdempotencyStore {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    /// * `key_prefix` - Prefix for all keys (default: "quiver")
    /// * `ttl` - Marker retention (default: 7 days)
    pub async fn new(
        url: &str,
        key_prefix: Option<&str>,
        ttl: Option<Duration>,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(url = %redacted_url(url), "Connected to Redis for idempotency");

        Ok(Self {
            conn,
            key_prefix: key_prefix.unwrap_or(DEFAULT_KEY_PREFIX).to_string(),
            ttl: ttl.unwrap_or(DEFAULT_TTL),
        })
    }

    fn processed_key(&self, event_id: &str) -> String {
        format!("{}:processed:{}", self.key_prefix, event_id)
    }
}

/// `url` with any password in its user info replaced by `***`.
fn redacted_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let (authority, path) = rest.split_at(authority_end);
    let Some((user_info, host)) = authority.rsplit_once('@') else {
        return url.to_string();
    };
    let user = match user_info.split_once(':') {
        Some((user, _password)) => format!("{}:***", user),
        None => user_info.to_string(),
    };
    format!("{}://{}@{}{}", scheme, user, host, path)
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn has_processed(&self, event_id: &str) -> Result<bool, StoreError> {
        let key = self.processed_key(event_id);
        let mut conn = self.conn.clone();

        let exists: bool = conn.exists(&key).await?;
        Ok(exists)
    }

    async fn mark_processed(&self, event_id: &str) -> Result<(), StoreError> {
        let key = self.processed_key(event_id);
        let mut conn = self.conn.clone();

        // NX keeps the first marker's expiry when a redelivery races a mark.
        let _: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(1)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        debug!(event_id = %event_id, "Marked event processed in Redis");
        Ok(())
    }
}
