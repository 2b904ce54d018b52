//! Effect target and idempotency store configuration.

use serde::Deserialize;

use crate::idempotency::DEFAULT_MEMORY_CAPACITY;

/// Idempotency store discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdempotencyType {
    /// Every delivery is treated as unseen.
    #[default]
    None,
    /// Process-local bounded set. Lost on restart.
    Memory,
    /// Shared Redis set (requires the `redis` feature).
    Redis,
}

/// Idempotency store configuration (discriminated union).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    #[serde(rename = "type")]
    pub store_type: IdempotencyType,
    pub memory: MemoryConfig,
    pub redis: RedisConfig,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            store_type: IdempotencyType::None,
            memory: MemoryConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

/// In-memory store configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Ids remembered before the oldest is evicted.
    pub capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_MEMORY_CAPACITY,
        }
    }
}

/// Redis-specific configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    pub key_prefix: String,
    /// Marker retention in seconds.
    pub ttl_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "quiver".to_string(),
            ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Effect target discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    /// Log each event as a customer notification.
    #[default]
    Notification,
    /// POST each event to `url`.
    Http,
}

/// Where decoded events are applied.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    #[serde(rename = "type")]
    pub target_type: TargetType,
    /// HTTP endpoint. Required for `http`.
    pub url: Option<String>,
    /// HTTP request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            target_type: TargetType::Notification,
            url: None,
            timeout_secs: 30,
        }
    }
}
