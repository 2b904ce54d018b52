//! Delivery loop and reconnect configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::broker::ReconnectStrategy;
use crate::consumer::{ConsumerOptions, DEFAULT_MAX_RETRIES, DEFAULT_PREFETCH_COUNT};

/// Delivery loop settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Queue to consume. Required.
    pub queue: String,
    /// Consumer tag; generated when absent.
    pub consumer_tag: Option<String>,
    pub prefetch_count: u16,
    pub max_retries: u32,
    /// Pause after a non-connection transport error, in milliseconds.
    pub error_pause_ms: u64,
    /// Stop the consumer after this many seconds. Runs until signalled when
    /// absent or zero.
    pub run_timeout_secs: Option<u64>,
    pub reconnect: ReconnectConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queue: String::new(),
            consumer_tag: None,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            max_retries: DEFAULT_MAX_RETRIES,
            error_pause_ms: 100,
            run_timeout_secs: None,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn options(&self) -> ConsumerOptions {
        let options = ConsumerOptions::new(&self.queue)
            .with_prefetch_count(self.prefetch_count)
            .with_max_retries(self.max_retries)
            .with_error_pause(Duration::from_millis(self.error_pause_ms));
        match &self.consumer_tag {
            Some(tag) => options.with_consumer_tag(tag),
            None => options,
        }
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Reconnect strategy discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectType {
    #[default]
    Fixed,
    Exponential,
}

/// Reconnect settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    #[serde(rename = "type")]
    pub reconnect_type: ReconnectType,
    /// Fixed delay, or the first exponential delay.
    pub delay_ms: u64,
    /// Exponential only: delay ceiling.
    pub max_delay_ms: u64,
    /// Exponential only: attempts before giving up.
    pub max_attempts: usize,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            reconnect_type: ReconnectType::Fixed,
            delay_ms: 5_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    pub fn strategy(&self) -> ReconnectStrategy {
        match self.reconnect_type {
            ReconnectType::Fixed => ReconnectStrategy::Fixed {
                delay: Duration::from_millis(self.delay_ms),
            },
            ReconnectType::Exponential => ReconnectStrategy::Exponential {
                min_delay: Duration::from_millis(self.delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
                max_attempts: self.max_attempts,
            },
        }
    }
}
