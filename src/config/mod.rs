//! Application configuration.
//!
//! Aggregates broker, consumer, idempotency and target settings into a single
//! Config struct that can be loaded from YAML files or environment variables.

mod broker;
mod consumer;
mod target;

pub use broker::BrokerConfig;
pub use consumer::{ConsumerConfig, ReconnectConfig, ReconnectType};
pub use target::{
    IdempotencyConfig, IdempotencyType, MemoryConfig, RedisConfig, TargetConfig, TargetType,
};

use serde::Deserialize;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "QUIVER_CONFIG";
/// Prefix for environment overrides (`QUIVER__CONSUMER__QUEUE=...`).
pub const CONFIG_ENV_PREFIX: &str = "QUIVER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "QUIVER_LOG";
/// Environment variable selecting the log output format (`json` or plain).
pub const LOG_FORMAT_ENV_VAR: &str = "QUIVER_LOG_FORMAT";

/// Legacy broker variables, mapped to the config keys they default.
const LEGACY_BROKER_ENV_VARS: &[(&str, &str)] = &[
    ("RABBITMQ_HOST", "broker.host"),
    ("RABBITMQ_PORT", "broker.port"),
    ("RABBITMQ_USER", "broker.username"),
    ("RABBITMQ_PASSWORD", "broker.password"),
    ("RABBITMQ_VHOST", "broker.vhost"),
];

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub consumer: ConsumerConfig,
    pub idempotency: IdempotencyConfig,
    pub target: TargetConfig,
}

impl Config {
    /// Load configuration.
    ///
    /// Sources, lowest priority first:
    /// - legacy `RABBITMQ_*` variables
    /// - `config.yaml` in the current directory
    /// - the file at `path`
    /// - the file named by `QUIVER_CONFIG`
    /// - `QUIVER__*` variables
    ///
    /// Call [`Config::validate`] once command-line overrides are applied.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder();

        for (var, key) in LEGACY_BROKER_ENV_VARS {
            if let Ok(value) = std::env::var(var) {
                builder = builder.set_default(*key, value)?;
            }
        }

        builder = builder
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Reject settings the consumer cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consumer.queue.trim().is_empty() {
            return Err(ConfigError::Invalid("consumer.queue is required".to_string()));
        }
        if self.consumer.prefetch_count == 0 {
            return Err(ConfigError::Invalid(
                "consumer.prefetch_count must be at least 1".to_string(),
            ));
        }
        if self.target.target_type == TargetType::Http
            && self.target.url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return Err(ConfigError::Invalid(
                "target.url is required for the http target".to_string(),
            ));
        }
        if self.consumer.reconnect.reconnect_type == ReconnectType::Exponential
            && self.consumer.reconnect.max_attempts == 0
        {
            return Err(ConfigError::Invalid(
                "consumer.reconnect.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.idempotency.store_type == IdempotencyType::Memory
            && self.idempotency.memory.capacity == 0
        {
            return Err(ConfigError::Invalid(
                "idempotency.memory.capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
