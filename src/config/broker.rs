//! Broker connection configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::broker::BrokerEndpoint;

/// RabbitMQ connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Heartbeat interval in seconds.
    pub heartbeat_secs: u64,
    /// TCP connect + handshake deadline in seconds.
    pub connect_timeout_secs: u64,
    /// Channel operation deadline in seconds.
    pub read_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            heartbeat_secs: 60,
            connect_timeout_secs: 10,
            read_timeout_secs: 10,
        }
    }
}

impl BrokerConfig {
    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            heartbeat: Duration::from_secs(self.heartbeat_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            read_timeout: Duration::from_secs(self.read_timeout_secs),
            ..BrokerEndpoint::new(&self.host, self.port)
                .with_credentials(&self.username, &self.password)
                .with_vhost(&self.vhost)
        }
    }
}
