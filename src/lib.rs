//! Quiver - AMQP event consumer
//!
//! A long-running consumer that subscribes to one RabbitMQ queue and applies
//! each delivered event exactly-effectively-once: manual acknowledgment,
//! bounded retry via the broker's death history, dead-lettering of poison
//! messages and optional idempotency tracking.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod event;
pub mod handler;
pub mod idempotency;
pub mod utils;
