//! Shared helpers for the consumer binary and the connection manager.

pub mod bootstrap;
pub mod retry;
