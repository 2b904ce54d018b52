//! Retry utilities: backoff builders for broker reconnects.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for broker reconnect attempts.
///
/// - Min delay: `min_delay`
/// - Max delay: `max_delay`
/// - Max attempts: `max_attempts`
/// - Jitter enabled
pub fn reconnect_backoff(
    min_delay: Duration,
    max_delay: Duration,
    max_attempts: usize,
) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min_delay)
        .with_max_delay(max_delay)
        .with_max_times(max_attempts)
        .with_jitter()
}
