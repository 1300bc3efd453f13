//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for a guest re-joining the control channel after its host went away.
///
/// - Min delay: 50ms
/// - Max delay: 2s
/// - Max attempts: 20
/// - Jitter enabled
pub fn rejoin_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(20)
        .with_jitter()
}

/// Backoff for retrying `connect` on a socket that is held by a listener
/// still starting up.
///
/// - Min delay: 10ms
/// - Max delay: 200ms
/// - Max attempts: 5
pub fn socket_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(200))
        .with_max_times(5)
}
