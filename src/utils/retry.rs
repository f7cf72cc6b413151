//! Retry utilities: backoff builders for broker sessions.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Delay used once a finite backoff sequence is exhausted.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Backoff for the broker producer connect.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 10
/// - Jitter enabled
pub fn connection_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(10)
        .with_jitter()
}

/// Backoff between consumer reconnect attempts.
///
/// Callers rebuild the iterator once a session has delivered a record and
/// fall back to `MAX_RECONNECT_DELAY` once it runs dry, so retries never stop.
///
/// - Min delay: 100ms
/// - Max delay: 30s
/// - Jitter enabled
pub fn consumer_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(MAX_RECONNECT_DELAY)
        .with_max_times(16)
        .with_jitter()
}

#[cfg(test)]
mod tests {
    use super::*;
    use backon::BackoffBuilder;

    #[test]
    fn test_connection_backoff_is_bounded() {
        let delays: Vec<Duration> = connection_backoff().build().collect();
        assert_eq!(delays.len(), 10);
        // Jitter can at most double the capped delay
        assert!(delays.iter().all(|d| *d <= Duration::from_secs(10)));
    }

    #[test]
    fn test_consumer_backoff_starts_small() {
        let first = consumer_backoff().build().next().unwrap();
        assert!(first < Duration::from_secs(1));
    }
}
