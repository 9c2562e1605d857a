//! Client configuration.

use std::time::Duration;

/// Pacing for the re-encryption loop.
#[derive(Debug, Clone)]
pub struct ReencryptionConfig {
    /// Environments rotated per request.
    pub batch_size: usize,
    /// Minimum wait before each batch.
    pub min_delay: Duration,
    /// Upper bound of the random wait added to `min_delay`.
    pub jitter: Duration,
    /// How long to wait for in-flight fetches and updates on a batch's
    /// env parents before giving up.
    pub in_flight_timeout: Duration,
    /// Poll interval while waiting on in-flight work.
    pub poll_interval: Duration,
}

impl Default for ReencryptionConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            min_delay: Duration::from_secs(1),
            jitter: Duration::from_secs(2),
            in_flight_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ReencryptionConfig {
    /// No waiting between batches. Useful in tests.
    pub fn immediate(batch_size: usize) -> Self {
        Self {
            batch_size,
            min_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            in_flight_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(5),
        }
    }
}

/// Configuration for [`crate::Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub reencryption: ReencryptionConfig,
    /// Extra fetch rounds a key grant may take when required envs are
    /// missing locally.
    pub fetch_retry_attempts: usize,
    /// Lifetime of new invites, device grants and recovery keys.
    /// `None` means they never expire.
    pub onboarding_ttl: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            reencryption: ReencryptionConfig::default(),
            fetch_retry_attempts: 3,
            onboarding_ttl: Some(Duration::from_secs(24 * 60 * 60)),
        }
    }
}
