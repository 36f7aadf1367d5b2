//! Reconnection backoff policy
//!
//! Exponential backoff between connect attempts

use serde::Serialize;
use std::time::{Duration, Instant};

/// Delay before the second connect attempt
pub const RECONNECT_INITIAL_DELAY: Duration = Duration::from_secs(5);
/// Multiplier applied after every failed attempt
pub const RECONNECT_BACKOFF_FACTOR: f64 = 2.0;

/// Reconnection policy configuration
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Backoff multiplier for exponential delay
    pub backoff_multiplier: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: RECONNECT_INITIAL_DELAY,
            max_delay: Duration::from_secs(60),
            backoff_multiplier: RECONNECT_BACKOFF_FACTOR,
        }
    }
}

impl ReconnectPolicy {
    /// Create with the default initial delay and factor
    pub fn with_max_delay(max_delay: Duration) -> Self {
        Self {
            max_delay,
            ..Self::default()
        }
    }

    /// Delay to use after the current one has been slept
    ///
    /// `min(current * multiplier, max_delay)`
    pub fn next_delay(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.backoff_multiplier)
            .min(self.max_delay)
    }
}

/// Reconnection statistics tracking
#[derive(Debug, Default, Clone, Serialize)]
pub struct ReconnectStats {
    /// Total connect attempts made by the reconnect loop
    pub total_attempts: u64,
    /// Successful reconnection count
    pub successful_reconnects: u64,
    /// Failed reconnection count
    pub failed_reconnects: u64,
    /// Last successful connection time
    #[serde(skip)]
    pub last_connected: Option<Instant>,
}
