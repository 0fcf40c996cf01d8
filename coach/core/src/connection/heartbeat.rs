//! Heartbeat and Reconnect Settings
//!
//! The connection manager pings the peer every `interval` while connected. A
//! failed ping is handled exactly like a receive error: the connection is
//! considered lost and the reconnect policy takes over.
//!
//! Reconnect delays double from `base_delay`: with the defaults, attempts 1
//! through 5 wait 1, 2, 4, 8 and 16 seconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for heartbeat behavior
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Interval between pings (default: 30 seconds)
    pub interval: Duration,
    /// Whether heartbeat is enabled (can be disabled for testing)
    pub enabled: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            enabled: true,
        }
    }
}

impl HeartbeatConfig {
    /// Create a new config with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a config with heartbeat disabled
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    /// Set the heartbeat interval
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Create a config suitable for testing (short interval)
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(100),
            enabled: true,
        }
    }
}

/// Bounded exponential backoff
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    /// Attempts after a loss before giving up (default: 5)
    pub max_attempts: u32,
    /// Delay before the first attempt (default: 1 second)
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    /// Create a policy with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy that never reconnects
    #[must_use]
    pub fn never() -> Self {
        Self {
            max_attempts: 0,
            ..Default::default()
        }
    }

    /// Set the attempt limit
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the first delay
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Delay before attempt `attempt` (1-based): `base × 2^(attempt−1)`
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << exponent)
    }

    /// Whether another attempt is allowed after `attempts_made`
    #[must_use]
    pub fn allows(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
