//! Connection configuration

use std::time::Duration;

/// Timeout used when a call passes a negative timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(25);

/// Settings the registry hands to every connection it opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Timeout for calls made with `timeout_ms < 0`
    pub default_timeout: Duration,
    /// Short-circuit calls to this connection's own services
    pub loopback_calls: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TIMEOUT,
            loopback_calls: true,
        }
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn loopback_calls(mut self, enabled: bool) -> Self {
        self.loopback_calls = enabled;
        self
    }

    /// Resolve a caller-supplied timeout in milliseconds
    pub fn timeout_for(&self, timeout_ms: i32) -> Duration {
        match u64::try_from(timeout_ms) {
            Ok(ms) => Duration::from_millis(ms),
            Err(_) => self.default_timeout,
        }
    }
}
