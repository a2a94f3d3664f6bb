//! Router configuration

use std::time::Duration;

/// Connection router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Interval between heartbeats on every connection
    pub heartbeat_interval: Duration,

    /// Interval between liveness checks
    ///
    /// An open connection not heard from during one interval is closed.
    pub heartbeat_check_interval: Duration,

    /// Round-trip budget of a direct open request
    pub open_timeout: Duration,

    /// Maximum buffered messages per destination while connecting
    pub max_pending_messages: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            heartbeat_check_interval: Duration::from_secs(3),
            open_timeout: Duration::from_secs(2),
            max_pending_messages: 256,
        }
    }
}

impl RouterConfig {
    /// Check the configuration for unusable values
    ///
    /// # Errors
    /// Returns a description of the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval.is_zero() {
            return Err("heartbeat_interval must not be zero".to_string());
        }
        if self.heartbeat_check_interval.is_zero() {
            return Err("heartbeat_check_interval must not be zero".to_string());
        }
        if self.open_timeout.is_zero() {
            return Err("open_timeout must not be zero".to_string());
        }
        if self.max_pending_messages == 0 {
            return Err("max_pending_messages must be at least 1".to_string());
        }
        Ok(())
    }
}
