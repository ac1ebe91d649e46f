//! Host-side tunables for an upgrade session.

use std::time::Duration;

/// Configuration for an OTA session.
///
/// All values are host-side policy and independent of the connected device.
#[derive(Debug, Clone)]
pub struct OtaConfig {
    /// Timeout for a single command/response exchange. Also bounds the gap
    /// between consecutive device-initiated file requests during transfer.
    pub command_timeout: Duration,
    /// How long to wait for the device to reappear after a reboot.
    pub reconnect_timeout: Duration,
    /// How long to wait for the device to go offline after it has been told
    /// to switch communication mode.
    pub offline_wait_timeout: Duration,
    /// Maximum number of initial connection attempts.
    pub max_retries: u32,
    /// Upper bound on the number of file bytes served in one block reply.
    /// Device requests for more are clamped to this.
    pub block_size: u16,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(8),
            reconnect_timeout: Duration::from_secs(30),
            offline_wait_timeout: Duration::from_secs(20),
            max_retries: 3,
            block_size: 512,
        }
    }
}

impl OtaConfig {
    /// Set the command/response timeout.
    #[must_use]
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the reconnect timeout.
    #[must_use]
    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    /// Set the offline-wait timeout.
    #[must_use]
    pub fn with_offline_wait_timeout(mut self, timeout: Duration) -> Self {
        self.offline_wait_timeout = timeout;
        self
    }

    /// Set the maximum number of initial connection attempts.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the per-reply block size cap.
    #[must_use]
    pub fn with_block_size(mut self, block_size: u16) -> Self {
        self.block_size = block_size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OtaConfig::default();
        assert_eq!(config.command_timeout, Duration::from_secs(8));
        assert_eq!(config.reconnect_timeout, Duration::from_secs(30));
        assert_eq!(config.offline_wait_timeout, Duration::from_secs(20));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.block_size, 512);
    }

    #[test]
    fn test_builder_setters() {
        let config = OtaConfig::default()
            .with_command_timeout(Duration::from_secs(2))
            .with_reconnect_timeout(Duration::from_secs(10))
            .with_offline_wait_timeout(Duration::from_secs(5))
            .with_max_retries(1)
            .with_block_size(128);
        assert_eq!(config.command_timeout, Duration::from_secs(2));
        assert_eq!(config.reconnect_timeout, Duration::from_secs(10));
        assert_eq!(config.offline_wait_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.block_size, 128);
    }
}
