//! Host configuration and contract constants
//!
//! Timeout values mirror the firmware contract. Tests and the CLI shrink them
//! through the `with_*` builders; nothing else reads the constants directly.

use std::time::Duration;

/// Firmware interface version reported by `get_info`
pub const FIRMWARE_VERSION: u32 = 0x0000_1000;

/// Maximum number of simultaneously loaded networks
pub const MAX_LOADED_NETWORK: usize = 32;

/// Images larger than this use the large exec timeout (5 KiB)
pub const LARGE_NETWORK_SIZE_THRESHOLD: u32 = 5 * 1024;

/// Length of each IPC ring in 32-bit words
pub const NPU_IPC_BUF_LENGTH: usize = 512;

/// Exec timeout for small networks (5 min)
pub const NW_SMALL_EXEC_TIMEOUT_MS: u64 = 1000 * 300;

/// Exec timeout for large networks (60 min)
pub const NW_LARGE_EXEC_TIMEOUT_MS: u64 = 1000 * 300 * 12;

/// Load timeout (5 min)
pub const NW_LOAD_TIMEOUT_MS: u64 = 1000 * 300;

/// Unload timeout (5 min)
pub const NW_UNLOAD_TIMEOUT_MS: u64 = 1000 * 300;

/// Time `deinit` waits for in-flight operations before cancelling them
pub const DEINIT_GRACE_MS: u64 = 5000;

/// Host context configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Deadline for a load response
    pub load_timeout: Duration,

    /// Deadline for an unload response
    pub unload_timeout: Duration,

    /// Deadline for exec of a network at or below the size threshold
    pub small_exec_timeout: Duration,

    /// Deadline for exec of a network above the size threshold
    pub large_exec_timeout: Duration,

    /// Size in bytes above which a network counts as large
    pub large_network_threshold: u32,

    /// Grace period `deinit` allows in-flight operations
    pub deinit_grace: Duration,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            load_timeout: Duration::from_millis(NW_LOAD_TIMEOUT_MS),
            unload_timeout: Duration::from_millis(NW_UNLOAD_TIMEOUT_MS),
            small_exec_timeout: Duration::from_millis(NW_SMALL_EXEC_TIMEOUT_MS),
            large_exec_timeout: Duration::from_millis(NW_LARGE_EXEC_TIMEOUT_MS),
            large_network_threshold: LARGE_NETWORK_SIZE_THRESHOLD,
            deinit_grace: Duration::from_millis(DEINIT_GRACE_MS),
        }
    }
}

impl HostConfig {
    /// Set the load timeout
    #[must_use]
    pub const fn with_load_timeout(mut self, timeout: Duration) -> Self {
        self.load_timeout = timeout;
        self
    }

    /// Set the unload timeout
    #[must_use]
    pub const fn with_unload_timeout(mut self, timeout: Duration) -> Self {
        self.unload_timeout = timeout;
        self
    }

    /// Set both exec timeouts
    #[must_use]
    pub const fn with_exec_timeouts(mut self, small: Duration, large: Duration) -> Self {
        self.small_exec_timeout = small;
        self.large_exec_timeout = large;
        self
    }

    /// Set the `deinit` grace period
    #[must_use]
    pub const fn with_deinit_grace(mut self, grace: Duration) -> Self {
        self.deinit_grace = grace;
        self
    }

    /// Exec deadline for a network image of `size` bytes
    pub const fn exec_timeout(&self, size: u32) -> Duration {
        if size > self.large_network_threshold {
            self.large_exec_timeout
        } else {
            self.small_exec_timeout
        }
    }
}

/// Duration as whole milliseconds, saturating
pub(crate) fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
