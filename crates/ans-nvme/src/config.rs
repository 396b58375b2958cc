use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{NvmeError, Result};
use crate::tags::{ADMIN_QUEUE_DEPTH, MAX_QUEUE_DEPTH};

/// Tunables for one controller instance.
///
/// Every field has a default matching the ANS2 firmware defaults, so a config file only needs to
/// name what it overrides.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// I/O ring depth. The I/O tag range is `ADMIN_QUEUE_DEPTH..io_queue_depth - 1`.
    pub io_queue_depth: u16,
    pub io_timeout_ms: u64,
    /// Deadline for admin commands; also bounds queue deletion during disable.
    pub admin_timeout_ms: u64,
    pub shutdown_timeout_ms: u64,
    pub boot_timeout_ms: u64,
    pub boot_status_timeout_ms: u64,
    /// Device-wide number of abort commands that may be outstanding at once.
    pub abort_limit: u16,
    pub small_pool_blocks: usize,
    pub page_pool_pages: usize,
    pub lba_shift: u8,
    pub nsid: u32,
    pub max_transfer_bytes: u32,
    pub max_segments: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            io_queue_depth: MAX_QUEUE_DEPTH,
            io_timeout_ms: 30_000,
            admin_timeout_ms: 60_000,
            shutdown_timeout_ms: 5_000,
            boot_timeout_ms: 1_000,
            boot_status_timeout_ms: 10_000,
            abort_limit: 4,
            small_pool_blocks: 128,
            page_pool_pages: 64,
            lba_shift: 12,
            nsid: 1,
            max_transfer_bytes: 4 << 20,
            max_segments: 127,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.io_queue_depth <= ADMIN_QUEUE_DEPTH + 1 || self.io_queue_depth > MAX_QUEUE_DEPTH {
            return Err(NvmeError::InvalidConfig(
                "io_queue_depth must be in 34..=64 (tags below 32 belong to the admin queue)",
            ));
        }
        if self.io_timeout_ms == 0 || self.admin_timeout_ms == 0 || self.shutdown_timeout_ms == 0 {
            return Err(NvmeError::InvalidConfig("timeouts must be non-zero"));
        }
        if self.boot_timeout_ms == 0 || self.boot_status_timeout_ms == 0 {
            return Err(NvmeError::InvalidConfig("boot timeouts must be non-zero"));
        }
        if self.abort_limit == 0 {
            return Err(NvmeError::InvalidConfig("abort_limit must be at least 1"));
        }
        if self.small_pool_blocks == 0 || self.page_pool_pages == 0 {
            return Err(NvmeError::InvalidConfig("PRP pools must not be empty"));
        }
        if !(9..=16).contains(&self.lba_shift) {
            return Err(NvmeError::InvalidConfig("lba_shift must be in 9..=16"));
        }
        if self.nsid == 0 || self.nsid == u32::MAX {
            return Err(NvmeError::InvalidConfig("nsid must name a single namespace"));
        }
        if self.max_transfer_bytes < (1 << self.lba_shift) {
            return Err(NvmeError::InvalidConfig(
                "max_transfer_bytes must cover at least one logical block",
            ));
        }
        if self.max_segments == 0 {
            return Err(NvmeError::InvalidConfig("max_segments must be at least 1"));
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn admin_timeout(&self) -> Duration {
        Duration::from_millis(self.admin_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }

    pub fn boot_status_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_status_timeout_ms)
    }

    pub fn block_size(&self) -> u32 {
        1 << self.lba_shift
    }
}
