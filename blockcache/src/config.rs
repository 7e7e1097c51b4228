//! Engine configuration.
//!
//! Every field has a default, so a config file only needs the keys it changes:
//!
//! ```json
//! { "block-size": 4194304, "workers": 4 }
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const MB: u64 = 1024 * 1024;
pub const DEFAULT_BLOCK_SIZE: u64 = 8 * MB;
pub const DEFAULT_MEM_SIZE: u64 = 1024 * MB;
pub const DEFAULT_MAX_BLOCKS: u32 = 50_000;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Block size in bytes.
    pub block_size: u64,
    /// Total buffer pool budget in bytes.
    pub mem_size: u64,
    pub workers: usize,
    /// Blocks prefetched after a synchronous miss.
    pub read_ahead: u32,
    pub max_blocks: u32,
    /// Capacity of each worker queue.
    pub queue_capacity: usize,
    /// How long a synchronous caller waits on a background transfer before
    /// cancelling it.
    pub sync_wait_ms: u64,
    pub acquire_timeout_ms: u64,
    pub idle_evict_ms: u64,
    pub maintenance_interval_ms: u64,
    /// Percent of the pool that local (dirty) buffers may occupy before the
    /// upload scheduler starts writing them back.
    pub local_watermark: u8,
    /// Percent of the pool that synced buffers may occupy before they are
    /// reclaimed regardless of idleness.
    pub synced_watermark: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            mem_size: DEFAULT_MEM_SIZE,
            workers: 8,
            read_ahead: 3,
            max_blocks: DEFAULT_MAX_BLOCKS,
            queue_capacity: 500,
            sync_wait_ms: 1000,
            acquire_timeout_ms: 5000,
            idle_evict_ms: 2000,
            maintenance_interval_ms: 500,
            local_watermark: 20,
            synced_watermark: 60,
        }
    }
}

impl Config {
    /// Defaults with block size and memory budget given in megabytes.
    pub fn from_mb(block_size_mb: u64, mem_size_mb: u64) -> Self {
        Self {
            block_size: block_size_mb * MB,
            mem_size: mem_size_mb * MB,
            ..Self::default()
        }
    }

    /// Load a JSON config file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        let cfg: Config = serde_json::from_slice(&raw)
            .map_err(|e| Error::Config(format!("parse {}: {e}", path.display())))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(Error::Config("block-size must be positive".into()));
        }
        if self.block_size > u32::MAX as u64 {
            return Err(Error::Config("block-size must fit in 32 bits".into()));
        }
        if self.mem_size < self.block_size {
            return Err(Error::Config(
                "mem-size must hold at least one block".into(),
            ));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(Error::Config("queue-capacity must be positive".into()));
        }
        if self.max_blocks == 0 {
            return Err(Error::Config("max-blocks must be positive".into()));
        }
        if self.local_watermark > 100 || self.synced_watermark > 100 {
            return Err(Error::Config("watermarks are percentages".into()));
        }
        Ok(())
    }

    /// Number of buffers the pool may hand out.
    pub fn max_buffers(&self) -> usize {
        (self.mem_size / self.block_size.max(1)) as usize
    }

    pub fn sync_wait(&self) -> Duration {
        Duration::from_millis(self.sync_wait_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_evict(&self) -> Duration {
        Duration::from_millis(self.idle_evict_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }
}
