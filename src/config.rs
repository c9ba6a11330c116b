//! Database configuration.
//!
//! Mirrors the configuration keys the storage layer exposes: buffer pool
//! sizing, threading limits, compression, checkpointing, and durability.

use crate::error::{Result, StorageError};
use std::path::Path;
use std::time::Duration;

/// Tunable parameters for a [`crate::db::Database`].
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of pages the buffer manager may keep resident at once.
    pub buffer_pool_size: usize,
    /// Upper bound on task scheduler worker threads.
    pub max_num_threads: usize,
    /// Whether string/blob column chunks use dictionary compression.
    pub enable_compression: bool,
    /// Opens the database without permitting writes.
    pub read_only: bool,
    /// Hard ceiling on total on-disk size, in bytes. `None` means unbounded.
    pub max_db_size: Option<u64>,
    /// Whether checkpoints are triggered automatically once the WAL grows
    /// past `checkpoint_threshold` bytes.
    pub auto_checkpoint: bool,
    /// WAL size, in bytes, that triggers an automatic checkpoint.
    pub checkpoint_threshold: u64,
    /// How long a checkpoint waits for in-flight writers to drain before
    /// giving up with `CheckpointBusy`.
    pub checkpoint_wait_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            buffer_pool_size: 4096,
            max_num_threads: 4,
            enable_compression: false,
            read_only: false,
            max_db_size: None,
            auto_checkpoint: true,
            checkpoint_threshold: 64 * 1024 * 1024,
            checkpoint_wait_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Durability-first preset: small checkpoint threshold, generous wait
    /// timeout, compression off to keep write paths simple to reason about.
    pub fn production() -> Self {
        Self {
            buffer_pool_size: 16384,
            max_num_threads: 8,
            enable_compression: true,
            read_only: false,
            max_db_size: None,
            auto_checkpoint: true,
            checkpoint_threshold: 32 * 1024 * 1024,
            checkpoint_wait_timeout: Duration::from_secs(60),
        }
    }

    /// Throughput-first preset for bulk loads and benchmarks: larger buffer
    /// pool, bigger checkpoint threshold, no compression overhead.
    pub fn benchmark() -> Self {
        Self {
            buffer_pool_size: 65536,
            max_num_threads: 16,
            enable_compression: false,
            read_only: false,
            max_db_size: None,
            auto_checkpoint: false,
            checkpoint_threshold: 512 * 1024 * 1024,
            checkpoint_wait_timeout: Duration::from_secs(5),
        }
    }

    /// Opens an existing database strictly for reads: no WAL writer, no
    /// scheduler threads beyond what scans need.
    pub fn read_only() -> Self {
        Self {
            buffer_pool_size: 8192,
            max_num_threads: 4,
            enable_compression: false,
            read_only: true,
            max_db_size: None,
            auto_checkpoint: false,
            checkpoint_threshold: u64::MAX,
            checkpoint_wait_timeout: Duration::from_secs(1),
        }
    }

    /// Validates field combinations that can't be expressed in the type
    /// system alone.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_pool_size == 0 {
            return Err(StorageError::ConfigError(
                "buffer_pool_size must be nonzero".into(),
            ));
        }
        if self.max_num_threads == 0 {
            return Err(StorageError::ConfigError(
                "max_num_threads must be nonzero".into(),
            ));
        }
        if let Some(max) = self.max_db_size {
            let page_size = crate::pager::DEFAULT_PAGE_SIZE as u64;
            if max < page_size || !max.is_power_of_two() {
                return Err(StorageError::ConfigError(format!(
                    "max_db_size must be a power of two >= the page size ({page_size}), got {max}"
                )));
            }
        }
        if self.read_only && self.auto_checkpoint {
            return Err(StorageError::ConfigError(
                "auto_checkpoint cannot be enabled on a read_only configuration".into(),
            ));
        }
        Ok(())
    }

    /// Loads a configuration from a TOML file, falling back to defaults for
    /// any key the file omits.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parses a configuration from a TOML document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        #[derive(serde::Deserialize, Default)]
        #[serde(default)]
        struct Raw {
            buffer_pool_size: Option<usize>,
            max_num_threads: Option<usize>,
            enable_compression: Option<bool>,
            read_only: Option<bool>,
            max_db_size: Option<u64>,
            auto_checkpoint: Option<bool>,
            checkpoint_threshold: Option<u64>,
            checkpoint_wait_timeout_secs: Option<u64>,
        }
        let raw: Raw = toml::from_str(text)
            .map_err(|e| StorageError::ConfigError(format!("invalid config toml: {e}")))?;
        let base = Config::default();
        let cfg = Config {
            buffer_pool_size: raw.buffer_pool_size.unwrap_or(base.buffer_pool_size),
            max_num_threads: raw.max_num_threads.unwrap_or(base.max_num_threads),
            enable_compression: raw.enable_compression.unwrap_or(base.enable_compression),
            read_only: raw.read_only.unwrap_or(base.read_only),
            max_db_size: raw.max_db_size.or(base.max_db_size),
            auto_checkpoint: raw.auto_checkpoint.unwrap_or(base.auto_checkpoint),
            checkpoint_threshold: raw.checkpoint_threshold.unwrap_or(base.checkpoint_threshold),
            checkpoint_wait_timeout: raw
                .checkpoint_wait_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(base.checkpoint_wait_timeout),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}
