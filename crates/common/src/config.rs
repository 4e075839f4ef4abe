//! Engine configuration.
//!
//! Loaded from TOML; every section and key has a default so an empty file is
//! a valid configuration.
//!
//! ```toml
//! [cache]
//! block_size = 65536
//! capacity_blocks = 4096
//!
//! [flush]
//! conflict_policy = "merge_blocks"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub flush: FlushConfig,
    pub retry: RetryConfig,
    pub journal: JournalConfig,
    pub invalidation: InvalidationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Size of one cache block and backend data object, in bytes
    pub block_size: u64,
    /// Maximum number of blocks held in memory
    pub capacity_blocks: usize,
    /// Maximum number of dirty blocks before writes wait
    pub max_dirty_blocks: usize,
    /// How long a write waits for dirty capacity before failing
    pub backpressure_timeout_ms: u64,
    /// Blocks fetched ahead of a sequential reader; 0 turns readahead off
    pub readahead_blocks: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_size: 64 * 1024,
            capacity_blocks: 4096,
            max_dirty_blocks: 1024,
            backpressure_timeout_ms: 30_000,
            readahead_blocks: 8,
        }
    }
}

impl CacheConfig {
    pub fn backpressure_timeout(&self) -> Duration {
        Duration::from_millis(self.backpressure_timeout_ms)
    }

    /// Dirty limit, never above total capacity.
    pub fn dirty_limit(&self) -> usize {
        self.max_dirty_blocks.min(self.capacity_blocks)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The last flush to complete overwrites the backend block
    #[default]
    LastWriterWins,
    /// Detect remote changes by entity tag and merge at byte-range granularity
    MergeBlocks,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    pub interval_ms: u64,
    pub max_concurrency: usize,
    pub conflict_policy: ConflictPolicy,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            max_concurrency: 8,
            conflict_policy: ConflictPolicy::LastWriterWins,
        }
    }
}

impl FlushConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Segment size at which the journal rotates to a new file
    pub segment_bytes: u64,
    /// fsync every append
    pub sync: bool,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            segment_bytes: 64 * 1024 * 1024,
            sync: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// Events older than this are discarded on receipt
    pub event_ttl_secs: u64,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self { event_ttl_secs: 300 }
    }
}

impl InvalidationConfig {
    pub fn event_ttl(&self) -> Duration {
        Duration::from_secs(self.event_ttl_secs)
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(s).map_err(|e| FsError::InvalidArgument(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| FsError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.block_size == 0 {
            return Err(FsError::InvalidArgument(
                "cache.block_size must be positive".into(),
            ));
        }
        if self.cache.capacity_blocks == 0 {
            return Err(FsError::InvalidArgument(
                "cache.capacity_blocks must be positive".into(),
            ));
        }
        if self.cache.max_dirty_blocks == 0 {
            return Err(FsError::InvalidArgument(
                "cache.max_dirty_blocks must be positive".into(),
            ));
        }
        if self.cache.readahead_blocks >= self.cache.capacity_blocks {
            return Err(FsError::InvalidArgument(
                "cache.readahead_blocks must be below cache.capacity_blocks".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(FsError::InvalidArgument(
                "retry.max_attempts must be positive".into(),
            ));
        }
        if self.flush.interval_ms == 0 {
            return Err(FsError::InvalidArgument(
                "flush.interval_ms must be positive".into(),
            ));
        }
        if self.flush.max_concurrency == 0 {
            return Err(FsError::InvalidArgument(
                "flush.max_concurrency must be positive".into(),
            ));
        }
        if self.journal.segment_bytes == 0 {
            return Err(FsError::InvalidArgument(
                "journal.segment_bytes must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_is_default() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.cache.block_size, 65536);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.flush.conflict_policy, ConflictPolicy::LastWriterWins);
    }

    #[test]
    fn test_partial_sections() {
        let config = Config::from_toml_str(
            r#"
            [cache]
            block_size = 4096
            max_dirty_blocks = 8000

            [flush]
            conflict_policy = "merge_blocks"
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.block_size, 4096);
        assert_eq!(config.cache.capacity_blocks, 4096);
        // dirty limit is clamped to capacity
        assert_eq!(config.cache.dirty_limit(), 4096);
        assert_eq!(config.flush.conflict_policy, ConflictPolicy::MergeBlocks);
        assert_eq!(config.flush.interval_ms, 5_000);
    }

    #[test]
    fn test_validate_rejects_zero_block_size() {
        let err = Config::from_toml_str("[cache]\nblock_size = 0\n").unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("objectfs.toml");
        std::fs::write(&path, "[retry]\nmax_attempts = 2\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.retry.max_attempts, 2);
        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
