//! Shared fixtures for ObjectFS integration tests
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use ::common::bus::LocalHub;
use ::common::config::{Config, ConflictPolicy};
use ::common::fs::{MountOptions, ObjectFs, OpenFlags};
use ::common::types::{InodeId, NewAttrs};
use object_store::MemoryStore;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Small blocks so a few bytes span several of them. The periodic flush is
/// effectively off; tests flush explicitly. Readahead is off so backend call
/// counts only reflect what a test asks for.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.cache.block_size = 16;
    config.cache.capacity_blocks = 64;
    config.cache.max_dirty_blocks = 32;
    config.cache.backpressure_timeout_ms = 2_000;
    config.cache.readahead_blocks = 0;
    config.flush.interval_ms = 3_600_000;
    config.retry.max_attempts = 2;
    config.retry.initial_delay_ms = 1;
    config.retry.max_delay_ms = 2;
    config.retry.jitter = false;
    config
}

pub fn merge_config() -> Config {
    let mut config = test_config();
    config.flush.conflict_policy = ConflictPolicy::MergeBlocks;
    config
}

/// One simulated backend and invalidation hub, shared by every mount made
/// from it. Each mount gets its own state directory.
pub struct TestEnv {
    pub store: MemoryStore,
    pub hub: LocalHub,
    pub dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        init_tracing();
        Self {
            store: MemoryStore::new(),
            hub: LocalHub::new(),
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn options(&self, name: &str, config: Config) -> MountOptions {
        MountOptions::new(
            Arc::new(self.store.clone()),
            Arc::new(self.hub.clone()),
            self.dir.path().join(name),
        )
        .with_config(config)
    }

    pub async fn mount(&self, name: &str) -> ObjectFs {
        self.mount_with(name, test_config()).await
    }

    pub async fn mount_with(&self, name: &str, config: Config) -> ObjectFs {
        ObjectFs::mount(self.options(name, config)).await.unwrap()
    }
}

/// Create `name` under `parent`, write `data` and close (flushing it).
pub async fn write_file(fs: &ObjectFs, parent: InodeId, name: &str, data: &[u8]) -> InodeId {
    let (record, fh) = fs
        .create(parent, name, &NewAttrs::default(), OpenFlags::read_write())
        .await
        .unwrap();
    fs.write(fh, 0, data).await.unwrap();
    fs.close(fh).await.unwrap();
    record.id
}

/// Whole content of `ino`, read through a fresh read-only handle.
pub async fn read_all(fs: &ObjectFs, ino: InodeId) -> Vec<u8> {
    let size = fs.getattr(ino).await.unwrap().size;
    let fh = fs.open(ino, OpenFlags::read_only()).await.unwrap();
    let data = fs.read(fh, 0, size as u32 + 64).await.unwrap();
    fs.release(fh).unwrap();
    data.to_vec()
}

pub fn names(listing: &[::common::index::DirListing]) -> Vec<String> {
    listing.iter().map(|l| l.name.clone()).collect()
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
