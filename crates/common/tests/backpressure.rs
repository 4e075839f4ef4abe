//! Dirty capacity limits and flushing against an unavailable backend

mod common;

use std::time::Duration;

use ::common::config::Config;
use ::common::error::FsError;
use ::common::fs::{HandleState, OpenFlags};
use ::common::keys;
use ::common::types::{InodeId, NewAttrs};

use common::{read_all, test_config, TestEnv};

const ROOT: InodeId = InodeId::ROOT;

fn tight_config() -> Config {
    let mut config = test_config();
    config.cache.max_dirty_blocks = 4;
    config.cache.backpressure_timeout_ms = 200;
    config.retry.max_attempts = 1;
    config
}

#[tokio::test]
async fn test_backpressure_while_backend_is_down() {
    let env = TestEnv::new();
    let fs = env.mount_with("a", tight_config()).await;
    let (record, fh) = fs
        .create(ROOT, "big", &NewAttrs::default(), OpenFlags::read_write())
        .await
        .unwrap();
    let ino = record.id;

    env.store.set_available(false);
    assert_eq!(fs.write(fh, 0, &[1u8; 64]).await.unwrap(), 64);
    let err = fs.write(fh, 64, &[2u8; 16]).await.unwrap_err();
    assert!(matches!(err, FsError::Backpressure));
    assert_eq!(err.errno(), libc::EAGAIN);
    assert!(err.is_retryable());

    // everything acknowledged is still readable locally
    assert_eq!(fs.getattr(ino).await.unwrap().size, 64);
    assert_eq!(read_all(&fs, ino).await, vec![1u8; 64]);

    assert!(matches!(fs.fsync(fh).await, Err(FsError::BackendUnavailable(_))));
    assert_eq!(fs.handle_state(fh).unwrap(), HandleState::OpenedDirty);
    assert!(fs.close(fh).await.is_err());
    assert_eq!(fs.handle_state(fh).unwrap(), HandleState::OpenedDirty);
    assert_eq!(fs.open_handles(), 1);

    env.store.set_available(true);
    fs.close(fh).await.unwrap();
    assert_eq!(fs.open_handles(), 0);
    let prefix = keys::inode_prefix(ino);
    for index in 0..4 {
        assert_eq!(
            env.store.object(&keys::block_key(&prefix, index)).unwrap().to_vec(),
            vec![1u8; 16]
        );
    }
}

#[tokio::test]
async fn test_writer_unblocks_when_flusher_frees_space() {
    let env = TestEnv::new();
    let mut config = tight_config();
    config.cache.backpressure_timeout_ms = 5_000;
    let fs = env.mount_with("a", config).await;
    let (record, fh) = fs
        .create(ROOT, "stream", &NewAttrs::default(), OpenFlags::read_write())
        .await
        .unwrap();

    // four times the dirty limit; each stall kicks the flusher
    for chunk in 0..16u64 {
        fs.write(fh, chunk * 16, &[chunk as u8; 16]).await.unwrap();
    }
    fs.close(fh).await.unwrap();

    let expected: Vec<u8> = (0..16u8).flat_map(|i| [i; 16]).collect();
    fs.evict_all_cache();
    assert_eq!(read_all(&fs, record.id).await, expected);
    assert_eq!(fs.cache_stats().dirty_blocks, 0);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let env = TestEnv::new();
    let mut config = test_config();
    config.retry.max_attempts = 4;
    let fs = env.mount_with("a", config).await;
    let (record, fh) = fs
        .create(ROOT, "flaky", &NewAttrs::default(), OpenFlags::read_write())
        .await
        .unwrap();
    fs.write(fh, 0, b"eventually stored").await.unwrap();

    env.store.fail_next(2);
    fs.close(fh).await.unwrap();
    fs.evict_all_cache();
    assert_eq!(read_all(&fs, record.id).await, b"eventually stored".to_vec());
}

#[tokio::test]
async fn test_permission_denied_is_not_retried() {
    let env = TestEnv::new();
    let fs = env.mount("a").await;
    let (_, fh) = fs
        .create(ROOT, "locked", &NewAttrs::default(), OpenFlags::read_write())
        .await
        .unwrap();
    fs.write(fh, 0, b"secret").await.unwrap();

    env.store.set_permission_denied(true);
    let puts = env.store.calls().puts;
    let err = fs.fsync(fh).await.unwrap_err();
    assert!(matches!(err, FsError::PermissionDenied(_)));
    assert_eq!(err.errno(), libc::EACCES);
    assert_eq!(env.store.calls().puts, puts + 1);

    env.store.set_permission_denied(false);
    fs.fsync(fh).await.unwrap();
}

#[tokio::test]
async fn test_abandoned_flush_leaves_blocks_dirty() {
    let env = TestEnv::new();
    let fs = env.mount("a").await;
    let (record, fh) = fs
        .create(ROOT, "slow", &NewAttrs::default(), OpenFlags::read_write())
        .await
        .unwrap();
    let ino = record.id;
    fs.write(fh, 0, &[7u8; 16]).await.unwrap();

    env.store.set_latency(Some(Duration::from_millis(500)));
    let abandoned = tokio::time::timeout(Duration::from_millis(50), fs.fsync(fh)).await;
    assert!(abandoned.is_err());
    assert!(fs.is_dirty(ino));

    // a later sweep picks the block up again
    env.store.set_latency(None);
    fs.sync_all().await.unwrap();
    let key = keys::block_key(&keys::inode_prefix(ino), 0);
    assert_eq!(env.store.object(&key).unwrap().to_vec(), vec![7u8; 16]);
    assert!(!fs.is_dirty(ino));
    assert_eq!(fs.cache_stats().dirty_blocks, 0);
    fs.close(fh).await.unwrap();
}
