//! Crash recovery: journal replay, checkpoints and orphaned inodes

mod common;

use std::path::PathBuf;
use std::time::Duration;

use ::common::error::FsError;
use ::common::fs::{ObjectFs, OpenFlags};
use ::common::keys;
use ::common::types::{InodeId, NewAttrs};

use common::{eventually, read_all, test_config, write_file, TestEnv};

const ROOT: InodeId = InodeId::ROOT;

/// Create `name` and write to it without closing, so nothing is flushed.
async fn write_unflushed(fs: &ObjectFs, name: &str, data: &[u8]) -> InodeId {
    let (record, fh) = fs
        .create(ROOT, name, &NewAttrs::default(), OpenFlags::read_write())
        .await
        .unwrap();
    fs.write(fh, 0, data).await.unwrap();
    record.id
}

fn journal_segments(env: &TestEnv, mount: &str) -> Vec<PathBuf> {
    let mut segments: Vec<PathBuf> = std::fs::read_dir(env.dir.path().join(mount).join("journal"))
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("seg"))
        .collect();
    segments.sort();
    segments
}

#[tokio::test]
async fn test_unflushed_writes_survive_crash() {
    let env = TestEnv::new();
    let ino = {
        let fs = env.mount("a").await;
        let ino = write_unflushed(&fs, "notes", b"unsaved work").await;
        // crash: no close, no sync
        drop(fs);
        ino
    };
    assert!(env.store.keys().is_empty());

    let fs = env.mount("a").await;
    assert_eq!(fs.lookup(ROOT, "notes").await.unwrap().id, ino);
    assert_eq!(read_all(&fs, ino).await, b"unsaved work".to_vec());
    assert!(fs.is_dirty(ino));

    fs.sync_all().await.unwrap();
    assert!(!fs.is_dirty(ino));

    // a mount with no local state sees it through the backend
    let other = env.mount("b").await;
    let record = other.lookup(ROOT, "notes").await.unwrap();
    assert_eq!(record.id, ino);
    assert_eq!(read_all(&other, ino).await, b"unsaved work".to_vec());
}

#[tokio::test]
async fn test_replay_is_idempotent_across_repeated_crashes() {
    let env = TestEnv::new();
    let ino = {
        let fs = env.mount("a").await;
        let ino = write_unflushed(&fs, "log", b"0123456789").await;
        let fh = fs.open(ino, OpenFlags::read_write()).await.unwrap();
        fs.write(fh, 4, b"abcdefghijklmnop").await.unwrap();
        fs.truncate(ino, 12).await.unwrap();
        ino
    };

    for _ in 0..3 {
        let fs = env.mount("a").await;
        assert_eq!(fs.getattr(ino).await.unwrap().size, 12);
        assert_eq!(read_all(&fs, ino).await, b"0123abcdefgh".to_vec());
    }
}

#[tokio::test]
async fn test_checkpoint_then_crash() {
    let env = TestEnv::new();
    let (first, second) = {
        let fs = env.mount("a").await;
        let first = write_file(&fs, ROOT, "first", b"flushed").await;
        fs.sync_all().await.unwrap();
        assert!(env.dir.path().join("a").join("index.snapshot").exists());

        let second = write_unflushed(&fs, "second", b"journaled only").await;
        (first, second)
    };

    let fs = env.mount("a").await;
    let listed: Vec<String> = fs
        .readdir(ROOT)
        .await
        .unwrap()
        .into_iter()
        .map(|l| l.name)
        .collect();
    assert_eq!(listed, vec!["first", "second"]);
    assert_eq!(read_all(&fs, first).await, b"flushed".to_vec());
    assert_eq!(read_all(&fs, second).await, b"journaled only".to_vec());
    assert!(!fs.is_dirty(first));
    assert!(fs.is_dirty(second));
}

#[tokio::test]
async fn test_checkpoint_prunes_journal() {
    let env = TestEnv::new();
    let mut config = test_config();
    config.journal.segment_bytes = 256;
    let fs = env.mount_with("a", config.clone()).await;

    for i in 0..8 {
        write_file(&fs, ROOT, &format!("file{}", i), &[i as u8; 40]).await;
    }
    assert!(fs.journal_segments() > 1);

    fs.sync_all().await.unwrap();
    assert_eq!(fs.journal_segments(), 1);
    drop(fs);

    let fs = env.mount_with("a", config).await;
    for i in 0..8 {
        let record = fs.lookup(ROOT, &format!("file{}", i)).await.unwrap();
        assert_eq!(read_all(&fs, record.id).await, vec![i as u8; 40]);
    }
}

#[tokio::test]
async fn test_fsync_then_crash() {
    let env = TestEnv::new();
    let ino = {
        let fs = env.mount("a").await;
        let ino = write_unflushed(&fs, "report", b"quarterly numbers").await;
        let fh = fs.open(ino, OpenFlags::read_only()).await.unwrap();
        fs.fsync(fh).await.unwrap();
        ino
    };
    let prefix = keys::inode_prefix(ino);
    assert!(env.store.object(&keys::meta_key(&prefix)).is_some());

    let fs = env.mount("a").await;
    assert_eq!(read_all(&fs, ino).await, b"quarterly numbers".to_vec());
    fs.sync_all().await.unwrap();
    assert_eq!(
        env.store.object(&keys::block_key(&prefix, 0)).unwrap().to_vec(),
        b"quarterly number".to_vec()
    );
}

#[tokio::test]
async fn test_inode_unlinked_while_open_is_deleted_after_crash() {
    let env = TestEnv::new();
    let ino = {
        let fs = env.mount("a").await;
        let ino = write_file(&fs, ROOT, "tmp", b"scratch data").await;
        let _fh = fs.open(ino, OpenFlags::read_only()).await.unwrap();
        fs.unlink(ROOT, "tmp").await.unwrap();
        ino
    };
    let prefix = keys::inode_prefix(ino);
    assert!(env.store.keys().iter().any(|k| k.starts_with(&prefix)));

    // the remount cleans up on its own, without a sync
    let fs = env.mount("a").await;
    let store = &env.store;
    let prefix = prefix.as_str();
    let gone = eventually(Duration::from_secs(5), move || async move {
        store.keys().iter().all(|k| !k.starts_with(prefix))
    })
    .await;
    assert!(gone);
    assert!(matches!(fs.lookup(ROOT, "tmp").await, Err(FsError::NotFound)));
}

#[tokio::test]
async fn test_corrupt_journal_fails_mount() {
    let env = TestEnv::new();
    {
        let fs = env.mount("a").await;
        write_unflushed(&fs, "victim", b"some bytes").await;
    }

    let segment = journal_segments(&env, "a").pop().unwrap();
    let mut bytes = std::fs::read(&segment).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&segment, bytes).unwrap();

    let result = ObjectFs::mount(env.options("a", test_config())).await;
    assert!(matches!(result, Err(FsError::Journal(_))));
}

#[tokio::test]
async fn test_shutdown_flushes_everything() {
    let env = TestEnv::new();
    let fs = env.mount("a").await;
    let ino = write_unflushed(&fs, "pending", b"at shutdown").await;
    fs.shutdown().await.unwrap();

    let other = env.mount("b").await;
    let record = other.lookup(ROOT, "pending").await.unwrap();
    assert_eq!(record.id, ino);
    assert_eq!(read_all(&other, ino).await, b"at shutdown".to_vec());
}
