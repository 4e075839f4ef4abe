//! Two mounts sharing a backend and an invalidation hub

mod common;

use std::time::Duration;

use ::common::error::FsError;
use ::common::fs::OpenFlags;
use ::common::types::InodeId;

use common::{eventually, read_all, write_file, TestEnv};

const ROOT: InodeId = InodeId::ROOT;
const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_overwrite_reaches_other_mount() {
    let env = TestEnv::new();
    let a = env.mount("a").await;
    let b = env.mount("b").await;

    let ino = write_file(&a, ROOT, "shared", b"version one").await;
    a.sync_all().await.unwrap();

    assert_eq!(b.lookup(ROOT, "shared").await.unwrap().id, ino);
    assert_eq!(read_all(&b, ino).await, b"version one".to_vec());
    let before = b.invalidations_applied();

    let fh = a.open(ino, OpenFlags::read_write()).await.unwrap();
    a.write(fh, 0, b"VERSION TWO").await.unwrap();
    a.close(fh).await.unwrap();

    let reader = &b;
    let updated = eventually(WAIT, move || async move {
        read_all(reader, ino).await == b"VERSION TWO".to_vec()
    })
    .await;
    assert!(updated);
    assert!(b.invalidations_applied() > before);
}

#[tokio::test]
async fn test_size_change_reaches_other_mount() {
    let env = TestEnv::new();
    let a = env.mount("a").await;
    let b = env.mount("b").await;

    let ino = write_file(&a, ROOT, "growing", b"0123456789").await;
    a.sync_all().await.unwrap();
    assert_eq!(b.getattr(ino).await.unwrap().size, 10);

    let append = OpenFlags {
        write: true,
        append: true,
        ..OpenFlags::default()
    };
    let fh = a.open(ino, append).await.unwrap();
    a.write(fh, 0, &[b'x'; 30]).await.unwrap();
    a.close(fh).await.unwrap();

    let peer = &b;
    let grown = eventually(WAIT, move || async move {
        peer.getattr(ino).await.map(|r| r.size).unwrap_or(0) == 40
    })
    .await;
    assert!(grown);

    let mut expected = b"0123456789".to_vec();
    expected.extend_from_slice(&[b'x'; 30]);
    assert_eq!(read_all(&b, ino).await, expected);
}

#[tokio::test]
async fn test_create_and_unlink_reach_other_mount() {
    let env = TestEnv::new();
    let a = env.mount("a").await;
    let b = env.mount("b").await;

    write_file(&a, ROOT, "existing", b"e").await;
    a.sync_all().await.unwrap();
    assert!(b.lookup(ROOT, "existing").await.is_ok());

    write_file(&a, ROOT, "fresh", b"f").await;
    a.sync_all().await.unwrap();
    let peer = &b;
    let created = eventually(WAIT, move || async move {
        peer.lookup(ROOT, "fresh").await.is_ok()
    })
    .await;
    assert!(created);

    a.unlink(ROOT, "existing").await.unwrap();
    a.sync_all().await.unwrap();
    let removed = eventually(WAIT, move || async move {
        matches!(peer.lookup(ROOT, "existing").await, Err(FsError::NotFound))
    })
    .await;
    assert!(removed);
}

#[tokio::test]
async fn test_own_events_are_not_applied() {
    let env = TestEnv::new();
    let a = env.mount("a").await;

    let ino = write_file(&a, ROOT, "mine", b"local").await;
    a.sync_all().await.unwrap();
    let fh = a.open(ino, OpenFlags::read_write()).await.unwrap();
    a.write(fh, 0, b"LOCAL").await.unwrap();
    a.close(fh).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(a.invalidations_applied(), 0);
    assert_eq!(env.hub.subscriber_count(), 1);
}
