//! Kernel mount round trip
//!
//! Needs `/dev/fuse` and `fusermount3`, so it only runs when
//! `OBJECTFS_FUSE_TESTS=1` is set.

#![cfg(feature = "fuse")]

use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::MetadataExt;

use tempfile::TempDir;

use object_store::ObjectStoreConfig;
use objectfs_daemon::{Mount, MountConfig};

fn fuse_tests_enabled() -> bool {
    if std::env::var("OBJECTFS_FUSE_TESTS").as_deref() == Ok("1") {
        return true;
    }
    eprintln!("skipping kernel mount test, set OBJECTFS_FUSE_TESTS=1 to run it");
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_posix_calls_through_kernel_mount() {
    if !fuse_tests_enabled() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let mount_point = dir.path().join("mnt");
    std::fs::create_dir_all(&mount_point).unwrap();

    let mut config = MountConfig::new(
        ObjectStoreConfig::Local {
            path: dir.path().join("objects"),
        },
        dir.path().join("state"),
    )
    .with_mount_point(&mount_point);
    config.fuse.auto_unmount = false;

    let mount = Mount::start(config.clone()).await.unwrap();
    assert!(mount.is_fuse_mounted());

    let root = mount_point.clone();
    tokio::task::spawn_blocking(move || {
        std::fs::create_dir(root.join("docs")).unwrap();
        let path = root.join("docs").join("report.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"hello from the kernel").unwrap();
        file.seek(SeekFrom::Start(6)).unwrap();
        file.write_all(b"FROM").unwrap();
        file.sync_all().unwrap();
        drop(file);

        let mut body = String::new();
        std::fs::File::open(&path)
            .unwrap()
            .read_to_string(&mut body)
            .unwrap();
        assert_eq!(body, "hello FROM the kernel");
        assert_eq!(std::fs::metadata(&path).unwrap().size(), 21);

        std::os::unix::fs::symlink("report.txt", root.join("docs").join("latest")).unwrap();
        assert_eq!(
            std::fs::read_link(root.join("docs").join("latest")).unwrap(),
            std::path::PathBuf::from("report.txt")
        );

        std::fs::rename(&path, root.join("docs").join("final.txt")).unwrap();
        let mut names: Vec<String> = std::fs::read_dir(root.join("docs"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["final.txt", "latest"]);
    })
    .await
    .unwrap();

    mount.unmount().await.unwrap();

    // the same content is visible headless from a fresh state directory
    let mut config = config;
    config.mount_point = None;
    config.state_dir = dir.path().join("state-2");
    let mount = Mount::start(config).await.unwrap();
    let fs = mount.fs();
    let docs = fs
        .lookup(common::types::InodeId::ROOT, "docs")
        .await
        .unwrap();
    let file = fs.lookup(docs.id, "final.txt").await.unwrap();
    assert_eq!(file.size, 21);
    mount.unmount().await.unwrap();
}
