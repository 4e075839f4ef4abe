//! Conversions between engine records and kernel attributes.

use std::time::SystemTime;

use chrono::{DateTime, Utc};
use common::types::{InodeKind, InodeRecord};
use fuser::{FileAttr, FileType, TimeOrNow};

/// Block unit `st_blocks` is counted in.
const STAT_BLOCK: u64 = 512;

pub fn file_type(kind: InodeKind) -> FileType {
    match kind {
        InodeKind::File => FileType::RegularFile,
        InodeKind::Directory => FileType::Directory,
        InodeKind::Symlink => FileType::Symlink,
    }
}

pub fn to_file_attr(record: &InodeRecord, block_size: u32) -> FileAttr {
    let ctime = SystemTime::from(record.ctime);
    FileAttr {
        ino: record.id.as_u64(),
        size: record.size,
        blocks: record.size.div_ceil(STAT_BLOCK),
        atime: SystemTime::from(record.atime),
        mtime: SystemTime::from(record.mtime),
        ctime,
        crtime: ctime,
        kind: file_type(record.kind),
        perm: (record.mode & 0o7777) as u16,
        nlink: record.nlink,
        uid: record.uid,
        gid: record.gid,
        rdev: 0,
        blksize: block_size,
        flags: 0,
    }
}

pub fn to_datetime(time: TimeOrNow) -> DateTime<Utc> {
    match time {
        TimeOrNow::SpecificTime(time) => DateTime::<Utc>::from(time),
        TimeOrNow::Now => Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use common::types::{InodeId, NewAttrs};

    #[test]
    fn test_file_attr_from_record() {
        let attrs = NewAttrs::new(0o100640, 1000, 100);
        let mut record = InodeRecord::new(InodeId(42), InodeId::ROOT, InodeKind::File, &attrs);
        record.size = 1025;

        let attr = to_file_attr(&record, 4096);
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 1025);
        assert_eq!(attr.blocks, 3);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.perm, 0o640);
        assert_eq!(attr.nlink, 1);
        assert_eq!((attr.uid, attr.gid), (1000, 100));
        assert_eq!(attr.blksize, 4096);
        assert_eq!(attr.mtime, SystemTime::from(record.mtime));
    }

    #[test]
    fn test_directory_and_symlink_kinds() {
        let dir = InodeRecord::new(
            InodeId(2),
            InodeId::ROOT,
            InodeKind::Directory,
            &NewAttrs::new(0o755, 0, 0),
        );
        let attr = to_file_attr(&dir, 512);
        assert_eq!(attr.kind, FileType::Directory);
        assert_eq!(attr.nlink, 2);

        let link = InodeRecord::new(
            InodeId(3),
            InodeId::ROOT,
            InodeKind::Symlink,
            &NewAttrs::new(0o777, 0, 0).with_target("../target"),
        );
        let attr = to_file_attr(&link, 512);
        assert_eq!(attr.kind, FileType::Symlink);
        assert_eq!(attr.size, 9);
    }

    #[test]
    fn test_time_or_now() {
        let at = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        assert_eq!(
            SystemTime::from(to_datetime(TimeOrNow::SpecificTime(at))),
            at
        );

        let before = Utc::now();
        assert!(to_datetime(TimeOrNow::Now) >= before);
    }
}
