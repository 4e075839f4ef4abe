use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::error::FsError;
use common::fs::OpenFlags;
use common::types::{InodeId, NewAttrs, SetAttr};
use common::ObjectFs;
use fuser::{
    FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use tokio::runtime::Handle;
use tracing::{debug, trace, warn};

use super::attr::{file_type, to_datetime, to_file_attr};

/// Blocks reported free by `statfs`; object storage has no fixed size.
const STATFS_FREE_BLOCKS: u64 = 1 << 32;
const STATFS_FREE_FILES: u64 = 1 << 32;
const MAX_NAME_LEN: u32 = 255;

/// One directory entry as handed to the kernel.
struct DirEntry {
    ino: u64,
    kind: FileType,
    name: OsString,
}

pub struct ObjectFsFuse {
    fs: Arc<ObjectFs>,
    runtime: Handle,
    ttl: Duration,
    block_size: u32,
    /// Listings taken at `opendir`, by directory handle
    dirs: HashMap<u64, Vec<DirEntry>>,
    next_dir_handle: u64,
}

impl ObjectFsFuse {
    pub fn new(fs: Arc<ObjectFs>, runtime: Handle, ttl: Duration) -> Self {
        let block_size = u32::try_from(fs.config().cache.block_size).unwrap_or(u32::MAX);
        Self {
            fs,
            runtime,
            ttl,
            block_size,
            dirs: HashMap::new(),
            next_dir_handle: 1,
        }
    }

    fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    fn attr(&self, record: &common::types::InodeRecord) -> fuser::FileAttr {
        to_file_attr(record, self.block_size)
    }

    fn snapshot_dir(&self, ino: InodeId) -> Result<Vec<DirEntry>, FsError> {
        self.block_on(async {
            let dir = self.fs.getattr(ino).await?;
            if !dir.is_dir() {
                return Err(FsError::NotDirectory);
            }
            let listing = self.fs.readdir(ino).await?;
            let parent = if ino == InodeId::ROOT { ino } else { dir.parent };

            let mut entries = Vec::with_capacity(listing.len() + 2);
            entries.push(DirEntry {
                ino: ino.as_u64(),
                kind: FileType::Directory,
                name: OsString::from("."),
            });
            entries.push(DirEntry {
                ino: parent.as_u64(),
                kind: FileType::Directory,
                name: OsString::from(".."),
            });
            entries.extend(listing.into_iter().map(|entry| DirEntry {
                ino: entry.inode.as_u64(),
                kind: file_type(entry.kind),
                name: OsString::from(entry.name),
            }));
            Ok(entries)
        })
    }
}

/// Entry names must be valid UTF-8 to become object keys.
fn utf8_name(name: &OsStr) -> Result<&str, FsError> {
    name.to_str()
        .ok_or_else(|| FsError::InvalidArgument(format!("non-utf8 name {:?}", name)))
}

fn offset(offset: i64) -> Result<u64, FsError> {
    u64::try_from(offset).map_err(|_| FsError::InvalidArgument(format!("offset {}", offset)))
}

fn errno(op: &str, ino: u64, err: &FsError) -> i32 {
    match err {
        FsError::NotFound | FsError::AlreadyExists | FsError::NotEmpty => {
            trace!(op, ino, error = %err, "fuse op failed")
        }
        _ => warn!(op, ino, error = %err, "fuse op failed"),
    }
    err.errno()
}

impl Filesystem for ObjectFsFuse {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        debug!(mount = %self.fs.mount_id(), "fuse init");
        Ok(())
    }

    fn destroy(&mut self) {
        self.dirs.clear();
        if let Err(err) = self.block_on(self.fs.sync_all()) {
            warn!(error = %err, "sync at fuse teardown failed");
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = utf8_name(name)
            .and_then(|name| self.block_on(self.fs.lookup(InodeId(parent), name)));
        match result {
            Ok(record) => reply.entry(&self.ttl, &self.attr(&record), 0),
            Err(err) => reply.error(errno("lookup", parent, &err)),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.block_on(self.fs.getattr(InodeId(ino))) {
            Ok(record) => reply.attr(&self.ttl, &self.attr(&record)),
            Err(err) => reply.error(errno("getattr", ino, &err)),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let attr = SetAttr {
            mode: mode.map(|mode| mode & 0o7777),
            uid,
            gid,
            size,
            atime: atime.map(to_datetime),
            mtime: mtime.map(to_datetime),
        };
        match self.block_on(self.fs.setattr(InodeId(ino), fh, &attr)) {
            Ok(record) => reply.attr(&self.ttl, &self.attr(&record)),
            Err(err) => reply.error(errno("setattr", ino, &err)),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.block_on(self.fs.readlink(InodeId(ino))) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(err) => reply.error(errno("readlink", ino, &err)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let attrs = NewAttrs::new(mode & !umask & 0o7777, req.uid(), req.gid());
        let result = utf8_name(name)
            .and_then(|name| self.block_on(self.fs.mkdir(InodeId(parent), name, &attrs)));
        match result {
            Ok(record) => reply.entry(&self.ttl, &self.attr(&record), 0),
            Err(err) => reply.error(errno("mkdir", parent, &err)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = utf8_name(name)
            .and_then(|name| self.block_on(self.fs.unlink(InodeId(parent), name)));
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno("unlink", parent, &err)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = utf8_name(name)
            .and_then(|name| self.block_on(self.fs.rmdir(InodeId(parent), name)));
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno("rmdir", parent, &err)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = utf8_name(link_name).and_then(|name| {
            let target = utf8_name(target.as_os_str())?;
            self.block_on(
                self.fs
                    .symlink(InodeId(parent), name, target, req.uid(), req.gid()),
            )
        });
        match result {
            Ok(record) => reply.entry(&self.ttl, &self.attr(&record), 0),
            Err(err) => reply.error(errno("symlink", parent, &err)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        // RENAME_NOREPLACE and RENAME_EXCHANGE are not supported
        if flags != 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let result = utf8_name(name).and_then(|name| {
            let newname = utf8_name(newname)?;
            self.block_on(
                self.fs
                    .rename(InodeId(parent), name, InodeId(newparent), newname),
            )
        });
        match result {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno("rename", parent, &err)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.block_on(self.fs.open(InodeId(ino), OpenFlags::from_raw(flags))) {
            Ok(fh) => reply.opened(fh, 0),
            Err(err) => reply.error(errno("open", ino, &err)),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset_in: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let result =
            offset(offset_in).and_then(|at| self.block_on(self.fs.read(fh, at, size)));
        match result {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(errno("read", ino, &err)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset_in: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let result =
            offset(offset_in).and_then(|at| self.block_on(self.fs.write(fh, at, data)));
        match result {
            Ok(written) => reply.written(written),
            Err(err) => reply.error(errno("write", ino, &err)),
        }
    }

    /// Called on every `close(2)` of a descriptor: push its writes out.
    fn flush(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.block_on(self.fs.fsync(fh)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno("flush", ino, &err)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.fs.release(fh) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno("release", ino, &err)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.block_on(self.fs.fsync(fh)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(errno("fsync", ino, &err)),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.snapshot_dir(InodeId(ino)) {
            Ok(entries) => {
                let fh = self.next_dir_handle;
                self.next_dir_handle += 1;
                self.dirs.insert(fh, entries);
                reply.opened(fh, 0);
            }
            Err(err) => reply.error(errno("opendir", ino, &err)),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(entries) = self.dirs.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        let start = usize::try_from(offset).unwrap_or(0);
        for (i, entry) in entries.iter().enumerate().skip(start) {
            // offset of the entry after this one
            if reply.add(entry.ino, (i + 1) as i64, entry.kind, &entry.name) {
                break;
            }
        }
        trace!(ino, fh, offset, "readdir");
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dirs.remove(&fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let open = self.fs.open_handles() as u64;
        reply.statfs(
            STATFS_FREE_BLOCKS,
            STATFS_FREE_BLOCKS,
            STATFS_FREE_BLOCKS,
            STATFS_FREE_FILES + open,
            STATFS_FREE_FILES,
            self.block_size,
            MAX_NAME_LEN,
            self.block_size,
        );
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let attrs = NewAttrs::new(mode & !umask & 0o7777, req.uid(), req.gid());
        let result = utf8_name(name).and_then(|name| {
            self.block_on(
                self.fs
                    .create(InodeId(parent), name, &attrs, OpenFlags::from_raw(flags)),
            )
        });
        match result {
            Ok((record, fh)) => reply.created(&self.ttl, &self.attr(&record), 0, fh, 0),
            Err(err) => reply.error(errno("create", parent, &err)),
        }
    }
}
