//! Operation translator
//!
//! [`ObjectFs`] is one mounted filesystem. It turns POSIX-style calls into
//! metadata index, block cache and journal operations, and runs two
//! background tasks: the flusher, which pushes dirty state to the backend,
//! and the invalidation listener, which applies peers' events.
//!
//! # Consistency
//!
//! - Every mutation is journaled before it is acknowledged and reaches the
//!   backend later, in the background or on `fsync`/`close`.
//! - Per-inode locks are held for the in-memory part of an operation only,
//!   never across a backend round trip.
//! - Reads of clean data are served from the cache; anything missing is
//!   fetched and cached unless the inode was invalidated meanwhile.
//!
//! # Handles
//!
//! An open handle is `OpenedClean` until something is written through it,
//! then `OpenedDirty` until a flush succeeds. `close` flushes first and
//! reports the flush error, keeping the handle open; `release` detaches
//! without waiting. An inode unlinked while open keeps its data until the
//! last handle goes away.

mod backend;
mod events;
mod flusher;
mod handle;
mod locks;
mod recovery;

pub use handle::{Handle, HandleState, HandleTable, OpenFlags};
pub use recovery::RecoveryReport;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::try_join_all;
use futures::stream::{self, StreamExt};
use object_store::ObjectStoreAdapter;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::{InvalidationBus, InvalidationTransport, Outbox};
use crate::cache::{BlockCache, BlockRead, CacheStats};
use crate::config::Config;
use crate::conflict::{resolver_for, ConflictResolver};
use crate::error::{FsError, Result};
use crate::index::{DirListing, DirStream, MetadataIndex};
use crate::journal::Journal;
use crate::keys;
use crate::retry::RetryPolicy;
use crate::types::{InodeId, InodeKind, InodeRecord, MountId, NewAttrs, SetAttr};

use backend::Backend;
use locks::InodeLocks;

const JOURNAL_DIR: &str = "journal";
const SNAPSHOT_FILE: &str = "index.snapshot";

/// Everything needed to mount a filesystem.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub config: Config,
    pub store: Arc<dyn ObjectStoreAdapter>,
    pub transport: Arc<dyn InvalidationTransport>,
    /// Local directory holding the journal and index snapshots
    pub state_dir: PathBuf,
}

impl MountOptions {
    pub fn new(
        store: Arc<dyn ObjectStoreAdapter>,
        transport: Arc<dyn InvalidationTransport>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            config: Config::default(),
            store,
            transport,
            state_dir: state_dir.into(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }
}

/// A mounted filesystem.
#[derive(Debug)]
pub struct ObjectFs {
    inner: Arc<Inner>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug)]
pub(crate) struct Inner {
    config: Config,
    mount: MountId,
    backend: Backend,
    resolver: Arc<dyn ConflictResolver>,
    index: MetadataIndex,
    cache: BlockCache,
    journal: Arc<Journal>,
    bus: InvalidationBus,
    handles: HandleTable,
    locks: InodeLocks,
    /// Serializes flushes of one inode
    flush_locks: InodeLocks,
    /// Unlinked inodes whose backend objects are still to be deleted
    pending_deletes: Mutex<BTreeSet<InodeId>>,
    kick: Arc<Notify>,
    snapshot_path: PathBuf,
    /// Journal position covered by the last snapshot written
    checkpoint_seq: AtomicU64,
    invalidations: AtomicU64,
}

impl ObjectFs {
    /// Mount: open the journal, recover the index and cache from the last
    /// snapshot plus the journal tail, then start the background tasks.
    pub async fn mount(options: MountOptions) -> Result<Self> {
        let MountOptions {
            config,
            store,
            transport,
            state_dir,
        } = options;
        config.validate()?;
        std::fs::create_dir_all(&state_dir)
            .map_err(|e| FsError::Io(format!("{}: {}", state_dir.display(), e)))?;

        let journal = Arc::new(Journal::open(
            state_dir.join(JOURNAL_DIR),
            config.journal.clone(),
        )?);
        let mount = MountId::new();
        let outbox = Arc::new(Outbox::new(mount));
        let backend = Backend::new(store, RetryPolicy::from(&config.retry));
        let cache = BlockCache::new(&config.cache);
        let bus = InvalidationBus::new(mount, transport, config.invalidation.event_ttl());
        // subscribe before recovery so nothing published meanwhile is missed
        let events = bus.subscribe();

        let snapshot_path = state_dir.join(SNAPSHOT_FILE);
        let report = recovery::recover(&journal, &backend, &cache, &snapshot_path, outbox).await?;
        let RecoveryReport {
            index,
            replay_from,
            applied,
            skipped,
            orphans,
        } = report;

        let inner = Arc::new(Inner {
            resolver: resolver_for(config.flush.conflict_policy),
            index: index.with_sink(journal.clone()),
            handles: HandleTable::default(),
            locks: InodeLocks::default(),
            flush_locks: InodeLocks::default(),
            pending_deletes: Mutex::new(orphans.iter().copied().collect()),
            kick: Arc::new(Notify::new()),
            checkpoint_seq: AtomicU64::new(replay_from),
            invalidations: AtomicU64::new(0),
            config,
            mount,
            backend,
            cache,
            journal,
            bus,
            snapshot_path,
        });

        let (shutdown, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(flusher::run(Arc::downgrade(&inner), shutdown_rx.clone())),
            tokio::spawn(events::listen(Arc::downgrade(&inner), events, shutdown_rx)),
        ];

        info!(
            mount = %mount,
            state_dir = %state_dir.display(),
            replayed = applied,
            skipped = skipped,
            orphans = orphans.len(),
            "filesystem mounted"
        );
        if !orphans.is_empty() {
            inner.kick.notify_one();
        }

        Ok(Self {
            inner,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }

    /* Lookup and attributes */

    pub async fn lookup(&self, parent: InodeId, name: &str) -> Result<InodeRecord> {
        let inner = &self.inner;
        inner.ensure_loaded(parent).await?;
        let child = inner.index.lookup(parent, name)?;
        inner.ensure_loaded(child).await?;
        inner.index.stat(child)
    }

    pub async fn getattr(&self, ino: InodeId) -> Result<InodeRecord> {
        self.inner.ensure_loaded(ino).await?;
        self.inner.index.stat(ino)
    }

    /// Change attributes. A size change truncates the file, through `fh`
    /// when the caller holds one.
    pub async fn setattr(&self, ino: InodeId, fh: Option<u64>, attr: &SetAttr) -> Result<InodeRecord> {
        let inner = &self.inner;
        inner.ensure_loaded(ino).await?;
        if let Some(size) = attr.size {
            inner.truncate(ino, size).await?;
            if let Some(fh) = fh {
                inner.handles.mark_dirty(fh);
            }
        }
        let _guard = inner.locks.write(ino).await;
        inner.index.update_metadata(ino, attr)
    }

    pub async fn truncate(&self, ino: InodeId, size: u64) -> Result<InodeRecord> {
        self.inner.ensure_loaded(ino).await?;
        self.inner.truncate(ino, size).await
    }

    /* Namespace */

    /// Create and open a regular file.
    pub async fn create(
        &self,
        parent: InodeId,
        name: &str,
        attrs: &NewAttrs,
        flags: OpenFlags,
    ) -> Result<(InodeRecord, u64)> {
        let inner = &self.inner;
        inner.ensure_loaded(parent).await?;
        let record = {
            let _guard = inner.locks.write(parent).await;
            inner.index.create(parent, name, InodeKind::File, attrs)?
        };
        let fh = inner.handles.open(record.id, flags, false);
        Ok((record, fh))
    }

    pub async fn mkdir(&self, parent: InodeId, name: &str, attrs: &NewAttrs) -> Result<InodeRecord> {
        self.inner.ensure_loaded(parent).await?;
        let _guard = self.inner.locks.write(parent).await;
        self.inner
            .index
            .create(parent, name, InodeKind::Directory, attrs)
    }

    pub async fn symlink(
        &self,
        parent: InodeId,
        name: &str,
        target: &str,
        uid: u32,
        gid: u32,
    ) -> Result<InodeRecord> {
        if target.is_empty() {
            return Err(FsError::InvalidArgument("empty symlink target".into()));
        }
        let attrs = NewAttrs::new(0o777, uid, gid).with_target(target);
        self.inner.ensure_loaded(parent).await?;
        let _guard = self.inner.locks.write(parent).await;
        self.inner
            .index
            .create(parent, name, InodeKind::Symlink, &attrs)
    }

    pub async fn readlink(&self, ino: InodeId) -> Result<String> {
        self.inner.ensure_loaded(ino).await?;
        let record = self.inner.index.stat(ino)?;
        match (record.kind, record.target) {
            (InodeKind::Symlink, Some(target)) => Ok(target),
            _ => Err(FsError::InvalidArgument("not a symlink".into())),
        }
    }

    pub async fn unlink(&self, parent: InodeId, name: &str) -> Result<()> {
        self.remove(parent, name, false).await
    }

    pub async fn rmdir(&self, parent: InodeId, name: &str) -> Result<()> {
        self.remove(parent, name, true).await
    }

    async fn remove(&self, parent: InodeId, name: &str, expect_dir: bool) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_loaded(parent).await?;
        let child = inner.index.lookup(parent, name)?;
        inner.ensure_loaded(child).await?;
        let removed = {
            let _guards = inner.locks.write_all(&[parent, child]).await;
            inner.index.remove(parent, name, expect_dir)?
        };
        inner.after_unlink(&removed);
        Ok(())
    }

    /// Atomically move `src_name` to `dst_name`, replacing the destination.
    pub async fn rename(
        &self,
        src_parent: InodeId,
        src_name: &str,
        dst_parent: InodeId,
        dst_name: &str,
    ) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_loaded(src_parent).await?;
        inner.ensure_loaded(dst_parent).await?;
        let moved = inner.index.lookup(src_parent, src_name)?;
        inner.ensure_loaded(moved).await?;
        let mut lock_set = vec![src_parent, dst_parent, moved];
        match inner.index.lookup(dst_parent, dst_name) {
            Ok(existing) => {
                inner.ensure_loaded(existing).await?;
                lock_set.push(existing);
            }
            Err(FsError::NotFound) => {}
            Err(err) => return Err(err),
        }

        let replaced = {
            let _guards = inner.locks.write_all(&lock_set).await;
            inner
                .index
                .rename(src_parent, src_name, dst_parent, dst_name)?
        };
        if let Some(replaced) = replaced {
            inner.after_unlink(&replaced);
        }
        Ok(())
    }

    /// Full listing of `dir`, taken from one consistent snapshot.
    pub async fn readdir(&self, dir: InodeId) -> Result<Vec<DirListing>> {
        Ok(self.readdir_from(dir, None).await?.collect())
    }

    /// Listing of `dir` resuming after the entry named `cookie`.
    pub async fn readdir_from(&self, dir: InodeId, cookie: Option<&str>) -> Result<DirStream> {
        self.inner.ensure_loaded(dir).await?;
        self.inner.index.readdir_from(dir, cookie)
    }

    /* File handles */

    pub async fn open(&self, ino: InodeId, flags: OpenFlags) -> Result<u64> {
        let inner = &self.inner;
        inner.ensure_loaded(ino).await?;
        let record = inner.index.stat(ino)?;
        if record.is_dir() && (flags.write || flags.truncate) {
            return Err(FsError::IsDirectory);
        }
        if flags.write && flags.truncate && record.size > 0 {
            inner.truncate(ino, 0).await?;
        }
        let dirty = inner.cache.has_dirty(ino) || inner.index.is_dirty(ino);
        let fh = inner.handles.open(ino, flags, dirty);
        debug!(inode = %ino, fh = fh, write = flags.write, "opened");
        Ok(fh)
    }

    /// Read up to `size` bytes at `offset`. Short only at end of file.
    pub async fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Bytes> {
        let handle = self.inner.handles.get(fh)?;
        self.inner.read_at(handle.inode, offset, size as u64).await
    }

    /// Write `data` at `offset` (or at the end, for append handles).
    ///
    /// Returns once the write is journaled and cached. Fails with
    /// [`FsError::Backpressure`] if dirty capacity stays exhausted past the
    /// configured timeout.
    pub async fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32> {
        let inner = &self.inner;
        let handle = inner.handles.get(fh)?;
        if !handle.flags.write {
            return Err(FsError::BadHandle(fh));
        }
        let ino = handle.inode;
        inner.ensure_loaded(ino).await?;
        if data.is_empty() {
            return Ok(0);
        }

        let guess = if handle.flags.append {
            inner.index.stat(ino)?.size
        } else {
            offset
        };
        let reservation = inner
            .cache
            .reserve(
                ino,
                guess,
                data.len() as u64,
                inner.config.cache.backpressure_timeout(),
                || inner.kick.notify_one(),
            )
            .await?;

        let _guard = inner.locks.write(ino).await;
        let offset = if handle.flags.append {
            inner.index.stat(ino)?.size
        } else {
            offset
        };
        let cache = &inner.cache;
        inner.index.commit_write(ino, offset, data, move |old_size| {
            cache.apply_write(ino, offset, data, old_size, reservation)
        })?;
        inner.handles.mark_dirty(fh);
        Ok(data.len() as u32)
    }

    /// Push everything written to the handle's inode to the backend.
    pub async fn fsync(&self, fh: u64) -> Result<()> {
        let inner = &self.inner;
        let handle = inner.handles.get(fh)?;
        match inner.flush_inode(handle.inode).await {
            Ok(()) => {
                inner.handles.set_state(fh, HandleState::OpenedClean);
                Ok(())
            }
            Err(err) => {
                inner.handles.set_state(fh, HandleState::OpenedDirty);
                Err(err)
            }
        }
    }

    /// Flush and close `fh`. On a flush error the handle stays open and
    /// dirty so the caller can retry.
    pub async fn close(&self, fh: u64) -> Result<()> {
        let inner = &self.inner;
        let handle = inner.handles.get(fh)?;
        if handle.state != HandleState::OpenedClean {
            inner.handles.set_state(fh, HandleState::Closing);
            if let Err(err) = inner.flush_inode(handle.inode).await {
                warn!(inode = %handle.inode, fh = fh, error = %err, "flush on close failed");
                inner.handles.set_state(fh, HandleState::OpenedDirty);
                return Err(err);
            }
        }
        let (handle, remaining) = inner.handles.close(fh)?;
        inner.on_last_close(handle.inode, remaining);
        Ok(())
    }

    /// Close `fh` without flushing; the background flusher takes over.
    pub fn release(&self, fh: u64) -> Result<()> {
        let inner = &self.inner;
        let (handle, remaining) = inner.handles.close(fh)?;
        if handle.state != HandleState::OpenedClean {
            inner.kick.notify_one();
        }
        inner.on_last_close(handle.inode, remaining);
        Ok(())
    }

    /* Maintenance */

    /// Flush one inode's data and metadata now.
    pub async fn flush_inode(&self, ino: InodeId) -> Result<()> {
        self.inner.flush_inode(ino).await
    }

    /// Flush everything dirty, process pending deletions and checkpoint
    /// the index if nothing is left unflushed.
    pub async fn sync_all(&self) -> Result<()> {
        self.inner.flush_all().await
    }

    /// Drop every clean cached block.
    pub fn evict_all_cache(&self) -> usize {
        self.inner.cache.evict_all_clean()
    }

    /// Stop the background tasks and flush everything.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let result = self.inner.flush_all().await;
        match &result {
            Ok(()) => info!(mount = %self.inner.mount, "filesystem unmounted cleanly"),
            Err(err) => warn!(mount = %self.inner.mount, error = %err, "unmounted with unflushed state"),
        }
        result
    }

    /* Getters */

    pub fn mount_id(&self) -> MountId {
        self.inner.mount
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    pub fn handle_state(&self, fh: u64) -> Result<HandleState> {
        Ok(self.inner.handles.get(fh)?.state)
    }

    pub fn open_handles(&self) -> usize {
        self.inner.handles.len()
    }

    /// Peer events applied since mount.
    pub fn invalidations_applied(&self) -> u64 {
        self.inner.invalidations.load(Ordering::Relaxed)
    }

    /// Whether `ino` has anything not yet in the backend.
    pub fn is_dirty(&self, ino: InodeId) -> bool {
        self.inner.cache.has_dirty(ino) || self.inner.index.is_dirty(ino)
    }

    pub fn journal_segments(&self) -> usize {
        self.inner.journal.segment_count()
    }
}

impl Drop for ObjectFs {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Inner {
    /// Make sure `id` reflects the backend before it is used. A node already
    /// known locally is served as is when the backend cannot be reached.
    async fn ensure_loaded(&self, id: InodeId) -> Result<()> {
        if !self.index.needs_load(id) {
            return Ok(());
        }
        match self.backend.hydrate(&self.index, id).await {
            Ok(true) => {
                let is_file = self
                    .index
                    .stat(id)
                    .map(|r| r.kind == InodeKind::File)
                    .unwrap_or(false);
                if is_file {
                    let dropped = self.cache.invalidate_clean(id);
                    debug!(inode = %id, dropped = dropped, "reloaded inode, dropped clean blocks");
                }
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(err) if err.is_retryable() && self.index.is_hydrated(id) => {
                warn!(inode = %id, error = %err, "backend unreachable, serving cached metadata");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn truncate(&self, ino: InodeId, size: u64) -> Result<InodeRecord> {
        let _guard = self.locks.write(ino).await;
        let cache = &self.cache;
        self.index
            .commit_truncate(ino, size, move |old_size| cache.truncate(ino, old_size, size))
    }

    async fn read_at(&self, ino: InodeId, offset: u64, size: u64) -> Result<Bytes> {
        self.ensure_loaded(ino).await?;
        let (prefix, len, first, reads, ahead) = {
            let _guard = self.locks.read(ino).await;
            let record = self.index.stat(ino)?;
            if record.is_dir() {
                return Err(FsError::IsDirectory);
            }
            if offset >= record.size {
                return Ok(Bytes::new());
            }
            let len = size.min(record.size - offset);
            let Some((first, last)) = self.cache.block_span(offset, len) else {
                return Ok(Bytes::new());
            };
            let reads = self.cache.lookup(ino, first, last);
            let ahead = self.cache.plan_readahead(ino, offset, len, record.size);
            (record.key, len, first, reads, ahead)
        };

        let prefix = prefix.as_str();
        let demand = try_join_all(reads.into_iter().enumerate().map(|(i, read)| {
            let index = first + i as u64;
            async move {
                match read {
                    BlockRead::Hit(data) => Ok::<Bytes, FsError>(data),
                    BlockRead::Zero => Ok(Bytes::new()),
                    BlockRead::Miss { epoch } | BlockRead::NeedsBase { epoch } => {
                        let (data, etag) = self.fetch_block(prefix, index).await?;
                        Ok(self.cache.fill(ino, index, data, etag, epoch))
                    }
                }
            }
        }));
        let (blocks, ()) = tokio::join!(demand, self.prefetch(ino, prefix, ahead));
        let blocks = blocks?;

        let bs = self.cache.block_size();
        let end = offset + len;
        let mut out = Vec::with_capacity(len as usize);
        for (i, block) in blocks.iter().enumerate() {
            let block_start = (first + i as u64) * bs;
            let from = (offset.max(block_start) - block_start) as usize;
            let to = (end.min(block_start + bs) - block_start) as usize;
            let mark = out.len();
            if from < block.len() {
                out.extend_from_slice(&block[from..to.min(block.len())]);
            }
            // holes and short blocks read as zero
            out.resize(mark + (to - from), 0);
        }
        Ok(Bytes::from(out))
    }

    /// Backend content of one block, with its entity tag when conflicts
    /// are being detected.
    async fn fetch_block(&self, prefix: &str, index: u64) -> Result<(Bytes, Option<String>)> {
        let etag = if self.resolver.detects_conflicts() {
            self.backend.etag(&keys::block_key(prefix, index)).await?
        } else {
            None
        };
        let data = self.backend.get_block(prefix, index).await?;
        Ok((data, etag))
    }

    /// Fill the blocks a sequential reader is heading for. A failed fetch
    /// only costs the reader a miss later.
    async fn prefetch(&self, ino: InodeId, prefix: &str, plan: Option<(Vec<u64>, u64)>) {
        let Some((indices, epoch)) = plan else {
            return;
        };
        let count = indices.len();
        stream::iter(indices)
            .for_each_concurrent(self.config.flush.max_concurrency, |index| async move {
                match self.fetch_block(prefix, index).await {
                    Ok((data, etag)) => {
                        self.cache.fill(ino, index, data, etag, epoch);
                    }
                    Err(err) => {
                        debug!(inode = %ino, block = index, error = %err, "readahead fetch failed");
                    }
                }
            })
            .await;
        debug!(inode = %ino, blocks = count, "read ahead");
    }

    fn after_unlink(&self, removed: &InodeRecord) {
        if removed.nlink > 0 {
            return;
        }
        if self.handles.is_open(removed.id) {
            debug!(inode = %removed.id, "unlinked while open, deferring delete");
        } else {
            self.schedule_delete(removed.id);
        }
    }

    fn on_last_close(&self, ino: InodeId, remaining: usize) {
        if remaining > 0 {
            return;
        }
        match self.index.stat(ino) {
            Ok(record) if record.nlink == 0 => self.schedule_delete(ino),
            Ok(_) => {}
            Err(_) => self.cache.drop_inode(ino),
        }
    }

    fn schedule_delete(&self, ino: InodeId) {
        self.cache.drop_inode(ino);
        self.pending_deletes.lock().insert(ino);
        self.kick.notify_one();
    }
}
