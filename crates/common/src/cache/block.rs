use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};

use super::ranges::{overlay, ByteRange, RangeSet};
use super::readahead::Readahead;
use super::stats::{CacheStats, Counters};
use crate::config::CacheConfig;
use crate::error::{FsError, Result};
use crate::types::InodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Clean,
    Dirty,
    Flushing,
}

#[derive(Debug)]
struct CachedBlock {
    /// Block content; bytes past the end read as zero
    data: Vec<u8>,
    state: BlockState,
    last_access: u64,
    /// Entity tag of the backend object this content was loaded from
    base_etag: Option<String>,
    /// Bytes written locally since the block was last clean
    dirty: RangeSet,
    /// Whether `data` includes the backend content underneath `dirty`
    loaded: bool,
    /// Unique per write; lets a flush notice it was overtaken
    gen: u64,
}

/// Result of looking up one block for a read.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockRead {
    Hit(Bytes),
    /// Known to be zero without asking the backend
    Zero,
    /// Not cached; fetch and [`BlockCache::fill`] with `epoch`
    Miss { epoch: u64 },
    /// Dirty but missing its base; fetch and [`BlockCache::fill`]
    NeedsBase { epoch: u64 },
}

/// Snapshot of a dirty block handed to the flusher.
#[derive(Debug, Clone)]
pub struct FlushItem {
    pub index: u64,
    pub data: Vec<u8>,
    pub loaded: bool,
    pub dirty: Vec<ByteRange>,
    pub base_etag: Option<String>,
    pub gen: u64,
}

#[derive(Debug, Clone)]
pub enum FlushOutcome {
    /// `data` is now the backend content of the block
    Written {
        data: Vec<u8>,
        etag: Option<String>,
    },
    Failed,
}

type BlockKey = (InodeId, u64);

#[derive(Debug, Default)]
struct Inner {
    blocks: HashMap<BlockKey, CachedBlock>,
    by_inode: HashMap<InodeId, BTreeSet<u64>>,
    /// Clean blocks ordered by (last access, inode, index)
    lru: BTreeSet<(u64, InodeId, u64)>,
    tick: u64,
    next_gen: u64,
    /// Dirty plus flushing blocks
    dirty: usize,
    reserved: usize,
    epochs: HashMap<InodeId, u64>,
    global_epoch: u64,
    /// First block index known to be zero while backend blocks await deletion
    trims: HashMap<InodeId, u64>,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn next_gen(&mut self) -> u64 {
        self.next_gen += 1;
        self.next_gen
    }

    fn epoch(&self, inode: InodeId) -> u64 {
        self.global_epoch + self.epochs.get(&inode).copied().unwrap_or(0)
    }

    fn bump_epoch(&mut self, inode: InodeId) {
        *self.epochs.entry(inode).or_insert(0) += 1;
    }

    fn is_trimmed(&self, inode: InodeId, index: u64) -> bool {
        self.trims.get(&inode).map(|t| index >= *t).unwrap_or(false)
    }

    fn insert(&mut self, key: BlockKey, block: CachedBlock) {
        if block.state == BlockState::Clean {
            self.lru.insert((block.last_access, key.0, key.1));
        } else {
            self.dirty += 1;
        }
        self.by_inode.entry(key.0).or_default().insert(key.1);
        self.blocks.insert(key, block);
    }

    fn remove(&mut self, key: BlockKey) -> Option<CachedBlock> {
        let block = self.blocks.remove(&key)?;
        if block.state == BlockState::Clean {
            self.lru.remove(&(block.last_access, key.0, key.1));
        } else {
            self.dirty -= 1;
        }
        if let Some(set) = self.by_inode.get_mut(&key.0) {
            set.remove(&key.1);
            if set.is_empty() {
                self.by_inode.remove(&key.0);
            }
        }
        Some(block)
    }

    fn touch(&mut self, key: BlockKey, tick: u64) {
        if let Some(block) = self.blocks.get_mut(&key) {
            if block.state == BlockState::Clean {
                self.lru.remove(&(block.last_access, key.0, key.1));
                self.lru.insert((tick, key.0, key.1));
            }
            block.last_access = tick;
        }
    }

    /// Mark an existing block dirty, taking it off the eviction list.
    fn make_dirty(&mut self, key: BlockKey) {
        if let Some(block) = self.blocks.get_mut(&key) {
            match block.state {
                BlockState::Clean => {
                    self.lru.remove(&(block.last_access, key.0, key.1));
                    block.state = BlockState::Dirty;
                    self.dirty += 1;
                }
                BlockState::Flushing => block.state = BlockState::Dirty,
                BlockState::Dirty => {}
            }
        }
    }

    fn evict_one(&mut self) -> Option<BlockKey> {
        let (_, inode, index) = self.lru.pop_first()?;
        let key = (inode, index);
        // already off the lru
        if let Some(block) = self.blocks.remove(&key) {
            debug_assert_eq!(block.state, BlockState::Clean);
            if let Some(set) = self.by_inode.get_mut(&inode) {
                set.remove(&index);
                if set.is_empty() {
                    self.by_inode.remove(&inode);
                }
            }
        }
        Some(key)
    }

    fn indices(&self, inode: InodeId) -> Vec<u64> {
        self.by_inode
            .get(&inode)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }
}

/// Fixed-capacity block cache with write-back dirty tracking.
#[derive(Debug)]
pub struct BlockCache {
    block_size: u64,
    capacity: usize,
    dirty_limit: usize,
    inner: Mutex<Inner>,
    space: Notify,
    counters: Counters,
    readahead: Readahead,
}

/// Room for dirty blocks held by a pending write. Released on drop.
#[derive(Debug)]
pub struct Reservation<'a> {
    cache: &'a BlockCache,
    count: usize,
}

impl Reservation<'_> {
    fn take(&mut self) -> usize {
        std::mem::take(&mut self.count)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        let count = self.take();
        if count > 0 {
            self.cache.inner.lock().reserved -= count;
            self.cache.space.notify_waiters();
        }
    }
}

impl BlockCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            block_size: config.block_size,
            capacity: config.capacity_blocks,
            dirty_limit: config.dirty_limit(),
            inner: Mutex::new(Inner::default()),
            space: Notify::new(),
            counters: Counters::default(),
            readahead: Readahead::new(config.readahead_blocks),
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Indices of the first and last block touched by `[offset, offset + len)`.
    pub fn block_span(&self, offset: u64, len: u64) -> Option<(u64, u64)> {
        if len == 0 {
            return None;
        }
        Some((offset / self.block_size, (offset + len - 1) / self.block_size))
    }

    /// Wait until the blocks a write to `[offset, offset + len)` would dirty
    /// fit under the dirty limit, calling `on_full` each time it has to wait.
    pub async fn reserve<F>(
        &self,
        inode: InodeId,
        offset: u64,
        len: u64,
        timeout: Duration,
        on_full: F,
    ) -> Result<Reservation<'_>>
    where
        F: Fn(),
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.space.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(count) = self.try_reserve(inode, offset, len) {
                return Ok(Reservation { cache: self, count });
            }

            debug!(inode = %inode, offset = offset, len = len, "dirty capacity exhausted, waiting");
            on_full();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    inode = %inode,
                    timeout_ms = timeout.as_millis() as u64,
                    "write gave up waiting for dirty capacity"
                );
                return Err(FsError::Backpressure);
            }
        }
    }

    fn try_reserve(&self, inode: InodeId, offset: u64, len: u64) -> Option<usize> {
        let (first, last) = match self.block_span(offset, len) {
            Some(span) => span,
            None => return Some(0),
        };
        let mut inner = self.inner.lock();
        let needed = (first..=last)
            .filter(|index| {
                inner
                    .blocks
                    .get(&(inode, *index))
                    .map(|b| b.state == BlockState::Clean)
                    .unwrap_or(true)
            })
            .count()
            .min(self.dirty_limit);
        if needed == 0 {
            return Some(0);
        }
        if inner.dirty + inner.reserved + needed > self.dirty_limit {
            return None;
        }
        inner.reserved += needed;
        Some(needed)
    }

    /// Look up every block in `first..=last` for a read.
    pub fn lookup(&self, inode: InodeId, first: u64, last: u64) -> Vec<BlockRead> {
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();
        let epoch = inner.epoch(inode);
        let mut reads = Vec::with_capacity((last - first + 1) as usize);
        let (mut hits, mut misses) = (0, 0);

        for index in first..=last {
            let key = (inode, index);
            let read = match inner.blocks.get(&key) {
                Some(block) if block.loaded => {
                    hits += 1;
                    BlockRead::Hit(Bytes::copy_from_slice(&block.data))
                }
                Some(_) => {
                    misses += 1;
                    BlockRead::NeedsBase { epoch }
                }
                None if inner.is_trimmed(inode, index) => BlockRead::Zero,
                None => {
                    misses += 1;
                    BlockRead::Miss { epoch }
                }
            };
            if !matches!(read, BlockRead::Zero | BlockRead::Miss { .. }) {
                inner.touch(key, tick);
            }
            reads.push(read);
        }
        Counters::bump(&self.counters.hits, hits);
        Counters::bump(&self.counters.misses, misses);
        reads
    }

    pub fn epoch(&self, inode: InodeId) -> u64 {
        self.inner.lock().epoch(inode)
    }

    /// Blocks worth fetching ahead of a read of `[offset, offset + len)` in
    /// a file of `size` bytes, with the epoch to fill them under. Only a
    /// read continuing a sequential stream gets any; blocks already cached
    /// or known to be zero are left out.
    pub fn plan_readahead(
        &self,
        inode: InodeId,
        offset: u64,
        len: u64,
        size: u64,
    ) -> Option<(Vec<u64>, u64)> {
        let (_, last) = self.block_span(offset, len)?;
        let eof = size.checked_sub(1)? / self.block_size;
        let range = self.readahead.observe(inode, offset, len, last, eof)?;
        let inner = self.inner.lock();
        let wanted: Vec<u64> = range
            .filter(|index| {
                !inner.blocks.contains_key(&(inode, *index)) && !inner.is_trimmed(inode, *index)
            })
            .collect();
        if wanted.is_empty() {
            return None;
        }
        Counters::bump(&self.counters.prefetched, wanted.len() as u64);
        Some((wanted, inner.epoch(inode)))
    }

    /// Install backend content fetched for a miss, returning the block's
    /// current content.
    ///
    /// If the block turned dirty while the fetch was in flight, `data` becomes
    /// its base and the local writes are laid on top. If the inode was
    /// invalidated or truncated since `epoch` was taken, `data` is returned
    /// without being cached.
    pub fn fill(
        &self,
        inode: InodeId,
        index: u64,
        data: Bytes,
        etag: Option<String>,
        epoch: u64,
    ) -> Bytes {
        Counters::bump(&self.counters.fills, 1);
        let mut inner = self.inner.lock();
        let key = (inode, index);
        let tick = inner.next_tick();

        if let Some(block) = inner.blocks.get_mut(&key) {
            if !block.loaded {
                block.data = overlay(&data, &block.data, block.dirty.as_slice());
                block.loaded = true;
                block.base_etag = etag;
            }
            let content = Bytes::copy_from_slice(&block.data);
            inner.touch(key, tick);
            return content;
        }

        if inner.epoch(inode) != epoch {
            debug!(inode = %inode, block = index, "discarding fill for invalidated block");
            return data;
        }

        if inner.blocks.len() >= self.capacity && !self.evict_for_insert(&mut inner) {
            return data;
        }
        inner.insert(
            key,
            CachedBlock {
                data: data.to_vec(),
                state: BlockState::Clean,
                last_access: tick,
                base_etag: etag,
                dirty: RangeSet::new(),
                loaded: true,
                gen: 0,
            },
        );
        data
    }

    /// Apply a write of `data` at `offset` to a file that was `old_size`
    /// bytes long, consuming the reservation taken for it.
    pub fn apply_write(
        &self,
        inode: InodeId,
        offset: u64,
        data: &[u8],
        old_size: u64,
        mut reservation: Reservation<'_>,
    ) {
        let count = reservation.take();
        let mut inner = self.inner.lock();
        inner.reserved -= count;
        self.write_locked(&mut inner, inode, offset, data, old_size);
    }

    /// Apply a write without a reservation; used by journal replay.
    pub fn apply_write_unreserved(&self, inode: InodeId, offset: u64, data: &[u8], old_size: u64) {
        let mut inner = self.inner.lock();
        self.write_locked(&mut inner, inode, offset, data, old_size);
    }

    fn write_locked(
        &self,
        inner: &mut Inner,
        inode: InodeId,
        offset: u64,
        data: &[u8],
        old_size: u64,
    ) {
        let bs = self.block_size;
        let end = offset + data.len() as u64;
        let tick = inner.next_tick();
        let mut pos = offset;

        while pos < end {
            let index = pos / bs;
            let block_start = index * bs;
            let in_block = (pos - block_start) as usize;
            let n = (end.min(block_start + bs) - pos) as usize;
            let chunk = &data[(pos - offset) as usize..(pos - offset) as usize + n];
            let key = (inode, index);
            let gen = inner.next_gen();

            if inner.blocks.contains_key(&key) {
                inner.make_dirty(key);
                if let Some(block) = inner.blocks.get_mut(&key) {
                    if block.data.len() < in_block + n {
                        block.data.resize(in_block + n, 0);
                    }
                    block.data[in_block..in_block + n].copy_from_slice(chunk);
                    block.dirty.insert(ByteRange::new(in_block, in_block + n));
                    block.gen = gen;
                    block.last_access = tick;
                }
            } else {
                let loaded = block_start >= old_size
                    || inner.is_trimmed(inode, index)
                    || (in_block == 0 && n as u64 == bs);
                if inner.blocks.len() >= self.capacity {
                    self.evict_for_insert(inner);
                }
                let mut content = vec![0u8; in_block + n];
                content[in_block..].copy_from_slice(chunk);
                let mut dirty = RangeSet::new();
                dirty.insert(ByteRange::new(in_block, in_block + n));
                inner.insert(
                    key,
                    CachedBlock {
                        data: content,
                        state: BlockState::Dirty,
                        last_access: tick,
                        base_etag: None,
                        dirty,
                        loaded,
                        gen,
                    },
                );
            }
            pos += n as u64;
        }
    }

    /// Resize an inode's cached content from `old_size` to `new_size`
    /// without touching the backend.
    ///
    /// Shrinking drops every block past the new end and zeroes the tail of
    /// the boundary block. The stale backend blocks are remembered as a
    /// pending trim and read as zero until the flusher deletes them.
    pub fn truncate(&self, inode: InodeId, old_size: u64, new_size: u64) {
        let bs = self.block_size;
        let mut inner = self.inner.lock();
        inner.bump_epoch(inode);
        if new_size >= old_size {
            return;
        }

        let keep = new_size.div_ceil(bs);
        let mut dropped = 0;
        for index in inner.indices(inode) {
            if index >= keep && inner.remove((inode, index)).is_some() {
                dropped += 1;
            }
        }
        let trim = inner.trims.get(&inode).copied().map_or(keep, |t| t.min(keep));
        inner.trims.insert(inode, trim);

        let cut = (new_size % bs) as usize;
        if cut != 0 {
            let index = new_size / bs;
            let key = (inode, index);
            let gen = inner.next_gen();
            let tail = ByteRange::new(cut, bs as usize);
            if inner.blocks.contains_key(&key) {
                inner.make_dirty(key);
                if let Some(block) = inner.blocks.get_mut(&key) {
                    block.data.truncate(cut);
                    block.dirty.clip(cut);
                    block.dirty.insert(tail);
                    block.gen = gen;
                }
            } else {
                let tick = inner.next_tick();
                let mut dirty = RangeSet::new();
                dirty.insert(tail);
                inner.insert(
                    key,
                    CachedBlock {
                        data: Vec::new(),
                        state: BlockState::Dirty,
                        last_access: tick,
                        base_etag: None,
                        dirty,
                        loaded: false,
                        gen,
                    },
                );
            }
        }
        debug!(
            inode = %inode,
            old_size = old_size,
            new_size = new_size,
            dropped = dropped,
            "truncated cached blocks"
        );
        drop(inner);
        if dropped > 0 {
            self.space.notify_waiters();
        }
    }

    /// Move every dirty block of `inode` to flushing and snapshot it. Content
    /// is clipped to `size`.
    pub fn begin_flush(&self, inode: InodeId, size: u64) -> Vec<FlushItem> {
        let bs = self.block_size;
        let mut inner = self.inner.lock();
        let mut items = Vec::new();
        for index in inner.indices(inode) {
            let Some(block) = inner.blocks.get_mut(&(inode, index)) else {
                continue;
            };
            if block.state != BlockState::Dirty {
                continue;
            }
            block.state = BlockState::Flushing;
            let limit = size.saturating_sub(index * bs).min(bs) as usize;
            let mut data = block.data.clone();
            data.truncate(limit);
            let mut dirty = block.dirty.clone();
            dirty.clip(limit);
            items.push(FlushItem {
                index,
                data,
                loaded: block.loaded,
                dirty: dirty.as_slice().to_vec(),
                base_etag: block.base_etag.clone(),
                gen: block.gen,
            });
        }
        items
    }

    /// Record the result of flushing one block captured by [`begin_flush`].
    ///
    /// A block rewritten while the flush was in flight stays dirty. A failed
    /// flush returns the block to dirty; its content is never dropped.
    ///
    /// [`begin_flush`]: BlockCache::begin_flush
    pub fn complete_flush(&self, inode: InodeId, index: u64, gen: u64, outcome: FlushOutcome) {
        let key = (inode, index);
        let mut inner = self.inner.lock();
        let tick = inner.next_tick();
        let Some(block) = inner.blocks.get_mut(&key) else {
            return;
        };

        match outcome {
            FlushOutcome::Written { data, etag } => {
                if block.gen == gen && block.state == BlockState::Flushing {
                    block.data = data;
                    block.loaded = true;
                    block.base_etag = etag;
                    block.dirty.clear();
                    block.state = BlockState::Clean;
                    block.last_access = tick;
                    inner.dirty -= 1;
                    inner.lru.insert((tick, inode, index));
                    while inner.blocks.len() > self.capacity {
                        if !self.evict_for_insert(&mut inner) {
                            break;
                        }
                    }
                    drop(inner);
                    self.space.notify_waiters();
                } else {
                    if !block.loaded {
                        block.data = overlay(&data, &block.data, block.dirty.as_slice());
                        block.loaded = true;
                    }
                    block.base_etag = etag;
                }
            }
            FlushOutcome::Failed => {
                if block.gen == gen && block.state == BlockState::Flushing {
                    block.state = BlockState::Dirty;
                }
            }
        }
    }

    /// First block index awaiting deletion in the backend, if any.
    pub fn pending_trim(&self, inode: InodeId) -> Option<u64> {
        self.inner.lock().trims.get(&inode).copied()
    }

    /// Forget a pending trim once the backend blocks from `from` on are gone.
    pub fn clear_trim(&self, inode: InodeId, from: u64) {
        let mut inner = self.inner.lock();
        if inner.trims.get(&inode) == Some(&from) {
            inner.trims.remove(&inode);
        }
    }

    /// Evict every clean block of `inode` so the next read refetches it.
    pub fn invalidate_clean(&self, inode: InodeId) -> usize {
        let mut inner = self.inner.lock();
        inner.bump_epoch(inode);
        let clean: Vec<u64> = inner
            .indices(inode)
            .into_iter()
            .filter(|index| {
                inner
                    .blocks
                    .get(&(inode, *index))
                    .map(|b| b.state == BlockState::Clean)
                    .unwrap_or(false)
            })
            .collect();
        for index in &clean {
            inner.remove((inode, *index));
        }
        clean.len()
    }

    /// Drop everything cached for `inode`, dirty blocks included.
    pub fn drop_inode(&self, inode: InodeId) {
        self.readahead.forget(inode);
        let mut inner = self.inner.lock();
        inner.bump_epoch(inode);
        inner.trims.remove(&inode);
        let mut freed = false;
        for index in inner.indices(inode) {
            if let Some(block) = inner.remove((inode, index)) {
                freed |= block.state != BlockState::Clean;
            }
        }
        drop(inner);
        if freed {
            self.space.notify_waiters();
        }
    }

    /// Evict every clean block.
    pub fn evict_all_clean(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.global_epoch += 1;
        let mut evicted = 0;
        while inner.evict_one().is_some() {
            evicted += 1;
        }
        evicted
    }

    /* Getters */

    pub fn has_dirty(&self, inode: InodeId) -> bool {
        let inner = self.inner.lock();
        inner.trims.contains_key(&inode)
            || inner.indices(inode).iter().any(|index| {
                inner
                    .blocks
                    .get(&(inode, *index))
                    .map(|b| b.state != BlockState::Clean)
                    .unwrap_or(false)
            })
    }

    /// Inodes with blocks waiting for a flush or a pending trim.
    pub fn dirty_inodes(&self) -> Vec<InodeId> {
        let inner = self.inner.lock();
        let mut inodes: BTreeSet<InodeId> = inner.trims.keys().copied().collect();
        for ((inode, _), block) in &inner.blocks {
            if block.state == BlockState::Dirty {
                inodes.insert(*inode);
            }
        }
        inodes.into_iter().collect()
    }

    pub fn dirty_count(&self) -> usize {
        self.inner.lock().dirty
    }

    pub fn len(&self) -> usize {
        self.inner.lock().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, inode: InodeId, index: u64) -> bool {
        self.inner.lock().blocks.contains_key(&(inode, index))
    }

    pub fn state(&self, inode: InodeId, index: u64) -> Option<BlockState> {
        self.inner
            .lock()
            .blocks
            .get(&(inode, index))
            .map(|b| b.state)
    }

    /// Clean blocks from least to most recently used.
    pub fn recency_order(&self) -> Vec<(InodeId, u64)> {
        self.inner
            .lock()
            .lru
            .iter()
            .map(|(_, inode, index)| (*inode, *index))
            .collect()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: Counters::get(&self.counters.hits),
            misses: Counters::get(&self.counters.misses),
            fills: Counters::get(&self.counters.fills),
            evictions: Counters::get(&self.counters.evictions),
            prefetched: Counters::get(&self.counters.prefetched),
            clean_blocks: inner.blocks.len() - inner.dirty,
            dirty_blocks: inner.dirty,
            capacity_blocks: self.capacity,
            dirty_limit: self.dirty_limit,
        }
    }

    fn evict_for_insert(&self, inner: &mut Inner) -> bool {
        match inner.evict_one() {
            Some((inode, index)) => {
                Counters::bump(&self.counters.evictions, 1);
                debug!(inode = %inode, block = index, "evicted clean block");
                true
            }
            None => false,
        }
    }
}
