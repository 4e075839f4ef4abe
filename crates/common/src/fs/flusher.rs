//! Write-back flushing.
//!
//! One flush of an inode captures, under its read lock, the dirty blocks,
//! the metadata and the invalidation events committed with them. Blocks go
//! out first, in parallel; the metadata object follows only once every
//! block landed, and the events are published last. A failed block stays
//! dirty and its events are put back, so nothing is lost or announced early.
//! The same holds when the flush future is dropped before it finishes.

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::Inner;
use crate::bus::InvalidationEvent;
use crate::cache::{overlay, FlushItem, FlushOutcome};
use crate::conflict::{diverged, Conflict, Resolution};
use crate::error::{FsError, Result};
use crate::keys;
use crate::types::{InodeId, InodeKind};

/// Background loop: flush everything on every tick, or sooner when kicked.
pub(super) async fn run(inner: Weak<Inner>, mut shutdown: watch::Receiver<bool>) {
    let (period, kick) = match inner.upgrade() {
        Some(inner) => (inner.config.flush.interval(), inner.kick.clone()),
        None => return,
    };
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = kick.notified() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("flusher stopping");
                    return;
                }
            }
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if let Err(err) = inner.flush_all().await {
            warn!(error = %err, "background flush incomplete");
        }
    }
}

impl Inner {
    /// Flush `id`, waiting for any flush of it already running.
    pub(super) fn flush_inode(self: &Arc<Self>, id: InodeId) -> BoxFuture<'_, Result<()>> {
        async move {
            let _serial = self.flush_locks.write(id).await;
            self.run_flush(id).await
        }
        .boxed()
    }

    async fn run_flush(self: &Arc<Self>, id: InodeId) -> Result<()> {
        let record = match self.index.stat(id) {
            Ok(record) => record,
            Err(FsError::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };
        // unlinked inodes are deleted, not flushed; placeholders hold nothing
        if record.nlink == 0 || record.version == 0 {
            return Ok(());
        }

        if record.is_dir() {
            // a new entry must not be published before the inode it names
            for child in self.index.unflushed_children(id) {
                self.flush_inode(child).await?;
            }
        }

        let prefix = record.key;
        if let Some(from) = self.cache.pending_trim(id) {
            let deleted = self.backend.delete_blocks_from(&prefix, from).await?;
            self.cache.clear_trim(id, from);
            debug!(inode = %id, from = from, deleted = deleted, "trimmed backend blocks");
        }

        let (meta, version, tombstones, items, mut ticket) = {
            let _guard = self.locks.read(id).await;
            let (meta, version, tombstones) = self.index.capture_meta(id)?;
            let items = if meta.record.kind == InodeKind::File {
                self.cache.begin_flush(id, meta.record.size)
            } else {
                Vec::new()
            };
            let events = self.index.outbox().take_committed(id);
            let ticket = FlushTicket::new(self, id, &items, events);
            (meta, version, tombstones, items, ticket)
        };
        let size = meta.record.size;

        let blocks = items.len();
        let prefix = prefix.as_str();
        let mut puts = stream::iter(items)
            .map(|item| async move {
                let (index, gen) = (item.index, item.gen);
                (index, gen, self.put_block(id, prefix, size, item).await)
            })
            .buffer_unordered(self.config.flush.max_concurrency);

        let mut failure = None;
        while let Some((index, gen, result)) = puts.next().await {
            match result {
                Ok((data, etag)) => {
                    ticket.complete(index, gen, FlushOutcome::Written { data, etag })
                }
                Err(err) => {
                    warn!(inode = %id, block = index, error = %err, "block flush failed");
                    ticket.complete(index, gen, FlushOutcome::Failed);
                    failure.get_or_insert(err);
                }
            }
        }
        drop(puts);
        if let Some(err) = failure {
            return Err(err);
        }

        if version > self.index.flushed(id) {
            let encoded = meta.encode()?;
            self.backend
                .put(&keys::meta_key(prefix), Bytes::from(encoded))
                .await?;
            self.index.mark_flushed(id, version, &tombstones);
        }

        for event in ticket.take_events() {
            if let Err(err) = self.bus.publish(event).await {
                warn!(inode = %id, error = %err, "failed to publish invalidation");
            }
        }

        if !self.cache.has_dirty(id) && !self.index.is_dirty(id) {
            self.handles.mark_inode_clean(id);
        }
        debug!(inode = %id, blocks = blocks, version = version, "flushed inode");
        Ok(())
    }

    /// Write one block, resolving its content against the backend first
    /// when needed. Returns what the backend now holds and its entity tag.
    async fn put_block(
        &self,
        id: InodeId,
        prefix: &str,
        size: u64,
        item: FlushItem,
    ) -> Result<(Vec<u8>, Option<String>)> {
        let bs = self.cache.block_size();
        let key = keys::block_key(prefix, item.index);
        let limit = size.saturating_sub(item.index * bs).min(bs) as usize;
        if limit == 0 {
            self.backend.delete(&key).await?;
            return Ok((Vec::new(), None));
        }

        let mut data = item.data;
        if !item.loaded {
            let base = self.backend.get(&key).await?.unwrap_or_default();
            data = overlay(&base, &data, &item.dirty);
        } else if self.resolver.detects_conflicts() {
            let remote_etag = self.backend.etag(&key).await?;
            if diverged(item.base_etag.as_deref(), remote_etag.as_deref()) {
                let remote = self.backend.get(&key).await?.unwrap_or_default();
                let conflict = Conflict {
                    inode: id,
                    block: item.index,
                    local: data.clone(),
                    dirty: item.dirty.clone(),
                    remote: remote.to_vec(),
                    remote_etag,
                };
                if let Resolution::UseMerged(merged) = self.resolver.resolve(&conflict) {
                    data = merged;
                }
            }
        }
        data.truncate(limit);

        let etag = self.backend.put(&key, Bytes::from(data.clone())).await?;
        Ok((data, etag))
    }

    fn requeue(&self, id: InodeId, events: &[InvalidationEvent]) {
        let outbox = self.index.outbox();
        for event in events {
            outbox.enqueue(id, event.inode, event.kind, event.version);
        }
    }

    /// Flush every dirty inode, files before directories, then delete what
    /// was unlinked and checkpoint the index if nothing is left unflushed.
    pub(super) async fn flush_all(self: &Arc<Self>) -> Result<()> {
        let mut targets: BTreeSet<InodeId> = self.cache.dirty_inodes().into_iter().collect();
        targets.extend(self.index.dirty_nodes().into_iter().map(|(id, _)| id));
        targets.extend(self.index.outbox().commit_targets());

        let (dirs, files): (Vec<InodeId>, Vec<InodeId>) = targets.into_iter().partition(|id| {
            self.index
                .stat(*id)
                .map(|r| r.is_dir())
                .unwrap_or(false)
        });

        let mut failure = None;
        let file_results: Vec<(InodeId, Result<()>)> = stream::iter(files)
            .map(|id| async move { (id, self.flush_inode(id).await) })
            .buffer_unordered(self.config.flush.max_concurrency)
            .collect()
            .await;
        for (id, result) in file_results {
            if let Err(err) = result {
                debug!(inode = %id, error = %err, "file flush failed");
                failure.get_or_insert(err);
            }
        }
        for id in dirs {
            if let Err(err) = self.flush_inode(id).await {
                debug!(inode = %id, error = %err, "directory flush failed");
                failure.get_or_insert(err);
            }
        }
        if let Err(err) = self.process_deletes().await {
            failure.get_or_insert(err);
        }
        if let Some(err) = failure {
            return Err(err);
        }
        self.checkpoint()?;
        Ok(())
    }

    /// Delete the backend objects of unlinked inodes nobody holds open.
    async fn process_deletes(&self) -> Result<()> {
        let pending: Vec<InodeId> = self.pending_deletes.lock().iter().copied().collect();
        for id in pending {
            if self.handles.is_open(id) {
                continue;
            }
            let prefix = keys::inode_prefix(id);
            let deleted = self.backend.delete_prefix(&prefix).await?;
            self.cache.drop_inode(id);
            self.index.purge(id);
            self.pending_deletes.lock().remove(&id);
            debug!(inode = %id, objects = deleted, "deleted unlinked inode from backend");
        }
        Ok(())
    }

    /// Snapshot the index and prune the journal, but only when everything
    /// the journal holds is already in the backend.
    fn checkpoint(&self) -> Result<bool> {
        let last = self.checkpoint_seq.load(Ordering::SeqCst);
        let snapshot = self.index.snapshot(|| {
            let seq = self.journal.next_seq();
            let quiescent = self.cache.dirty_count() == 0
                && self.cache.dirty_inodes().is_empty()
                && self.index.dirty_nodes().is_empty()
                && self.pending_deletes.lock().is_empty();
            (quiescent && seq > last).then_some(seq)
        });
        let Some(snapshot) = snapshot else {
            return Ok(false);
        };

        let seq = snapshot.journal_seq;
        snapshot.save(&self.snapshot_path)?;
        let pruned = self.journal.truncate_before(seq)?;
        self.checkpoint_seq.store(seq, Ordering::SeqCst);
        info!(
            journal_seq = seq,
            inodes = snapshot.records.len(),
            pruned_segments = pruned,
            "checkpointed index"
        );
        Ok(true)
    }
}

/// What one flush took out of the cache and the outbox.
///
/// Blocks still flushing when the ticket drops return to dirty and untaken
/// events go back to the outbox, so a flush abandoned midway, by an error or
/// by its future being dropped, loses nothing.
struct FlushTicket<'a> {
    inner: &'a Inner,
    inode: InodeId,
    /// (block index, generation) of blocks not yet completed
    pending: Vec<(u64, u64)>,
    events: Vec<InvalidationEvent>,
}

impl<'a> FlushTicket<'a> {
    fn new(
        inner: &'a Inner,
        inode: InodeId,
        items: &[FlushItem],
        events: Vec<InvalidationEvent>,
    ) -> Self {
        Self {
            inner,
            inode,
            pending: items.iter().map(|item| (item.index, item.gen)).collect(),
            events,
        }
    }

    fn complete(&mut self, index: u64, gen: u64, outcome: FlushOutcome) {
        self.pending.retain(|pending| *pending != (index, gen));
        self.inner.cache.complete_flush(self.inode, index, gen, outcome);
    }

    fn take_events(&mut self) -> Vec<InvalidationEvent> {
        std::mem::take(&mut self.events)
    }
}

impl Drop for FlushTicket<'_> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!(
                inode = %self.inode,
                blocks = self.pending.len(),
                "returning unflushed blocks to dirty"
            );
        }
        for (index, gen) in self.pending.drain(..) {
            self.inner
                .cache
                .complete_flush(self.inode, index, gen, FlushOutcome::Failed);
        }
        if !self.events.is_empty() {
            self.inner.requeue(self.inode, &self.events);
        }
    }
}
