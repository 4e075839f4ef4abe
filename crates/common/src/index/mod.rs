//! Metadata index
//!
//! The in-memory tree of inode records and directory entries. It is the
//! source of truth for namespace shape on this mount.
//!
//! # Mutations
//!
//! Every mutating call builds a [`Mutation`], commits it to the configured
//! [`MutationSink`] (the journal) while holding the locks of everything it
//! touches, and then applies that same mutation to the in-memory records.
//! Journal replay goes through the same apply helpers, each part gated on
//! the version of the inode it changes, so replaying a record twice is a
//! no-op.
//!
//! # Locking
//!
//! - Namespace mutations (create, remove, rename and remote refreshes) hold
//!   the namespace locks of the directories they change: the parent, both
//!   parents of a rename, and a directory being removed or replaced. Those
//!   are taken together, before any node lock.
//! - Within a node, the entries lock is taken before the record lock.
//! - The node map lock is never held while taking a node lock.
//! - Every journaled mutation holds the snapshot gate shared; taking a
//!   snapshot holds it exclusive, so a snapshot always matches a journal
//!   position.

mod dirs;
mod node;
mod remote;
mod snapshot;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};

pub use node::{DirEntry, DirListing, DirStream};
pub use remote::{RemoteEntry, RemoteInode};
pub use snapshot::{IndexSnapshot, SnapshotDir, SnapshotRecord};

use dirs::{DirGuard, DirLocks};
use node::{Entries, InodeNode};

use crate::bus::{EventKind, Outbox};
use crate::error::{FsError, Result};
use crate::journal::{Mutation, MutationOp, MutationSink, VersionBump};
use crate::types::{IdAllocator, InodeId, InodeKind, InodeRecord, NewAttrs, SetAttr, Version};

pub const MAX_NAME_LEN: usize = 255;

const MAX_DEPTH: usize = 4096;

/// Reject names that cannot appear in a directory.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(FsError::InvalidArgument(format!("invalid name {:?}", name)));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(FsError::InvalidArgument(format!(
            "name longer than {} bytes",
            MAX_NAME_LEN
        )));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(FsError::InvalidArgument(format!("invalid name {:?}", name)));
    }
    Ok(())
}

/// What replaying one journal record did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Already reflected in the index
    Skipped,
    /// Applied; `prior_size` is the recorded inode's size beforehand
    Applied { prior_size: u64 },
}

#[derive(Debug)]
pub struct MetadataIndex {
    nodes: RwLock<HashMap<InodeId, Arc<InodeNode>>>,
    gate: RwLock<()>,
    dirs: DirLocks,
    sink: Option<Arc<dyn MutationSink>>,
    outbox: Arc<Outbox>,
    ids: IdAllocator,
}

impl MetadataIndex {
    /// Index holding only a brand-new root directory.
    pub fn new(outbox: Arc<Outbox>) -> Self {
        let root = InodeRecord::new(
            InodeId::ROOT,
            InodeId::ROOT,
            InodeKind::Directory,
            &NewAttrs::new(0o755, 0, 0),
        );
        Self::with_root(InodeNode::new(root, BTreeMap::new(), 0), outbox)
    }

    /// Index whose root has yet to be loaded from the backend.
    pub fn unhydrated(outbox: Arc<Outbox>) -> Self {
        Self::with_root(
            InodeNode::placeholder(InodeId::ROOT, InodeId::ROOT, InodeKind::Directory),
            outbox,
        )
    }

    /// Index rebuilt from a snapshot. Every node starts stale so peers'
    /// changes made while this mount was down get picked up.
    pub fn from_snapshot(snapshot: IndexSnapshot, outbox: Arc<Outbox>) -> Self {
        let ids = IdAllocator::new();
        let mut dirs: HashMap<InodeId, SnapshotDir> =
            snapshot.dirs.into_iter().map(|d| (d.dir, d)).collect();
        let mut nodes = HashMap::with_capacity(snapshot.records.len());
        for SnapshotRecord { record, flushed } in snapshot.records {
            let id = record.id;
            let entries = dirs
                .remove(&id)
                .map(|d| d.entries.into_iter().collect())
                .unwrap_or_default();
            let node = InodeNode::new(record, entries, flushed);
            node.set_stale(true);
            ids.observe(id);
            nodes.insert(id, Arc::new(node));
        }
        nodes.entry(InodeId::ROOT).or_insert_with(|| {
            Arc::new(InodeNode::placeholder(
                InodeId::ROOT,
                InodeId::ROOT,
                InodeKind::Directory,
            ))
        });
        Self {
            nodes: RwLock::new(nodes),
            gate: RwLock::new(()),
            dirs: DirLocks::default(),
            sink: None,
            outbox,
            ids,
        }
    }

    fn with_root(root: InodeNode, outbox: Arc<Outbox>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(InodeId::ROOT, Arc::new(root));
        Self {
            nodes: RwLock::new(nodes),
            gate: RwLock::new(()),
            dirs: DirLocks::default(),
            sink: None,
            outbox,
            ids: IdAllocator::new(),
        }
    }

    /// Commit every mutation to `sink` before applying it.
    pub fn with_sink(mut self, sink: Arc<dyn MutationSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    fn node(&self, id: InodeId) -> Result<Arc<InodeNode>> {
        self.nodes.read().get(&id).cloned().ok_or(FsError::NotFound)
    }

    fn dir_node(&self, id: InodeId) -> Result<Arc<InodeNode>> {
        let node = self.node(id)?;
        if !node.record.read().is_dir() {
            return Err(FsError::NotDirectory);
        }
        Ok(node)
    }

    fn commit(&self, mutation: &Mutation) -> Result<()> {
        if let Some(sink) = &self.sink {
            let seq = sink.commit(mutation)?;
            debug!(inode = %mutation.inode, seq = seq, version = mutation.post_version, "journaled mutation");
        }
        Ok(())
    }

    /* Queries */

    pub fn lookup(&self, parent: InodeId, name: &str) -> Result<InodeId> {
        let dir = self.dir_node(parent)?;
        let entries = dir.entries.read();
        match entries.get(name) {
            Some(entry) if !entry.tombstone => Ok(entry.inode),
            _ => Err(FsError::NotFound),
        }
    }

    pub fn stat(&self, id: InodeId) -> Result<InodeRecord> {
        Ok(self.node(id)?.record.read().clone())
    }

    pub fn contains(&self, id: InodeId) -> bool {
        self.nodes.read().contains_key(&id)
    }

    /// Whether `id` is known with real content, stale or not.
    pub fn is_hydrated(&self, id: InodeId) -> bool {
        let node = self.nodes.read().get(&id).cloned();
        node.map(|n| n.record.read().version > 0).unwrap_or(false)
    }

    /// Whether `id` must be (re)loaded from the backend before use.
    pub fn needs_load(&self, id: InodeId) -> bool {
        match self.nodes.read().get(&id) {
            Some(node) => node.is_stale(),
            None => true,
        }
    }

    pub fn readdir(&self, dir: InodeId) -> Result<DirStream> {
        self.readdir_from(dir, None)
    }

    /// List `dir` starting after the name `cookie`.
    pub fn readdir_from(&self, dir: InodeId, cookie: Option<&str>) -> Result<DirStream> {
        let node = self.dir_node(dir)?;
        let entries = node.entries.read().clone();
        Ok(DirStream::new(entries, cookie.map(str::to_string)))
    }

    /// Whether `id` is `ancestor` or lies somewhere below it.
    pub fn is_within(&self, id: InodeId, ancestor: InodeId) -> bool {
        let mut current = id;
        for _ in 0..MAX_DEPTH {
            if current == ancestor {
                return true;
            }
            if current == InodeId::ROOT {
                return false;
            }
            match self.node(current) {
                Ok(node) => current = node.record.read().parent,
                Err(_) => return false,
            }
        }
        false
    }

    /* Namespace mutations */

    /// Link a new inode named `name` under `parent`.
    pub fn create(
        &self,
        parent: InodeId,
        name: &str,
        kind: InodeKind,
        attrs: &NewAttrs,
    ) -> Result<InodeRecord> {
        validate_name(name)?;
        let _gate = self.gate.read();
        let _dirs = self.dirs.lock(&[parent]);
        let dir = self.dir_node(parent)?;
        let mut entries = dir.entries.write();
        let mut dir_rec = dir.record.write();
        if dir_rec.nlink == 0 {
            return Err(FsError::NotFound);
        }
        if live(&entries, name).is_some() {
            return Err(FsError::AlreadyExists);
        }

        let child = InodeRecord::new(self.ids.allocate(), parent, kind, attrs);
        let mutation = Mutation::new(
            VersionBump::next(parent, dir_rec.version),
            attrs.at,
            MutationOp::Create {
                name: name.to_string(),
                child: child.clone(),
            },
        );
        self.commit(&mutation)?;
        self.apply_create(&mut entries, &mut dir_rec, &mutation);
        drop(dir_rec);
        drop(entries);

        self.enqueue_events(&mutation);
        debug!(parent = %parent, inode = %child.id, name = name, kind = ?kind, "created inode");
        Ok(child)
    }

    /// Remove `name` from `parent`. The name becomes a tombstone until the
    /// parent's metadata reaches the backend. Returns the unlinked record.
    pub fn remove(&self, parent: InodeId, name: &str, expect_dir: bool) -> Result<InodeRecord> {
        validate_name(name)?;
        let _gate = self.gate.read();
        let _dirs = self.lock_namespace(&[parent], false, || self.child_dir(parent, name));
        let dir = self.dir_node(parent)?;
        let entry = live(&dir.entries.read(), name).ok_or(FsError::NotFound)?;
        match (expect_dir, entry.kind == InodeKind::Directory) {
            (true, false) => return Err(FsError::NotDirectory),
            (false, true) => return Err(FsError::IsDirectory),
            _ => {}
        }
        let child = self.node(entry.inode)?;
        if expect_dir && has_live_entries(&child.entries.read()) {
            return Err(FsError::NotEmpty);
        }

        let mut entries = dir.entries.write();
        let mut dir_rec = dir.record.write();
        let mut child_rec = child.record.write();
        let at = Utc::now();
        let mutation = Mutation::new(
            VersionBump::next(parent, dir_rec.version),
            at,
            MutationOp::Remove {
                name: name.to_string(),
                child: VersionBump::next(entry.inode, child_rec.version),
            },
        );
        self.commit(&mutation)?;
        apply_remove(&mut entries, &mut dir_rec, Some(&mut *child_rec), &mutation);
        let removed = child_rec.clone();
        drop(child_rec);
        drop(dir_rec);
        drop(entries);

        self.enqueue_events(&mutation);
        debug!(parent = %parent, inode = %removed.id, name = name, "removed name");
        Ok(removed)
    }

    /// Move `src_name` in `src_parent` to `dst_name` in `dst_parent`,
    /// replacing whatever `dst_name` named. Returns the replaced record.
    ///
    /// Both directories change under their locks at once: a concurrent
    /// lookup sees either the old name or the new one, never both or neither.
    pub fn rename(
        &self,
        src_parent: InodeId,
        src_name: &str,
        dst_parent: InodeId,
        dst_name: &str,
    ) -> Result<Option<InodeRecord>> {
        validate_name(src_name)?;
        validate_name(dst_name)?;
        let _gate = self.gate.read();
        let _dirs = self.lock_namespace(&[src_parent, dst_parent], src_parent != dst_parent, || {
            self.child_dir(dst_parent, dst_name)
        });
        let src = self.dir_node(src_parent)?;
        let dst = self.dir_node(dst_parent)?;
        let moved = live(&src.entries.read(), src_name).ok_or(FsError::NotFound)?;
        if src_parent == dst_parent && src_name == dst_name {
            return Ok(None);
        }
        let replaced = live(&dst.entries.read(), dst_name);

        if moved.kind == InodeKind::Directory && self.is_within(dst_parent, moved.inode) {
            return Err(FsError::InvalidArgument(
                "cannot move a directory inside itself".into(),
            ));
        }
        let moved_node = self.node(moved.inode)?;
        let replaced_node = match &replaced {
            Some(entry) => {
                match (moved.kind == InodeKind::Directory, entry.kind == InodeKind::Directory) {
                    (true, false) => return Err(FsError::NotDirectory),
                    (false, true) => return Err(FsError::IsDirectory),
                    _ => {}
                }
                let node = self.node(entry.inode)?;
                if has_live_entries(&node.entries.read()) {
                    return Err(FsError::NotEmpty);
                }
                Some(node)
            }
            None => None,
        };

        let same_dir = src_parent == dst_parent;
        let mut src_entries = src.entries.write();
        let mut dst_entries = if same_dir {
            None
        } else {
            Some(dst.entries.write())
        };
        let mut src_rec = src.record.write();
        let mut dst_rec = if same_dir {
            None
        } else {
            Some(dst.record.write())
        };
        let mut moved_rec = moved_node.record.write();
        let mut replaced_rec = replaced_node.as_ref().map(|n| n.record.write());

        let mutation = Mutation::new(
            VersionBump::next(src_parent, src_rec.version),
            Utc::now(),
            MutationOp::Rename {
                src_name: src_name.to_string(),
                dst_name: dst_name.to_string(),
                dst_parent: dst_rec
                    .as_ref()
                    .map(|r| VersionBump::next(dst_parent, r.version)),
                moved: VersionBump::next(moved.inode, moved_rec.version),
                replaced: replaced_rec
                    .as_ref()
                    .map(|r| VersionBump::next(r.id, r.version)),
            },
        );
        self.commit(&mutation)?;
        let dst_side = match (dst_entries.as_mut(), dst_rec.as_mut()) {
            (Some(e), Some(r)) => Some((&mut **e, &mut **r)),
            _ => None,
        };
        apply_rename(
            &mut src_entries,
            &mut src_rec,
            dst_side,
            Some(&mut *moved_rec),
            replaced_rec.as_deref_mut(),
            &mutation,
        );
        let replaced_out = replaced_rec.as_ref().map(|r| (**r).clone());
        drop(replaced_rec);
        drop(moved_rec);
        drop(dst_rec);
        drop(src_rec);
        drop(dst_entries);
        drop(src_entries);

        self.enqueue_events(&mutation);
        debug!(
            src_parent = %src_parent,
            src_name = src_name,
            dst_parent = %dst_parent,
            dst_name = dst_name,
            inode = %moved.inode,
            "renamed"
        );
        Ok(replaced_out)
    }

    /// Lock `dirs`, plus the directory `extra` names while they are held.
    /// When that directory was not locked yet everything is released and
    /// taken again together, until `extra` stops changing.
    fn lock_namespace<F>(&self, dirs: &[InodeId], moving: bool, extra: F) -> DirGuard<'_>
    where
        F: Fn() -> Option<InodeId>,
    {
        let mut wanted = dirs.to_vec();
        loop {
            let guard = if moving {
                self.dirs.lock_move(&wanted)
            } else {
                self.dirs.lock(&wanted)
            };
            match extra() {
                Some(dir) if !wanted.contains(&dir) => {
                    drop(guard);
                    wanted = dirs.to_vec();
                    wanted.push(dir);
                }
                _ => return guard,
            }
        }
    }

    /// The directory `name` in `parent` names, if it is one.
    fn child_dir(&self, parent: InodeId, name: &str) -> Option<InodeId> {
        let dir = self.nodes.read().get(&parent).cloned()?;
        let entry = live(&dir.entries.read(), name)?;
        (entry.kind == InodeKind::Directory).then_some(entry.inode)
    }

    /// Lock the directory currently holding `node`.
    fn lock_parent_of(&self, node: &InodeNode) -> (InodeId, DirGuard<'_>) {
        loop {
            let parent = node.record.read().parent;
            let guard = self.dirs.lock(&[parent]);
            if node.record.read().parent == parent {
                return (parent, guard);
            }
        }
    }

    /* Inode mutations */

    /// Change attributes other than size; size goes through
    /// [`commit_truncate`](Self::commit_truncate).
    pub fn update_metadata(&self, id: InodeId, attr: &SetAttr) -> Result<InodeRecord> {
        let attr = attr.without_size();
        if attr.is_empty() {
            return self.stat(id);
        }
        let _gate = self.gate.read();
        let node = self.node(id)?;
        let mut rec = node.record.write();
        let mutation = Mutation::new(
            VersionBump::next(id, rec.version),
            Utc::now(),
            MutationOp::SetAttr { attr },
        );
        self.commit(&mutation)?;
        apply_data(&mut rec, &mutation);
        let out = rec.clone();
        drop(rec);
        self.enqueue_events(&mutation);
        Ok(out)
    }

    /// Commit a write of `data` at `offset`. `apply` runs with the prior
    /// size after the journal accepted the record and before the record
    /// changes, with the inode's record locked.
    pub fn commit_write<F>(&self, id: InodeId, offset: u64, data: &[u8], apply: F) -> Result<InodeRecord>
    where
        F: FnOnce(u64),
    {
        let _gate = self.gate.read();
        let node = self.node(id)?;
        let mut rec = node.record.write();
        check_regular(&rec)?;
        let new_size = rec.size.max(offset + data.len() as u64);
        let mutation = Mutation::new(
            VersionBump::next(id, rec.version),
            Utc::now(),
            MutationOp::Write {
                offset,
                data: data.to_vec(),
                new_size,
            },
        );
        self.commit(&mutation)?;
        apply(rec.size);
        apply_data(&mut rec, &mutation);
        let out = rec.clone();
        drop(rec);
        self.enqueue_events(&mutation);
        Ok(out)
    }

    /// Commit a size change. `apply` gets the prior size, as with
    /// [`commit_write`](Self::commit_write).
    pub fn commit_truncate<F>(&self, id: InodeId, new_size: u64, apply: F) -> Result<InodeRecord>
    where
        F: FnOnce(u64),
    {
        let _gate = self.gate.read();
        let node = self.node(id)?;
        let mut rec = node.record.write();
        check_regular(&rec)?;
        let mutation = Mutation::new(
            VersionBump::next(id, rec.version),
            Utc::now(),
            MutationOp::Truncate {
                old_size: rec.size,
                new_size,
            },
        );
        self.commit(&mutation)?;
        apply(rec.size);
        apply_data(&mut rec, &mutation);
        let out = rec.clone();
        drop(rec);
        self.enqueue_events(&mutation);
        Ok(out)
    }

    /* Replay */

    /// Re-apply a journaled mutation. Parts already reflected in the index
    /// (by version) are skipped.
    pub fn apply(&self, mutation: &Mutation) -> Result<ReplayOutcome> {
        let _gate = self.gate.read();
        let mut dirs = vec![mutation.inode];
        if let MutationOp::Rename {
            dst_parent: Some(bump),
            ..
        } = &mutation.op
        {
            dirs.push(bump.inode);
        }
        let _dirs = self.dirs.lock(&dirs);
        let node = self.node(mutation.inode)?;
        let prior_size = node.record.read().size;

        let applied = match &mutation.op {
            MutationOp::Write { .. } | MutationOp::Truncate { .. } | MutationOp::SetAttr { .. } => {
                apply_data(&mut node.record.write(), mutation)
            }
            MutationOp::Create { .. } => {
                let mut entries = node.entries.write();
                let mut rec = node.record.write();
                self.apply_create(&mut entries, &mut rec, mutation)
            }
            MutationOp::Remove { child, .. } => {
                let child = self.nodes.read().get(&child.inode).cloned();
                let mut entries = node.entries.write();
                let mut rec = node.record.write();
                let mut child_rec = child.as_ref().map(|c| c.record.write());
                apply_remove(&mut entries, &mut rec, child_rec.as_deref_mut(), mutation)
            }
            MutationOp::Rename {
                dst_parent,
                moved,
                replaced,
                ..
            } => {
                let find = |id: InodeId| self.nodes.read().get(&id).cloned();
                let dst = dst_parent.and_then(|b| find(b.inode));
                let moved = find(moved.inode);
                let replaced = replaced.and_then(|b| find(b.inode));

                let mut src_entries = node.entries.write();
                let mut dst_entries = dst.as_ref().map(|d| d.entries.write());
                let mut src_rec = node.record.write();
                let mut dst_rec = dst.as_ref().map(|d| d.record.write());
                let mut moved_rec = moved.as_ref().map(|m| m.record.write());
                let mut replaced_rec = replaced.as_ref().map(|r| r.record.write());
                let dst_side = match (dst_entries.as_mut(), dst_rec.as_mut()) {
                    (Some(e), Some(r)) => Some((&mut **e, &mut **r)),
                    _ => None,
                };
                apply_rename(
                    &mut src_entries,
                    &mut src_rec,
                    dst_side,
                    moved_rec.as_deref_mut(),
                    replaced_rec.as_deref_mut(),
                    mutation,
                )
            }
        };

        if !applied {
            return Ok(ReplayOutcome::Skipped);
        }
        self.enqueue_events(mutation);
        Ok(ReplayOutcome::Applied { prior_size })
    }

    fn apply_create(&self, entries: &mut Entries, dir: &mut InodeRecord, mutation: &Mutation) -> bool {
        let MutationOp::Create { name, child } = &mutation.op else {
            return false;
        };
        if dir.version >= mutation.post_version {
            return false;
        }
        Arc::make_mut(entries).insert(name.clone(), DirEntry::live(child.id, child.kind));
        if child.is_dir() {
            dir.nlink += 1;
        }
        touch(dir, mutation.at, mutation.post_version);
        self.ids.observe(child.id);
        self.nodes
            .write()
            .entry(child.id)
            .or_insert_with(|| Arc::new(InodeNode::new(child.clone(), BTreeMap::new(), 0)));
        true
    }

    fn enqueue_events(&self, mutation: &Mutation) {
        let outbox = &self.outbox;
        let (inode, version) = (mutation.inode, mutation.post_version);
        match &mutation.op {
            MutationOp::Write { .. } | MutationOp::Truncate { .. } => {
                outbox.enqueue(inode, inode, EventKind::DataChanged, version)
            }
            MutationOp::SetAttr { .. } | MutationOp::Create { .. } => {
                outbox.enqueue(inode, inode, EventKind::MetadataChanged, version)
            }
            MutationOp::Remove { child, .. } => {
                outbox.enqueue(inode, inode, EventKind::MetadataChanged, version);
                outbox.enqueue(inode, child.inode, EventKind::Deleted, child.post);
            }
            MutationOp::Rename {
                dst_parent,
                moved,
                replaced,
                ..
            } => {
                outbox.enqueue(inode, inode, EventKind::MetadataChanged, version);
                let dst = match dst_parent {
                    Some(bump) => {
                        outbox.enqueue(bump.inode, bump.inode, EventKind::MetadataChanged, bump.post);
                        bump.inode
                    }
                    None => inode,
                };
                outbox.enqueue(moved.inode, moved.inode, EventKind::MetadataChanged, moved.post);
                if let Some(bump) = replaced {
                    outbox.enqueue(dst, bump.inode, EventKind::Deleted, bump.post);
                }
            }
        }
    }

    /* Remote state */

    /// Install metadata loaded from the backend. Applied only when the
    /// remote version is newer and the local node has nothing unflushed;
    /// either way the node stops being stale. Returns whether it applied.
    pub fn refresh(&self, remote: RemoteInode) -> bool {
        let id = remote.record.id;
        let _dirs = self.dirs.lock(&[id]);
        let version = remote.record.version;
        let remote_entries = remote.entries.map(into_entries);

        let existing = self.nodes.read().get(&id).cloned();
        let node = match existing {
            Some(node) => node,
            None => {
                let entries = remote_entries.unwrap_or_default();
                self.adopt_children(id, &entries);
                self.ids.observe(id);
                self.nodes
                    .write()
                    .insert(id, Arc::new(InodeNode::new(remote.record, entries, version)));
                return true;
            }
        };

        let mut entries = node.entries.write();
        let mut rec = node.record.write();
        node.set_stale(false);
        if rec.version > node.flushed() {
            debug!(inode = %id, local = rec.version, remote = version, "skipping refresh of inode with unflushed changes");
            return false;
        }
        if version <= rec.version {
            return false;
        }
        *rec = remote.record;
        if let Some(remote_entries) = remote_entries {
            *entries = Arc::new(remote_entries);
        }
        node.reset_flushed(version);
        let children = entries.clone();
        drop(rec);
        drop(entries);
        self.adopt_children(id, &children);
        debug!(inode = %id, version = version, "refreshed inode from backend");
        true
    }

    /// Insert placeholders for children not known locally.
    fn adopt_children(&self, dir: InodeId, entries: &BTreeMap<String, DirEntry>) {
        let mut nodes = self.nodes.write();
        for entry in entries.values() {
            nodes
                .entry(entry.inode)
                .or_insert_with(|| Arc::new(InodeNode::placeholder(entry.inode, dir, entry.kind)));
        }
    }

    /// Mark `id` stale if `version` is newer than the local one.
    pub fn mark_stale(&self, id: InodeId, version: Version) -> bool {
        let Some(node) = self.nodes.read().get(&id).cloned() else {
            return false;
        };
        let newer = version > node.record.read().version;
        if newer {
            node.set_stale(true);
        }
        newer
    }

    /// React to a peer deleting `id`: drop its name from the parent and
    /// unlink the record. Returns the unlinked record if anything changed.
    pub fn remove_deleted(&self, id: InodeId, version: Version) -> Option<InodeRecord> {
        let node = self.nodes.read().get(&id).cloned()?;
        let (parent, _dirs) = self.lock_parent_of(&node);
        let local = node.record.read().version;
        if version <= local {
            return None;
        }
        let dir = self.nodes.read().get(&parent).cloned();
        if let Some(dir) = dir.filter(|d| !d.is_stale()) {
            let mut entries = dir.entries.write();
            let mut dir_rec = dir.record.write();
            let names: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.inode == id)
                .map(|(name, _)| name.clone())
                .collect();
            for name in names {
                if let Some(entry) = Arc::make_mut(&mut entries).remove(&name) {
                    if entry.kind == InodeKind::Directory && !entry.tombstone {
                        dir_rec.nlink = dir_rec.nlink.saturating_sub(1);
                    }
                }
            }
        }
        let mut rec = node.record.write();
        rec.nlink = 0;
        rec.version = version;
        node.reset_flushed(version);
        Some(rec.clone())
    }

    /// Forget an inode whose metadata does not exist in the backend.
    pub fn forget_missing(&self, id: InodeId) {
        let Some(node) = self.nodes.read().get(&id).cloned() else {
            return;
        };
        let (parent, _dirs) = self.lock_parent_of(&node);
        self.nodes.write().remove(&id);
        let dir = self.nodes.read().get(&parent).cloned();
        if let Some(dir) = dir {
            let mut entries = dir.entries.write();
            let names: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.inode == id)
                .map(|(name, _)| name.clone())
                .collect();
            for name in names {
                Arc::make_mut(&mut entries).remove(&name);
            }
        }
        debug!(inode = %id, "forgot inode missing from backend");
    }

    /// Give an unhydrated root its initial record, for a backend that has
    /// never seen this filesystem.
    pub fn materialize_root(&self) {
        let _dirs = self.dirs.lock(&[InodeId::ROOT]);
        let Some(root) = self.nodes.read().get(&InodeId::ROOT).cloned() else {
            return;
        };
        let mut rec = root.record.write();
        if rec.version == 0 {
            *rec = InodeRecord::new(
                InodeId::ROOT,
                InodeId::ROOT,
                InodeKind::Directory,
                &NewAttrs::new(0o755, 0, 0),
            );
            info!("initialized empty filesystem root");
        }
        root.set_stale(false);
    }

    /// Drop an unlinked inode for good.
    pub fn purge(&self, id: InodeId) {
        if id == InodeId::ROOT {
            return;
        }
        self.nodes.write().remove(&id);
        self.outbox.discard(id);
    }

    /* Flush support */

    /// Unlinked inodes still held in the index.
    pub fn orphans(&self) -> Vec<InodeId> {
        let nodes: Vec<_> = self.nodes.read().values().cloned().collect();
        let mut ids: Vec<InodeId> = nodes
            .iter()
            .filter_map(|n| {
                let rec = n.record.read();
                (rec.nlink == 0 && rec.version > 0).then_some(rec.id)
            })
            .collect();
        ids.sort();
        ids
    }

    /// Linked inodes with metadata newer than the backend's copy.
    pub fn dirty_nodes(&self) -> Vec<(InodeId, InodeKind)> {
        let nodes: Vec<_> = self.nodes.read().values().cloned().collect();
        let mut dirty: Vec<(InodeId, InodeKind)> = nodes
            .iter()
            .filter_map(|n| {
                let rec = n.record.read();
                (rec.nlink > 0 && rec.version > n.flushed()).then_some((rec.id, rec.kind))
            })
            .collect();
        dirty.sort_by_key(|(id, _)| *id);
        dirty
    }

    pub fn is_dirty(&self, id: InodeId) -> bool {
        let node = self.nodes.read().get(&id).cloned();
        node.map(|n| n.record.read().version > n.flushed())
            .unwrap_or(false)
    }

    /// Newest version of `id` known to be in the backend.
    pub fn flushed(&self, id: InodeId) -> Version {
        let node = self.nodes.read().get(&id).cloned();
        node.map(|n| n.flushed()).unwrap_or(0)
    }

    /// Children of `dir` whose metadata has never been written.
    pub fn unflushed_children(&self, dir: InodeId) -> Vec<InodeId> {
        let Ok(node) = self.node(dir) else {
            return Vec::new();
        };
        let entries = node.entries.read().clone();
        entries
            .values()
            .filter(|e| !e.tombstone)
            .filter(|e| {
                let node = self.nodes.read().get(&e.inode).cloned();
                node.map(|n| n.flushed() == 0 && n.record.read().version > 0)
                    .unwrap_or(false)
            })
            .map(|e| e.inode)
            .collect()
    }

    /// Backend form of `id`, its version, and the tombstones it drops.
    pub fn capture_meta(&self, id: InodeId) -> Result<(RemoteInode, Version, Vec<String>)> {
        let node = self.node(id)?;
        let entries = node.entries.read();
        let record = node.record.read().clone();
        let version = record.version;
        let (remote_entries, tombstones) = if record.is_dir() {
            let mut live = BTreeMap::new();
            let mut dead = Vec::new();
            for (name, entry) in entries.iter() {
                if entry.tombstone {
                    dead.push(name.clone());
                } else {
                    live.insert(
                        name.clone(),
                        RemoteEntry {
                            inode: entry.inode,
                            kind: entry.kind,
                        },
                    );
                }
            }
            (Some(live), dead)
        } else {
            (None, Vec::new())
        };
        Ok((
            RemoteInode {
                record,
                entries: remote_entries,
            },
            version,
            tombstones,
        ))
    }

    /// Record that `version` of `id` is durable, purging the tombstones it
    /// no longer lists.
    pub fn mark_flushed(&self, id: InodeId, version: Version, tombstones: &[String]) {
        let Ok(node) = self.node(id) else {
            return;
        };
        node.set_flushed(version);
        if tombstones.is_empty() {
            return;
        }
        let mut entries = node.entries.write();
        for name in tombstones {
            if entries.get(name).map(|e| e.tombstone).unwrap_or(false) {
                Arc::make_mut(&mut entries).remove(name);
            }
        }
    }

    /* Snapshot */

    /// Capture the whole index while mutations are held off.
    ///
    /// `journal_seq` runs under the same exclusion and returns the first
    /// journal sequence number the snapshot does not cover, or `None` to
    /// skip the snapshot.
    pub fn snapshot<F>(&self, journal_seq: F) -> Option<IndexSnapshot>
    where
        F: FnOnce() -> Option<u64>,
    {
        let _gate = self.gate.write();
        let seq = journal_seq()?;
        let mut nodes: Vec<(InodeId, Arc<InodeNode>)> = self
            .nodes
            .read()
            .iter()
            .map(|(id, n)| (*id, n.clone()))
            .collect();
        nodes.sort_by_key(|(id, _)| *id);

        let mut records = Vec::with_capacity(nodes.len());
        let mut dirs = Vec::new();
        for (id, node) in &nodes {
            let entries = node.entries.read().clone();
            let record = node.record.read().clone();
            if record.is_dir() {
                dirs.push(SnapshotDir {
                    dir: *id,
                    version: record.version,
                    entries: entries
                        .iter()
                        .map(|(name, e)| (name.clone(), e.clone()))
                        .collect(),
                });
            }
            records.push(SnapshotRecord {
                record,
                flushed: node.flushed(),
            });
        }
        Some(IndexSnapshot {
            journal_seq: seq,
            records,
            dirs,
        })
    }

    /* Getters */

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn live(entries: &Entries, name: &str) -> Option<DirEntry> {
    entries.get(name).filter(|e| !e.tombstone).cloned()
}

fn has_live_entries(entries: &Entries) -> bool {
    entries.values().any(|e| !e.tombstone)
}

fn into_entries(remote: BTreeMap<String, RemoteEntry>) -> BTreeMap<String, DirEntry> {
    remote
        .into_iter()
        .map(|(name, e)| (name, DirEntry::live(e.inode, e.kind)))
        .collect()
}

fn check_regular(rec: &InodeRecord) -> Result<()> {
    match rec.kind {
        InodeKind::File => Ok(()),
        InodeKind::Directory => Err(FsError::IsDirectory),
        InodeKind::Symlink => Err(FsError::InvalidArgument("not a regular file".into())),
    }
}

fn touch(rec: &mut InodeRecord, at: DateTime<Utc>, version: Version) {
    rec.mtime = at;
    rec.ctime = at;
    rec.version = version;
}

fn advance(rec: &mut InodeRecord, at: DateTime<Utc>, version: Version) {
    rec.ctime = at;
    rec.version = rec.version.max(version);
}

/// Apply a write, truncate or attribute change. Returns whether it applied.
fn apply_data(rec: &mut InodeRecord, mutation: &Mutation) -> bool {
    if rec.version >= mutation.post_version {
        return false;
    }
    match &mutation.op {
        MutationOp::Write { new_size, .. } => {
            rec.size = *new_size;
            rec.mtime = mutation.at;
        }
        MutationOp::Truncate { new_size, .. } => {
            rec.size = *new_size;
            rec.mtime = mutation.at;
        }
        MutationOp::SetAttr { attr } => {
            if let Some(mode) = attr.mode {
                rec.mode = mode & 0o7777;
            }
            if let Some(uid) = attr.uid {
                rec.uid = uid;
            }
            if let Some(gid) = attr.gid {
                rec.gid = gid;
            }
            if let Some(atime) = attr.atime {
                rec.atime = atime;
            }
            if let Some(mtime) = attr.mtime {
                rec.mtime = mtime;
            }
        }
        _ => return false,
    }
    rec.ctime = mutation.at;
    rec.version = mutation.post_version;
    true
}

fn apply_remove(
    entries: &mut Entries,
    dir: &mut InodeRecord,
    child: Option<&mut InodeRecord>,
    mutation: &Mutation,
) -> bool {
    let MutationOp::Remove { name, child: bump } = &mutation.op else {
        return false;
    };
    let mut applied = false;
    let child_is_dir = child
        .as_ref()
        .map(|c| c.is_dir())
        .or_else(|| entries.get(name).map(|e| e.kind == InodeKind::Directory))
        .unwrap_or(false);

    if dir.version < mutation.post_version {
        if let Some(entry) = Arc::make_mut(entries).get_mut(name) {
            if entry.inode == bump.inode {
                entry.tombstone = true;
            }
        }
        if child_is_dir {
            dir.nlink = dir.nlink.saturating_sub(1);
        }
        touch(dir, mutation.at, mutation.post_version);
        applied = true;
    }
    if let Some(child) = child {
        if child.version < bump.post {
            child.nlink = if child.is_dir() {
                0
            } else {
                child.nlink.saturating_sub(1)
            };
            advance(child, mutation.at, bump.post);
            applied = true;
        }
    }
    applied
}

fn apply_rename(
    src_entries: &mut Entries,
    src: &mut InodeRecord,
    dst: Option<(&mut Entries, &mut InodeRecord)>,
    moved: Option<&mut InodeRecord>,
    replaced: Option<&mut InodeRecord>,
    mutation: &Mutation,
) -> bool {
    let MutationOp::Rename {
        src_name,
        dst_name,
        dst_parent,
        moved: moved_bump,
        replaced: replaced_bump,
    } = &mutation.op
    else {
        return false;
    };
    let at = mutation.at;
    let dst_id = dst_parent.map(|b| b.inode).unwrap_or(mutation.inode);
    let kind = moved.as_ref().map(|m| m.kind).or_else(|| {
        src_entries
            .get(src_name)
            .filter(|e| e.inode == moved_bump.inode)
            .map(|e| e.kind)
    });
    let moved_is_dir = kind == Some(InodeKind::Directory);
    let mut applied = false;

    let src_pending = src.version < mutation.post_version;
    if src_pending {
        let map = Arc::make_mut(src_entries);
        if map.get(src_name).map(|e| e.inode) == Some(moved_bump.inode) {
            map.remove(src_name);
        }
        match (dst_parent, kind) {
            (None, Some(kind)) => {
                if let Some(old) = map.insert(dst_name.clone(), DirEntry::live(moved_bump.inode, kind)) {
                    if old.kind == InodeKind::Directory && !old.tombstone && old.inode != moved_bump.inode {
                        src.nlink = src.nlink.saturating_sub(1);
                    }
                }
            }
            (Some(_), _) if moved_is_dir => src.nlink = src.nlink.saturating_sub(1),
            _ => {}
        }
        touch(src, at, mutation.post_version);
        applied = true;
    }

    if let (Some((dst_entries, dst_rec)), Some(bump), Some(kind)) = (dst, dst_parent, kind) {
        if dst_rec.version < bump.post {
            let map = Arc::make_mut(dst_entries);
            let old = map.insert(dst_name.clone(), DirEntry::live(moved_bump.inode, kind));
            if moved_is_dir {
                dst_rec.nlink += 1;
            }
            if let Some(old) = old {
                if old.kind == InodeKind::Directory && !old.tombstone {
                    dst_rec.nlink = dst_rec.nlink.saturating_sub(1);
                }
            }
            touch(dst_rec, at, bump.post);
            applied = true;
        }
    }

    if let Some(moved) = moved {
        if moved.version < moved_bump.post {
            moved.parent = dst_id;
            advance(moved, at, moved_bump.post);
            applied = true;
        }
    }

    if let (Some(replaced), Some(bump)) = (replaced, replaced_bump) {
        if replaced.version < bump.post {
            replaced.nlink = if replaced.is_dir() {
                0
            } else {
                replaced.nlink.saturating_sub(1)
            };
            advance(replaced, at, bump.post);
            applied = true;
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::types::MountId;

    fn index() -> MetadataIndex {
        MetadataIndex::new(Arc::new(Outbox::new(MountId::new())))
    }

    fn file(index: &MetadataIndex, parent: InodeId, name: &str) -> InodeId {
        index
            .create(parent, name, InodeKind::File, &NewAttrs::default())
            .unwrap()
            .id
    }

    fn dir(index: &MetadataIndex, parent: InodeId, name: &str) -> InodeId {
        index
            .create(parent, name, InodeKind::Directory, &NewAttrs::new(0o755, 0, 0))
            .unwrap()
            .id
    }

    fn names(index: &MetadataIndex, dir: InodeId) -> Vec<String> {
        index.readdir(dir).unwrap().map(|e| e.name).collect()
    }

    #[test]
    fn test_create_and_lookup() {
        let index = index();
        let id = file(&index, InodeId::ROOT, "a.txt");
        assert_eq!(index.lookup(InodeId::ROOT, "a.txt").unwrap(), id);
        assert_eq!(index.stat(id).unwrap().parent, InodeId::ROOT);
        assert_eq!(index.stat(InodeId::ROOT).unwrap().version, 2);
        assert!(matches!(
            index.lookup(InodeId::ROOT, "missing"),
            Err(FsError::NotFound)
        ));
    }

    #[test]
    fn test_create_existing_name_fails() {
        let index = index();
        file(&index, InodeId::ROOT, "a");
        let err = index
            .create(InodeId::ROOT, "a", InodeKind::Directory, &NewAttrs::default())
            .unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists));
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let index = index();
        for name in ["", ".", "..", "a/b"] {
            assert!(matches!(
                index.create(InodeId::ROOT, name, InodeKind::File, &NewAttrs::default()),
                Err(FsError::InvalidArgument(_))
            ));
        }
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(index
            .create(InodeId::ROOT, &long, InodeKind::File, &NewAttrs::default())
            .is_err());
    }

    #[test]
    fn test_remove_leaves_tombstone_until_flushed() {
        let index = index();
        let id = file(&index, InodeId::ROOT, "gone");
        let removed = index.remove(InodeId::ROOT, "gone", false).unwrap();
        assert_eq!(removed.id, id);
        assert_eq!(removed.nlink, 0);
        assert!(names(&index, InodeId::ROOT).is_empty());

        let (meta, version, tombstones) = index.capture_meta(InodeId::ROOT).unwrap();
        assert_eq!(tombstones, vec!["gone".to_string()]);
        assert!(meta.entries.unwrap().is_empty());
        index.mark_flushed(InodeId::ROOT, version, &tombstones);
        let (_, _, tombstones) = index.capture_meta(InodeId::ROOT).unwrap();
        assert!(tombstones.is_empty());
    }

    #[test]
    fn test_remove_non_empty_directory_fails() {
        let index = index();
        let d = dir(&index, InodeId::ROOT, "d");
        file(&index, d, "inner");
        assert!(matches!(
            index.remove(InodeId::ROOT, "d", true),
            Err(FsError::NotEmpty)
        ));
        assert!(matches!(
            index.remove(InodeId::ROOT, "d", false),
            Err(FsError::IsDirectory)
        ));
        index.remove(d, "inner", false).unwrap();
        index.remove(InodeId::ROOT, "d", true).unwrap();
        assert_eq!(index.stat(InodeId::ROOT).unwrap().nlink, 2);
    }

    #[test]
    fn test_rename_across_directories() {
        let index = index();
        let a = dir(&index, InodeId::ROOT, "a");
        let b = dir(&index, InodeId::ROOT, "b");
        let f = file(&index, a, "f");
        let victim = file(&index, b, "g");

        let replaced = index.rename(a, "f", b, "g").unwrap().unwrap();
        assert_eq!(replaced.id, victim);
        assert_eq!(replaced.nlink, 0);
        assert_eq!(index.lookup(b, "g").unwrap(), f);
        assert!(index.lookup(a, "f").is_err());
        assert_eq!(index.stat(f).unwrap().parent, b);
    }

    #[test]
    fn test_rename_directory_into_itself_fails() {
        let index = index();
        let a = dir(&index, InodeId::ROOT, "a");
        let inner = dir(&index, a, "inner");
        assert!(matches!(
            index.rename(InodeId::ROOT, "a", inner, "a"),
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_rename_directory_fixes_link_counts() {
        let index = index();
        let a = dir(&index, InodeId::ROOT, "a");
        dir(&index, InodeId::ROOT, "b");
        let sub = dir(&index, a, "sub");
        assert_eq!(index.stat(a).unwrap().nlink, 3);
        index.rename(a, "sub", InodeId::ROOT, "b").unwrap();
        assert_eq!(index.stat(a).unwrap().nlink, 2);
        // root: self, a, and sub replacing b
        assert_eq!(index.stat(InodeId::ROOT).unwrap().nlink, 4);
        assert_eq!(index.lookup(InodeId::ROOT, "b").unwrap(), sub);
    }

    #[test]
    fn test_readdir_snapshot_is_unaffected_by_later_mutation() {
        let index = index();
        file(&index, InodeId::ROOT, "a");
        file(&index, InodeId::ROOT, "b");
        let mut stream = index.readdir(InodeId::ROOT).unwrap();
        assert_eq!(stream.next().unwrap().name, "a");
        file(&index, InodeId::ROOT, "c");
        index.remove(InodeId::ROOT, "b", false).unwrap();
        let rest: Vec<String> = stream.map(|e| e.name).collect();
        assert_eq!(rest, vec!["b"]);
    }

    #[test]
    fn test_commit_write_grows_size_and_bumps_version() {
        let index = index();
        let f = file(&index, InodeId::ROOT, "f");
        let mut seen = None;
        let rec = index
            .commit_write(f, 10, b"hello", |old| seen = Some(old))
            .unwrap();
        assert_eq!(seen, Some(0));
        assert_eq!(rec.size, 15);
        assert_eq!(rec.version, 2);
        let rec = index.commit_truncate(f, 4, |_| {}).unwrap();
        assert_eq!(rec.size, 4);
        assert!(matches!(
            index.commit_write(InodeId::ROOT, 0, b"x", |_| {}),
            Err(FsError::IsDirectory)
        ));
    }

    #[test]
    fn test_update_metadata_keeps_size() {
        let index = index();
        let f = file(&index, InodeId::ROOT, "f");
        let rec = index
            .update_metadata(
                f,
                &SetAttr {
                    mode: Some(0o100600),
                    size: Some(99),
                    ..SetAttr::default()
                },
            )
            .unwrap();
        assert_eq!(rec.mode, 0o600);
        assert_eq!(rec.size, 0);
    }

    #[test]
    fn test_mutations_queue_events() {
        let index = index();
        let f = file(&index, InodeId::ROOT, "f");
        index.commit_write(f, 0, b"x", |_| {}).unwrap();
        index.remove(InodeId::ROOT, "f", false).unwrap();

        let events = index.outbox().take_committed(InodeId::ROOT);
        let deleted = events.iter().find(|e| e.inode == f).unwrap();
        assert_eq!(deleted.kind, EventKind::Deleted);
        assert_eq!(deleted.version, 3);
    }

    #[test]
    fn test_refresh_only_applies_newer_clean_state() {
        let index = index();
        let f = file(&index, InodeId::ROOT, "f");
        let (mut meta, version, _) = index.capture_meta(f).unwrap();
        index.mark_flushed(f, version, &[]);

        meta.record.size = 42;
        meta.record.version = version;
        assert!(!index.refresh(meta.clone()));
        meta.record.version = version + 5;
        assert!(index.refresh(meta.clone()));
        assert_eq!(index.stat(f).unwrap().size, 42);

        index.commit_write(f, 0, b"local", |_| {}).unwrap();
        meta.record.version = 100;
        assert!(!index.refresh(meta));
        assert_eq!(index.stat(f).unwrap().size, 42);
    }

    #[test]
    fn test_refresh_adopts_unknown_children_as_placeholders() {
        let index = MetadataIndex::unhydrated(Arc::new(Outbox::new(MountId::new())));
        assert!(index.needs_load(InodeId::ROOT));
        let mut root = InodeRecord::new(
            InodeId::ROOT,
            InodeId::ROOT,
            InodeKind::Directory,
            &NewAttrs::new(0o755, 0, 0),
        );
        root.version = 7;
        let mut entries = BTreeMap::new();
        entries.insert(
            "remote".to_string(),
            RemoteEntry {
                inode: InodeId(77),
                kind: InodeKind::File,
            },
        );
        assert!(index.refresh(RemoteInode {
            record: root,
            entries: Some(entries),
        }));
        assert!(!index.needs_load(InodeId::ROOT));
        assert_eq!(index.lookup(InodeId::ROOT, "remote").unwrap(), InodeId(77));
        assert!(index.needs_load(InodeId(77)));
    }

    #[test]
    fn test_remove_deleted_drops_entry() {
        let index = index();
        let f = file(&index, InodeId::ROOT, "f");
        assert!(index.remove_deleted(f, 1).is_none());
        let rec = index.remove_deleted(f, 2).unwrap();
        assert_eq!(rec.nlink, 0);
        assert!(index.lookup(InodeId::ROOT, "f").is_err());
        assert_eq!(index.orphans(), vec![f]);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let index = index();
        let f = file(&index, InodeId::ROOT, "f");
        let bump = VersionBump::next(f, 1);
        let write = Mutation::new(
            bump,
            Utc::now(),
            MutationOp::Write {
                offset: 0,
                data: b"abc".to_vec(),
                new_size: 3,
            },
        );
        assert_eq!(
            index.apply(&write).unwrap(),
            ReplayOutcome::Applied { prior_size: 0 }
        );
        assert_eq!(index.apply(&write).unwrap(), ReplayOutcome::Skipped);
        assert_eq!(index.stat(f).unwrap().size, 3);
    }

    #[test]
    fn test_snapshot_round_trip_restores_namespace() {
        let index = index();
        let d = dir(&index, InodeId::ROOT, "d");
        let f = file(&index, d, "f");
        index.commit_write(f, 0, b"data", |_| {}).unwrap();

        let snapshot = index.snapshot(|| Some(9)).unwrap();
        assert_eq!(snapshot.journal_seq, 9);
        let restored = MetadataIndex::from_snapshot(snapshot.clone(), Arc::new(Outbox::new(MountId::new())));
        assert_eq!(restored.lookup(d, "f").unwrap(), f);
        assert_eq!(restored.stat(f).unwrap().size, 4);
        assert!(restored.needs_load(f));
        assert_eq!(restored.snapshot(|| Some(9)), Some(snapshot));
        assert!(restored.snapshot(|| None).is_none());
    }
}
