//! Events waiting for their mutation to reach the backend.
//!
//! Index mutations enqueue events here instead of publishing them directly.
//! Each pending event names the inode whose flush commits it; once that
//! flush succeeds the event is taken and published. Events for the same
//! inode coalesce: the highest version wins and a `Deleted` dominates a
//! `DataChanged`, which dominates a `MetadataChanged`.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::{EventKind, InvalidationEvent};
use crate::types::{InodeId, MountId, Version};

#[derive(Debug, Clone, Copy)]
struct Pending {
    commit_on: InodeId,
    kind: EventKind,
    version: Version,
}

#[derive(Debug)]
pub struct Outbox {
    origin: MountId,
    pending: Mutex<HashMap<InodeId, Pending>>,
}

impl Outbox {
    pub fn new(origin: MountId) -> Self {
        Self {
            origin,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Queue an event about `inode`, published after `commit_on` is flushed.
    pub fn enqueue(&self, commit_on: InodeId, inode: InodeId, kind: EventKind, version: Version) {
        let mut pending = self.pending.lock();
        let entry = pending.entry(inode).or_insert(Pending {
            commit_on,
            kind,
            version,
        });
        if kind >= entry.kind {
            entry.kind = kind;
            entry.commit_on = commit_on;
        }
        entry.version = entry.version.max(version);
    }

    /// Remove and return every event committed by a flush of `inode`.
    pub fn take_committed(&self, inode: InodeId) -> Vec<InvalidationEvent> {
        let mut pending = self.pending.lock();
        let ready: Vec<InodeId> = pending
            .iter()
            .filter(|(_, p)| p.commit_on == inode)
            .map(|(id, _)| *id)
            .collect();
        ready
            .into_iter()
            .filter_map(|id| pending.remove(&id).map(|p| self.event(id, p)))
            .collect()
    }

    /// Inodes whose flush would release at least one pending event.
    pub fn commit_targets(&self) -> Vec<InodeId> {
        let mut targets: Vec<InodeId> = self.pending.lock().values().map(|p| p.commit_on).collect();
        targets.sort();
        targets.dedup();
        targets
    }

    /// Drop anything queued about `inode`.
    pub fn discard(&self, inode: InodeId) {
        self.pending.lock().remove(&inode);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn event(&self, inode: InodeId, pending: Pending) -> InvalidationEvent {
        InvalidationEvent::new(inode, pending.kind, pending.version, self.origin)
    }
}
