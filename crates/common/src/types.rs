//! Core data model shared by every component.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::keys;

/// Monotonic per-inode counter, bumped on every committed mutation.
pub type Version = u64;

/// Stable identifier of a filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(pub u64);

impl InodeId {
    pub const ROOT: InodeId = InodeId(1);

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl From<u64> for InodeId {
    fn from(value: u64) -> Self {
        InodeId(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InodeKind {
    File,
    Directory,
    Symlink,
}

/// Identity of one mount instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MountId(pub Uuid);

impl MountId {
    pub fn new() -> Self {
        MountId(Uuid::new_v4())
    }
}

impl Default for MountId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attributes of one filesystem object.
///
/// `key` is the backend key prefix owned by this inode. It is derived from
/// the id when the inode is created and never changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InodeRecord {
    pub id: InodeId,
    pub kind: InodeKind,
    /// Directory currently holding this inode's name
    pub parent: InodeId,
    pub size: u64,
    /// Permission bits
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub atime: DateTime<Utc>,
    pub mtime: DateTime<Utc>,
    pub ctime: DateTime<Utc>,
    pub version: Version,
    pub key: String,
    /// Link target, for symlinks only
    pub target: Option<String>,
}

impl InodeRecord {
    pub fn new(id: InodeId, parent: InodeId, kind: InodeKind, attrs: &NewAttrs) -> Self {
        let (size, target) = match &attrs.target {
            Some(target) if kind == InodeKind::Symlink => {
                (target.len() as u64, Some(target.clone()))
            }
            _ => (0, None),
        };
        Self {
            id,
            kind,
            parent,
            size,
            mode: attrs.mode,
            uid: attrs.uid,
            gid: attrs.gid,
            nlink: if kind == InodeKind::Directory { 2 } else { 1 },
            atime: attrs.at,
            mtime: attrs.at,
            ctime: attrs.at,
            version: 1,
            key: keys::inode_prefix(id),
            target,
        }
    }

    /// Record that has not been loaded from the backend yet.
    pub(crate) fn placeholder(id: InodeId, parent: InodeId, kind: InodeKind) -> Self {
        let epoch = DateTime::<Utc>::default();
        Self {
            id,
            kind,
            parent,
            size: 0,
            mode: if kind == InodeKind::Directory { 0o755 } else { 0o644 },
            uid: 0,
            gid: 0,
            nlink: if kind == InodeKind::Directory { 2 } else { 1 },
            atime: epoch,
            mtime: epoch,
            ctime: epoch,
            version: 0,
            key: keys::inode_prefix(id),
            target: None,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == InodeKind::Directory
    }
}

/// Attributes supplied when creating an inode.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAttrs {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub at: DateTime<Utc>,
    pub target: Option<String>,
}

impl NewAttrs {
    pub fn new(mode: u32, uid: u32, gid: u32) -> Self {
        Self {
            mode,
            uid,
            gid,
            at: Utc::now(),
            target: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

impl Default for NewAttrs {
    fn default() -> Self {
        Self::new(0o644, 0, 0)
    }
}

/// Metadata delta applied by `update_metadata`. Size changes go through
/// truncate instead.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<DateTime<Utc>>,
    pub mtime: Option<DateTime<Utc>>,
}

impl SetAttr {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.size.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
    }

    /// Same delta with the size change removed.
    pub fn without_size(&self) -> Self {
        Self {
            size: None,
            ..self.clone()
        }
    }
}

/// Allocates inode ids for one mount.
///
/// Ids carry a random 24-bit mount prefix in their high bits so that mounts
/// sharing a backend never hand out the same id.
#[derive(Debug)]
pub struct IdAllocator {
    prefix: u64,
    next: AtomicU64,
}

const COUNTER_BITS: u32 = 40;

impl IdAllocator {
    pub fn new() -> Self {
        let prefix = loop {
            let candidate = rand::random::<u32>() as u64 & 0x00ff_ffff;
            if candidate != 0 {
                break candidate;
            }
        };
        Self::with_prefix(prefix)
    }

    pub fn with_prefix(prefix: u64) -> Self {
        Self {
            prefix: prefix & 0x00ff_ffff,
            next: AtomicU64::new(1),
        }
    }

    pub fn allocate(&self) -> InodeId {
        let counter = self.next.fetch_add(1, Ordering::SeqCst);
        InodeId((self.prefix << COUNTER_BITS) | counter)
    }

    /// Make sure ids allocated from now on are above `id`.
    pub fn observe(&self, id: InodeId) {
        if id.0 >> COUNTER_BITS == self.prefix {
            let counter = id.0 & ((1 << COUNTER_BITS) - 1);
            self.next.fetch_max(counter + 1, Ordering::SeqCst);
        }
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocated_ids_carry_prefix() {
        let alloc = IdAllocator::with_prefix(0xabcdef);
        let first = alloc.allocate();
        let second = alloc.allocate();
        assert_eq!(first.0 >> 40, 0xabcdef);
        assert_ne!(first, second);
        assert_ne!(first, InodeId::ROOT);
    }

    #[test]
    fn test_observe_skips_past_known_ids() {
        let alloc = IdAllocator::with_prefix(7);
        alloc.observe(InodeId((7 << 40) | 41));
        // ids from other mounts are ignored
        alloc.observe(InodeId((8 << 40) | 1000));
        assert_eq!(alloc.allocate(), InodeId((7 << 40) | 42));
    }

    #[test]
    fn test_symlink_record_size_is_target_len() {
        let attrs = NewAttrs::new(0o777, 0, 0).with_target("../target");
        let record = InodeRecord::new(InodeId(5), InodeId::ROOT, InodeKind::Symlink, &attrs);
        assert_eq!(record.size, 9);
        assert_eq!(record.target.as_deref(), Some("../target"));
        assert_eq!(record.key, "inodes/0000000000000005/");
    }
}
