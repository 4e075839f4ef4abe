use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::{InodeId, InodeKind, InodeRecord, Version};

/// One name in a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub inode: InodeId,
    pub kind: InodeKind,
    /// Removed locally, still listed in the backend copy of the directory
    pub tombstone: bool,
}

impl DirEntry {
    pub fn live(inode: InodeId, kind: InodeKind) -> Self {
        Self {
            inode,
            kind,
            tombstone: false,
        }
    }
}

pub(crate) type Entries = Arc<BTreeMap<String, DirEntry>>;

/// An inode and, for directories, its entries.
///
/// Entries live behind an `Arc` so a listing can hold on to the map it
/// started with while mutations swap in a modified copy.
#[derive(Debug)]
pub(crate) struct InodeNode {
    pub record: RwLock<InodeRecord>,
    pub entries: RwLock<Entries>,
    stale: AtomicBool,
    flushed: AtomicU64,
}

impl InodeNode {
    pub fn new(record: InodeRecord, entries: BTreeMap<String, DirEntry>, flushed: Version) -> Self {
        Self {
            record: RwLock::new(record),
            entries: RwLock::new(Arc::new(entries)),
            stale: AtomicBool::new(false),
            flushed: AtomicU64::new(flushed),
        }
    }

    pub fn placeholder(id: InodeId, parent: InodeId, kind: InodeKind) -> Self {
        let node = Self::new(
            InodeRecord::placeholder(id, parent, kind),
            BTreeMap::new(),
            0,
        );
        node.set_stale(true);
        node
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub fn set_stale(&self, stale: bool) {
        self.stale.store(stale, Ordering::Release);
    }

    pub fn flushed(&self) -> Version {
        self.flushed.load(Ordering::Acquire)
    }

    pub fn set_flushed(&self, version: Version) {
        self.flushed.fetch_max(version, Ordering::AcqRel);
    }

    pub fn reset_flushed(&self, version: Version) {
        self.flushed.store(version, Ordering::Release);
    }
}

/// A name and what it points to, as returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirListing {
    pub name: String,
    pub inode: InodeId,
    pub kind: InodeKind,
}

/// Lazy listing over one immutable copy of a directory.
///
/// Names come back in byte order. Resuming with the last name seen as the
/// cookie against a newer copy never repeats a name and never skips a name
/// present in both copies.
#[derive(Debug, Clone)]
pub struct DirStream {
    entries: Entries,
    after: Option<String>,
}

impl DirStream {
    pub(crate) fn new(entries: Entries, after: Option<String>) -> Self {
        Self { entries, after }
    }

    /// Name of the last entry returned, used to resume a listing.
    pub fn cookie(&self) -> Option<&str> {
        self.after.as_deref()
    }
}

impl Iterator for DirStream {
    type Item = DirListing;

    fn next(&mut self) -> Option<DirListing> {
        let lower = match &self.after {
            Some(name) => Bound::Excluded(name.as_str()),
            None => Bound::Unbounded,
        };
        let (name, entry) = self
            .entries
            .range::<str, _>((lower, Bound::Unbounded))
            .find(|(_, entry)| !entry.tombstone)?;
        self.after = Some(name.clone());
        Some(DirListing {
            name: name.clone(),
            inode: entry.inode,
            kind: entry.kind,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(names: &[(&str, bool)]) -> Entries {
        Arc::new(
            names
                .iter()
                .enumerate()
                .map(|(i, (name, tombstone))| {
                    (
                        name.to_string(),
                        DirEntry {
                            inode: InodeId(i as u64 + 10),
                            kind: InodeKind::File,
                            tombstone: *tombstone,
                        },
                    )
                })
                .collect(),
        )
    }

    #[test]
    fn test_stream_skips_tombstones() {
        let names: Vec<String> = DirStream::new(entries(&[("a", false), ("b", true), ("c", false)]), None)
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn test_resume_against_newer_copy() {
        let mut first = DirStream::new(entries(&[("a", false), ("c", false), ("e", false)]), None);
        assert_eq!(first.next().unwrap().name, "a");
        assert_eq!(first.next().unwrap().name, "c");
        let cookie = first.cookie().map(str::to_string);

        // "b" was added before the cookie, "d" after it, "e" survived
        let newer = entries(&[("a", false), ("b", false), ("c", false), ("d", false), ("e", false)]);
        let rest: Vec<String> = DirStream::new(newer, cookie).map(|e| e.name).collect();
        assert_eq!(rest, vec!["d", "e"]);
    }
}
