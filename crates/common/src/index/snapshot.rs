//! Persistent snapshot of the metadata index.
//!
//! Written on orderly unmount and whenever the mount is quiescent, so a
//! remount can hydrate the index without walking the backend and then
//! replay only the journal records newer than the snapshot.

use std::fs;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::node::DirEntry;
use crate::error::{FsError, Result};
use crate::types::{InodeId, InodeRecord, Version};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub record: InodeRecord,
    /// Version known to be durable in the backend
    pub flushed: Version,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotDir {
    pub dir: InodeId,
    pub version: Version,
    pub entries: Vec<(String, DirEntry)>,
}

/// Inode records followed by directory entries, both sorted by inode id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    /// First journal sequence number not reflected in this snapshot
    pub journal_seq: u64,
    pub records: Vec<SnapshotRecord>,
    pub dirs: Vec<SnapshotDir>,
}

impl IndexSnapshot {
    /// Write the snapshot to `path` atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let bytes =
            bincode::serialize(self).map_err(|e| FsError::Snapshot(format!("encode: {}", e)))?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        debug!(
            path = %path.display(),
            inodes = self.records.len(),
            journal_seq = self.journal_seq,
            "wrote index snapshot"
        );
        Ok(())
    }

    /// Read the snapshot at `path`, or `None` if there is none.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: Self = bincode::deserialize(&bytes)
            .map_err(|e| FsError::Snapshot(format!("{}: {}", path.display(), e)))?;
        info!(
            path = %path.display(),
            inodes = snapshot.records.len(),
            journal_seq = snapshot.journal_seq,
            "loaded index snapshot"
        );
        Ok(Some(snapshot))
    }
}
