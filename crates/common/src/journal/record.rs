//! Mutation records.
//!
//! A [`Mutation`] describes one committed change: it is both the journal
//! payload and the input the metadata index applies, live or during replay.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{InodeId, InodeRecord, SetAttr, Version};

/// Version change of one inode touched by a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionBump {
    pub inode: InodeId,
    pub pre: Version,
    pub post: Version,
}

impl VersionBump {
    pub fn next(inode: InodeId, current: Version) -> Self {
        Self {
            inode,
            pre: current,
            post: current + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MutationOp {
    /// Bytes written at `offset`; `new_size` is the file size afterwards
    Write {
        offset: u64,
        data: Vec<u8>,
        new_size: u64,
    },
    SetAttr {
        attr: SetAttr,
    },
    Truncate {
        old_size: u64,
        new_size: u64,
    },
    /// New child linked under the mutated directory
    Create {
        name: String,
        child: InodeRecord,
    },
    /// Name removed from the mutated directory
    Remove {
        name: String,
        child: VersionBump,
    },
    /// Name moved out of the mutated directory
    Rename {
        src_name: String,
        dst_name: String,
        /// Destination directory, when it differs from the source
        dst_parent: Option<VersionBump>,
        moved: VersionBump,
        replaced: Option<VersionBump>,
    },
}

/// One committed change, tagged with the inode it is recorded against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub inode: InodeId,
    pub pre_version: Version,
    pub post_version: Version,
    pub at: DateTime<Utc>,
    pub op: MutationOp,
}

impl Mutation {
    pub fn new(bump: VersionBump, at: DateTime<Utc>, op: MutationOp) -> Self {
        Self {
            inode: bump.inode,
            pre_version: bump.pre,
            post_version: bump.post,
            at,
            op,
        }
    }

    /// Every pre-existing inode this mutation changes, the recorded inode first.
    pub fn touched(&self) -> Vec<InodeId> {
        let mut ids = vec![self.inode];
        match &self.op {
            MutationOp::Remove { child, .. } => ids.push(child.inode),
            MutationOp::Rename {
                dst_parent,
                moved,
                replaced,
                ..
            } => {
                ids.extend(dst_parent.map(|b| b.inode));
                ids.push(moved.inode);
                ids.extend(replaced.map(|b| b.inode));
            }
            _ => {}
        }
        ids
    }
}

/// A mutation as stored in the journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub seq: u64,
    pub mutation: Mutation,
}

/// Borrowed form of [`JournalRecord`], encoded identically.
#[derive(Serialize)]
pub(crate) struct JournalRecordRef<'a> {
    pub seq: u64,
    pub mutation: &'a Mutation,
}
