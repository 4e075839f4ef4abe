//! Byte-range merge conflict resolver

use tracing::info;

use super::types::{Conflict, Resolution};
use super::ConflictResolver;
use crate::cache::overlay;
use crate::error::FsError;

/// Keep the remote block and re-apply only the bytes this mount wrote.
///
/// Writers touching disjoint ranges of the same block both survive. Where
/// ranges overlap the local bytes win.
#[derive(Debug, Clone, Default)]
pub struct MergeBlocks;

impl MergeBlocks {
    pub fn new() -> Self {
        Self
    }
}

impl ConflictResolver for MergeBlocks {
    fn detects_conflicts(&self) -> bool {
        true
    }

    fn resolve(&self, conflict: &Conflict) -> Resolution {
        let err = FsError::VersionConflict {
            inode: conflict.inode,
            detail: format!(
                "block {} changed remotely (etag {:?})",
                conflict.block, conflict.remote_etag
            ),
        };
        if conflict.fully_dirty() {
            info!(error = %err, "local block supersedes remote copy");
            return Resolution::UseLocal;
        }
        info!(error = %err, dirty_ranges = conflict.dirty.len(), "merging dirty ranges onto remote block");
        Resolution::UseMerged(overlay(&conflict.remote, &conflict.local, &conflict.dirty))
    }
}
