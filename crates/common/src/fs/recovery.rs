//! Mount-time recovery: rebuild the index from the last snapshot, then
//! replay the journal tail into the index and the block cache.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use super::backend::Backend;
use crate::bus::Outbox;
use crate::cache::BlockCache;
use crate::error::{FsError, Result};
use crate::index::{IndexSnapshot, MetadataIndex, ReplayOutcome};
use crate::journal::{Journal, MutationOp};
use crate::types::InodeId;

/// Outcome of recovering one mount's local state.
#[derive(Debug)]
pub struct RecoveryReport {
    pub index: MetadataIndex,
    /// First journal sequence number replayed
    pub replay_from: u64,
    pub applied: usize,
    pub skipped: usize,
    /// Unlinked inodes whose backend objects still need deleting
    pub orphans: Vec<InodeId>,
}

pub(super) async fn recover(
    journal: &Journal,
    backend: &Backend,
    cache: &BlockCache,
    snapshot_path: &Path,
    outbox: Arc<Outbox>,
) -> Result<RecoveryReport> {
    let (index, replay_from) = match IndexSnapshot::load(snapshot_path)? {
        Some(snapshot) => {
            let from = snapshot.journal_seq;
            (MetadataIndex::from_snapshot(snapshot, outbox), from)
        }
        None => (MetadataIndex::unhydrated(outbox), 1),
    };

    let (mut applied, mut skipped) = (0, 0);
    for record in journal.replay_from(replay_from)? {
        // a corrupt record stops the mount rather than guessing past it
        let record = record?;
        let mutation = &record.mutation;

        for id in mutation.touched() {
            if index.is_hydrated(id) {
                continue;
            }
            match backend.hydrate(&index, id).await {
                Ok(_) | Err(FsError::NotFound) => {}
                Err(err) => return Err(err),
            }
        }

        match index.apply(mutation) {
            Ok(ReplayOutcome::Applied { prior_size }) => {
                applied += 1;
                match &mutation.op {
                    MutationOp::Write { offset, data, .. } => {
                        cache.apply_write_unreserved(mutation.inode, *offset, data, prior_size)
                    }
                    MutationOp::Truncate { new_size, .. } => {
                        cache.truncate(mutation.inode, prior_size, *new_size)
                    }
                    _ => {}
                }
            }
            Ok(ReplayOutcome::Skipped) => skipped += 1,
            Err(FsError::NotFound) => {
                warn!(
                    seq = record.seq,
                    inode = %mutation.inode,
                    "journal record names an inode that no longer exists, skipping"
                );
                skipped += 1;
            }
            Err(err) => return Err(err),
        }
    }

    let orphans = index.orphans();
    info!(
        replay_from = replay_from,
        applied = applied,
        skipped = skipped,
        orphans = orphans.len(),
        dirty_blocks = cache.dirty_count(),
        "recovered local state"
    );
    Ok(RecoveryReport {
        index,
        replay_from,
        applied,
        skipped,
        orphans,
    })
}
