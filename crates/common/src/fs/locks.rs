//! Per-inode reader/writer locks.
//!
//! Held by the translator across the in-memory part of an operation, never
//! across a backend round trip.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::types::InodeId;

const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Default)]
pub(crate) struct InodeLocks {
    locks: Mutex<HashMap<InodeId, Arc<RwLock<()>>>>,
}

impl InodeLocks {
    fn lock_for(&self, inode: InodeId) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        if locks.len() > PRUNE_THRESHOLD {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks.entry(inode).or_default().clone()
    }

    pub async fn read(&self, inode: InodeId) -> OwnedRwLockReadGuard<()> {
        self.lock_for(inode).read_owned().await
    }

    pub async fn write(&self, inode: InodeId) -> OwnedRwLockWriteGuard<()> {
        self.lock_for(inode).write_owned().await
    }

    /// Exclusive locks on several inodes, taken in id order.
    pub async fn write_all(&self, inodes: &[InodeId]) -> Vec<OwnedRwLockWriteGuard<()>> {
        let mut ids = inodes.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.write(id).await);
        }
        guards
    }
}
