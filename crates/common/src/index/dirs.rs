//! Namespace locks, one per directory.
//!
//! An operation names every directory whose entries it reads and changes and
//! takes them all in one step, so acquisitions never interleave. Renames
//! between two directories are additionally serialized with each other,
//! which keeps a directory from being moved below itself by two concurrent
//! renames that each looked fine on their own.

use std::collections::BTreeSet;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::types::InodeId;

#[derive(Debug, Default)]
pub(crate) struct DirLocks {
    held: Mutex<BTreeSet<InodeId>>,
    released: Condvar,
    moves: Mutex<()>,
}

/// Directories held by one operation. Released on drop.
#[derive(Debug)]
#[must_use]
pub(crate) struct DirGuard<'a> {
    locks: &'a DirLocks,
    dirs: Vec<InodeId>,
    _moves: Option<MutexGuard<'a, ()>>,
}

impl DirLocks {
    pub fn lock(&self, dirs: &[InodeId]) -> DirGuard<'_> {
        self.acquire(dirs, None)
    }

    /// Lock for a rename from one directory into another.
    pub fn lock_move(&self, dirs: &[InodeId]) -> DirGuard<'_> {
        let moves = self.moves.lock();
        self.acquire(dirs, Some(moves))
    }

    fn acquire<'a>(&'a self, dirs: &[InodeId], moves: Option<MutexGuard<'a, ()>>) -> DirGuard<'a> {
        let mut dirs = dirs.to_vec();
        dirs.sort();
        dirs.dedup();
        let mut held = self.held.lock();
        while dirs.iter().any(|dir| held.contains(dir)) {
            self.released.wait(&mut held);
        }
        held.extend(dirs.iter().copied());
        DirGuard {
            locks: self,
            dirs,
            _moves: moves,
        }
    }

    #[cfg(test)]
    fn is_held(&self, dir: InodeId) -> bool {
        self.held.lock().contains(&dir)
    }
}

impl Drop for DirGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock();
        for dir in &self.dirs {
            held.remove(dir);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_other_directories_stay_available() {
        let locks = DirLocks::default();
        let a = locks.lock(&[InodeId(1), InodeId(2)]);
        let b = locks.lock(&[InodeId(3)]);
        assert!(locks.is_held(InodeId(2)));
        assert!(locks.is_held(InodeId(3)));
        drop(a);
        assert!(!locks.is_held(InodeId(1)));
        assert!(!locks.is_held(InodeId(2)));
        drop(b);
        assert!(!locks.is_held(InodeId(3)));
    }

    #[test]
    fn test_shared_directory_waits_for_release() {
        let locks = Arc::new(DirLocks::default());
        let held = locks.lock(&[InodeId(1)]);

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let locks = locks.clone();
            thread::spawn(move || {
                let _guard = locks.lock(&[InodeId(2), InodeId(1)]);
                tx.send(()).unwrap();
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        // the waiter took nothing while blocked
        assert!(!locks.is_held(InodeId(2)));

        drop(held);
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
        waiter.join().unwrap();
        assert!(!locks.is_held(InodeId(1)));
    }

    #[test]
    fn test_duplicate_directories_are_taken_once() {
        let locks = DirLocks::default();
        let guard = locks.lock_move(&[InodeId(4), InodeId(4)]);
        assert_eq!(guard.dirs, vec![InodeId(4)]);
    }
}
