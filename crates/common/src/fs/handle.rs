//! Open file handles.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};
use crate::types::InodeId;

/// Lifecycle of one open handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleState {
    /// Nothing written through this handle since its last successful flush
    OpenedClean,
    /// Holds writes not yet known to be in the backend
    OpenedDirty,
    /// Flushing on the way to being closed
    Closing,
}

/// How a handle was opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub write: bool,
    pub truncate: bool,
    pub append: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self::default()
    }

    pub fn read_write() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    /// Decode `open(2)` flags.
    pub fn from_raw(flags: i32) -> Self {
        let access = flags & libc::O_ACCMODE;
        Self {
            write: access == libc::O_WRONLY || access == libc::O_RDWR,
            truncate: flags & libc::O_TRUNC != 0,
            append: flags & libc::O_APPEND != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handle {
    pub inode: InodeId,
    pub flags: OpenFlags,
    pub state: HandleState,
}

#[derive(Debug, Default)]
struct Handles {
    by_fh: HashMap<u64, Handle>,
    open: HashMap<InodeId, usize>,
}

#[derive(Debug)]
pub struct HandleTable {
    next: AtomicU64,
    inner: Mutex<Handles>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
            inner: Mutex::new(Handles::default()),
        }
    }
}

impl HandleTable {
    pub fn open(&self, inode: InodeId, flags: OpenFlags, dirty: bool) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::Relaxed);
        let state = if dirty {
            HandleState::OpenedDirty
        } else {
            HandleState::OpenedClean
        };
        let mut inner = self.inner.lock();
        inner.by_fh.insert(
            fh,
            Handle {
                inode,
                flags,
                state,
            },
        );
        *inner.open.entry(inode).or_insert(0) += 1;
        fh
    }

    pub fn get(&self, fh: u64) -> Result<Handle> {
        self.inner
            .lock()
            .by_fh
            .get(&fh)
            .copied()
            .ok_or(FsError::BadHandle(fh))
    }

    pub fn set_state(&self, fh: u64, state: HandleState) {
        if let Some(handle) = self.inner.lock().by_fh.get_mut(&fh) {
            handle.state = state;
        }
    }

    pub fn mark_dirty(&self, fh: u64) {
        self.set_state(fh, HandleState::OpenedDirty);
    }

    /// Every dirty handle on `inode` becomes clean after a full flush.
    pub fn mark_inode_clean(&self, inode: InodeId) {
        for handle in self.inner.lock().by_fh.values_mut() {
            if handle.inode == inode && handle.state == HandleState::OpenedDirty {
                handle.state = HandleState::OpenedClean;
            }
        }
    }

    /// Remove `fh`, returning it and how many handles remain on its inode.
    pub fn close(&self, fh: u64) -> Result<(Handle, usize)> {
        let mut inner = self.inner.lock();
        let handle = inner.by_fh.remove(&fh).ok_or(FsError::BadHandle(fh))?;
        let remaining = match inner.open.get_mut(&handle.inode) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => 0,
        };
        if remaining == 0 {
            inner.open.remove(&handle.inode);
        }
        Ok((handle, remaining))
    }

    pub fn open_count(&self, inode: InodeId) -> usize {
        self.inner.lock().open.get(&inode).copied().unwrap_or(0)
    }

    pub fn is_open(&self, inode: InodeId) -> bool {
        self.open_count(inode) > 0
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_fh.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
