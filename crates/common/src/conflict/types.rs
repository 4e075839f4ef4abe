//! Core types for conflict resolution

use crate::cache::ByteRange;
use crate::types::InodeId;

/// A block whose backend copy changed since the local copy was loaded
#[derive(Debug, Clone)]
pub struct Conflict {
    pub inode: InodeId,
    pub block: u64,
    /// Local block content, dirty ranges included
    pub local: Vec<u8>,
    /// Byte ranges of `local` written by this mount
    pub dirty: Vec<ByteRange>,
    /// Current backend content
    pub remote: Vec<u8>,
    pub remote_etag: Option<String>,
}

impl Conflict {
    /* Getters */

    /// Whether every byte of the block was written locally
    pub fn fully_dirty(&self) -> bool {
        let covered: usize = self.dirty.iter().map(|r| r.len()).sum();
        covered >= self.local.len().max(self.remote.len())
    }
}

/// What the flusher writes for a conflicting block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Write the local block as is
    UseLocal,
    /// Write this content instead
    UseMerged(Vec<u8>),
}
