//! Sequential read detection.
//!
//! A read that starts exactly where the previous read of the same inode
//! ended continues a stream. Each read of a stream asks for the blocks up
//! to `window` past its last block that have not been asked for yet, so a
//! steady reader keeps the window full with one or two fetches per read.

use std::ops::RangeInclusive;

use moka::sync::Cache;

use crate::types::InodeId;

/// Inodes tracked at once; the least recently read stream is forgotten
const MAX_STREAMS: u64 = 4096;

#[derive(Debug, Clone, Copy)]
struct Stream {
    /// Offset the next read must start at to stay sequential
    next_offset: u64,
    /// First block not yet handed out for prefetch
    ahead: u64,
}

#[derive(Debug)]
pub struct Readahead {
    window: u64,
    streams: Cache<InodeId, Stream>,
}

impl Readahead {
    pub fn new(window: usize) -> Self {
        Self {
            window: window as u64,
            streams: Cache::new(MAX_STREAMS),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.window > 0
    }

    /// Record a read of `[offset, offset + len)` covering blocks up to
    /// `last`, in a file whose final block is `eof`. Returns the blocks to
    /// fetch ahead of the reader, if the read continues a stream.
    pub fn observe(
        &self,
        inode: InodeId,
        offset: u64,
        len: u64,
        last: u64,
        eof: u64,
    ) -> Option<RangeInclusive<u64>> {
        if !self.is_enabled() || len == 0 {
            return None;
        }
        let previous = self.streams.get(&inode);
        let sequential = previous
            .map(|stream| stream.next_offset == offset)
            .unwrap_or(false);

        let mut stream = Stream {
            next_offset: offset + len,
            ahead: last + 1,
        };
        let plan = if sequential {
            let from = previous.map(|p| p.ahead).unwrap_or(0).max(last + 1);
            let to = last.saturating_add(self.window).min(eof);
            stream.ahead = from.max(to + 1);
            (from <= to).then_some(from..=to)
        } else {
            None
        };
        self.streams.insert(inode, stream);
        plan
    }

    pub fn forget(&self, inode: InodeId) {
        self.streams.invalidate(&inode);
    }
}
