//! Block cache
//!
//! A fixed-capacity store of file data chunks keyed by `(inode, block index)`.
//! Writes are always satisfied locally and mark blocks dirty; dirty blocks
//! are pushed to the backend by the flusher and only become evictable once
//! clean again.
//!
//! # Eviction
//!
//! Least-recently-used among clean blocks only. Each cache operation takes
//! one access tick, so blocks touched by the same operation share a tick and
//! ties break on the lowest inode id, then the lowest block index.
//!
//! # Backpressure
//!
//! The number of dirty blocks is bounded. A writer first reserves room for
//! the blocks it will dirty; when none is left it waits for a flush to free
//! capacity and gives up with [`FsError::Backpressure`](crate::FsError::Backpressure)
//! after a timeout.
//!
//! # Partial blocks
//!
//! A write covering part of an uncached block does not fetch the rest. The
//! block is created dirty but unloaded, remembering which byte ranges it
//! owns; the backend content is merged underneath on the next read or at
//! flush time.
//!
//! # Readahead
//!
//! A read that picks up where the previous read of the same file stopped
//! is treated as sequential, and the next few uncached blocks are fetched
//! alongside it as clean blocks.

mod block;
mod ranges;
mod readahead;
mod stats;

pub use block::{BlockCache, BlockRead, BlockState, FlushItem, FlushOutcome, Reservation};
pub use ranges::{overlay, ByteRange, RangeSet};
pub use stats::CacheStats;
