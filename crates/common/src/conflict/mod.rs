//! Conflict resolution for block flushes
//!
//! Two mounts sharing a backend can each hold dirty copies of the same block.
//! When a flush is about to overwrite a block object, the resolver decides
//! what actually gets written.
//!
//! # Built-in Strategies
//!
//! - **[`LastWriterWins`]**: The flushing mount overwrites whatever is there
//!   (default). "Last" is whichever flush completes last.
//! - **[`MergeBlocks`]**: If the backend block changed since it was loaded,
//!   re-fetch it and lay only the locally dirty byte ranges on top.
//!
//! # Custom Resolvers
//!
//! Implement the [`ConflictResolver`] trait to plug in another strategy.

mod last_writer_wins;
mod merge_blocks;
mod types;

use std::sync::Arc;

pub use last_writer_wins::LastWriterWins;
pub use merge_blocks::MergeBlocks;
pub use types::{Conflict, Resolution};

use crate::config::ConflictPolicy;

/// Trait for conflict resolution strategies
pub trait ConflictResolver: std::fmt::Debug + Send + Sync {
    /// Whether the flusher should check the backend for divergence before
    /// writing a block. Resolvers that always overwrite skip the extra `head`.
    fn detects_conflicts(&self) -> bool;

    /// Decide what to write for a block whose backend copy diverged from the
    /// copy the local edits were made against.
    fn resolve(&self, conflict: &Conflict) -> Resolution;
}

/// Build the resolver for a configured policy.
pub fn resolver_for(policy: ConflictPolicy) -> Arc<dyn ConflictResolver> {
    match policy {
        ConflictPolicy::LastWriterWins => Arc::new(LastWriterWins::new()),
        ConflictPolicy::MergeBlocks => Arc::new(MergeBlocks::new()),
    }
}

/// Whether a backend etag means the block changed under us.
///
/// A block loaded from nothing (`base` is `None`) diverged if anything exists
/// now.
pub fn diverged(base: Option<&str>, remote: Option<&str>) -> bool {
    match (base, remote) {
        (Some(base), Some(remote)) => base != remote,
        (None, Some(_)) => true,
        (_, None) => false,
    }
}
