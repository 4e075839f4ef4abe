//! ObjectFS engine
//!
//! This crate makes a remote, eventually consistent object store behave like
//! a local POSIX filesystem. It is organised leaf-first:
//!
//! - [`index`]: the metadata index, source of truth for namespace shape
//! - [`cache`]: fixed-capacity block cache with write-back dirty tracking
//! - [`journal`]: append-only write-back journal for crash recovery
//! - [`bus`]: invalidation events exchanged between mounts sharing a backend
//! - [`fs`]: the operation translator that turns filesystem calls into index,
//!   cache, journal and backend operations
//!
//! The object store itself is consumed through the
//! [`object_store::ObjectStoreAdapter`] trait.

pub mod bus;
pub mod cache;
pub mod config;
pub mod conflict;
pub mod error;
pub mod fs;
pub mod index;
pub mod journal;
pub mod keys;
pub mod retry;
pub mod types;

pub use config::Config;
pub use error::{FsError, Result};
pub use fs::{MountOptions, ObjectFs};

pub mod prelude {
    pub use crate::bus::{EventKind, InvalidationEvent, InvalidationTransport, LocalHub};
    pub use crate::config::{Config, ConflictPolicy};
    pub use crate::error::{FsError, Result};
    pub use crate::fs::{HandleState, MountOptions, ObjectFs, OpenFlags};
    pub use crate::types::{InodeId, InodeKind, InodeRecord, MountId, SetAttr, Version};
}
