use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{InodeId, MountId, Version};

/// What changed about an inode. Later variants dominate earlier ones when
/// events for the same inode are coalesced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    MetadataChanged,
    DataChanged,
    Deleted,
}

/// Notification that a peer's cached view of `inode` is stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationEvent {
    pub inode: InodeId,
    pub kind: EventKind,
    pub version: Version,
    pub origin: MountId,
    pub emitted_at: DateTime<Utc>,
}

impl InvalidationEvent {
    pub fn new(inode: InodeId, kind: EventKind, version: Version, origin: MountId) -> Self {
        Self {
            inode,
            kind,
            version,
            origin,
            emitted_at: Utc::now(),
        }
    }
}
