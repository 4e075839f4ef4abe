//! Backend form of an inode's metadata.
//!
//! Stored as JSON at `<prefix>meta`. Directories carry their live entries;
//! tombstones never leave the mount.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};
use crate::types::{InodeId, InodeKind, InodeRecord};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub inode: InodeId,
    pub kind: InodeKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteInode {
    pub record: InodeRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<BTreeMap<String, RemoteEntry>>,
}

impl RemoteInode {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| FsError::Internal(format!("encode meta: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| FsError::BackendUnavailable(format!("malformed inode meta: {}", e)))
    }
}
