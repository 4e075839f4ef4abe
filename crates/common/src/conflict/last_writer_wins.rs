//! Last-writer-wins conflict resolver

use super::types::{Conflict, Resolution};
use super::ConflictResolver;

/// Overwrite the backend block with the local one.
///
/// Concurrent writers to overlapping ranges end up with whichever flush
/// reached the backend last.
#[derive(Debug, Clone, Default)]
pub struct LastWriterWins;

impl LastWriterWins {
    pub fn new() -> Self {
        Self
    }
}

impl ConflictResolver for LastWriterWins {
    fn detects_conflicts(&self) -> bool {
        false
    }

    fn resolve(&self, _conflict: &Conflict) -> Resolution {
        Resolution::UseLocal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ByteRange;
    use crate::types::InodeId;

    #[test]
    fn test_always_uses_local() {
        let conflict = Conflict {
            inode: InodeId(5),
            block: 0,
            local: b"mine".to_vec(),
            dirty: vec![ByteRange::new(0, 2)],
            remote: b"them".to_vec(),
            remote_etag: Some("7".into()),
        };
        assert_eq!(LastWriterWins::new().resolve(&conflict), Resolution::UseLocal);
    }
}
