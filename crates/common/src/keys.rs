//! Backend key layout.
//!
//! Every inode owns the prefix `inodes/<id:016x>/`. Data blocks live at
//! `<prefix>b<index:016x>` and the serialized record at `<prefix>meta`.

use crate::types::InodeId;

pub fn inode_prefix(id: InodeId) -> String {
    format!("inodes/{:016x}/", id.0)
}

pub fn block_key(prefix: &str, index: u64) -> String {
    format!("{}b{:016x}", prefix, index)
}

pub fn meta_key(prefix: &str) -> String {
    format!("{}meta", prefix)
}

/// Block index encoded in `key`, if it is a block key under `prefix`.
pub fn parse_block_key(prefix: &str, key: &str) -> Option<u64> {
    let rest = key.strip_prefix(prefix)?.strip_prefix('b')?;
    if rest.len() != 16 {
        return None;
    }
    u64::from_str_radix(rest, 16).ok()
}
