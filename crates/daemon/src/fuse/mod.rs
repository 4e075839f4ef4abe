//! FUSE front end
//!
//! Exposes an [`ObjectFs`] to the kernel through `fuser`.
//!
//! # Threading
//!
//! `fuser` drives the filesystem from its own session thread. Each callback
//! runs the matching engine operation to completion on the tokio runtime the
//! mount was started from, so callbacks never run on a runtime worker.
//!
//! # Inodes and handles
//!
//! Engine inode ids are used as kernel inode numbers directly; the root is
//! id 1 on both sides. File handles are the engine's own. Directory handles
//! are local to this module and hold the listing taken at `opendir`, so a
//! directory read by the kernel in several batches sees one consistent
//! listing.

mod attr;
mod filesystem;

use std::path::Path;
use std::sync::Arc;

use common::ObjectFs;
use fuser::{BackgroundSession, MountOption};
use tokio::runtime::Handle;

use crate::config::FuseOptions;

pub use attr::{file_type, to_file_attr};
pub use filesystem::ObjectFsFuse;

/// Mount `fs` at `mount_point` on a background session thread.
pub fn spawn(
    fs: Arc<ObjectFs>,
    mount_point: &Path,
    options: &FuseOptions,
    runtime: Handle,
) -> std::io::Result<BackgroundSession> {
    let mut mount_options = vec![
        MountOption::FSName(options.fs_name.clone()),
        MountOption::Subtype("objectfs".to_string()),
        MountOption::DefaultPermissions,
    ];
    if options.allow_other {
        mount_options.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        mount_options.push(MountOption::AutoUnmount);
    }

    let filesystem = ObjectFsFuse::new(fs, runtime, options.attr_ttl());
    fuser::spawn_mount2(filesystem, mount_point, &mount_options)
}
