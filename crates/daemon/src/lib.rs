//! ObjectFS daemon
//!
//! Assembles a mounted filesystem from a [`MountConfig`]: the object store
//! backend, the local state directory and the engine settings. With the
//! `fuse` feature (on by default) the mount is also exposed to the kernel
//! through `fuser`.

pub mod config;
#[cfg(feature = "fuse")]
pub mod fuse;
pub mod mount;

pub use config::{ConfigError, FuseOptions, MountConfig};
pub use mount::Mount;
