use object_store::StoreError;

use crate::types::InodeId;

pub type Result<T> = std::result::Result<T, FsError>;

/// Errors surfaced by filesystem operations.
///
/// Structural errors (`NotFound`, `AlreadyExists`, `NotEmpty`, ...) reflect
/// namespace state and are never retried. `BackendUnavailable` and
/// `Backpressure` are transient.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    #[error("file exists")]
    AlreadyExists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("version conflict on inode {inode}: {detail}")]
    VersionConflict { inode: InodeId, detail: String },

    #[error("write buffer full, retry later")]
    Backpressure,

    #[error("bad file handle {0}")]
    BadHandle(u64),

    #[error("journal error: {0}")]
    Journal(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FsError {
    /// Whether the caller may retry the operation after a delay.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FsError::BackendUnavailable(_) | FsError::Backpressure)
    }

    /// POSIX error code reported to the kernel.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NotDirectory => libc::ENOTDIR,
            FsError::IsDirectory => libc::EISDIR,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::PermissionDenied(_) => libc::EACCES,
            FsError::Backpressure => libc::EAGAIN,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::BackendUnavailable(_)
            | FsError::VersionConflict { .. }
            | FsError::Journal(_)
            | FsError::Snapshot(_)
            | FsError::Io(_)
            | FsError::Internal(_) => libc::EIO,
        }
    }
}

impl From<StoreError> for FsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => FsError::NotFound,
            StoreError::Unavailable(msg) => FsError::BackendUnavailable(msg),
            StoreError::PermissionDenied(msg) => FsError::PermissionDenied(msg),
            StoreError::InvalidKey(msg) | StoreError::Config(msg) => {
                FsError::InvalidArgument(msg)
            }
        }
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        FsError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::NotFound.errno(), libc::ENOENT);
        assert_eq!(FsError::AlreadyExists.errno(), libc::EEXIST);
        assert_eq!(FsError::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(FsError::Backpressure.errno(), libc::EAGAIN);
        assert_eq!(FsError::BackendUnavailable("down".into()).errno(), libc::EIO);
        assert_eq!(FsError::Journal("bad frame".into()).errno(), libc::EIO);
    }

    #[test]
    fn test_structural_errors_are_not_retryable() {
        assert!(!FsError::NotFound.is_retryable());
        assert!(!FsError::AlreadyExists.is_retryable());
        assert!(!FsError::NotEmpty.is_retryable());
        assert!(!FsError::PermissionDenied("no".into()).is_retryable());
        assert!(FsError::BackendUnavailable("down".into()).is_retryable());
        assert!(FsError::Backpressure.is_retryable());
    }

    #[test]
    fn test_store_errors_convert() {
        assert!(matches!(
            FsError::from(StoreError::Unavailable("timeout".into())),
            FsError::BackendUnavailable(_)
        ));
        assert!(matches!(
            FsError::from(StoreError::NotFound("k".into())),
            FsError::NotFound
        ));
        assert!(matches!(
            FsError::from(StoreError::PermissionDenied("k".into())),
            FsError::PermissionDenied(_)
        ));
    }
}
