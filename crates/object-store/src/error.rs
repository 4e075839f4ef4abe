use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by an object store adapter.
///
/// Only [`StoreError::Unavailable`] is transient; every other variant is fatal
/// to the operation that issued the call.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("invalid storage configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether the failed call may succeed if issued again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<object_store::Error> for StoreError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => StoreError::NotFound(path),
            object_store::Error::PermissionDenied { path, source } => {
                StoreError::PermissionDenied(format!("{}: {}", path, source))
            }
            object_store::Error::Unauthenticated { path, source } => {
                StoreError::PermissionDenied(format!("{}: {}", path, source))
            }
            object_store::Error::InvalidPath { source } => {
                StoreError::InvalidKey(source.to_string())
            }
            object_store::Error::UnknownConfigurationKey { store, key } => {
                StoreError::Config(format!("{}: unknown key {}", store, key))
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

impl From<object_store::path::Error> for StoreError {
    fn from(err: object_store::path::Error) -> Self {
        StoreError::InvalidKey(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(StoreError::Unavailable("timeout".into()).is_retryable());
        assert!(!StoreError::NotFound("k".into()).is_retryable());
        assert!(!StoreError::PermissionDenied("k".into()).is_retryable());
        assert!(!StoreError::InvalidKey("k".into()).is_retryable());
        assert!(!StoreError::Config("k".into()).is_retryable());
    }

    #[test]
    fn test_not_found_maps_through() {
        let err = object_store::Error::NotFound {
            path: "inodes/a/meta".to_string(),
            source: "missing".into(),
        };
        assert!(matches!(
            StoreError::from(err),
            StoreError::NotFound(path) if path == "inodes/a/meta"
        ));
    }
}
