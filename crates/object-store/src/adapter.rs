use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::Result;

/// Size and entity tag of a stored object, as reported by `head`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
    pub etag: Option<String>,
}

/// Uniform interface over an object storage backend.
///
/// Every call may fail with [`StoreError::Unavailable`](crate::StoreError::Unavailable)
/// (retryable) or [`StoreError::PermissionDenied`](crate::StoreError::PermissionDenied)
/// (fatal). Implementations must be safe to share across tasks.
#[async_trait]
pub trait ObjectStoreAdapter: std::fmt::Debug + Send + Sync {
    /// Fetch the full contents of `key`.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Store `data` under `key`, replacing any previous object.
    ///
    /// Returns the new entity tag when the backend reports one.
    async fn put(&self, key: &str, data: Bytes) -> Result<Option<String>>;

    /// Delete `key`. Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Lazily list every key under `prefix`.
    fn list<'a>(&'a self, prefix: &str) -> BoxStream<'a, Result<String>>;

    /// Fetch size and entity tag for `key` without its contents.
    async fn head(&self, key: &str) -> Result<ObjectMeta>;
}
