//! Backend calls made by the translator, each wrapped in the retry policy.

use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::{ObjectStoreAdapter, StoreError};
use tracing::{debug, warn};

use crate::error::{FsError, Result};
use crate::index::{MetadataIndex, RemoteInode};
use crate::keys;
use crate::retry::RetryPolicy;
use crate::types::InodeId;

#[derive(Debug, Clone)]
pub(crate) struct Backend {
    store: Arc<dyn ObjectStoreAdapter>,
    retry: RetryPolicy,
}

impl Backend {
    pub fn new(store: Arc<dyn ObjectStoreAdapter>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    /// Contents of `key`, or `None` if it does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let store = &self.store;
        self.retry
            .run("get", move || async move {
                match store.get(key).await {
                    Ok(data) => Ok(Some(data)),
                    Err(StoreError::NotFound(_)) => Ok(None),
                    Err(e) => Err(FsError::from(e)),
                }
            })
            .await
    }

    /// Entity tag of `key`, or `None` if it does not exist or has none.
    pub async fn etag(&self, key: &str) -> Result<Option<String>> {
        let store = &self.store;
        self.retry
            .run("head", move || async move {
                match store.head(key).await {
                    Ok(meta) => Ok(meta.etag),
                    Err(StoreError::NotFound(_)) => Ok(None),
                    Err(e) => Err(FsError::from(e)),
                }
            })
            .await
    }

    pub async fn put(&self, key: &str, data: Bytes) -> Result<Option<String>> {
        let store = &self.store;
        self.retry
            .run("put", move || {
                let data = data.clone();
                async move { store.put(key, data).await.map_err(FsError::from) }
            })
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let store = &self.store;
        self.retry
            .run("delete", move || async move {
                store.delete(key).await.map_err(FsError::from)
            })
            .await
    }

    pub async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let store = &self.store;
        self.retry
            .run("list", move || async move {
                store
                    .list(prefix)
                    .try_collect::<Vec<_>>()
                    .await
                    .map_err(FsError::from)
            })
            .await
    }

    /// Fetch one data block. A missing block reads as empty.
    pub async fn get_block(&self, prefix: &str, index: u64) -> Result<Bytes> {
        Ok(self
            .get(&keys::block_key(prefix, index))
            .await?
            .unwrap_or_default())
    }

    /// Load the metadata of `id`.
    pub async fn load_meta(&self, id: InodeId) -> Result<Option<RemoteInode>> {
        let key = keys::meta_key(&keys::inode_prefix(id));
        match self.get(&key).await? {
            Some(bytes) => Ok(Some(RemoteInode::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Bring `id` up to date from the backend. A root that does not exist
    /// yet is created locally; any other missing inode is forgotten and
    /// reported as `NotFound`. Returns whether newer metadata was applied.
    pub async fn hydrate(&self, index: &MetadataIndex, id: InodeId) -> Result<bool> {
        match self.load_meta(id).await? {
            Some(remote) => {
                if remote.record.id != id {
                    return Err(FsError::BackendUnavailable(format!(
                        "meta for {} names inode {}",
                        id, remote.record.id
                    )));
                }
                Ok(index.refresh(remote))
            }
            None if id == InodeId::ROOT => {
                index.materialize_root();
                Ok(false)
            }
            None => {
                if index.is_dirty(id) {
                    // created here and not flushed yet
                    return Ok(false);
                }
                debug!(inode = %id, "inode metadata missing from backend");
                index.forget_missing(id);
                Err(FsError::NotFound)
            }
        }
    }

    /// Delete every object under `prefix`.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list(prefix).await?;
        for key in &keys {
            self.delete(key).await?;
        }
        Ok(keys.len())
    }

    /// Delete the data blocks under `prefix` with index `from` or higher.
    pub async fn delete_blocks_from(&self, prefix: &str, from: u64) -> Result<usize> {
        let mut deleted = 0;
        for key in self.list(prefix).await? {
            match keys::parse_block_key(prefix, &key) {
                Some(index) if index >= from => {
                    self.delete(&key).await?;
                    deleted += 1;
                }
                Some(_) => {}
                None if key == keys::meta_key(prefix) => {}
                None => warn!(key = %key, "ignoring unexpected object under inode prefix"),
            }
        }
        Ok(deleted)
    }
}
