//! `object_store`-backed adapter.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::adapter::{ObjectMeta, ObjectStoreAdapter};
use crate::error::{Result, StoreError};

/// Backend selection for [`Storage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectStoreConfig {
    /// S3 or any S3-compatible service (MinIO, R2, ...)
    S3 {
        endpoint: String,
        access_key: String,
        secret_key: String,
        bucket: String,
        region: Option<String>,
    },
    /// A directory on the local filesystem
    Local { path: PathBuf },
    /// Process memory; contents are lost on drop
    Memory,
}

/// Adapter over any `object_store` backend.
#[derive(Debug, Clone)]
pub struct Storage {
    inner: Arc<dyn ObjectStore>,
}

impl Storage {
    /// Build the backend described by `config`.
    pub async fn new(config: ObjectStoreConfig) -> Result<Self> {
        let inner: Arc<dyn ObjectStore> = match config {
            ObjectStoreConfig::S3 {
                endpoint,
                access_key,
                secret_key,
                bucket,
                region,
            } => {
                info!(endpoint = %endpoint, bucket = %bucket, "connecting to s3 storage");
                let store = AmazonS3Builder::new()
                    .with_endpoint(&endpoint)
                    .with_access_key_id(&access_key)
                    .with_secret_access_key(&secret_key)
                    .with_bucket_name(&bucket)
                    .with_region(region.as_deref().unwrap_or("us-east-1"))
                    .with_allow_http(endpoint.starts_with("http://"))
                    .build()
                    .map_err(|e| StoreError::Config(e.to_string()))?;
                Arc::new(store)
            }
            ObjectStoreConfig::Local { path } => {
                info!(path = %path.display(), "using local object storage");
                tokio::fs::create_dir_all(&path)
                    .await
                    .map_err(|e| StoreError::Config(format!("{}: {}", path.display(), e)))?;
                let store = LocalFileSystem::new_with_prefix(&path)
                    .map_err(|e| StoreError::Config(e.to_string()))?;
                Arc::new(store)
            }
            ObjectStoreConfig::Memory => Arc::new(InMemory::new()),
        };
        Ok(Self { inner })
    }

    /// Wrap an already constructed `object_store` backend.
    pub fn from_store(inner: Arc<dyn ObjectStore>) -> Self {
        Self { inner }
    }

    fn path(key: &str) -> Result<Path> {
        Ok(Path::parse(key)?)
    }
}

#[async_trait]
impl ObjectStoreAdapter for Storage {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let path = Self::path(key)?;
        let result = self.inner.get(&path).await?;
        let data = result.bytes().await?;
        debug!(key = %key, size = data.len(), "fetched object");
        Ok(data)
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<Option<String>> {
        let path = Self::path(key)?;
        let size = data.len();
        let result = self.inner.put(&path, data.into()).await?;
        debug!(key = %key, size = size, "stored object");
        Ok(result.e_tag)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = Self::path(key)?;
        match self.inner.delete(&path).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list<'a>(&'a self, prefix: &str) -> BoxStream<'a, Result<String>> {
        let prefix = Path::from(prefix.trim_end_matches('/'));
        self.inner
            .list(Some(&prefix))
            .map(|meta| {
                meta.map(|m| m.location.to_string())
                    .map_err(StoreError::from)
            })
            .boxed()
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        let path = Self::path(key)?;
        let meta = self.inner.head(&path).await?;
        Ok(ObjectMeta {
            size: meta.size as u64,
            etag: meta.e_tag,
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;
    use tempfile::TempDir;

    use super::*;

    #[tokio::test]
    async fn test_local_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(ObjectStoreConfig::Local {
            path: dir.path().join("objects"),
        })
        .await
        .unwrap();

        storage
            .put("inodes/01/b00", Bytes::from_static(b"block"))
            .await
            .unwrap();
        assert_eq!(&storage.get("inodes/01/b00").await.unwrap()[..], b"block");
        assert_eq!(storage.head("inodes/01/b00").await.unwrap().size, 5);

        storage.delete("inodes/01/b00").await.unwrap();
        assert!(matches!(
            storage.get("inodes/01/b00").await,
            Err(StoreError::NotFound(_))
        ));
        // deleting twice is fine
        storage.delete("inodes/01/b00").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let storage = Storage::new(ObjectStoreConfig::Memory).await.unwrap();
        for key in ["inodes/01/meta", "inodes/01/b00", "inodes/02/meta"] {
            storage.put(key, Bytes::from_static(b"x")).await.unwrap();
        }

        let mut keys: Vec<String> = storage.list("inodes/01/").try_collect().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["inodes/01/b00", "inodes/01/meta"]);
    }

    #[test]
    fn test_config_tagged_shape() {
        let config: ObjectStoreConfig =
            serde_json::from_str(r#"{"type":"local","path":"/var/lib/objectfs"}"#).unwrap();
        assert_eq!(
            config,
            ObjectStoreConfig::Local {
                path: PathBuf::from("/var/lib/objectfs")
            }
        );
    }
}
