//! In-process adapter with fault injection.
//!
//! [`MemoryStore`] behaves like a strongly consistent object store living in
//! process memory. Tests can take it offline, make the next N calls fail,
//! deny access, or slow every call down, and read back how many calls of
//! each kind were issued.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};

use crate::adapter::{ObjectMeta, ObjectStoreAdapter};
use crate::error::{Result, StoreError};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    etag: String,
}

/// Number of calls issued against a [`MemoryStore`], per operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub gets: u64,
    pub puts: u64,
    pub deletes: u64,
    pub lists: u64,
    pub heads: u64,
}

#[derive(Debug, Default)]
struct Counters {
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    lists: AtomicU64,
    heads: AtomicU64,
}

/// Shareable in-memory object store. Clones see the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    objects: RwLock<BTreeMap<String, StoredObject>>,
    next_etag: AtomicU64,
    offline: AtomicBool,
    denied: AtomicBool,
    fail_next: AtomicUsize,
    latency: Mutex<Option<Duration>>,
    counters: Counters,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the backend offline (`false`) or bring it back (`true`).
    pub fn set_available(&self, available: bool) {
        self.inner.offline.store(!available, Ordering::SeqCst);
    }

    /// Make every call fail with `PermissionDenied` while set.
    pub fn set_permission_denied(&self, denied: bool) {
        self.inner.denied.store(denied, Ordering::SeqCst);
    }

    /// Fail the next `n` calls with `Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.inner.latency.lock() = latency;
    }

    /* Getters */

    pub fn calls(&self) -> CallCounts {
        let c = &self.inner.counters;
        CallCounts {
            gets: c.gets.load(Ordering::SeqCst),
            puts: c.puts.load(Ordering::SeqCst),
            deletes: c.deletes.load(Ordering::SeqCst),
            lists: c.lists.load(Ordering::SeqCst),
            heads: c.heads.load(Ordering::SeqCst),
        }
    }

    /// Contents of `key`, bypassing fault injection and counters.
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.inner.objects.read().get(key).map(|o| o.data.clone())
    }

    /// All stored keys in order, bypassing fault injection and counters.
    pub fn keys(&self) -> Vec<String> {
        self.inner.objects.read().keys().cloned().collect()
    }

    /// Store `data` directly, as if another writer had put it.
    pub fn insert_raw(&self, key: &str, data: Bytes) -> String {
        self.store(key, data)
    }

    fn store(&self, key: &str, data: Bytes) -> String {
        let etag = format!(
            "\"{}\"",
            self.inner.next_etag.fetch_add(1, Ordering::SeqCst) + 1
        );
        self.inner.objects.write().insert(
            key.to_string(),
            StoredObject {
                data,
                etag: etag.clone(),
            },
        );
        etag
    }

    fn check(&self, key: &str) -> Result<()> {
        if self.inner.denied.load(Ordering::SeqCst) {
            return Err(StoreError::PermissionDenied(key.to_string()));
        }
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{}: backend offline", key)));
        }
        let injected = self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable(format!("{}: injected failure", key)));
        }
        Ok(())
    }

    async fn delay(&self) {
        let latency = *self.inner.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ObjectStoreAdapter for MemoryStore {
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.inner.counters.gets.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        self.check(key)?;
        self.object(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<Option<String>> {
        self.inner.counters.puts.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        self.check(key)?;
        Ok(Some(self.store(key, data)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.counters.deletes.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        self.check(key)?;
        self.inner.objects.write().remove(key);
        Ok(())
    }

    fn list<'a>(&'a self, prefix: &str) -> BoxStream<'a, Result<String>> {
        self.inner.counters.lists.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.check(prefix) {
            return stream::iter(vec![Err(e)]).boxed();
        }
        let keys: Vec<Result<String>> = self
            .inner
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| Ok(k.clone()))
            .collect();
        stream::iter(keys).boxed()
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        self.inner.counters.heads.fetch_add(1, Ordering::SeqCst);
        self.delay().await;
        self.check(key)?;
        self.inner
            .objects
            .read()
            .get(key)
            .map(|o| ObjectMeta {
                size: o.data.len() as u64,
                etag: Some(o.etag.clone()),
            })
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }
}
