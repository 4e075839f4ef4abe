//! Object storage adapter for ObjectFS
//!
//! This crate is the narrow boundary between the filesystem engine and the
//! remote object store. The engine only ever talks to an
//! [`ObjectStoreAdapter`]: a uniform `get`/`put`/`delete`/`list`/`head`
//! interface that every backend implements.
//!
//! # Backends
//!
//! - [`Storage`]: production adapter built on the `object_store` crate, able to
//!   target S3/MinIO, a local directory, or process memory
//!   (see [`ObjectStoreConfig`])
//! - [`MemoryStore`]: in-process adapter with fault injection and call
//!   counters, used by tests to simulate an unavailable or slow backend
//!
//! # Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use objectfs_object_store::{ObjectStoreAdapter, ObjectStoreConfig, Storage};
//!
//! # async fn example() -> Result<(), objectfs_object_store::StoreError> {
//! let storage = Storage::new(ObjectStoreConfig::Local {
//!     path: "/tmp/objectfs".into(),
//! })
//! .await?;
//!
//! storage.put("inodes/0000000000000001/meta", Bytes::from_static(b"{}")).await?;
//! let data = storage.get("inodes/0000000000000001/meta").await?;
//! assert_eq!(&data[..], b"{}");
//! # Ok(())
//! # }
//! ```

mod adapter;
mod error;
mod memory;
mod storage;

pub use adapter::{ObjectMeta, ObjectStoreAdapter};
pub use error::{Result, StoreError};
pub use memory::{CallCounts, MemoryStore};
pub use storage::{ObjectStoreConfig, Storage};
