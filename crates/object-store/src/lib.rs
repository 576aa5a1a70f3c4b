//! Passive blob storage for safebox
//!
//! A safe lives on a dumb shared store that can only list, read, write, stat
//! and delete named blobs. This crate provides that interface and the pieces
//! built directly on it:
//!
//! - [`BlobStore`]: the five-operation trait every backend adapts to
//! - [`Storage`]: an adapter over `object_store` (in-memory, local filesystem, S3/MinIO)
//! - [`Lock`]: a best-effort lease lock made of lock files and heartbeats
//! - [`Uploader`]: a bounded background queue for deferred writes
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use safebox_object_store::{BlobStore, ObjectStoreConfig, Storage};
//!
//! # async fn example() -> Result<(), safebox_object_store::BlobStoreError> {
//! let storage = Storage::new(ObjectStoreConfig::Local { path: "/tmp/safe".into() }).await?;
//! let store: Arc<dyn BlobStore> = Arc::new(storage.with_root("alice/demo"));
//! store.write("groups/0", bytes::Bytes::from_static(b"...")).await?;
//! # Ok(())
//! # }
//! ```

mod error;
mod lock;
mod storage;
mod store;
mod uploader;

pub use error::{BlobStoreError, Result};
pub use lock::{Lock, LockConfig, LockGuard, LOCK_DIR};
pub use storage::{ObjectStoreConfig, Storage};
pub use store::{BlobStore, Entry, Filter};
pub use uploader::{UploadConfig, Uploader};
