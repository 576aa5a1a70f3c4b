//! Object storage backend abstraction (S3/MinIO/local filesystem/memory).

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};

use crate::error::{BlobStoreError, Result};
use crate::store::{BlobStore, Entry, Filter};

/// Configuration for the object storage backend.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectStoreConfig {
    /// In-memory storage (for testing)
    #[default]
    Memory,

    /// Local filesystem storage
    Local {
        /// Path to the storage directory
        path: PathBuf,
    },

    /// S3-compatible storage (AWS S3, MinIO, etc.)
    S3 {
        /// S3 endpoint URL (e.g., "http://localhost:9000" for MinIO)
        endpoint: String,
        /// Access key ID
        access_key: String,
        /// Secret access key
        secret_key: String,
        /// Bucket name
        bucket: String,
        /// Optional region (defaults to "us-east-1")
        region: Option<String>,
    },
}

/// [`BlobStore`] adapter over any `object_store` backend.
///
/// Every name is resolved below an optional root, so several safes can live
/// in one bucket.
#[derive(Debug, Clone)]
pub struct Storage {
    inner: Arc<dyn ObjectStore>,
    root: Option<String>,
    id: String,
}

impl Storage {
    /// Create a new storage backend from configuration.
    pub async fn new(config: ObjectStoreConfig) -> Result<Self> {
        let (inner, id): (Arc<dyn ObjectStore>, String) = match &config {
            ObjectStoreConfig::Memory => (Arc::new(InMemory::new()), "memory".to_string()),

            ObjectStoreConfig::Local { path } => {
                tokio::fs::create_dir_all(path).await?;
                let store = LocalFileSystem::new_with_prefix(path)
                    .map_err(|e| BlobStoreError::InvalidConfig(e.to_string()))?;
                (Arc::new(store), format!("file://{}", path.display()))
            }

            ObjectStoreConfig::S3 {
                endpoint,
                access_key,
                secret_key,
                bucket,
                region,
            } => {
                let builder = AmazonS3Builder::new()
                    .with_endpoint(endpoint)
                    .with_access_key_id(access_key)
                    .with_secret_access_key(secret_key)
                    .with_bucket_name(bucket)
                    .with_region(region.as_deref().unwrap_or("us-east-1"))
                    .with_allow_http(endpoint.starts_with("http://"));

                let store: Arc<dyn ObjectStore> = Arc::new(
                    builder
                        .build()
                        .map_err(|e| BlobStoreError::InvalidConfig(e.to_string()))?,
                );

                // Fail fast if the bucket is missing
                {
                    use futures::TryStreamExt;
                    let mut stream = store.list(None);
                    match stream.try_next().await {
                        Ok(_) => {}
                        Err(object_store::Error::NotFound { .. }) => {
                            return Err(BlobStoreError::BucketNotFound(bucket.clone()));
                        }
                        Err(e) => {
                            let msg = e.to_string();
                            if msg.contains("NoSuchBucket")
                                || msg.contains("bucket") && msg.contains("not")
                            {
                                return Err(BlobStoreError::BucketNotFound(bucket.clone()));
                            }
                            return Err(e.into());
                        }
                    }
                }

                (store, format!("s3://{}", bucket))
            }
        };

        Ok(Self {
            inner,
            root: None,
            id,
        })
    }

    /// Create an in-memory storage backend.
    ///
    /// Clones share the same underlying memory, which is how tests simulate
    /// several peers on one store.
    pub fn memory() -> Self {
        Self {
            inner: Arc::new(InMemory::new()),
            root: None,
            id: "memory".to_string(),
        }
    }

    /// Resolve every name below `root`.
    pub fn with_root(mut self, root: &str) -> Self {
        let root = root.trim_matches('/');
        if root.is_empty() {
            return self;
        }
        self.id = format!("{}/{}", self.id, root);
        self.root = Some(match self.root.take() {
            Some(parent) => format!("{}/{}", parent, root),
            None => root.to_string(),
        });
        self
    }

    fn path(&self, name: &str) -> Result<ObjectPath> {
        let name = name.trim_matches('/');
        let full = match (&self.root, name.is_empty()) {
            (Some(root), true) => root.clone(),
            (Some(root), false) => format!("{}/{}", root, name),
            (None, _) => name.to_string(),
        };
        ObjectPath::parse(&full).map_err(|e| BlobStoreError::InvalidName(e.to_string()))
    }

    fn map_err(name: &str, err: object_store::Error) -> BlobStoreError {
        match err {
            object_store::Error::NotFound { .. } => BlobStoreError::NotFound(name.to_string()),
            e => e.into(),
        }
    }
}

#[async_trait]
impl BlobStore for Storage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn list(&self, dir: &str, filter: &Filter) -> Result<Vec<Entry>> {
        let prefix = self.path(dir)?;
        let prefix = (!prefix.as_ref().is_empty()).then_some(prefix);
        let listing = match self.inner.list_with_delimiter(prefix.as_ref()).await {
            Ok(listing) => listing,
            Err(object_store::Error::NotFound { .. }) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::with_capacity(listing.common_prefixes.len() + listing.objects.len());
        for folder in &listing.common_prefixes {
            if let Some(name) = folder.filename() {
                entries.push(Entry {
                    name: name.to_string(),
                    size: 0,
                    mod_time: DateTime::<Utc>::default(),
                    is_dir: true,
                });
            }
        }
        for meta in listing.objects {
            if let Some(name) = meta.location.filename() {
                entries.push(Entry {
                    name: name.to_string(),
                    size: meta.size as u64,
                    mod_time: meta.last_modified,
                    is_dir: false,
                });
            }
        }

        Ok(filter.apply(entries))
    }

    async fn read(&self, name: &str, range: Option<Range<u64>>) -> Result<Bytes> {
        let path = self.path(name)?;
        match range {
            Some(range) => self
                .inner
                .get_range(&path, range.start as usize..range.end as usize)
                .await
                .map_err(|e| Self::map_err(name, e)),
            None => {
                let result = self
                    .inner
                    .get(&path)
                    .await
                    .map_err(|e| Self::map_err(name, e))?;
                result.bytes().await.map_err(|e| Self::map_err(name, e))
            }
        }
    }

    async fn write(&self, name: &str, data: Bytes) -> Result<()> {
        let path = self.path(name)?;
        self.inner.put(&path, data.into()).await?;
        Ok(())
    }

    async fn stat(&self, name: &str) -> Result<Entry> {
        let path = self.path(name)?;
        let meta = self
            .inner
            .head(&path)
            .await
            .map_err(|e| Self::map_err(name, e))?;
        Ok(Entry {
            name: meta.location.filename().unwrap_or_default().to_string(),
            size: meta.size as u64,
            mod_time: meta.last_modified,
            is_dir: false,
        })
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.path(name)?;
        // Ignore NotFound errors - the blob may already be deleted
        match self.inner.delete(&path).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_write_read_stat_delete() {
        let storage = Storage::memory();
        let data = Bytes::from("hello blob");

        storage.write("dir/a", data.clone()).await.unwrap();
        assert_eq!(storage.read("dir/a", None).await.unwrap(), data);
        assert_eq!(
            storage.read("dir/a", Some(0..5)).await.unwrap(),
            Bytes::from("hello")
        );

        let stat = storage.stat("dir/a").await.unwrap();
        assert_eq!(stat.name, "a");
        assert_eq!(stat.size, data.len() as u64);

        storage.delete("dir/a").await.unwrap();
        assert!(storage.read("dir/a", None).await.unwrap_err().is_not_found());
        assert!(storage.stat("dir/a").await.unwrap_err().is_not_found());

        // Deleting twice is fine
        storage.delete("dir/a").await.unwrap();
    }

    #[tokio::test]
    async fn test_list_files_and_folders() {
        let storage = Storage::memory();
        for name in ["db/usr/0002", "db/usr/0001", "db/usr/.touch", "db/adm/0001"] {
            storage.write(name, Bytes::new()).await.unwrap();
        }

        let names: Vec<_> = storage
            .list("db/usr", &Filter::files())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["0001", "0002"]);

        let hidden = storage
            .list("db/usr", &Filter::files().hidden())
            .await
            .unwrap();
        assert_eq!(hidden.len(), 3);

        let folders = storage.list("db", &Filter::default()).await.unwrap();
        assert!(folders.iter().all(|e| e.is_dir));
        assert_eq!(folders.len(), 2);

        // Missing directories list as empty
        assert!(storage
            .list("nothing/here", &Filter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_root_isolates_safes() {
        let base = Storage::memory();
        let left = base.clone().with_root("alice/one");
        let right = base.clone().with_root("alice/two");

        left.write("groups/0", Bytes::from("left")).await.unwrap();
        assert!(right.read("groups/0", None).await.is_err());
        assert_eq!(
            base.read("alice/one/groups/0", None).await.unwrap(),
            Bytes::from("left")
        );
        assert_eq!(left.id(), "memory/alice/one");
    }

    #[tokio::test]
    async fn test_local_storage() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = ObjectStoreConfig::Local {
            path: temp_dir.path().to_path_buf(),
        };

        let storage = Storage::new(config).await.unwrap();
        storage
            .write("keys/usr/keystore", Bytes::from("test data"))
            .await
            .unwrap();
        assert_eq!(
            storage.read("keys/usr/keystore", None).await.unwrap(),
            Bytes::from("test data")
        );

        let file_path = temp_dir.path().join("keys").join("usr").join("keystore");
        assert!(file_path.exists());
    }
}
