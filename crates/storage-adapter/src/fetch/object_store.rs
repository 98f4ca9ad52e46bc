//! Object store fetcher
//!
//! The transport is behind [`ObjectStoreClient`]; this module only knows how
//! to turn a single-object or prefix locator into files on disk. A prefix is
//! mirrored relative to itself and fails as a whole if any object fails.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use async_trait::async_trait;
use tracing::{debug, info};
use walkdir::WalkDir;

use common::error::{Error, FetchError, Result};
use common::utils::format_bytes;
use crate::filesystem::is_safe_relative;
use crate::key::ObjectStoreLocator;

/// One object returned by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    /// Full object key
    pub key: String,
    /// Size reported by the listing, if any
    pub size: Option<u64>,
}

/// Result of downloading one object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectDownload {
    /// Bytes written to the destination file
    pub bytes_written: u64,
    /// Length the store declared for the object, if any
    pub content_length: Option<u64>,
}

/// Capability interface for object storage backends
#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// Downloads one object into a new file at `dest`
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
    ) -> std::result::Result<ObjectDownload, FetchError>;

    /// Lists every object whose key starts with `prefix`
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> std::result::Result<Vec<ObjectSummary>, FetchError>;
}

/// Fetcher for object store locators
#[derive(Clone)]
pub struct ObjectStoreFetcher {
    client: Arc<dyn ObjectStoreClient>,
}

impl ObjectStoreFetcher {
    pub fn new(client: Arc<dyn ObjectStoreClient>) -> Self {
        Self { client }
    }

    /// Fetches the locator into `dest`, returning the bytes written
    pub async fn fetch(&self, locator: &ObjectStoreLocator, dest: &Path) -> Result<u64> {
        match locator {
            ObjectStoreLocator::Object { bucket, key } => {
                let bytes = self.get_checked(bucket, key, None, dest).await?;
                Ok(bytes)
            }
            ObjectStoreLocator::Prefix { bucket, prefix } => {
                let objects = self.client.list_objects(bucket, prefix).await?;
                let objects: Vec<_> = objects
                    .into_iter()
                    .filter(|o| !o.key.ends_with('/'))
                    .collect();

                if objects.is_empty() {
                    return Err(FetchError::not_found(format!(
                        "s3://{}/{}: no objects under prefix",
                        bucket, prefix
                    ))
                    .into());
                }

                tokio::fs::create_dir_all(dest).await?;

                let mut total = 0u64;
                for object in &objects {
                    let relative = object.key.strip_prefix(prefix.as_str()).ok_or_else(|| {
                        Error::Internal(format!(
                            "listing for '{}' returned foreign key '{}'",
                            prefix, object.key
                        ))
                    })?;
                    if !is_safe_relative(relative) {
                        return Err(Error::InvalidArgument(format!(
                            "object key '{}' escapes its prefix",
                            object.key
                        )));
                    }

                    let target = dest.join(relative);
                    total += self.get_checked(bucket, &object.key, object.size, &target).await?;
                }

                info!(
                    source = %format!("s3://{}/{}", bucket, prefix),
                    objects = objects.len(),
                    size = %format_bytes(total),
                    "downloaded prefix"
                );
                Ok(total)
            }
        }
    }

    /// Downloads one object and validates its size
    async fn get_checked(
        &self,
        bucket: &str,
        key: &str,
        listed_size: Option<u64>,
        dest: &Path,
    ) -> std::result::Result<u64, FetchError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::partial_write(format!("s3://{}/{}: {}", bucket, key, e)))?;
        }

        let download = self.client.get_object(bucket, key, dest).await?;

        for expected in [download.content_length, listed_size].into_iter().flatten() {
            if expected != download.bytes_written {
                return Err(FetchError::partial_write(format!(
                    "s3://{}/{}: expected {} bytes, received {}",
                    bucket, key, expected, download.bytes_written
                )));
            }
        }

        debug!(bucket, key, bytes = download.bytes_written, "object downloaded");
        Ok(download.bytes_written)
    }
}

/// Object store backed by a mounted directory, one subdirectory per bucket
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> std::result::Result<PathBuf, FetchError> {
        if !is_safe_relative(bucket) || bucket.contains('/') || !is_safe_relative(key) {
            return Err(FetchError::not_found(format!("s3://{}/{}: invalid object path", bucket, key)));
        }
        Ok(self.root.join(bucket).join(key))
    }
}

fn map_io(err: std::io::Error, context: String) -> FetchError {
    match err.kind() {
        std::io::ErrorKind::NotFound => FetchError::not_found(context),
        std::io::ErrorKind::PermissionDenied => FetchError::unauthorized(context),
        _ => FetchError::partial_write(format!("{}: {}", context, err)),
    }
}

#[async_trait]
impl ObjectStoreClient for FsObjectStore {
    async fn get_object(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
    ) -> std::result::Result<ObjectDownload, FetchError> {
        let source = self.object_path(bucket, key)?;
        let context = format!("s3://{}/{}", bucket, key);

        let metadata = tokio::fs::metadata(&source)
            .await
            .map_err(|e| map_io(e, context.clone()))?;
        if !metadata.is_file() {
            return Err(FetchError::not_found(context));
        }

        let bytes_written = tokio::fs::copy(&source, dest)
            .await
            .map_err(|e| map_io(e, context))?;

        Ok(ObjectDownload {
            bytes_written,
            content_length: Some(metadata.len()),
        })
    }

    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> std::result::Result<Vec<ObjectSummary>, FetchError> {
        let bucket_dir = self.root.join(bucket);
        let prefix = prefix.to_string();
        let context = format!("s3://{}/{}", bucket, prefix);

        tokio::task::spawn_blocking(move || {
            if !bucket_dir.is_dir() {
                return Err(FetchError::not_found(format!("{}: no such bucket", context)));
            }

            let mut objects = Vec::new();
            for entry in WalkDir::new(&bucket_dir).sort_by_file_name() {
                let entry = entry.map_err(|e| FetchError::transient(format!("{}: {}", context, e)))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = match entry.path().strip_prefix(&bucket_dir) {
                    Ok(relative) => relative,
                    Err(_) => continue,
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(&prefix) {
                    let size = entry.metadata().ok().map(|m| m.len());
                    objects.push(ObjectSummary { key, size });
                }
            }
            Ok(objects)
        })
        .await
        .map_err(|e| FetchError::transient(format!("listing task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::error::FetchErrorKind;

    fn mounted_store() -> (tempfile::TempDir, FsObjectStore) {
        let root = tempfile::tempdir().unwrap();
        let bucket = root.path().join("weights");
        std::fs::create_dir_all(bucket.join("clf/v1/sub")).unwrap();
        std::fs::write(bucket.join("clf/v1/model.pt"), vec![7u8; 12]).unwrap();
        std::fs::write(bucket.join("clf/v1/sub/vocab.txt"), b"abc").unwrap();
        std::fs::write(bucket.join("other.bin"), b"zz").unwrap();
        let store = FsObjectStore::new(root.path());
        (root, store)
    }

    #[tokio::test]
    async fn test_single_object() {
        let (_root, store) = mounted_store();
        let fetcher = ObjectStoreFetcher::new(Arc::new(store));
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("payload");

        let locator = ObjectStoreLocator::Object {
            bucket: "weights".to_string(),
            key: "clf/v1/model.pt".to_string(),
        };
        assert_eq!(fetcher.fetch(&locator, &dest).await.unwrap(), 12);
        assert_eq!(std::fs::read(&dest).unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_prefix_mirrors_layout() {
        let (_root, store) = mounted_store();
        let fetcher = ObjectStoreFetcher::new(Arc::new(store));
        let out = tempfile::tempdir().unwrap();
        let dest = out.path().join("payload");

        let locator = ObjectStoreLocator::Prefix {
            bucket: "weights".to_string(),
            prefix: "clf/v1/".to_string(),
        };
        assert_eq!(fetcher.fetch(&locator, &dest).await.unwrap(), 15);
        assert!(dest.join("model.pt").is_file());
        assert!(dest.join("sub/vocab.txt").is_file());
        assert!(!dest.join("other.bin").exists());
    }

    #[tokio::test]
    async fn test_missing_object_and_empty_prefix() {
        let (_root, store) = mounted_store();
        let fetcher = ObjectStoreFetcher::new(Arc::new(store));
        let out = tempfile::tempdir().unwrap();

        let missing = ObjectStoreLocator::Object {
            bucket: "weights".to_string(),
            key: "nope.pt".to_string(),
        };
        let err = fetcher.fetch(&missing, &out.path().join("a")).await.unwrap_err();
        assert_eq!(err.fetch_kind(), Some(FetchErrorKind::NotFound));

        let empty = ObjectStoreLocator::Prefix {
            bucket: "weights".to_string(),
            prefix: "nothing/".to_string(),
        };
        let err = fetcher.fetch(&empty, &out.path().join("b")).await.unwrap_err();
        assert_eq!(err.fetch_kind(), Some(FetchErrorKind::NotFound));
    }

    struct ShortStore;

    #[async_trait]
    impl ObjectStoreClient for ShortStore {
        async fn get_object(
            &self,
            _bucket: &str,
            _key: &str,
            dest: &Path,
        ) -> std::result::Result<ObjectDownload, FetchError> {
            tokio::fs::write(dest, b"half").await.unwrap();
            Ok(ObjectDownload {
                bytes_written: 4,
                content_length: Some(8),
            })
        }

        async fn list_objects(
            &self,
            _bucket: &str,
            _prefix: &str,
        ) -> std::result::Result<Vec<ObjectSummary>, FetchError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_content_length_mismatch_is_partial_write() {
        let fetcher = ObjectStoreFetcher::new(Arc::new(ShortStore));
        let out = tempfile::tempdir().unwrap();
        let locator = ObjectStoreLocator::Object {
            bucket: "b".to_string(),
            key: "k".to_string(),
        };
        let err = fetcher.fetch(&locator, &out.path().join("k")).await.unwrap_err();
        assert_eq!(err.fetch_kind(), Some(FetchErrorKind::PartialWrite));
    }
}
