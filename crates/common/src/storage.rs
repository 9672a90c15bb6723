//! Blob storage abstraction for proof artifacts.
//!
//! Supports both local filesystem and S3-compatible object storage. Keys are
//! flat artifact file names (`<participant id>_<n>.<ext>`), so the same name
//! addresses the local copy and the remote object.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::{StorageBackendKind, StorageSettings};
use crate::{AppError, AppResult};

/// Metadata about a stored blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    /// Object key.
    pub key: String,
    /// Size in bytes.
    pub size: u64,
    /// MD5 hash of the content.
    pub md5: String,
}

/// Blob store backend trait.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload the file at `source` under `key`, replacing any existing object.
    async fn put_file(&self, key: &str, source: &Path) -> AppResult<StoredBlob>;

    /// Download `key` into `dest`, returning the number of bytes written.
    async fn get_to_file(&self, key: &str, dest: &Path) -> AppResult<u64>;

    /// List every key in the store.
    async fn list_keys(&self) -> AppResult<Vec<String>>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> AppResult<()>;

    /// Check if a key exists.
    async fn exists(&self, key: &str) -> AppResult<bool>;
}

/// Shared handle to a blob store.
pub type SharedBlobStore = Arc<dyn BlobStore>;

/// Reject keys that could escape the store's namespace.
pub fn validate_key(key: &str) -> AppResult<()> {
    if key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\'])
        || key.contains("..")
    {
        return Err(AppError::Storage(format!("Invalid blob key: {key:?}")));
    }
    Ok(())
}

async fn write_atomically(dest: &Path, data: &[u8]) -> AppResult<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to create directory: {e}")))?;
    }
    let mut tmp = dest.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, data)
        .await
        .map_err(|e| AppError::Storage(format!("Failed to write file: {e}")))?;
    tokio::fs::rename(&tmp, dest)
        .await
        .map_err(|e| AppError::Storage(format!("Failed to move file into place: {e}")))?;
    Ok(())
}

/// Local filesystem blob store.
pub struct LocalBlobStore {
    base_path: PathBuf,
}

impl LocalBlobStore {
    /// Create a new local blob store rooted at `base_path`.
    #[must_use]
    pub const fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn path_for(&self, key: &str) -> AppResult<PathBuf> {
        validate_key(key)?;
        Ok(self.base_path.join(key))
    }
}

#[async_trait::async_trait]
impl BlobStore for LocalBlobStore {
    async fn put_file(&self, key: &str, source: &Path) -> AppResult<StoredBlob> {
        let path = self.path_for(key)?;
        let data = tokio::fs::read(source)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to read {}: {e}", source.display())))?;

        write_atomically(&path, &data).await?;

        Ok(StoredBlob {
            key: key.to_string(),
            size: data.len() as u64,
            md5: format!("{:x}", md5::compute(&data)),
        })
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> AppResult<u64> {
        let path = self.path_for(key)?;
        let data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(AppError::NotFound(format!("Blob {key}")));
            }
            Err(e) => return Err(AppError::Storage(format!("Failed to read blob {key}: {e}"))),
        };
        write_atomically(dest, &data).await?;
        Ok(data.len() as u64)
    }

    async fn list_keys(&self) -> AppResult<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(AppError::Storage(format!("Failed to list blobs: {e}"))),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| AppError::Storage(format!("Failed to list blobs: {e}")))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            // In-flight writes.
            if name.ends_with(".part") {
                continue;
            }
            keys.push(name);
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!("Failed to delete blob {key}: {e}"))),
        }
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }
}

/// S3-compatible object storage backend.
#[cfg(feature = "s3")]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: Option<String>,
}

#[cfg(feature = "s3")]
impl S3BlobStore {
    /// Create a new S3 blob store.
    #[must_use]
    pub fn new(
        endpoint: &str,
        bucket: String,
        region: &str,
        access_key_id: &str,
        secret_access_key: &str,
        prefix: Option<String>,
    ) -> Self {
        use aws_config::Region;
        use aws_sdk_s3::config::Credentials;

        let credentials =
            Credentials::new(access_key_id, secret_access_key, None, None, "proofbot");

        let config = aws_sdk_s3::Config::builder()
            .endpoint_url(endpoint)
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            client: aws_sdk_s3::Client::from_conf(config),
            bucket,
            prefix,
        }
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{}/{}", prefix.trim_end_matches('/'), key),
            None => key.to_string(),
        }
    }

    fn strip_prefix<'a>(&self, full_key: &'a str) -> &'a str {
        match &self.prefix {
            Some(prefix) => full_key
                .strip_prefix(prefix.trim_end_matches('/'))
                .map_or(full_key, |rest| rest.trim_start_matches('/')),
            None => full_key,
        }
    }
}

#[cfg(feature = "s3")]
#[async_trait::async_trait]
impl BlobStore for S3BlobStore {
    async fn put_file(&self, key: &str, source: &Path) -> AppResult<StoredBlob> {
        use aws_sdk_s3::primitives::ByteStream;

        validate_key(key)?;
        let data = tokio::fs::read(source)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to read {}: {e}", source.display())))?;
        let md5 = format!("{:x}", md5::compute(&data));
        let size = data.len() as u64;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("S3 upload failed: {e}")))?;

        Ok(StoredBlob {
            key: key.to_string(),
            size,
            md5,
        })
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> AppResult<u64> {
        validate_key(key)?;
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| {
                if e.to_string().contains("NoSuchKey") {
                    AppError::NotFound(format!("Blob {key}"))
                } else {
                    AppError::Storage(format!("S3 download failed: {e}"))
                }
            })?;
        let data = object
            .body
            .collect()
            .await
            .map_err(|e| AppError::Storage(format!("S3 download interrupted: {e}")))?
            .into_bytes();

        write_atomically(dest, &data).await?;
        Ok(data.len() as u64)
    }

    async fn list_keys(&self) -> AppResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .set_prefix(self.prefix.clone())
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| AppError::Storage(format!("S3 list failed: {e}")))?;
            for object in page.contents() {
                if let Some(full_key) = object.key() {
                    keys.push(self.strip_prefix(full_key).to_string());
                }
            }
        }
        Ok(keys)
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        validate_key(key)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|e| AppError::Storage(format!("S3 delete failed: {e}")))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        validate_key(key)?;
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.to_string().contains("NotFound") || e.to_string().contains("404") {
                    Ok(false)
                } else {
                    Err(AppError::Storage(format!("S3 head_object failed: {e}")))
                }
            }
        }
    }
}

/// Build the configured blob store.
pub fn build_blob_store(settings: &StorageSettings) -> AppResult<SharedBlobStore> {
    match settings.backend {
        StorageBackendKind::Local => Ok(Arc::new(LocalBlobStore::new(
            settings.local_path.clone(),
        ))),
        #[cfg(feature = "s3")]
        StorageBackendKind::S3 => {
            let required = |value: &Option<String>, name: &str| {
                value
                    .clone()
                    .ok_or_else(|| AppError::Config(format!("storage.{name} is required for s3")))
            };
            Ok(Arc::new(S3BlobStore::new(
                &required(&settings.endpoint, "endpoint")?,
                required(&settings.bucket, "bucket")?,
                &required(&settings.region, "region")?,
                &required(&settings.access_key_id, "access_key_id")?,
                &required(&settings.secret_access_key, "secret_access_key")?,
                settings.prefix.clone(),
            )))
        }
        #[cfg(not(feature = "s3"))]
        StorageBackendKind::S3 => Err(AppError::Config(
            "storage.backend = \"s3\" requires the `s3` feature".to_string(),
        )),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("123_1.png").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("a/b.png").is_err());
        assert!(validate_key(".hidden").is_err());
    }

    #[tokio::test]
    async fn test_local_put_get_list_delete() {
        let blobs = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(blobs.path().to_path_buf());

        let source = scratch.path().join("upload.png");
        tokio::fs::write(&source, b"png-bytes").await.unwrap();

        let stored = store.put_file("42_1.png", &source).await.unwrap();
        assert_eq!(stored.size, 9);
        assert_eq!(stored.md5, format!("{:x}", md5::compute(b"png-bytes")));
        assert!(store.exists("42_1.png").await.unwrap());
        assert_eq!(store.list_keys().await.unwrap(), vec!["42_1.png".to_string()]);

        let dest = scratch.path().join("restored").join("42_1.png");
        let written = store.get_to_file("42_1.png", &dest).await.unwrap();
        assert_eq!(written, 9);
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"png-bytes");

        store.delete("42_1.png").await.unwrap();
        store.delete("42_1.png").await.unwrap();
        assert!(!store.exists("42_1.png").await.unwrap());
    }

    #[tokio::test]
    async fn test_local_get_missing_is_not_found() {
        let blobs = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(blobs.path().to_path_buf());
        let dest = blobs.path().join("out.bin");

        let err = store.get_to_file("missing.png", &dest).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_list_keys_on_missing_dir_is_empty() {
        let store = LocalBlobStore::new(PathBuf::from("/nonexistent/proofbot/blobs"));
        assert!(store.list_keys().await.unwrap().is_empty());
    }
}
