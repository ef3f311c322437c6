use std::collections::HashMap;

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::RwLock,
};

use storage_driver::{
    Driver, Metadata, ObjectStream, Reader, StorageError, StorageErrorKind, UploadOptions, Writer,
};

const NAME: &str = "memory";

#[derive(Debug, Clone)]
struct MemoryObject {
    created: DateTime<Utc>,
    content_type: Option<String>,
    data: Bytes,
}

impl From<&MemoryObject> for Metadata {
    fn from(value: &MemoryObject) -> Self {
        Self {
            created: value.created,
            size: value.data.len() as u64,
            content_type: value.content_type.clone(),
        }
    }
}

/// Storage driver that keeps objects in memory, for `mem://` caches and tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    buckets: RwLock<HashMap<String, HashMap<Utf8PathBuf, MemoryObject>>>,
}

impl MemoryStorage {
    /// Create a new `MemoryStorage` instance, with no buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new `MemoryStorage` instance, with the given buckets.
    pub fn with_buckets(buckets: &[&str]) -> Self {
        let map = buckets
            .iter()
            .map(|bucket| (bucket.to_string(), HashMap::new()))
            .collect();

        Self {
            buckets: RwLock::new(map),
        }
    }

    /// Create a new bucket in the storage.
    pub async fn create_bucket(&self, bucket: String) {
        let mut buckets = self.buckets.write().await;
        buckets.entry(bucket).or_default();
    }

    async fn object(&self, bucket: &str, remote: &Utf8Path) -> Result<MemoryObject, StorageError> {
        let buckets = self.buckets.read().await;
        buckets
            .get(bucket)
            .and_then(|objects| objects.get(remote))
            .cloned()
            .ok_or_else(|| StorageError::not_found(NAME, bucket, remote))
    }
}

#[async_trait::async_trait]
impl Driver for MemoryStorage {
    fn name(&self) -> &'static str {
        NAME
    }

    fn scheme(&self) -> &str {
        "mem"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        Ok((&self.object(bucket, remote).await?).into())
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let mut buckets = self.buckets.write().await;
        let objects = buckets.get_mut(bucket).ok_or_else(|| {
            StorageError::builder(
                NAME,
                StorageErrorKind::NotFound,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("bucket not found: {bucket}"),
                ),
            )
            .bucket(bucket)
            .build()
        })?;
        objects.remove(remote);

        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
        options: &UploadOptions,
    ) -> Result<(), StorageError> {
        let mut buf = Vec::new();
        local
            .read_to_end(&mut buf)
            .await
            .map_err(|err| StorageError::from_io(NAME, err))?;

        if let Some(expected) = options.content_length {
            if buf.len() as u64 != expected {
                return Err(StorageError::builder(
                    NAME,
                    StorageErrorKind::InvalidRequest,
                    format!("expected {expected} bytes, read {}", buf.len()),
                )
                .bucket(bucket)
                .path(remote.as_str())
                .build());
            }
        }

        let object = MemoryObject {
            created: Utc::now(),
            content_type: options.content_type.clone(),
            data: buf.into(),
        };

        let mut buckets = self.buckets.write().await;
        buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(remote.to_owned(), object);

        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let object = self.object(bucket, remote).await?;

        local
            .write_all(&object.data)
            .await
            .map_err(|err| StorageError::from_io(NAME, err))?;

        local
            .flush()
            .await
            .map_err(|err| StorageError::from_io(NAME, err))?;

        Ok(())
    }

    async fn open(&self, bucket: &str, remote: &Utf8Path) -> Result<ObjectStream, StorageError> {
        let object = self.object(bucket, remote).await?;
        Ok(Box::pin(std::io::Cursor::new(object.data)))
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        tracing::trace!(%bucket, ?prefix, "list memory bucket");

        let buckets = self.buckets.read().await;
        let Some(objects) = buckets.get(bucket) else {
            return Ok(Vec::new());
        };

        let prefix = prefix.map(Utf8Path::as_str).unwrap_or_default();
        Ok(objects
            .keys()
            .map(|path| path.to_string())
            .filter(|path| path.starts_with(prefix))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_objects_with_content_type() {
        let storage = MemoryStorage::new();
        let key = Utf8Path::new("manifests/sha256:1");
        let mut body: &[u8] = b"{}";
        storage
            .upload(
                "",
                key,
                &mut body,
                &UploadOptions::new().content_type("application/vnd.oci.image.manifest.v1+json"),
            )
            .await
            .unwrap();

        let metadata = storage.metadata("", key).await.unwrap();
        assert_eq!(metadata.size, 2);
        assert_eq!(
            metadata.content_type.as_deref(),
            Some("application/vnd.oci.image.manifest.v1+json")
        );

        let mut out = Vec::new();
        storage.download("", key, &mut out).await.unwrap();
        assert_eq!(out, b"{}");
    }

    #[tokio::test]
    async fn missing_bucket_and_object_are_not_found() {
        let storage = MemoryStorage::with_buckets(&["cache"]);
        let err = storage
            .metadata("cache", Utf8Path::new("blobs/x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::NotFound);

        let err = storage
            .metadata("other", Utf8Path::new("blobs/x"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::NotFound);
        assert!(!storage.exists("other", Utf8Path::new("blobs/x")).await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_by_prefix() {
        let storage = MemoryStorage::new();
        for key in ["blobs/a", "blobs/b", "manifests/c"] {
            let mut body: &[u8] = b"x";
            storage
                .upload("", Utf8Path::new(key), &mut body, &UploadOptions::new())
                .await
                .unwrap();
        }

        let mut blobs = storage.list("", Some(Utf8Path::new("blobs"))).await.unwrap();
        blobs.sort();
        assert_eq!(blobs, vec!["blobs/a".to_owned(), "blobs/b".to_owned()]);
    }
}
