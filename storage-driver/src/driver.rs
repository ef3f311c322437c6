#![allow(clippy::needless_pass_by_ref_mut)]

use std::{fmt, ops::Deref, pin::Pin, sync::Arc, time::Duration};

use camino::Utf8Path;
use chrono::{DateTime, Utc};
use eyre::{eyre, WrapErr};
use http::Uri;
use tokio::io::{self, AsyncWriteExt};

use crate::error::{StorageError, StorageErrorKind};

/// A reader stream for file contents.
pub type Reader<'r> = dyn io::AsyncBufRead + Unpin + Send + Sync + 'r;

/// A writer stream for file contents.
pub type Writer<'w> = dyn io::AsyncWrite + Unpin + Send + Sync + 'w;

/// An owned stream over the contents of a stored object.
pub type ObjectStream = Pin<Box<dyn io::AsyncRead + Send + 'static>>;

/// Object metadata, which will be generically provided by the driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Metadata {
    /// The size of the object in bytes.
    pub size: u64,

    /// The creation timestamp of the object.
    pub created: DateTime<Utc>,

    /// The content type the object was written with, if the driver recorded one.
    pub content_type: Option<String>,
}

/// Options applied when writing an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// Content type recorded alongside the object.
    pub content_type: Option<String>,

    /// Exact length of the payload, when the caller knows it up front.
    pub content_length: Option<u64>,
}

impl UploadOptions {
    /// Options with nothing set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record this content type with the object.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Declare the payload length.
    pub fn content_length(mut self, length: u64) -> Self {
        self.content_length = Some(length);
        self
    }
}

/// A storage driver, which provides the ability to interact with a storage backend.
#[async_trait::async_trait]
pub trait Driver: fmt::Debug {
    /// The name of the driver.
    fn name(&self) -> &'static str;

    /// The Uri scheme this driver is opened from.
    fn scheme(&self) -> &str;

    /// Delete an object from the storage, by path.
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError>;

    /// Get the metadata for an object, by path.
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError>;

    /// Check whether an object exists.
    ///
    /// Only a [`StorageErrorKind::NotFound`] failure counts as absence, any other
    /// failure is returned to the caller.
    async fn exists(&self, bucket: &str, remote: &Utf8Path) -> Result<bool, StorageError> {
        match self.metadata(bucket, remote).await {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == StorageErrorKind::NotFound => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Upload an object to the storage, using a reader stream to provide the contents.
    ///
    /// An object is either written completely or not visible at all.
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
        options: &UploadOptions,
    ) -> Result<(), StorageError>;

    /// Download an object from storage, into a writer stream.
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError>;

    /// Open an object for streaming reads.
    ///
    /// Drivers which can stream natively should override this, the default
    /// buffers the whole object in memory.
    async fn open(&self, bucket: &str, remote: &Utf8Path) -> Result<ObjectStream, StorageError> {
        let mut buffer: Vec<u8> = Vec::new();
        self.download(bucket, remote, &mut buffer).await?;
        Ok(Box::pin(io::BufReader::new(std::io::Cursor::new(buffer))))
    }

    /// Whether [`Driver::signed_url`] can succeed for this driver.
    fn supports_signed_urls(&self) -> bool {
        false
    }

    /// Produce a time-limited URL which grants read access to an object
    /// without going through this process.
    async fn signed_url(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        expires_in: Duration,
    ) -> Result<Uri, StorageError> {
        let _ = expires_in;
        Err(StorageError::builder(
            self.name(),
            StorageErrorKind::Unsupported,
            eyre!("{} does not support signed URLs", self.name()),
        )
        .bucket(bucket)
        .path(remote.as_str())
        .build())
    }

    /// Download an object from storage, into a local file.
    async fn download_file(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &Utf8Path,
    ) -> Result<(), StorageError> {
        tracing::trace!(%remote, %local, "Downloading to file: {local}");

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::from_io("tokio::fs", err))?;
        }
        let mut file = tokio::io::BufWriter::new(
            tokio::fs::File::create(local)
                .await
                .map_err(|err| StorageError::from_io("tokio::fs", err))?,
        );
        self.download(bucket, remote, &mut file).await?;
        file.shutdown()
            .await
            .wrap_err("shutdown file buffer")
            .map_err(StorageError::with("tokio::fs", StorageErrorKind::Io))?;
        Ok(())
    }

    /// Upload an object to storage, from a local file.
    async fn upload_file(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &Utf8Path,
        options: &UploadOptions,
    ) -> Result<(), StorageError> {
        tracing::trace!(%remote, %local, "Uploading from file: {local}");
        let file = tokio::fs::File::open(local)
            .await
            .map_err(|err| StorageError::from_io("tokio::fs", err))?;

        let mut options = options.clone();
        if options.content_length.is_none() {
            let metadata = file
                .metadata()
                .await
                .map_err(|err| StorageError::from_io("tokio::fs", err))?;
            options.content_length = Some(metadata.len());
        }

        let mut reader = tokio::io::BufReader::new(file);
        self.upload(bucket, remote, &mut reader, &options).await
    }

    /// List the objects in a bucket, optionally filtered by a prefix.
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError>;
}

#[async_trait::async_trait]
impl<D> Driver for Arc<D>
where
    D: ?Sized + Driver + Sync + Send + 'static,
{
    fn name(&self) -> &'static str {
        self.deref().name()
    }

    fn scheme(&self) -> &str {
        self.deref().scheme()
    }

    fn supports_signed_urls(&self) -> bool {
        self.deref().supports_signed_urls()
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.deref().delete(bucket, remote).await
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.deref().metadata(bucket, remote).await
    }

    async fn exists(&self, bucket: &str, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.deref().exists(bucket, remote).await
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
        options: &UploadOptions,
    ) -> Result<(), StorageError> {
        self.deref().upload(bucket, remote, reader, options).await
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        self.deref().download(bucket, remote, writer).await
    }

    async fn open(&self, bucket: &str, remote: &Utf8Path) -> Result<ObjectStream, StorageError> {
        self.deref().open(bucket, remote).await
    }

    async fn signed_url(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        expires_in: Duration,
    ) -> Result<Uri, StorageError> {
        self.deref().signed_url(bucket, remote, expires_in).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.deref().list(bucket, prefix).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use camino::Utf8PathBuf;
    use tokio::io::AsyncReadExt;
    use tokio::sync::Mutex;

    use super::*;

    static_assertions::assert_obj_safe!(Driver);

    #[derive(Debug, Default)]
    struct MapDriver {
        objects: Mutex<HashMap<Utf8PathBuf, Vec<u8>>>,
    }

    #[async_trait::async_trait]
    impl Driver for MapDriver {
        fn name(&self) -> &'static str {
            "map"
        }

        fn scheme(&self) -> &str {
            "map"
        }

        async fn delete(&self, _bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
            self.objects.lock().await.remove(remote);
            Ok(())
        }

        async fn metadata(
            &self,
            bucket: &str,
            remote: &Utf8Path,
        ) -> Result<Metadata, StorageError> {
            let objects = self.objects.lock().await;
            let data = objects
                .get(remote)
                .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote))?;
            Ok(Metadata {
                size: data.len() as u64,
                created: Utc::now(),
                content_type: None,
            })
        }

        async fn upload(
            &self,
            _bucket: &str,
            remote: &Utf8Path,
            reader: &mut Reader<'_>,
            _options: &UploadOptions,
        ) -> Result<(), StorageError> {
            let mut data = Vec::new();
            reader
                .read_to_end(&mut data)
                .await
                .map_err(|err| StorageError::from_io(self.name(), err))?;
            self.objects.lock().await.insert(remote.to_owned(), data);
            Ok(())
        }

        async fn download(
            &self,
            bucket: &str,
            remote: &Utf8Path,
            writer: &mut Writer<'_>,
        ) -> Result<(), StorageError> {
            let data = self
                .objects
                .lock()
                .await
                .get(remote)
                .cloned()
                .ok_or_else(|| StorageError::not_found(self.name(), bucket, remote))?;
            writer
                .write_all(&data)
                .await
                .map_err(|err| StorageError::from_io(self.name(), err))?;
            Ok(())
        }

        async fn list(
            &self,
            _bucket: &str,
            _prefix: Option<&Utf8Path>,
        ) -> Result<Vec<String>, StorageError> {
            Ok(self
                .objects
                .lock()
                .await
                .keys()
                .map(|k| k.to_string())
                .collect())
        }
    }

    #[tokio::test]
    async fn exists_treats_not_found_as_absent() {
        let driver = MapDriver::default();
        let key = Utf8Path::new("blobs/a");
        assert!(!driver.exists("b", key).await.unwrap());

        let mut reader: &[u8] = b"hello";
        driver
            .upload("b", key, &mut reader, &UploadOptions::new())
            .await
            .unwrap();
        assert!(driver.exists("b", key).await.unwrap());
    }

    #[tokio::test]
    async fn default_open_buffers_download() {
        let driver = Arc::new(MapDriver::default());
        let key = Utf8Path::new("manifests/x");
        let mut reader: &[u8] = b"{}";
        driver
            .upload("b", key, &mut reader, &UploadOptions::new())
            .await
            .unwrap();

        let mut stream = driver.open("b", key).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "{}");
    }

    #[tokio::test]
    async fn signed_urls_are_unsupported_by_default() {
        let driver = MapDriver::default();
        let err = driver
            .signed_url("b", Utf8Path::new("k"), Duration::from_secs(60))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::Unsupported);
        assert!(!driver.supports_signed_urls());
        assert!(!Arc::new(driver).supports_signed_urls());
    }
}
