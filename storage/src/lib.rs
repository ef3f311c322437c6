//! # Storage backends
//!
//! Configuration and unification for the storage backends.
//!
//! A bucket is addressed by a URL, where the scheme picks the driver:
//!
//! | URL                               | Driver                  |
//! |-----------------------------------|-------------------------|
//! | `mem://` or `mem://bucket`        | [`MemoryStorage`]       |
//! | `file:///var/cache/kiln`          | [`LocalDriver`]         |
//! | `s3://bucket?region=eu-west-1`    | [`S3Driver`]            |
//! | `gs://bucket`                     | [`S3Driver`] (GCS)      |
//! | `azblob://container?account=kiln` | [`AzureDriver`]         |

use std::{sync::Arc, time::Duration};

use camino::Utf8Path;
#[cfg(feature = "local")]
use camino::Utf8PathBuf;
use http::Uri;
use tokio::io;
use url::Url;

#[cfg(feature = "azure")]
pub(crate) mod azure;
#[cfg(feature = "local")]
pub(crate) mod local;
pub(crate) mod memory;
#[cfg(feature = "s3")]
pub(crate) mod s3;
pub mod sigv4;
pub mod xml;

#[cfg(feature = "azure")]
#[doc(inline)]
pub use azure::{AzureConfig, AzureDriver};

#[cfg(feature = "local")]
#[doc(inline)]
pub use local::LocalDriver;

#[doc(inline)]
pub use memory::MemoryStorage;

#[cfg(feature = "s3")]
#[doc(inline)]
pub use s3::{S3Config, S3Driver, S3Flavor};

#[doc(inline)]
pub use storage_driver::{
    Driver, Metadata, ObjectStream, Reader, StorageError, StorageErrorKind, UploadOptions, Writer,
};

const CONFIG: &str = "config";

/// Which driver a bucket URL resolves to, and where the bucket lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    /// An in-process bucket, lost on restart.
    Memory {
        /// Bucket name, may be empty.
        bucket: String,
    },

    /// A directory on the local filesystem.
    #[cfg(feature = "local")]
    Local {
        /// Root directory for stored objects.
        path: Utf8PathBuf,
    },

    /// An S3 compatible bucket.
    #[cfg(feature = "s3")]
    S3 {
        /// Bucket name.
        bucket: String,

        /// Connection settings.
        config: S3Config,
    },

    /// An Azure Blob Storage container.
    #[cfg(feature = "azure")]
    Azure {
        /// Container name.
        container: String,

        /// Account settings.
        config: AzureConfig,
    },
}

fn query_param(url: &Url, names: &[&str]) -> Option<String> {
    url.query_pairs()
        .find(|(key, _)| names.contains(&key.as_ref()))
        .map(|(_, value)| value.into_owned())
}

fn invalid(url: &Url, message: impl Into<String>) -> StorageError {
    StorageError::builder(CONFIG, StorageErrorKind::InvalidRequest, message.into())
        .context(url.to_string())
        .build()
}

impl StorageConfig {
    /// Parse a bucket URL.
    pub fn from_url(url: &Url) -> Result<Self, StorageError> {
        match url.scheme() {
            "mem" => Ok(StorageConfig::Memory {
                bucket: url.host_str().unwrap_or_default().to_owned(),
            }),

            #[cfg(feature = "local")]
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| invalid(url, "file URL must be an absolute local path"))?;
                let path = Utf8PathBuf::from_path_buf(path)
                    .map_err(|_| invalid(url, "file URL must be valid UTF-8"))?;
                Ok(StorageConfig::Local { path })
            }

            #[cfg(feature = "s3")]
            scheme @ ("s3" | "gs") => {
                let bucket = url
                    .host_str()
                    .filter(|host| !host.is_empty())
                    .ok_or_else(|| invalid(url, "bucket URL has no bucket name"))?
                    .to_owned();

                let mut config = if scheme == "gs" {
                    S3Config::gcs()
                } else {
                    let region = query_param(url, &["region"])
                        .or_else(|| std::env::var("AWS_REGION").ok())
                        .or_else(|| std::env::var("AWS_DEFAULT_REGION").ok())
                        .unwrap_or_else(|| "us-east-1".to_owned());
                    if region.is_empty()
                        || !region
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '-')
                    {
                        return Err(invalid(url, format!("invalid region {region:?}")));
                    }
                    S3Config::aws(region)
                };

                if let Some(endpoint) = query_param(url, &["endpoint"]) {
                    let endpoint = if endpoint.contains("://") {
                        endpoint
                    } else {
                        format!("https://{endpoint}")
                    };
                    config.endpoint = Some(
                        endpoint
                            .parse::<Uri>()
                            .map_err(|err| invalid(url, format!("invalid endpoint: {err}")))?,
                    );
                }

                if let Some(style) = query_param(url, &["use_path_style", "s3ForcePathStyle"]) {
                    config.path_style = matches!(style.as_str(), "true" | "1");
                }

                Ok(StorageConfig::S3 { bucket, config })
            }

            #[cfg(feature = "azure")]
            "azblob" => {
                let container = url
                    .host_str()
                    .filter(|host| !host.is_empty())
                    .ok_or_else(|| invalid(url, "azblob URL has no container name"))?
                    .to_owned();
                let flag = |names: &[&str]| {
                    query_param(url, names).is_some_and(|v| matches!(v.as_str(), "true" | "1"))
                };
                let config = AzureConfig {
                    account: query_param(url, &["account", "storage_account"]),
                    endpoint: query_param(url, &["endpoint"]),
                    use_emulator: flag(&["localemu", "use_emulator"]),
                    allow_http: query_param(url, &["protocol"]).as_deref() == Some("http"),
                };
                Ok(StorageConfig::Azure { container, config })
            }

            other => Err(invalid(url, format!("unsupported storage scheme: {other}"))),
        }
    }

    /// Construct the driver, and return a handle to the configured bucket.
    #[tracing::instrument]
    pub fn build(self) -> Result<StorageBucket, StorageError> {
        Ok(match self {
            StorageConfig::Memory { bucket } => {
                Storage::new(MemoryStorage::with_buckets(&[&bucket])).bucket(bucket)
            }
            #[cfg(feature = "local")]
            StorageConfig::Local { path } => Storage::new(LocalDriver::new(path)).bucket(""),
            #[cfg(feature = "s3")]
            StorageConfig::S3 { bucket, config } => {
                Storage::new(S3Driver::new(config)?).bucket(bucket)
            }
            #[cfg(feature = "azure")]
            StorageConfig::Azure { container, config } => {
                Storage::new(AzureDriver::new(&container, &config)?).bucket(container)
            }
        })
    }
}

pub(crate) type ArcDriver = Arc<dyn Driver + Send + Sync>;

/// A shared handle to a storage driver.
#[derive(Debug, Clone)]
pub struct Storage {
    driver: ArcDriver,
}

impl<D> From<D> for Storage
where
    D: Driver + Send + Sync + 'static,
{
    fn from(value: D) -> Self {
        Storage::new(value)
    }
}

impl Storage {
    /// Wrap a driver.
    pub fn new<D: Driver + Send + Sync + 'static>(driver: D) -> Self {
        Self {
            driver: Arc::new(driver),
        }
    }

    /// The driver name.
    pub fn name(&self) -> &str {
        self.driver.name()
    }

    /// A handle scoped to a single bucket.
    pub fn bucket<S: Into<String>>(&self, bucket: S) -> StorageBucket {
        StorageBucket {
            driver: self.driver.clone(),
            bucket: bucket.into(),
        }
    }

    /// Get the metadata for an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn metadata(
        &self,
        bucket: &str,
        remote: &Utf8Path,
    ) -> Result<Metadata, StorageError> {
        self.driver.metadata(bucket, remote).await
    }

    /// Download an object into a writer.
    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name()))]
    pub async fn download<'d, W>(
        &'d self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Downloading from: {bucket}/{remote}");
        self.driver.download(bucket, remote, writer).await?;
        Ok(())
    }

    /// Upload an object from a reader.
    #[tracing::instrument(skip(self, reader), fields(driver=self.driver.name(), bucket))]
    pub async fn upload<'d, R>(
        &'d self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut R,
        options: &UploadOptions,
    ) -> Result<(), StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Uploading to: {bucket}/{remote}");
        self.driver.upload(bucket, remote, reader, options).await?;
        Ok(())
    }

    /// List the objects in a bucket.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket))]
    pub async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        self.driver.list(bucket, prefix).await
    }

    /// Delete an object.
    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn delete(&self, bucket: &str, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(bucket, path).await
    }
}

/// A storage driver bound to one bucket.
#[derive(Debug, Clone)]
pub struct StorageBucket {
    /// The bucket name, which may be empty for drivers without buckets.
    pub bucket: String,
    driver: ArcDriver,
}

impl StorageBucket {
    /// The name of the driver behind this bucket.
    pub fn driver_name(&self) -> &'static str {
        self.driver.name()
    }

    /// The URL scheme of the driver behind this bucket.
    pub fn scheme(&self) -> &str {
        self.driver.scheme()
    }

    /// Whether the driver can hand out signed URLs.
    pub fn supports_signed_urls(&self) -> bool {
        self.driver.supports_signed_urls()
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn metadata(&self, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        self.driver.metadata(&self.bucket, remote).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn exists(&self, remote: &Utf8Path) -> Result<bool, StorageError> {
        self.driver.exists(&self.bucket, remote).await
    }

    #[tracing::instrument(skip(self, writer), fields(driver=self.driver.name()))]
    pub async fn download<'d, W>(
        &'d self,
        remote: &Utf8Path,
        writer: &mut W,
    ) -> Result<(), StorageError>
    where
        W: io::AsyncWrite + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Downloading from: {}/{remote}", self.bucket);
        self.driver.download(&self.bucket, remote, writer).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name()))]
    pub async fn open(&self, remote: &Utf8Path) -> Result<ObjectStream, StorageError> {
        self.driver.open(&self.bucket, remote).await
    }

    #[tracing::instrument(
        skip(self, reader),
        fields(driver = self.driver.name(), bucket = self.bucket)
    )]
    pub async fn upload<'d, R>(
        &'d self,
        remote: &Utf8Path,
        reader: &mut R,
        options: &UploadOptions,
    ) -> Result<(), StorageError>
    where
        R: io::AsyncBufRead + Unpin + Send + Sync + 'd,
    {
        tracing::trace!(%remote, "Uploading to: {}/{remote}", self.bucket);
        self.driver
            .upload(&self.bucket, remote, reader, options)
            .await?;
        Ok(())
    }

    pub async fn upload_file(
        &self,
        remote: &Utf8Path,
        local: &Utf8Path,
        options: &UploadOptions,
    ) -> Result<(), StorageError> {
        self.driver
            .upload_file(&self.bucket, remote, local, options)
            .await
    }

    pub async fn download_file(
        &self,
        remote: &Utf8Path,
        local: &Utf8Path,
    ) -> Result<(), StorageError> {
        self.driver.download_file(&self.bucket, remote, local).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn signed_url(
        &self,
        remote: &Utf8Path,
        expires_in: Duration,
    ) -> Result<Uri, StorageError> {
        self.driver
            .signed_url(&self.bucket, remote, expires_in)
            .await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn list(&self, prefix: Option<&Utf8Path>) -> Result<Vec<String>, StorageError> {
        self.driver.list(&self.bucket, prefix).await
    }

    #[tracing::instrument(skip(self), fields(driver=self.driver.name(), bucket=self.bucket))]
    pub async fn delete(&self, path: &Utf8Path) -> Result<(), StorageError> {
        self.driver.delete(&self.bucket, path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_urls() {
        let config = StorageConfig::from_url(&"mem://".parse().unwrap()).unwrap();
        assert_eq!(
            config,
            StorageConfig::Memory {
                bucket: String::new()
            }
        );
    }

    #[test]
    fn file_urls() {
        let config = StorageConfig::from_url(&"file:///tmp/cache".parse().unwrap()).unwrap();
        assert_eq!(
            config,
            StorageConfig::Local {
                path: "/tmp/cache".into()
            }
        );
    }

    #[test]
    fn s3_urls_carry_region_and_endpoint() {
        let url = "s3://cache?region=eu-west-1&endpoint=minio.local:9000&s3ForcePathStyle=true"
            .parse()
            .unwrap();
        let StorageConfig::S3 { bucket, config } = StorageConfig::from_url(&url).unwrap() else {
            panic!("expected s3 config");
        };
        assert_eq!(bucket, "cache");
        assert_eq!(config.region, "eu-west-1");
        assert!(config.path_style);
        assert_eq!(
            config.endpoint.unwrap().to_string(),
            "https://minio.local:9000/"
        );
    }

    #[test]
    fn malformed_regions_are_rejected() {
        let url = "s3://cache?region=eu%20west/1".parse().unwrap();
        let err = StorageConfig::from_url(&url).unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[test]
    fn gs_urls_use_gcs_flavor() {
        let StorageConfig::S3 { config, .. } =
            StorageConfig::from_url(&"gs://cache".parse().unwrap()).unwrap()
        else {
            panic!("expected s3 config");
        };
        assert_eq!(config.flavor, S3Flavor::Gcs);
    }

    #[test]
    fn azblob_urls_name_a_container() {
        let url = "azblob://cache?account=kilnstore&localemu=true".parse().unwrap();
        let StorageConfig::Azure { container, config } = StorageConfig::from_url(&url).unwrap()
        else {
            panic!("expected azure config");
        };
        assert_eq!(container, "cache");
        assert_eq!(config.account.as_deref(), Some("kilnstore"));
        assert!(config.use_emulator);
        assert!(!config.allow_http);

        let err = StorageConfig::from_url(&"azblob://".parse().unwrap()).unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[test]
    fn unknown_schemes_are_rejected() {
        let err = StorageConfig::from_url(&"ftp://cache".parse().unwrap()).unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
    }

    #[tokio::test]
    async fn built_bucket_round_trips() {
        let bucket = StorageConfig::Memory {
            bucket: "cache".into(),
        }
        .build()
        .unwrap();
        assert!(!bucket.supports_signed_urls());
        let mut body: &[u8] = b"hello";
        bucket
            .upload(Utf8Path::new("blobs/a"), &mut body, &UploadOptions::new())
            .await
            .unwrap();
        assert!(bucket.exists(Utf8Path::new("blobs/a")).await.unwrap());
        assert!(!bucket.exists(Utf8Path::new("blobs/b")).await.unwrap());
    }
}
