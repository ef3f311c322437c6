//! A backend which keeps images in an object store bucket.
//!
//! Keys are flat and content addressed: `manifests/<digest>` and
//! `blobs/<digest>`, shared between every image name.

use std::collections::BTreeMap;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, StatusCode, header, request::Parts};
use axum::response::{IntoResponse, Redirect, Response};
use camino::Utf8PathBuf;
use storage::{StorageBucket, StorageConfig, UploadOptions};
use tokio_util::io::ReaderStream;
use url::Url;

use super::{Backend, DOCKER_CONTENT_DIGEST, Stored, digest_header, parse_bool, take_params};
use crate::error::{RegistryError, RegistryResult};
use crate::image::{ArchivedBlob, ImageArchive};
use crate::reference::Digest;

const DEFAULT_SIGNED_URL_TTL: Duration = Duration::from_secs(15 * 60);
const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
const OCTET_STREAM: &str = "application/octet-stream";

fn manifest_key(digest: &Digest) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("manifests/{digest}"))
}

fn blob_key(digest: &Digest) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("blobs/{digest}"))
}

/// Images in a storage bucket, optionally served through signed URL redirects.
#[derive(Debug, Clone)]
pub struct BucketBackend {
    bucket: StorageBucket,
    use_signed_urls: bool,
    signed_url_ttl: Duration,
}

impl BucketBackend {
    /// Serve content from `bucket` directly.
    pub fn new(bucket: StorageBucket) -> Self {
        Self {
            bucket,
            use_signed_urls: false,
            signed_url_ttl: DEFAULT_SIGNED_URL_TTL,
        }
    }

    /// Redirect reads to signed URLs valid for `ttl`.
    pub fn with_signed_urls(mut self, ttl: Duration) -> Self {
        self.use_signed_urls = true;
        self.signed_url_ttl = ttl;
        self
    }

    /// Open a bucket URL, e.g. `s3://cache?use_signed_urls=true`.
    ///
    /// `use_signed_urls` and `signed_url_ttl` (seconds) are consumed here, the
    /// rest of the URL goes to the storage driver. Asking for signed URLs from
    /// a driver which cannot sign them is an error.
    pub fn open(url: &Url) -> RegistryResult<Self> {
        let (url, params) = take_params(url, &["use_signed_urls", "signed_url_ttl"]);
        let bucket = StorageConfig::from_url(&url)?.build()?;
        let backend = Self::new(bucket);

        let ttl = match params.get("signed_url_ttl") {
            Some(ttl) => Duration::from_secs(ttl.parse().map_err(|_| {
                RegistryError::InvalidArgument(format!("invalid signed_url_ttl {ttl:?}"))
            })?),
            None => DEFAULT_SIGNED_URL_TTL,
        };

        match params.get("use_signed_urls").map(|v| parse_bool(v)).transpose()? {
            Some(true) if !backend.bucket.supports_signed_urls() => {
                Err(RegistryError::InvalidArgument(format!(
                    "{} storage cannot sign URLs, drop use_signed_urls",
                    backend.bucket.scheme()
                )))
            }
            Some(true) => Ok(backend.with_signed_urls(ttl)),
            _ => Ok(backend),
        }
    }

    async fn store_blob(&self, image: &ImageArchive, blob: &ArchivedBlob) -> RegistryResult<()> {
        let key = blob_key(&blob.digest);
        if self.bucket.exists(&key).await? {
            tracing::trace!(digest = %blob.digest, "blob already stored");
            return Ok(());
        }

        let mut reader = image.open_blob(blob).await?;
        let options = UploadOptions::new()
            .content_type(blob.media_type.clone())
            .content_length(blob.size);
        self.bucket.upload(&key, &mut reader, &options).await?;
        tracing::debug!(digest = %blob.digest, size = blob.size, "stored blob");
        Ok(())
    }

    async fn redirect(&self, key: &Utf8PathBuf, digest: &Digest) -> RegistryResult<Response> {
        let url = self.bucket.signed_url(key, self.signed_url_ttl).await?;
        tracing::debug!(%digest, "redirecting to signed URL");

        let mut response = Redirect::temporary(&url.to_string()).into_response();
        response
            .headers_mut()
            .insert(DOCKER_CONTENT_DIGEST, digest_header(digest));
        Ok(response)
    }
}

/// Guess the media type of a manifest stored without one.
fn detect_manifest_type(data: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(data)
        .ok()
        .and_then(|json| {
            json.get("mediaType")
                .and_then(|v| v.as_str())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| OCI_MANIFEST.to_owned())
}

#[async_trait::async_trait]
impl Backend for BucketBackend {
    fn name(&self) -> &str {
        "bucket"
    }

    #[tracing::instrument(skip(self, image), fields(digest = %image.digest()))]
    async fn store(
        &self,
        image: &ImageArchive,
        name: &str,
        reference: &str,
    ) -> RegistryResult<Stored> {
        // An image may list the same layer twice.
        let blobs: BTreeMap<&Digest, &ArchivedBlob> =
            image.blobs().map(|blob| (&blob.digest, blob)).collect();
        futures::future::try_join_all(blobs.into_values().map(|blob| self.store_blob(image, blob)))
            .await?;

        // The manifest goes last, so a stored manifest implies its blobs are present.
        let key = manifest_key(image.digest());
        if !self.bucket.exists(&key).await? {
            let manifest = image.manifest();
            let options = UploadOptions::new()
                .content_type(image.media_type())
                .content_length(manifest.len() as u64);
            let mut reader: &[u8] = &manifest[..];
            self.bucket.upload(&key, &mut reader, &options).await?;
        }

        tracing::info!("stored {name}:{reference}");
        Ok(Stored::from_archive(image))
    }

    async fn manifest(
        &self,
        parts: &Parts,
        _name: &str,
        digest: &Digest,
    ) -> RegistryResult<Response> {
        let key = manifest_key(digest);
        let unknown = || RegistryError::ManifestUnknown(digest.to_string());
        let metadata = self
            .bucket
            .metadata(&key)
            .await
            .map_err(|error| RegistryError::from(error).or_unknown(unknown))?;

        if parts.method == Method::HEAD {
            let content_type = metadata
                .content_type
                .unwrap_or_else(|| OCI_MANIFEST.to_owned());
            return Ok((
                StatusCode::OK,
                [
                    (header::CONTENT_TYPE, content_type),
                    (header::CONTENT_LENGTH, metadata.size.to_string()),
                    (
                        header::HeaderName::from_static(DOCKER_CONTENT_DIGEST),
                        digest.to_string(),
                    ),
                ],
            )
                .into_response());
        }

        if self.use_signed_urls {
            return self.redirect(&key, digest).await;
        }

        let mut data = Vec::with_capacity(metadata.size as usize);
        self.bucket
            .download(&key, &mut data)
            .await
            .map_err(|error| RegistryError::from(error).or_unknown(unknown))?;
        digest.verify(&data)?;

        let media_type = metadata
            .content_type
            .unwrap_or_else(|| detect_manifest_type(&data));
        Ok(Stored {
            digest: digest.clone(),
            media_type,
            manifest: data.into(),
        }
        .into_response())
    }

    async fn blob(&self, parts: &Parts, _name: &str, digest: &Digest) -> RegistryResult<Response> {
        let key = blob_key(digest);
        let unknown = || RegistryError::BlobUnknown(digest.to_string());
        let metadata = self
            .bucket
            .metadata(&key)
            .await
            .map_err(|error| RegistryError::from(error).or_unknown(unknown))?;

        let headers = [
            (
                header::CONTENT_TYPE,
                metadata
                    .content_type
                    .unwrap_or_else(|| OCTET_STREAM.to_owned()),
            ),
            (header::CONTENT_LENGTH, metadata.size.to_string()),
            (
                header::HeaderName::from_static(DOCKER_CONTENT_DIGEST),
                digest.to_string(),
            ),
        ];

        // Signed URLs are presigned for GET only.
        if parts.method == Method::HEAD {
            return Ok((StatusCode::OK, headers).into_response());
        }

        if self.use_signed_urls {
            return self.redirect(&key, digest).await;
        }

        let stream = self
            .bucket
            .open(&key)
            .await
            .map_err(|error| RegistryError::from(error).or_unknown(unknown))?;
        Ok((
            StatusCode::OK,
            headers,
            Body::from_stream(ReaderStream::new(stream)),
        )
            .into_response())
    }
}
