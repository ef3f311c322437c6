//! S3 compatible object storage, over plain HTTP with SigV4 signing.
//!
//! Google Cloud Storage is reached through its S3 interoperability API, so
//! `gs://` buckets are served by the same driver with a different endpoint.

use std::{fmt, time::Duration};

use bytes::Bytes;
use camino::Utf8Path;
use chrono::{DateTime, Utc};
use futures::TryStreamExt as _;
use http::{header, Method, StatusCode, Uri};
use http_body_util::BodyExt as _;
use hyperdriver::Body;
use percent_encoding::utf8_percent_encode;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tower::ServiceExt as _;

use storage_driver::{
    Driver, Metadata, ObjectStream, Reader, StorageError, StorageErrorKind, UploadOptions, Writer,
};

use crate::sigv4::{self, AwsCredentials, SigningParams, PATH_ENCODE};
use crate::xml;

const NAME: &str = "s3";

/// Objects larger than this are sent as a multipart upload.
pub const PART_SIZE: usize = 8 * 1024 * 1024;

/// The flavour of S3 API being spoken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum S3Flavor {
    /// Amazon S3, or anything compatible with it.
    Aws,

    /// Google Cloud Storage, through the XML interoperability API.
    Gcs,
}

impl S3Flavor {
    fn scheme(&self) -> &'static str {
        match self {
            S3Flavor::Aws => "s3",
            S3Flavor::Gcs => "gs",
        }
    }
}

/// Connection settings for an S3 compatible bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    /// Which API flavour to speak.
    pub flavor: S3Flavor,

    /// Signing region.
    pub region: String,

    /// Service endpoint, e.g. `https://s3.us-east-1.amazonaws.com`.
    pub endpoint: Option<Uri>,

    /// Address buckets as `endpoint/bucket/key` rather than `bucket.endpoint/key`.
    pub path_style: bool,
}

impl S3Config {
    /// Settings for Amazon S3 in a region.
    pub fn aws(region: impl Into<String>) -> Self {
        Self {
            flavor: S3Flavor::Aws,
            region: region.into(),
            endpoint: None,
            path_style: false,
        }
    }

    /// Settings for Google Cloud Storage.
    pub fn gcs() -> Self {
        Self {
            flavor: S3Flavor::Gcs,
            region: "auto".into(),
            endpoint: None,
            path_style: true,
        }
    }

    fn endpoint(&self) -> Result<Uri, StorageError> {
        if let Some(endpoint) = &self.endpoint {
            return Ok(endpoint.clone());
        }

        let uri = match self.flavor {
            S3Flavor::Aws => format!("https://s3.{}.amazonaws.com", self.region),
            S3Flavor::Gcs => "https://storage.googleapis.com".to_owned(),
        };
        uri.parse().map_err(|error| {
            StorageError::builder(NAME, StorageErrorKind::InvalidRequest, error)
                .context(format!("region {:?}", self.region))
                .build()
        })
    }

    fn credentials(&self) -> Option<AwsCredentials> {
        match self.flavor {
            S3Flavor::Aws => AwsCredentials::from_env(),
            S3Flavor::Gcs => {
                let id = std::env::var("GS_ACCESS_KEY_ID").ok();
                let secret = std::env::var("GS_SECRET_ACCESS_KEY").ok();
                match (id, secret) {
                    (Some(id), Some(secret)) => Some(AwsCredentials::new(id, secret, None)),
                    _ => AwsCredentials::from_env(),
                }
            }
        }
    }
}

/// Storage driver for S3 compatible object stores.
#[derive(Clone)]
pub struct S3Driver {
    config: S3Config,
    endpoint: Uri,
    credentials: Option<AwsCredentials>,
    client: hyperdriver::client::SharedClientService<Body, Body>,
}

impl fmt::Debug for S3Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Driver")
            .field("config", &self.config)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl S3Driver {
    /// Create a driver, reading credentials from the environment.
    pub fn new(config: S3Config) -> Result<Self, StorageError> {
        let client = hyperdriver::Client::build_tcp_http()
            .with_default_tls()
            .build_service();
        let credentials = config.credentials();
        Self::with_client(config, credentials, client)
    }

    /// Create a driver around an existing HTTP client service.
    pub fn with_client(
        config: S3Config,
        credentials: Option<AwsCredentials>,
        client: hyperdriver::client::SharedClientService<Body, Body>,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            endpoint: config.endpoint()?,
            config,
            credentials,
            client,
        })
    }

    fn object_uri(
        &self,
        bucket: &str,
        key: &str,
        query: Option<&str>,
    ) -> Result<Uri, StorageError> {
        let scheme = self.endpoint.scheme_str().unwrap_or("https");
        let authority = self
            .endpoint
            .authority()
            .map(|a| a.as_str())
            .unwrap_or_default();
        let key = utf8_percent_encode(key.trim_start_matches('/'), PATH_ENCODE);

        let mut uri = if self.config.path_style || bucket.is_empty() {
            format!("{scheme}://{authority}/{bucket}/{key}")
        } else {
            format!("{scheme}://{bucket}.{authority}/{key}")
        };
        if let Some(query) = query {
            uri.push('?');
            uri.push_str(query);
        }

        uri.parse().map_err(|error| {
            StorageError::builder(NAME, StorageErrorKind::InvalidRequest, error)
                .bucket(bucket)
                .path(key.to_string())
                .build()
        })
    }

    fn signing_params<'a>(&'a self, credentials: &'a AwsCredentials) -> SigningParams<'a> {
        SigningParams {
            credentials,
            region: &self.config.region,
            service: "s3",
            time: Utc::now(),
        }
    }

    async fn send(
        &self,
        mut request: http::Request<Body>,
        payload_hash: &str,
    ) -> Result<http::Response<Body>, StorageError> {
        if let Some(credentials) = &self.credentials {
            sigv4::sign_request(&mut request, &self.signing_params(credentials), payload_hash)
                .map_err(StorageError::with(NAME, StorageErrorKind::InvalidRequest))?;
        }

        tracing::trace!(method = %request.method(), uri = %request.uri(), "s3 request");
        self.client
            .clone()
            .oneshot(request)
            .await
            .map_err(StorageError::with(NAME, StorageErrorKind::ServiceUnavailable))
    }

    async fn check(
        &self,
        response: http::Response<Body>,
        bucket: &str,
        key: &str,
    ) -> Result<http::Response<Body>, StorageError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .unwrap_or_default();
        let document = String::from_utf8_lossy(&body);
        let code = xml::tag_value(&document, "Code");
        let message = xml::tag_value(&document, "Message").unwrap_or_else(|| status.to_string());

        let kind = match code.as_deref() {
            Some("NoSuchKey" | "NoSuchBucket" | "NoSuchUpload") => StorageErrorKind::NotFound,
            Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch") => {
                StorageErrorKind::PermissionDenied
            }
            Some("ExpiredToken" | "TokenRefreshRequired") => StorageErrorKind::AuthExpired,
            _ => StorageErrorKind::from_status(status),
        };

        let mut error = StorageError::builder(NAME, kind, message)
            .bucket(bucket)
            .path(key);
        if let Some(code) = code {
            error = error.context(code);
        }
        Err(error.build())
    }

    async fn read_part(reader: &mut Reader<'_>, size: usize) -> Result<Vec<u8>, StorageError> {
        let mut buffer = Vec::with_capacity(size);
        let mut chunk = (&mut *reader).take(size as u64);
        while buffer.len() < size {
            if chunk
                .read_buf(&mut buffer)
                .await
                .map_err(|err| StorageError::from_io(NAME, err))?
                == 0
            {
                break;
            }
        }
        Ok(buffer)
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: Bytes,
        options: &UploadOptions,
    ) -> Result<(), StorageError> {
        let uri = self.object_uri(bucket, key, None)?;
        let mut builder = http::Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header(header::CONTENT_LENGTH, data.len());
        if let Some(content_type) = &options.content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        let hash = sigv4::payload_hash(&data);
        let request = builder
            .body(Body::from(data))
            .map_err(StorageError::with(NAME, StorageErrorKind::InvalidRequest))?;

        let response = self.send(request, &hash).await?;
        self.check(response, bucket, key).await?;
        Ok(())
    }

    async fn create_multipart(
        &self,
        bucket: &str,
        key: &str,
        options: &UploadOptions,
    ) -> Result<String, StorageError> {
        let uri = self.object_uri(bucket, key, Some("uploads="))?;
        let mut builder = http::Request::builder().method(Method::POST).uri(uri);
        if let Some(content_type) = &options.content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        let request = builder
            .body(Body::empty())
            .map_err(StorageError::with(NAME, StorageErrorKind::InvalidRequest))?;

        let response = self.send(request, &sigv4::payload_hash(b"")).await?;
        let body = self.body(self.check(response, bucket, key).await?).await?;
        xml::tag_value(&String::from_utf8_lossy(&body), "UploadId").ok_or_else(|| {
            StorageError::builder(NAME, StorageErrorKind::Other, "missing UploadId")
                .bucket(bucket)
                .path(key)
                .build()
        })
    }

    async fn upload_part(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        number: usize,
        data: Vec<u8>,
    ) -> Result<String, StorageError> {
        let query = format!(
            "partNumber={number}&uploadId={}",
            utf8_percent_encode(upload_id, sigv4::URI_ENCODE)
        );
        let uri = self.object_uri(bucket, key, Some(&query))?;
        let hash = sigv4::payload_hash(&data);
        let request = http::Request::builder()
            .method(Method::PUT)
            .uri(uri)
            .header(header::CONTENT_LENGTH, data.len())
            .body(Body::from(Bytes::from(data)))
            .map_err(StorageError::with(NAME, StorageErrorKind::InvalidRequest))?;

        let response = self.check(self.send(request, &hash).await?, bucket, key).await?;
        response
            .headers()
            .get(header::ETAG)
            .and_then(|etag| etag.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| {
                StorageError::builder(NAME, StorageErrorKind::Other, "upload part without ETag")
                    .bucket(bucket)
                    .path(key)
                    .build()
            })
    }

    async fn complete_multipart(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        etags: &[String],
    ) -> Result<(), StorageError> {
        let mut document = String::from("<CompleteMultipartUpload>");
        for (index, etag) in etags.iter().enumerate() {
            document.push_str(&format!(
                "<Part><PartNumber>{}</PartNumber><ETag>{}</ETag></Part>",
                index + 1,
                xml::escape(etag)
            ));
        }
        document.push_str("</CompleteMultipartUpload>");

        let query = format!(
            "uploadId={}",
            utf8_percent_encode(upload_id, sigv4::URI_ENCODE)
        );
        let uri = self.object_uri(bucket, key, Some(&query))?;
        let hash = sigv4::payload_hash(document.as_bytes());
        let request = http::Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/xml")
            .body(Body::from(Bytes::from(document)))
            .map_err(StorageError::with(NAME, StorageErrorKind::InvalidRequest))?;

        let response = self.check(self.send(request, &hash).await?, bucket, key).await?;

        // Completion can fail after a 200, with the error in the body.
        let body = self.body(response).await?;
        let document = String::from_utf8_lossy(&body);
        if let Some(code) = xml::tag_value(&document, "Code") {
            return Err(StorageError::builder(NAME, StorageErrorKind::Other, code)
                .bucket(bucket)
                .path(key)
                .build());
        }
        Ok(())
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) {
        let query = format!(
            "uploadId={}",
            utf8_percent_encode(upload_id, sigv4::URI_ENCODE)
        );
        let Ok(uri) = self.object_uri(bucket, key, Some(&query)) else {
            return;
        };
        let Ok(request) = http::Request::builder()
            .method(Method::DELETE)
            .uri(uri)
            .body(Body::empty())
        else {
            return;
        };

        if let Err(error) = self.send(request, &sigv4::payload_hash(b"")).await {
            tracing::warn!(%bucket, %key, "failed to abort multipart upload: {error}");
        }
    }

    async fn upload_multipart(
        &self,
        bucket: &str,
        key: &str,
        first: Vec<u8>,
        reader: &mut Reader<'_>,
        options: &UploadOptions,
    ) -> Result<u64, StorageError> {
        tracing::debug!(%bucket, %key, "object exceeds one part, using multipart upload");
        let upload_id = self.create_multipart(bucket, key, options).await?;

        let result = async {
            let mut etags = Vec::new();
            let mut written = 0u64;
            let mut part = first;
            while !part.is_empty() {
                written += part.len() as u64;
                let etag = self
                    .upload_part(bucket, key, &upload_id, etags.len() + 1, part)
                    .await?;
                etags.push(etag);
                part = Self::read_part(reader, PART_SIZE).await?;
            }
            self.complete_multipart(bucket, key, &upload_id, &etags)
                .await?;
            Ok::<_, StorageError>(written)
        }
        .await;

        if result.is_err() {
            self.abort_multipart(bucket, key, &upload_id).await;
        }
        result
    }

    async fn body(&self, response: http::Response<Body>) -> Result<Bytes, StorageError> {
        response
            .into_body()
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(StorageError::with(NAME, StorageErrorKind::Io))
    }

    async fn get(&self, bucket: &str, remote: &Utf8Path) -> Result<Body, StorageError> {
        let uri = self.object_uri(bucket, remote.as_str(), None)?;
        let request = http::Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Body::empty())
            .map_err(StorageError::with(NAME, StorageErrorKind::InvalidRequest))?;

        let response = self.send(request, &sigv4::payload_hash(b"")).await?;
        Ok(self
            .check(response, bucket, remote.as_str())
            .await?
            .into_body())
    }
}

#[async_trait::async_trait]
impl Driver for S3Driver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn scheme(&self) -> &str {
        self.config.flavor.scheme()
    }

    fn supports_signed_urls(&self) -> bool {
        true
    }

    #[tracing::instrument(skip(self))]
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let uri = self.object_uri(bucket, remote.as_str(), None)?;
        let request = http::Request::builder()
            .method(Method::HEAD)
            .uri(uri)
            .body(Body::empty())
            .map_err(StorageError::with(NAME, StorageErrorKind::InvalidRequest))?;

        let response = self.send(request, &sigv4::payload_hash(b"")).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StorageError::not_found(NAME, bucket, remote));
        }
        let response = self.check(response, bucket, remote.as_str()).await?;
        let headers = response.headers();

        let size = headers
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        let created = headers
            .get(header::LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
            .map(|v| v.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        Ok(Metadata {
            size,
            created,
            content_type,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let uri = self.object_uri(bucket, remote.as_str(), None)?;
        let request = http::Request::builder()
            .method(Method::DELETE)
            .uri(uri)
            .body(Body::empty())
            .map_err(StorageError::with(NAME, StorageErrorKind::InvalidRequest))?;

        let response = self.send(request, &sigv4::payload_hash(b"")).await?;
        self.check(response, bucket, remote.as_str()).await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, reader))]
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
        options: &UploadOptions,
    ) -> Result<(), StorageError> {
        let first = Self::read_part(reader, PART_SIZE).await?;

        let written = if first.len() < PART_SIZE {
            let written = first.len() as u64;
            self.put_object(bucket, remote.as_str(), first.into(), options)
                .await?;
            written
        } else {
            self.upload_multipart(bucket, remote.as_str(), first, reader, options)
                .await?
        };

        if let Some(expected) = options.content_length {
            if expected != written {
                tracing::warn!(%bucket, %remote, %expected, %written, "upload length mismatch");
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self, writer))]
    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let mut body = self.get(bucket, remote).await?;
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(StorageError::with(NAME, StorageErrorKind::Io))?;
            if let Ok(data) = frame.into_data() {
                writer
                    .write_all(&data)
                    .await
                    .map_err(|err| StorageError::from_io(NAME, err))?;
            }
        }
        writer
            .flush()
            .await
            .map_err(|err| StorageError::from_io(NAME, err))?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn open(&self, bucket: &str, remote: &Utf8Path) -> Result<ObjectStream, StorageError> {
        let body = self.get(bucket, remote).await?;
        let stream = body.into_data_stream().map_err(std::io::Error::other);
        Ok(Box::pin(tokio_util::io::StreamReader::new(stream)))
    }

    async fn signed_url(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        expires_in: Duration,
    ) -> Result<Uri, StorageError> {
        let Some(credentials) = &self.credentials else {
            return Err(StorageError::builder(
                NAME,
                StorageErrorKind::PermissionDenied,
                "signed URLs require credentials",
            )
            .bucket(bucket)
            .path(remote.as_str())
            .build());
        };

        let uri = self.object_uri(bucket, remote.as_str(), None)?;
        sigv4::presign(
            &Method::GET,
            &uri,
            &self.signing_params(credentials),
            expires_in.as_secs(),
        )
        .map_err(StorageError::with(NAME, StorageErrorKind::InvalidRequest))
    }

    #[tracing::instrument(skip(self))]
    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut query = String::from("list-type=2");
            if let Some(prefix) = prefix {
                query.push_str("&prefix=");
                let prefix = utf8_percent_encode(prefix.as_str(), sigv4::URI_ENCODE);
                query.push_str(&prefix.to_string());
            }
            if let Some(token) = &continuation {
                query.push_str("&continuation-token=");
                query.push_str(&utf8_percent_encode(token, sigv4::URI_ENCODE).to_string());
            }

            let uri = self.object_uri(bucket, "", Some(&query))?;
            let request = http::Request::builder()
                .method(Method::GET)
                .uri(uri)
                .body(Body::empty())
                .map_err(StorageError::with(NAME, StorageErrorKind::InvalidRequest))?;
            let response = self.send(request, &sigv4::payload_hash(b"")).await?;
            let body = self.body(self.check(response, bucket, "").await?).await?;
            let document = String::from_utf8_lossy(&body);

            keys.extend(xml::tag_values(&document, "Key"));

            continuation = match xml::tag_value(&document, "IsTruncated").as_deref() {
                Some("true") => xml::tag_value(&document, "NextContinuationToken"),
                _ => None,
            };
            if continuation.is_none() {
                break;
            }
        }

        Ok(keys)
    }
}
