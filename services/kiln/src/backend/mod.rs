//! Backends: where built images are kept, and how they are served.
//!
//! A [`Backend`] is opened once from a URL by the [`BackendRegistry`], which
//! picks an implementation by URL scheme:
//!
//! | Scheme                      | Backend            |
//! |-----------------------------|--------------------|
//! | `file`, `mem`, `s3`, `gs`   | [`BucketBackend`]  |
//! | `registry`                  | [`ProxyBackend`]   |

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use axum::http::{HeaderValue, StatusCode, header, request::Parts};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use url::Url;

use crate::error::{RegistryError, RegistryResult};
use crate::image::ImageArchive;
use crate::reference::Digest;

mod bucket;
mod proxy;

pub use self::bucket::BucketBackend;
pub use self::proxy::ProxyBackend;

/// Header carrying the digest of the content in a response.
pub const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// A manifest which has been written to a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored {
    /// Manifest digest.
    pub digest: Digest,
    /// Manifest media type.
    pub media_type: String,
    /// Raw manifest bytes, exactly as stored.
    pub manifest: Bytes,
}

impl Stored {
    /// Describe the manifest of an image archive.
    pub fn from_archive(image: &ImageArchive) -> Self {
        Self {
            digest: image.digest().clone(),
            media_type: image.media_type().to_owned(),
            manifest: image.manifest().clone(),
        }
    }

    /// Response headers for this manifest, with the body only when `body` is set.
    pub fn response(&self, body: bool) -> Response {
        let headers = [
            (header::CONTENT_TYPE, self.media_type.clone()),
            (header::CONTENT_LENGTH, self.manifest.len().to_string()),
            (
                header::HeaderName::from_static(DOCKER_CONTENT_DIGEST),
                self.digest.to_string(),
            ),
        ];

        if body {
            (StatusCode::OK, headers, self.manifest.clone()).into_response()
        } else {
            (StatusCode::OK, headers).into_response()
        }
    }
}

impl IntoResponse for Stored {
    fn into_response(self) -> Response {
        self.response(true)
    }
}

pub(crate) fn digest_header(digest: &Digest) -> HeaderValue {
    HeaderValue::from_str(digest.as_str()).expect("digests are valid header values")
}

/// A storage, build and serving target for images.
#[async_trait::async_trait]
pub trait Backend: fmt::Debug + Send + Sync {
    /// Short name, for logs.
    fn name(&self) -> &str;

    /// Persist a freshly built image under `name:reference`.
    ///
    /// Blobs are written before the manifest that refers to them, and anything
    /// already present is left alone.
    async fn store(
        &self,
        image: &ImageArchive,
        name: &str,
        reference: &str,
    ) -> RegistryResult<Stored>;

    /// Serve (GET) or describe (HEAD) a manifest by digest.
    async fn manifest(&self, parts: &Parts, name: &str, digest: &Digest)
    -> RegistryResult<Response>;

    /// Serve (GET) or describe (HEAD) a blob by digest.
    async fn blob(&self, parts: &Parts, name: &str, digest: &Digest) -> RegistryResult<Response>;

    /// Root and token endpoints, for backends which front an upstream registry.
    fn auth(&self) -> Option<&dyn AuthBackend> {
        None
    }
}

/// The discovery and token half of the distribution API.
#[async_trait::async_trait]
pub trait AuthBackend: Send + Sync {
    /// `GET /v2/`
    async fn root(&self, parts: &Parts) -> RegistryResult<Response>;

    /// `GET /v2/token`
    async fn token(&self, parts: &Parts) -> RegistryResult<Response>;
}

/// Constructs a backend from its URL.
pub trait BackendOpener: Send + Sync {
    /// Open the backend at `url`.
    fn open(&self, url: &Url) -> RegistryResult<Arc<dyn Backend>>;
}

impl<F> BackendOpener for F
where
    F: Fn(&Url) -> RegistryResult<Arc<dyn Backend>> + Send + Sync,
{
    fn open(&self, url: &Url) -> RegistryResult<Arc<dyn Backend>> {
        (self)(url)
    }
}

/// Backend constructors by URL scheme.
///
/// Built once at startup and handed to whatever needs to open a backend.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    openers: HashMap<String, Arc<dyn BackendOpener>>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("schemes", &self.schemes())
            .finish()
    }
}

impl BackendRegistry {
    /// A registry with no schemes.
    pub fn new() -> Self {
        Self::default()
    }

    /// The bucket and proxy backends.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(open_bucket, &["file", "mem", "s3", "gs", "azblob"])
            .expect("default schemes are distinct");
        registry
            .register(open_proxy, &["registry"])
            .expect("default schemes are distinct");
        registry
    }

    /// Register `opener` for each of `schemes`.
    ///
    /// Fails without registering anything if a scheme is already taken.
    pub fn register<O>(&mut self, opener: O, schemes: &[&str]) -> RegistryResult<()>
    where
        O: BackendOpener + 'static,
    {
        if let Some(taken) = schemes
            .iter()
            .find(|scheme| self.openers.contains_key(**scheme))
        {
            return Err(RegistryError::Conflict(format!(
                "backend scheme {taken} is already registered"
            )));
        }

        let opener: Arc<dyn BackendOpener> = Arc::new(opener);
        for scheme in schemes {
            self.openers.insert((*scheme).to_owned(), Arc::clone(&opener));
        }
        Ok(())
    }

    /// Open the backend a URL names.
    pub fn open(&self, url: &str) -> RegistryResult<Arc<dyn Backend>> {
        let url = Url::parse(url).map_err(|error| {
            RegistryError::InvalidArgument(format!("backend URL {url}: {error}"))
        })?;
        let opener = self.openers.get(url.scheme()).ok_or_else(|| {
            RegistryError::NotFound(format!("no backend for scheme {}", url.scheme()))
        })?;

        let backend = opener.open(&url)?;
        tracing::info!(backend = backend.name(), scheme = url.scheme(), "opened backend");
        Ok(backend)
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.openers.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }
}

fn open_bucket(url: &Url) -> RegistryResult<Arc<dyn Backend>> {
    Ok(Arc::new(BucketBackend::open(url)?))
}

fn open_proxy(url: &Url) -> RegistryResult<Arc<dyn Backend>> {
    let client = hyperdriver::Client::build_tcp_http()
        .with_default_tls()
        .build_service();
    Ok(Arc::new(ProxyBackend::from_url(url, client)?))
}

/// Split recognised parameters out of a backend URL, leaving the rest in place.
pub(crate) fn take_params(url: &Url, names: &[&str]) -> (Url, BTreeMap<String, String>) {
    let mut taken = BTreeMap::new();
    let mut rest = Vec::new();
    for (key, value) in url.query_pairs() {
        if names.contains(&key.as_ref()) {
            taken.insert(key.into_owned(), value.into_owned());
        } else {
            rest.push((key.into_owned(), value.into_owned()));
        }
    }

    let mut url = url.clone();
    if rest.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(rest);
    }
    (url, taken)
}

/// `strconv.ParseBool` spellings.
pub(crate) fn parse_bool(value: &str) -> RegistryResult<bool> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        other => Err(RegistryError::InvalidArgument(format!(
            "invalid boolean {other:?}"
        ))),
    }
}
