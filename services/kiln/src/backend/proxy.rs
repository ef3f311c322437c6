//! A backend which fronts an upstream OCI registry.
//!
//! Reads are proxied to `{host}/v2/{repository}/{name}/...`, and built images
//! are pushed to `{host}/{repository}/{name}:{reference}`. The upstream's
//! token endpoint is proxied too, so clients authenticate against kiln as if
//! it were the upstream.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use axum::http::{HeaderValue, Method, StatusCode, header, request::Parts};
use axum::response::Response;
use bytes::Bytes;
use http_auth::parser::ChallengeParser;
use http_body_util::BodyExt as _;
use serde::Deserialize;
use tokio::io::AsyncReadExt as _;
use tower::ServiceExt as _;
use url::Url;

use super::{AuthBackend, Backend, DOCKER_CONTENT_DIGEST, Stored, parse_bool};
use crate::credentials::{self, CredentialProvider, HttpClient, Secret};
use crate::error::{ErrorResponse, RegistryError, RegistryResult};
use crate::image::{ArchivedBlob, ImageArchive};
use crate::reference::Digest;

const DEFAULT_TOKEN_PATH: &str = "/token";
const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;
const X_REDIRECTED: &str = "x-redirected";

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

type UpstreamResponse = http::Response<hyperdriver::Body>;

/// Proxies reads to, and pushes builds to, one repository of an upstream registry.
pub struct ProxyBackend {
    scheme: &'static str,
    host: String,
    repository: String,
    token_path: String,
    credentials: Arc<dyn CredentialProvider>,
    client: HttpClient,
    chunk_size: usize,
}

impl fmt::Debug for ProxyBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyBackend")
            .field("scheme", &self.scheme)
            .field("host", &self.host)
            .field("repository", &self.repository)
            .field("token_path", &self.token_path)
            .field("credentials", &self.credentials)
            .finish()
    }
}

fn decoded(value: &str) -> Option<String> {
    Some(percent_encoding::percent_decode_str(value).decode_utf8_lossy().into_owned())
        .filter(|value| !value.is_empty())
}

fn upstream_error(message: impl Into<String>) -> RegistryError {
    RegistryError::Upstream {
        status: None,
        message: message.into(),
    }
}

impl ProxyBackend {
    /// Open `registry://[user:pass@]host/repository?token_path=&tls_verify=`.
    pub fn from_url(url: &Url, client: HttpClient) -> RegistryResult<Self> {
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) if !host.is_empty() => format!("{host}:{port}"),
            (Some(host), None) if !host.is_empty() => host.to_owned(),
            _ => {
                return Err(RegistryError::InvalidArgument(format!(
                    "registry URL {url} has no host"
                )));
            }
        };
        let repository = url.path().trim_matches('/').to_owned();
        let params: BTreeMap<String, String> = url.query_pairs().into_owned().collect();

        // An unparseable tls_verify keeps TLS on.
        let scheme = match params.get("tls_verify").map(|value| parse_bool(value)) {
            Some(Ok(false)) => "http",
            _ => "https",
        };

        let mut token_path = DEFAULT_TOKEN_PATH.to_owned();
        match host.as_str() {
            "ghcr.io" if repository.is_empty() => {
                return Err(RegistryError::InvalidArgument(format!(
                    "repository cannot be empty for {host}: try registry://{host}/<user>"
                )));
            }
            "gcr.io" => token_path = "/v2/token".to_owned(),
            _ => {}
        }
        if let Some(path) = params.get("token_path").filter(|path| !path.is_empty()) {
            token_path = if path.starts_with('/') {
                path.clone()
            } else {
                format!("/{path}")
            };
        }

        let credentials = credentials::for_registry(
            &host,
            decoded(url.username()),
            url.password().and_then(decoded),
            client.clone(),
        );

        Ok(Self {
            scheme,
            host,
            repository,
            token_path,
            credentials,
            client,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Replace the credential provider.
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Size of each `PATCH` when pushing blobs.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}://{}{}", self.scheme, self.host, path)
    }

    fn token_url(&self) -> String {
        self.url(&self.token_path)
    }

    fn upstream_path(&self, segments: &[&str]) -> String {
        let mut path = String::from("/v2");
        for segment in std::iter::once(self.repository.as_str())
            .chain(segments.iter().copied())
            .map(|segment| segment.trim_matches('/'))
            .filter(|segment| !segment.is_empty())
        {
            path.push('/');
            path.push_str(segment);
        }
        path
    }

    async fn send(
        &self,
        request: http::Request<hyperdriver::Body>,
    ) -> RegistryResult<UpstreamResponse> {
        tracing::trace!(method = %request.method(), uri = %request.uri(), "upstream request");
        Ok(self.client.clone().oneshot(request).await?)
    }

    fn location(&self, response: &UpstreamResponse) -> RegistryResult<String> {
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| upstream_error("upload response has no Location"))?;

        if location.starts_with('/') {
            Ok(self.url(location))
        } else {
            Ok(location.to_owned())
        }
    }

    /// Forward the inbound request to `path` on the upstream.
    async fn proxy(
        &self,
        parts: &Parts,
        path: &str,
        query: Option<&str>,
        authorization: Option<HeaderValue>,
    ) -> RegistryResult<Response> {
        let mut uri = self.url(path);
        if let Some(query) = query.filter(|query| !query.is_empty()) {
            uri.push('?');
            uri.push_str(query);
        }

        let mut request = http::Request::builder()
            .method(parts.method.clone())
            .uri(&uri);
        if let Some(headers) = request.headers_mut() {
            for (name, value) in &parts.headers {
                if name != header::HOST {
                    headers.append(name.clone(), value.clone());
                }
            }
            if let Some(authorization) = authorization {
                headers.insert(header::AUTHORIZATION, authorization);
            }
        }
        let request = finish(request, hyperdriver::Body::empty())?;

        tracing::debug!(method = %parts.method, %uri, "proxying to upstream");
        let (head, body) = self.send(request).await?.into_parts();

        let body = if head.status.is_client_error() || head.status.is_server_error() {
            let bytes = body
                .collect()
                .await
                .map_err(|error| RegistryError::Upstream {
                    status: Some(head.status),
                    message: error.to_string(),
                })?
                .to_bytes();
            log_upstream_errors(&uri, head.status, &bytes);
            axum::body::Body::from(bytes)
        } else {
            axum::body::Body::new(body)
        };

        let mut response = Response::new(body);
        *response.status_mut() = head.status;
        let headers = response.headers_mut();
        for (name, value) in &head.headers {
            if !HOP_BY_HOP.contains(&name.as_str()) {
                headers.append(name.clone(), value.clone());
            }
        }
        if let Ok(value) = HeaderValue::from_str(&uri) {
            headers.insert(X_REDIRECTED, value);
        }

        if let Some(challenge) = head
            .headers
            .get(header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
        {
            let rewritten = challenge.replacen(&self.token_url(), &local_token_url(parts), 1);
            tracing::debug!(before = %challenge, after = %rewritten, "Www-Authenticate");
            if let Ok(value) = HeaderValue::from_str(&rewritten) {
                headers.insert(header::WWW_AUTHENTICATE, value);
            }
        }

        Ok(response)
    }

    /// Authorization for pushing to `repository`, following the upstream's challenge.
    async fn push_authorization(&self, repository: &str) -> RegistryResult<Option<HeaderValue>> {
        let basic = self
            .credentials
            .credential()
            .await?
            .map(|credential| credential.authorization());

        let response = self
            .send(finish(
                http::Request::get(self.url("/v2/")),
                hyperdriver::Body::empty(),
            )?)
            .await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(basic);
        }

        let Some(challenge) = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(BearerChallenge::parse)
        else {
            return Ok(basic);
        };

        let mut query = vec![("scope", format!("repository:{repository}:pull,push"))];
        if let Some(service) = challenge.service {
            query.push(("service", service));
        }
        let query = serde_urlencoded::to_string(&query)
            .map_err(|error| RegistryError::Internal(error.to_string()))?;
        let separator = if challenge.realm.contains('?') { '&' } else { '?' };

        let mut request = http::Request::get(format!("{}{separator}{query}", challenge.realm));
        if let Some(basic) = &basic {
            request = request.header(header::AUTHORIZATION, basic.clone());
        }
        let response = check(
            self.send(finish(request, hyperdriver::Body::empty())?).await?,
            "token",
        )
        .await?;

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|error| upstream_error(format!("reading token: {error}")))?
            .to_bytes();
        let token: TokenResponse = serde_json::from_slice(&body)
            .map_err(|error| upstream_error(format!("decoding token: {error}")))?;
        let token = token
            .token
            .or(token.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| upstream_error("token response has no token"))?;

        let bearer = Secret::from(token)
            .bearer()
            .map_err(|error| upstream_error(format!("token: {error}")))?;
        Ok(Some(bearer))
    }
}

fn finish(
    builder: http::request::Builder,
    body: hyperdriver::Body,
) -> RegistryResult<http::Request<hyperdriver::Body>> {
    builder
        .body(body)
        .map_err(|error| RegistryError::InvalidArgument(format!("upstream request: {error}")))
}

/// Turn an unsuccessful upstream response into an error.
async fn check(response: UpstreamResponse, what: &str) -> RegistryResult<UpstreamResponse> {
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
    log_upstream_errors(what, status, &body);

    let message = serde_json::from_slice::<ErrorResponse>(&body)
        .ok()
        .and_then(|response| response.errors.into_iter().next())
        .map(|error| format!("{}: {}", error.code, error.message))
        .unwrap_or_else(|| String::from_utf8_lossy(&body).into_owned());
    Err(RegistryError::Upstream {
        status: Some(status),
        message: format!("{what}: {message}"),
    })
}

fn log_upstream_errors(uri: &str, status: StatusCode, body: &[u8]) {
    let errors = serde_json::from_slice::<ErrorResponse>(body)
        .map(|response| response.errors)
        .unwrap_or_default();

    if errors.is_empty() {
        tracing::warn!(%uri, %status, "{}", String::from_utf8_lossy(body));
    }
    for error in errors {
        tracing::warn!(
            %uri,
            %status,
            code = %error.code,
            detail = ?error.detail,
            "{}",
            error.message
        );
    }
}

/// `/v2/token` on this service, as the client reached it.
fn local_token_url(parts: &Parts) -> String {
    let scheme = parts
        .headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .or_else(|| parts.uri.scheme_str())
        .unwrap_or("http");
    let host = parts
        .headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| parts.uri.authority().map(|authority| authority.as_str()))
        .unwrap_or("localhost");
    format!("{scheme}://{host}/v2/token")
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
}

impl BearerChallenge {
    fn parse(value: &str) -> Option<Self> {
        let challenge = ChallengeParser::new(value)
            .filter_map(Result::ok)
            .find(|challenge| challenge.scheme.eq_ignore_ascii_case("Bearer"))?;

        let mut realm = None;
        let mut service = None;
        for (key, value) in &challenge.params {
            if key.eq_ignore_ascii_case("realm") {
                realm = Some(value.to_unescaped());
            } else if key.eq_ignore_ascii_case("service") {
                service = Some(value.to_unescaped());
            }
        }

        Some(Self {
            realm: realm?,
            service,
        })
    }
}

/// One push of an image to an upstream repository.
struct Push<'a> {
    backend: &'a ProxyBackend,
    repository: String,
    authorization: Option<HeaderValue>,
}

impl Push<'_> {
    fn request(&self, method: Method, uri: &str) -> http::request::Builder {
        let builder = http::Request::builder().method(method).uri(uri);
        match &self.authorization {
            Some(authorization) => builder.header(header::AUTHORIZATION, authorization.clone()),
            None => builder,
        }
    }

    async fn blob(&self, image: &ImageArchive, blob: &ArchivedBlob) -> RegistryResult<()> {
        let backend = self.backend;
        let url = backend.url(&format!("/v2/{}/blobs/{}", self.repository, blob.digest));
        let response = backend
            .send(finish(
                self.request(Method::HEAD, &url),
                hyperdriver::Body::empty(),
            )?)
            .await?;
        if response.status().is_success() {
            tracing::trace!(digest = %blob.digest, "blob already pushed");
            return Ok(());
        }

        let start = backend.url(&format!("/v2/{}/blobs/uploads/", self.repository));
        let response = backend
            .send(finish(
                self.request(Method::POST, &start),
                hyperdriver::Body::empty(),
            )?)
            .await?;
        let mut location = backend.location(&check(response, "start upload").await?)?;

        let mut reader = image.open_blob(blob).await?;
        let mut offset: u64 = 0;
        loop {
            let mut chunk = Vec::with_capacity(backend.chunk_size.min(blob.size as usize));
            (&mut reader)
                .take(backend.chunk_size as u64)
                .read_to_end(&mut chunk)
                .await?;
            if chunk.is_empty() {
                break;
            }

            let end = offset + chunk.len() as u64 - 1;
            let request = self
                .request(Method::PATCH, &location)
                .header(header::CONTENT_RANGE, format!("{offset}-{end}"))
                .header(header::CONTENT_LENGTH, chunk.len())
                .header(header::CONTENT_TYPE, "application/octet-stream");
            let response = backend
                .send(finish(request, hyperdriver::Body::from(Bytes::from(chunk)))?)
                .await?;
            location = backend.location(&check(response, "upload chunk").await?)?;
            offset = end + 1;
        }

        let separator = if location.contains('?') { '&' } else { '?' };
        let commit = format!("{location}{separator}digest={}", blob.digest);
        let request = self
            .request(Method::PUT, &commit)
            .header(header::CONTENT_LENGTH, 0u64);
        check(
            backend
                .send(finish(request, hyperdriver::Body::empty())?)
                .await?,
            "commit upload",
        )
        .await?;

        tracing::debug!(digest = %blob.digest, size = offset, "pushed blob");
        Ok(())
    }

    async fn manifest(&self, image: &ImageArchive, reference: &str) -> RegistryResult<()> {
        let url = self
            .backend
            .url(&format!("/v2/{}/manifests/{reference}", self.repository));
        let request = self
            .request(Method::PUT, &url)
            .header(header::CONTENT_TYPE, image.media_type())
            .header(header::CONTENT_LENGTH, image.manifest().len());
        let response = check(
            self.backend
                .send(finish(
                    request,
                    hyperdriver::Body::from(image.manifest().clone()),
                )?)
                .await?,
            "push manifest",
        )
        .await?;

        if let Some(digest) = response
            .headers()
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|value| value.to_str().ok())
        {
            if digest != image.digest().as_str() {
                return Err(RegistryError::DigestMismatch {
                    expected: image.digest().to_string(),
                    actual: digest.to_owned(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Backend for ProxyBackend {
    fn name(&self) -> &str {
        "proxy"
    }

    #[tracing::instrument(skip(self, image), fields(host = %self.host, digest = %image.digest()))]
    async fn store(
        &self,
        image: &ImageArchive,
        name: &str,
        reference: &str,
    ) -> RegistryResult<Stored> {
        let repository = [self.repository.as_str(), name]
            .into_iter()
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        let push = Push {
            backend: self,
            authorization: self.push_authorization(&repository).await?,
            repository,
        };

        let blobs: BTreeMap<&Digest, &ArchivedBlob> =
            image.blobs().map(|blob| (&blob.digest, blob)).collect();
        futures::future::try_join_all(blobs.into_values().map(|blob| push.blob(image, blob)))
            .await?;
        push.manifest(image, reference).await?;

        tracing::info!("pushed {}/{}:{reference}", self.host, push.repository);
        Ok(Stored::from_archive(image))
    }

    async fn manifest(
        &self,
        parts: &Parts,
        name: &str,
        digest: &Digest,
    ) -> RegistryResult<Response> {
        let path = self.upstream_path(&[name, "manifests", digest.as_str()]);
        self.proxy(parts, &path, None, None).await
    }

    async fn blob(&self, parts: &Parts, name: &str, digest: &Digest) -> RegistryResult<Response> {
        let path = self.upstream_path(&[name, "blobs", digest.as_str()]);
        self.proxy(parts, &path, None, None).await
    }

    fn auth(&self) -> Option<&dyn AuthBackend> {
        Some(self)
    }
}

#[async_trait::async_trait]
impl AuthBackend for ProxyBackend {
    async fn root(&self, parts: &Parts) -> RegistryResult<Response> {
        self.proxy(parts, "/v2/", None, None).await
    }

    async fn token(&self, parts: &Parts) -> RegistryResult<Response> {
        let mut query: Vec<(String, String)> =
            serde_urlencoded::from_str(parts.uri.query().unwrap_or_default()).map_err(|error| {
                RegistryError::InvalidArgument(format!("token query: {error}"))
            })?;

        let scope = format!("repository:{}:pull", self.repository);
        let requested: Vec<&str> = query
            .iter()
            .filter(|(key, _)| key == "scope")
            .map(|(_, value)| value.as_str())
            .collect();
        tracing::debug!(before = ?requested, after = %scope, "scope");
        query.retain(|(key, _)| key != "scope");
        query.push(("scope".to_owned(), scope));
        query.sort_by(|a, b| a.0.cmp(&b.0));
        let query = serde_urlencoded::to_string(&query)
            .map_err(|error| RegistryError::Internal(error.to_string()))?;

        // Anonymous pulls still work when our own credentials are unavailable.
        let authorization = if parts.headers.contains_key(header::AUTHORIZATION) {
            None
        } else {
            match self.credentials.credential().await {
                Ok(credential) => credential.map(|credential| credential.authorization()),
                Err(error) => {
                    tracing::warn!(
                        host = %self.host,
                        "forwarding token request without credentials: {error}"
                    );
                    None
                }
            }
        };

        self.proxy(parts, &self.token_path, Some(&query), authorization)
            .await
    }
}
