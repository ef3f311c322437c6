//! Credentials for upstream registries.
//!
//! A [`CredentialProvider`] is picked per upstream host by [`for_registry`]:
//! static credentials from the backend URL win, otherwise the host decides
//! between GitHub, Azure workload identity and AWS ECR. Short-lived
//! credentials are cached until shortly before they expire.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use http::{HeaderValue, StatusCode};
use http_body_util::BodyExt as _;
use serde::de::DeserializeOwned;
use tower::ServiceExt as _;

use crate::flight::Cached;

mod aws;
mod azure;
mod github;
mod secret;

pub use self::aws::{AwsEcrCredentials, AwsIdentity};
pub use self::azure::{AzureCredentials, AzureIdentity};
pub use self::github::GithubCredentials;
pub use self::secret::{Secret, basic_auth};

/// HTTP client used for upstream and credential requests.
pub type HttpClient = hyperdriver::client::SharedClientService<hyperdriver::Body, hyperdriver::Body>;

/// How long before expiry a cached credential is refreshed.
fn refresh_margin() -> TimeDelta {
    TimeDelta::minutes(5)
}

/// Errors resolving upstream credentials.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// Required configuration is absent.
    #[error("missing {0}")]
    Missing(String),

    /// A helper program failed.
    #[error("{program} failed: {stderr}")]
    Command {
        /// Program that was run.
        program: String,
        /// Its stderr.
        stderr: String,
    },

    /// The provider could not be reached.
    #[error("credential request failed: {0}")]
    Request(#[from] hyperdriver::client::Error),

    /// The provider answered with an error.
    #[error("credential provider returned {status}: {body}")]
    Status {
        /// Response status.
        status: StatusCode,
        /// Response body.
        body: String,
    },

    /// The provider's answer could not be understood.
    #[error("invalid credential response: {0}")]
    Decode(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An error from a refresh shared with other callers.
    #[error(transparent)]
    Shared(Arc<CredentialError>),
}

impl CredentialError {
    /// Status the provider answered with, if it answered.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            CredentialError::Status { status, .. } => Some(*status),
            CredentialError::Shared(inner) => inner.status(),
            _ => None,
        }
    }
}

/// A username and password for an upstream registry.
#[derive(Debug, Clone)]
pub struct Credential {
    /// Username.
    pub username: String,
    /// Password or token.
    pub password: Secret,
    /// When the password stops working, if it does.
    pub expires: Option<DateTime<Utc>>,
}

impl Credential {
    /// A credential which does not expire.
    pub fn new(username: impl Into<String>, password: impl Into<Secret>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            expires: None,
        }
    }

    /// Set the expiry.
    pub fn expires(mut self, at: DateTime<Utc>) -> Self {
        self.expires = Some(at);
        self
    }

    /// An HTTP Basic `Authorization` value.
    pub fn authorization(&self) -> HeaderValue {
        basic_auth(&self.username, Some(self.password.revealed()))
    }
}

/// Something that can produce credentials for one upstream registry.
#[async_trait::async_trait]
pub trait CredentialProvider: fmt::Debug + Send + Sync {
    /// Resolve credentials. `None` means talk to the upstream anonymously.
    async fn credential(&self) -> Result<Option<Credential>, CredentialError>;
}

/// No credentials at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

#[async_trait::async_trait]
impl CredentialProvider for Anonymous {
    async fn credential(&self) -> Result<Option<Credential>, CredentialError> {
        Ok(None)
    }
}

/// A fixed username and password.
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credential);

impl StaticCredentials {
    /// Wrap a credential.
    pub fn new(credential: Credential) -> Self {
        Self(credential)
    }
}

#[async_trait::async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credential(&self) -> Result<Option<Credential>, CredentialError> {
        Ok(Some(self.0.clone()))
    }
}

type CachedResult = Result<Option<Credential>, Arc<CredentialError>>;

/// Caches another provider's credentials until shortly before they expire.
///
/// Failures are not cached.
pub struct CachedCredentials<P> {
    provider: Arc<P>,
    cache: Cached<CachedResult>,
}

impl<P: fmt::Debug> fmt::Debug for CachedCredentials<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedCredentials")
            .field("provider", &self.provider)
            .field("cache", &self.cache)
            .finish()
    }
}

impl<P> CachedCredentials<P> {
    /// Cache `provider`.
    pub fn new(provider: P) -> Self {
        Self {
            provider: Arc::new(provider),
            cache: Cached::default(),
        }
    }
}

fn lifetime(credential: &Credential) -> Option<Duration> {
    credential.expires.map(|expires| {
        (expires - Utc::now() - refresh_margin())
            .to_std()
            .unwrap_or(Duration::ZERO)
    })
}

#[async_trait::async_trait]
impl<P> CredentialProvider for CachedCredentials<P>
where
    P: CredentialProvider + 'static,
{
    async fn credential(&self) -> Result<Option<Credential>, CredentialError> {
        let provider = Arc::clone(&self.provider);
        self.cache
            .get(
                |result| result.is_ok(),
                move || {
                    Box::pin(async move {
                        let result = provider.credential().await.map_err(Arc::new);
                        let lifetime = match &result {
                            Ok(Some(credential)) => lifetime(credential),
                            _ => None,
                        };
                        (result, lifetime)
                    })
                },
            )
            .await
            .map_err(|_| CredentialError::Decode("credential refresh was abandoned".into()))?
            .map_err(CredentialError::Shared)
    }
}

/// Pick the credential provider for an upstream registry host.
pub fn for_registry(
    host: &str,
    username: Option<String>,
    password: Option<String>,
    client: HttpClient,
) -> Arc<dyn CredentialProvider> {
    let host = host.split(':').next().unwrap_or(host);

    match (username, password) {
        (Some(username), Some(password)) if !username.is_empty() && !password.is_empty() => {
            return Arc::new(StaticCredentials::new(Credential::new(username, password)));
        }
        _ => {}
    }

    if host == "ghcr.io" {
        tracing::debug!(%host, "using GitHub credentials");
        Arc::new(CachedCredentials::new(GithubCredentials::from_env()))
    } else if is_azure_registry(host) {
        tracing::debug!(%host, "using Azure workload identity");
        Arc::new(CachedCredentials::new(AzureCredentials::new(
            host,
            AzureIdentity::from_env(),
            client,
        )))
    } else if host.ends_with(".amazonaws.com") || host.ends_with(".amazonaws.com.cn") {
        tracing::debug!(%host, "using AWS ECR credentials");
        Arc::new(CachedCredentials::new(AwsEcrCredentials::new(
            host,
            AwsIdentity::from_env(),
            client,
        )))
    } else {
        Arc::new(Anonymous)
    }
}

fn is_azure_registry(host: &str) -> bool {
    [".azurecr.io", ".azurecr.us", ".azurecr.cn"]
        .iter()
        .any(|suffix| host.ends_with(suffix))
}

/// Send a request and return the body of a successful response.
async fn fetch(
    client: &HttpClient,
    request: http::Request<hyperdriver::Body>,
) -> Result<Bytes, CredentialError> {
    let uri = request.uri().clone();
    let response = client.clone().oneshot(request).await?;
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|error| CredentialError::Decode(format!("reading {uri}: {error}")))?
        .to_bytes();

    if !status.is_success() {
        tracing::warn!(%uri, %status, "credential provider rejected the request");
        return Err(CredentialError::Status {
            status,
            body: String::from_utf8_lossy(&body).into_owned(),
        });
    }
    Ok(body)
}

/// Send a request and decode a JSON response.
async fn fetch_json<T: DeserializeOwned>(
    client: &HttpClient,
    request: http::Request<hyperdriver::Body>,
) -> Result<T, CredentialError> {
    let body = fetch(client, request).await?;
    serde_json::from_slice(&body).map_err(|error| CredentialError::Decode(error.to_string()))
}

/// A `application/x-www-form-urlencoded` POST.
fn form_request(
    uri: &str,
    form: &[(&str, &str)],
) -> Result<http::Request<hyperdriver::Body>, CredentialError> {
    let body = serde_urlencoded::to_string(form)
        .map_err(|error| CredentialError::Decode(error.to_string()))?;
    http::Request::post(uri)
        .header(
            http::header::CONTENT_TYPE,
            "application/x-www-form-urlencoded",
        )
        .body(hyperdriver::Body::from(Bytes::from(body)))
        .map_err(|error| CredentialError::Decode(format!("building request to {uri}: {error}")))
}

#[cfg(test)]
pub(crate) mod mock {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use bytes::Bytes;
    use http::StatusCode;
    use http_body_util::BodyExt as _;

    /// A request as the mock saw it.
    #[derive(Debug, Clone)]
    pub(crate) struct Recorded {
        pub method: http::Method,
        pub uri: http::Uri,
        pub headers: http::HeaderMap,
        pub body: Bytes,
    }

    /// Canned upstream: replies by request path, records every request.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct MockService {
        responses: Arc<Mutex<HashMap<String, Vec<(StatusCode, http::HeaderMap, Vec<u8>)>>>>,
        requests: Arc<Mutex<Vec<Recorded>>>,
    }

    impl MockService {
        /// Queue a response for `path`. The last response for a path repeats.
        pub(crate) fn add(
            &self,
            path: &str,
            status: StatusCode,
            headers: &[(&str, &str)],
            body: impl Into<Vec<u8>>,
        ) {
            let mut map = http::HeaderMap::new();
            for (name, value) in headers {
                map.append(
                    http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                    value.parse().unwrap(),
                );
            }
            self.responses
                .lock()
                .unwrap()
                .entry(path.to_owned())
                .or_default()
                .push((status, map, body.into()));
        }

        pub(crate) fn requests(&self) -> Vec<Recorded> {
            self.requests.lock().unwrap().clone()
        }

        pub(crate) fn client(&self) -> super::HttpClient {
            hyperdriver::service::SharedService::new(self.clone())
        }
    }

    impl tower::Service<http::Request<hyperdriver::Body>> for MockService {
        type Response = http::Response<hyperdriver::Body>;
        type Error = hyperdriver::client::Error;
        type Future = std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
        >;

        fn poll_ready(
            &mut self,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<hyperdriver::Body>) -> Self::Future {
            let this = self.clone();
            Box::pin(async move {
                let (parts, body) = req.into_parts();
                let body = body.collect().await.unwrap().to_bytes();
                let path = parts.uri.path().to_owned();
                this.requests.lock().unwrap().push(Recorded {
                    method: parts.method,
                    uri: parts.uri,
                    headers: parts.headers,
                    body,
                });

                let (status, headers, body) = {
                    let mut responses = this.responses.lock().unwrap();
                    let queue = responses
                        .get_mut(&path)
                        .unwrap_or_else(|| panic!("No response configured for path: {path}"));
                    if queue.len() > 1 {
                        queue.remove(0)
                    } else {
                        queue[0].clone()
                    }
                };

                let mut builder = http::Response::builder().status(status);
                for (key, value) in headers.iter() {
                    builder = builder.header(key, value);
                }
                Ok(builder
                    .body(hyperdriver::Body::from(Bytes::from(body)))
                    .unwrap())
            })
        }
    }
}
