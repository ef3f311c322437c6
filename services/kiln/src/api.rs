//! API server builder and router

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use serde_json::json;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::Instrument as _;
use uuid::Uuid;

use crate::backend::Backend;
use crate::builder::ImageBuilder;
use crate::error::{RegistryError, RegistryResult};
use crate::orchestrator::Orchestrator;
use crate::reference::{DEFAULT_BRANCH, Digest, Reference, validate_name};

/// Correlation id echoed on every response.
pub const X_REQUEST_ID: &str = "x-request-id";

const API_VERSION: &str = "docker-distribution-api-version";

/// Registry builder for configuring and creating the registry service
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    backend: Option<Arc<dyn Backend>>,
    builder: Option<Arc<dyn ImageBuilder>>,
    default_branch: Option<String>,
}

impl RegistryBuilder {
    /// Create a new registry builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Where images are stored and served from.
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// What builds images for tags.
    pub fn builder(mut self, builder: Arc<dyn ImageBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    /// Branch that `latest` resolves to. Defaults to `public`.
    pub fn default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = Some(branch.into());
        self
    }

    /// Build the registry service
    ///
    /// Returns a Router that can be served with any tower-compatible server
    ///
    /// # Panics
    ///
    /// If no backend or no builder was configured.
    pub fn build(self) -> Router {
        let backend = self.backend.expect("backend must be configured");
        let builder = self.builder.expect("image builder must be configured");
        let branch = self
            .default_branch
            .unwrap_or_else(|| DEFAULT_BRANCH.to_owned());
        let orchestrator = Orchestrator::new(backend, builder).with_default_branch(branch);

        router(Arc::new(orchestrator))
    }
}

/// The registry routes over an existing orchestrator.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/v2", get(root))
        .route("/v2/", get(root))
        .route("/v2/token", get(token))
        .route("/v2/{*path}", get(dispatch))
        .layer(middleware::from_fn(request_span))
        .layer(SetResponseHeaderLayer::if_not_present(
            HeaderName::from_static(API_VERSION),
            HeaderValue::from_static("registry/2.0"),
        ))
        .with_state(orchestrator)
}

/// Wraps each request in a span with a fresh correlation id.
async fn request_span(request: Request, next: Next) -> Response {
    let id = Uuid::new_v4();
    let span = tracing::info_span!(
        "request",
        %id,
        method = %request.method(),
        path = %request.uri().path(),
    );

    async move {
        let mut response = next.run(request).await;
        if let Ok(value) = HeaderValue::from_str(&id.to_string()) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
        tracing::debug!(status = %response.status(), "response");
        response
    }
    .instrument(span)
    .await
}

/// API version check endpoint
async fn root(
    State(orchestrator): State<Arc<Orchestrator>>,
    request: Request,
) -> RegistryResult<Response> {
    let (parts, _) = request.into_parts();
    match orchestrator.backend().auth() {
        Some(auth) => auth.root(&parts).await,
        None => Ok((StatusCode::OK, Json(json!({}))).into_response()),
    }
}

/// Token passthrough, for backends which front an upstream registry.
async fn token(
    State(orchestrator): State<Arc<Orchestrator>>,
    request: Request,
) -> RegistryResult<Response> {
    let (parts, _) = request.into_parts();
    match orchestrator.backend().auth() {
        Some(auth) => auth.token(&parts).await,
        None => Err(RegistryError::NotFound(format!(
            "{} backend does not issue tokens",
            orchestrator.backend().name()
        ))),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Manifests,
    Blobs,
}

/// `{name}/{manifests|blobs}/{reference}`, where `name` may contain `/`.
fn split_path(path: &str) -> RegistryResult<(&str, Kind, &str)> {
    let unrouted = || RegistryError::NotFound(format!("no route for /v2/{path}"));

    let path = path.trim_start_matches('/');
    let (rest, reference) = path.rsplit_once('/').ok_or_else(unrouted)?;
    let (name, kind) = rest.rsplit_once('/').ok_or_else(unrouted)?;
    let kind = match kind {
        "manifests" => Kind::Manifests,
        "blobs" => Kind::Blobs,
        _ => return Err(unrouted()),
    };
    if reference.is_empty() {
        return Err(unrouted());
    }

    Ok((name, kind, reference))
}

async fn dispatch(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(path): Path<String>,
    request: Request,
) -> RegistryResult<Response> {
    let (name, kind, reference) = split_path(&path)?;
    validate_name(name)?;
    let (parts, _) = request.into_parts();
    tracing::info!(name, reference, ?kind, "registry request");

    let backend = orchestrator.backend();
    match kind {
        Kind::Blobs => {
            let digest = Digest::parse(reference)?;
            backend.blob(&parts, name, &digest).await
        }
        Kind::Manifests => match Reference::parse(reference)? {
            Reference::Digest(digest) => backend.manifest(&parts, name, &digest).await,
            Reference::Tag(tag) if parts.method == Method::HEAD => {
                match orchestrator.resolved(name, &tag) {
                    Some(stored) => Ok(stored.response(false)),
                    None => Err(RegistryError::ManifestUnknown(format!(
                        "{name}:{tag} has not been built"
                    ))),
                }
            }
            Reference::Tag(tag) => Ok(orchestrator.build(name, &tag).await?.response(true)),
        },
    }
}
