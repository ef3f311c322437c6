//! Error types for the registry

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use storage::StorageErrorKind;

use crate::builder::BuildError;
use crate::credentials::CredentialError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Manifest not found
    #[error("manifest not found: {0}")]
    ManifestUnknown(String),

    /// Blob not found
    #[error("blob not found: {0}")]
    BlobUnknown(String),

    /// Anything else that does not exist: routes, backend schemes.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Invalid repository name
    #[error("invalid repository name: {0}")]
    InvalidName(String),

    /// Invalid tag
    #[error("invalid tag: {0}")]
    InvalidTag(String),

    /// Malformed input that is not a name, tag or digest.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The image builder failed or did not know the image name.
    #[error("build of {name} failed: {source}")]
    BuildFailed {
        /// Image name that was being built.
        name: String,
        /// Underlying builder error.
        #[source]
        source: BuildError,
    },

    /// The upstream registry (or a credential provider) answered with an error.
    #[error("upstream error: {message}")]
    Upstream {
        /// Status returned by the upstream, if it answered at all.
        status: Option<StatusCode>,
        /// Upstream message.
        message: String,
    },

    /// The upstream registry could not be reached.
    #[error("upstream request failed: {0}")]
    UpstreamRequest(#[from] hyperdriver::client::Error),

    /// Access denied
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Conflicting state, such as a duplicate backend scheme.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage quota exhausted
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// The built image archive is unusable.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal failure, such as a build task that went away.
    #[error("internal error: {0}")]
    Internal(String),

    /// An error shared between the callers of one single-flight build.
    #[error(transparent)]
    Shared(Arc<RegistryError>),
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::ManifestUnknown(_)
            | RegistryError::BlobUnknown(_)
            | RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidDigest(_)
            | RegistryError::InvalidName(_)
            | RegistryError::InvalidTag(_)
            | RegistryError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            RegistryError::BuildFailed { source, .. } if source.is_unknown_name() => {
                StatusCode::NOT_FOUND
            }
            RegistryError::Upstream {
                status: Some(status),
                ..
            } => *status,
            RegistryError::Upstream { status: None, .. } | RegistryError::UpstreamRequest(_) => {
                StatusCode::BAD_GATEWAY
            }
            RegistryError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            RegistryError::Conflict(_) => StatusCode::CONFLICT,
            RegistryError::ResourceExhausted(_) => StatusCode::INSUFFICIENT_STORAGE,
            RegistryError::Storage(error) => match error.kind() {
                StorageErrorKind::NotFound => StatusCode::NOT_FOUND,
                StorageErrorKind::PermissionDenied | StorageErrorKind::AuthExpired => {
                    StatusCode::FORBIDDEN
                }
                StorageErrorKind::AlreadyExists => StatusCode::CONFLICT,
                StorageErrorKind::QuotaExceeded => StatusCode::INSUFFICIENT_STORAGE,
                StorageErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
                StorageErrorKind::Unsupported => StatusCode::NOT_IMPLEMENTED,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            RegistryError::Shared(inner) => inner.status_code(),
            RegistryError::BuildFailed { .. }
            | RegistryError::InvalidImage(_)
            | RegistryError::DigestMismatch { .. }
            | RegistryError::Io(_)
            | RegistryError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            RegistryError::BlobUnknown(_) => "BLOB_UNKNOWN",
            RegistryError::NotFound(_) => "NAME_UNKNOWN",
            RegistryError::InvalidDigest(_) | RegistryError::DigestMismatch { .. } => {
                "DIGEST_INVALID"
            }
            RegistryError::InvalidName(_) => "NAME_INVALID",
            RegistryError::InvalidTag(_) => "TAG_INVALID",
            RegistryError::InvalidArgument(_) => "UNSUPPORTED",
            RegistryError::BuildFailed { source, .. } if source.is_unknown_name() => {
                "NAME_UNKNOWN"
            }
            RegistryError::Upstream {
                status: Some(StatusCode::UNAUTHORIZED),
                ..
            } => "UNAUTHORIZED",
            RegistryError::PermissionDenied(_) => "DENIED",
            RegistryError::Storage(error) => match error.kind() {
                StorageErrorKind::NotFound => "BLOB_UNKNOWN",
                StorageErrorKind::PermissionDenied | StorageErrorKind::AuthExpired => "DENIED",
                _ => "UNKNOWN",
            },
            RegistryError::Shared(inner) => inner.error_code(),
            _ => "UNKNOWN",
        }
    }

    /// Replace a storage not-found with a registry-level not-found.
    pub(crate) fn or_unknown(self, unknown: impl FnOnce() -> RegistryError) -> RegistryError {
        match self {
            RegistryError::Storage(error) if error.kind() == StorageErrorKind::NotFound => {
                unknown()
            }
            other => other,
        }
    }
}

impl From<Arc<RegistryError>> for RegistryError {
    fn from(error: Arc<RegistryError>) -> Self {
        RegistryError::Shared(error)
    }
}

impl From<CredentialError> for RegistryError {
    fn from(error: CredentialError) -> Self {
        match error {
            CredentialError::Request(error) => RegistryError::UpstreamRequest(error),
            CredentialError::Status { status, body } => RegistryError::Upstream {
                status: Some(status),
                message: format!("credential provider: {body}"),
            },
            other => RegistryError::Upstream {
                status: other.status(),
                message: other.to_string(),
            },
        }
    }
}

/// OCI error response format
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Errors reported by the registry.
    #[serde(default)]
    pub errors: Vec<ErrorInfo>,
}

/// A single entry of an OCI error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// OCI error code, e.g. `MANIFEST_UNKNOWN`.
    pub code: String,
    /// Human readable message.
    #[serde(default)]
    pub message: String,
    /// Unstructured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(%status, code, "{message}");
        } else {
            tracing::debug!(%status, code, "{message}");
        }

        let body = ErrorResponse {
            errors: vec![ErrorInfo {
                code: code.to_owned(),
                message,
                detail: None,
            }],
        };

        (status, axum::Json(body)).into_response()
    }
}
