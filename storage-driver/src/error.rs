use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use camino::Utf8Path;
use tracing_error::SpanTrace;

/// Categorizes storage errors by their semantic meaning, independent of
/// the driver which produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// The requested object or bucket was not found.
    NotFound,

    /// The caller lacks permission to perform the requested operation.
    PermissionDenied,

    /// The object already exists and the driver refused to replace it.
    AlreadyExists,

    /// The storage service has run out of space or quota.
    QuotaExceeded,

    /// The operation failed due to I/O errors (network, disk, etc.).
    Io,

    /// The backing storage service is temporarily unavailable.
    ServiceUnavailable,

    /// Authentication credentials have expired and need refresh.
    AuthExpired,

    /// The request was invalid.
    InvalidRequest,

    /// The driver does not implement the requested operation.
    Unsupported,

    /// The operation was retried multiple times but continued to fail.
    RetriesExhausted,

    /// Data serialization or deserialization failed.
    SerializationError,

    /// An unexpected or uncategorized error occurred.
    Other,
}

impl StorageErrorKind {
    /// Returns whether this error kind typically indicates a retryable condition.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorKind::ServiceUnavailable
                | StorageErrorKind::AuthExpired
                | StorageErrorKind::Io
        )
    }

    /// Classify an I/O error kind.
    pub fn from_io_kind(kind: std::io::ErrorKind) -> Self {
        match kind {
            std::io::ErrorKind::NotFound => StorageErrorKind::NotFound,
            std::io::ErrorKind::PermissionDenied => StorageErrorKind::PermissionDenied,
            std::io::ErrorKind::AlreadyExists => StorageErrorKind::AlreadyExists,
            std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded => {
                StorageErrorKind::QuotaExceeded
            }
            std::io::ErrorKind::InvalidInput | std::io::ErrorKind::InvalidData => {
                StorageErrorKind::InvalidRequest
            }
            _ => StorageErrorKind::Io,
        }
    }

    /// Classify an HTTP status returned by an object-store REST API.
    pub fn from_status(status: http::StatusCode) -> Self {
        match status.as_u16() {
            404 => StorageErrorKind::NotFound,
            401 | 403 => StorageErrorKind::PermissionDenied,
            409 | 412 => StorageErrorKind::AlreadyExists,
            400 | 405 | 411 | 416 => StorageErrorKind::InvalidRequest,
            507 => StorageErrorKind::QuotaExceeded,
            429 | 500..=504 => StorageErrorKind::ServiceUnavailable,
            _ => StorageErrorKind::Other,
        }
    }
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::NotFound => write!(f, "not found"),
            StorageErrorKind::PermissionDenied => write!(f, "permission denied"),
            StorageErrorKind::AlreadyExists => write!(f, "already exists"),
            StorageErrorKind::QuotaExceeded => write!(f, "quota exceeded"),
            StorageErrorKind::Io => write!(f, "I/O error"),
            StorageErrorKind::ServiceUnavailable => write!(f, "service unavailable"),
            StorageErrorKind::AuthExpired => write!(f, "authentication expired"),
            StorageErrorKind::InvalidRequest => write!(f, "invalid request"),
            StorageErrorKind::Unsupported => write!(f, "unsupported"),
            StorageErrorKind::RetriesExhausted => write!(f, "retries exhausted"),
            StorageErrorKind::SerializationError => write!(f, "serialization error"),
            StorageErrorKind::Other => write!(f, "other error"),
        }
    }
}

#[derive(Debug)]
struct ErrorTrace {
    backtrace: Backtrace,
    span_trace: SpanTrace,
}

impl ErrorTrace {
    #[track_caller]
    fn capture() -> Self {
        ErrorTrace {
            backtrace: Backtrace::capture(),
            span_trace: SpanTrace::capture(),
        }
    }
}

/// Storage error with the operation context it happened in.
///
/// Carries a [`StorageErrorKind`], the driver name, the bucket and path when
/// known, the underlying error, and the backtrace and span trace captured at
/// construction.
///
/// ```rust
/// use storage_driver::{StorageError, StorageErrorKind};
///
/// let error = StorageError::builder(
///     "local",
///     StorageErrorKind::NotFound,
///     std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
/// )
/// .bucket("cache")
/// .path("blobs/sha256:abc")
/// .build();
///
/// assert_eq!(error.kind(), StorageErrorKind::NotFound);
/// assert_eq!(error.path(), Some("blobs/sha256:abc"));
/// ```
#[derive(Debug)]
pub struct StorageError {
    kind: StorageErrorKind,
    engine: &'static str,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
    source: Box<dyn StdError + Send + Sync + 'static>,
    traces: Box<ErrorTrace>,
}

impl StdError for StorageError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.source.as_ref())
    }
}

impl StorageError {
    /// Create a new storage error with the minimum required information.
    pub fn new<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> Self
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Self::builder(engine, kind, error).build()
    }

    /// Create a builder, to attach bucket, path and context to the error.
    pub fn builder<E>(engine: &'static str, kind: StorageErrorKind, error: E) -> StorageErrorBuilder
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        StorageErrorBuilder {
            engine,
            kind,
            source: error.into(),
            bucket: None,
            path: None,
            context: None,
        }
    }

    /// A not-found error for a specific object.
    pub fn not_found(engine: &'static str, bucket: &str, path: &Utf8Path) -> Self {
        Self::builder(
            engine,
            StorageErrorKind::NotFound,
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("{path} not found")),
        )
        .bucket(bucket)
        .path(path.as_str())
        .build()
    }

    /// Convert an I/O error, classifying the kind from the I/O error kind.
    pub fn from_io(engine: &'static str, error: std::io::Error) -> Self {
        StorageError::new(engine, StorageErrorKind::from_io_kind(error.kind()), error)
    }

    /// Returns a boxed closure that creates a storage error from a downstream error,
    /// for use with `.map_err()`.
    ///
    /// ```rust
    /// use storage_driver::{StorageError, StorageErrorKind};
    ///
    /// fn operation() -> Result<(), StorageError> {
    ///     std::fs::File::open("file.txt")
    ///         .map_err(StorageError::with("local", StorageErrorKind::Io))?;
    ///     Ok(())
    /// }
    /// ```
    pub fn with<E>(
        engine: &'static str,
        kind: StorageErrorKind,
    ) -> Box<dyn FnOnce(E) -> StorageError + Send + Sync>
    where
        E: Into<Box<dyn StdError + Send + Sync + 'static>>,
    {
        Box::new(move |error: E| StorageError::new(engine, kind, error))
    }

    /// Returns the error kind.
    pub fn kind(&self) -> StorageErrorKind {
        self.kind
    }

    /// Returns the storage engine name.
    pub fn engine(&self) -> &'static str {
        self.engine
    }

    /// Returns the bucket name, if available.
    pub fn bucket(&self) -> Option<&str> {
        self.bucket.as_deref()
    }

    /// Returns the object path, if available.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Returns additional context, if available.
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Returns whether this error is likely retryable.
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Returns a reference to the captured backtrace.
    pub fn backtrace(&self) -> &Backtrace {
        &self.traces.backtrace
    }

    /// Returns the tracing span context at the point where this error was created.
    pub fn span_trace(&self) -> &SpanTrace {
        &self.traces.span_trace
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "storage error [{}] from {}", self.kind, self.engine)?;

        if let Some(bucket) = self.bucket.as_deref().filter(|b| !b.is_empty()) {
            write!(f, " (bucket: {})", bucket)?;
        }

        if let Some(path) = &self.path {
            write!(f, " (path: {})", path)?;
        }

        if let Some(context) = &self.context {
            write!(f, " ({})", context)?;
        }

        write!(f, ": {}", self.source)
    }
}

/// Builder for a [`StorageError`] with optional context fields.
#[derive(Debug)]
pub struct StorageErrorBuilder {
    kind: StorageErrorKind,
    engine: &'static str,
    source: Box<dyn StdError + Send + Sync + 'static>,
    bucket: Option<String>,
    path: Option<String>,
    context: Option<String>,
}

impl StorageErrorBuilder {
    /// Set the bucket name.
    pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
        self.bucket = Some(bucket.into());
        self
    }

    /// Set the object path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Set additional context.
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Build the `StorageError`.
    #[track_caller]
    pub fn build(self) -> StorageError {
        StorageError {
            kind: self.kind,
            engine: self.engine,
            bucket: self.bucket,
            path: self.path,
            context: self.context,
            source: self.source,
            traces: Box::new(ErrorTrace::capture()),
        }
    }
}
