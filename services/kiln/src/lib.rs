//! # kiln
//!
//! A pull-through OCI registry which builds images on demand.
//!
//! A manifest request for a tag runs the image builder for that name and
//! tag, stores the resulting manifest and blobs in a [`Backend`], and serves
//! the manifest. Requests by digest, and all blob requests, are answered
//! straight from the backend. The backend is either an object store
//! ([`BucketBackend`]) or an upstream registry ([`ProxyBackend`]), chosen by
//! the scheme of its URL through a [`BackendRegistry`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kiln::{BackendRegistry, CommandBuilder, RegistryBuilder, default_command};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backends = BackendRegistry::with_defaults();
//! let router = RegistryBuilder::new()
//!     .backend(backends.open("file:///var/cache/kiln")?)
//!     .builder(Arc::new(CommandBuilder::new(default_command(), "/var/tmp/kiln")))
//!     .build();
//!
//! // Serve `router` with axum, or any tower-compatible server.
//! # drop(router);
//! # Ok(())
//! # }
//! ```

mod api;
pub mod backend;
pub mod builder;
pub mod config;
pub mod credentials;
mod error;
mod flight;
pub mod image;
mod orchestrator;
pub mod reference;

pub use api::{RegistryBuilder, X_REQUEST_ID, router};
pub use backend::{
    AuthBackend, Backend, BackendOpener, BackendRegistry, BucketBackend, ProxyBackend, Stored,
};
pub use builder::{BuildError, CommandBuilder, ImageBuilder, ImageTarball, default_command};
pub use config::KilnConfig;
pub use error::{ErrorInfo, ErrorResponse, RegistryError, RegistryResult};
pub use image::ImageArchive;
pub use orchestrator::Orchestrator;
pub use reference::{Digest, Reference, normalize_tag};
