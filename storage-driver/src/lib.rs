//! # Storage drivers
//!
//! The object-store seam used by the registry cache: a [`Driver`] stores
//! opaque objects under `bucket` + `path` keys, remembers the content type
//! each object was written with, and can optionally hand out signed URLs.

mod driver;
mod error;

pub use driver::Driver;
pub use driver::Metadata;
pub use driver::ObjectStream;
pub use driver::Reader;
pub use driver::UploadOptions;
pub use driver::Writer;
pub use error::{StorageError, StorageErrorBuilder, StorageErrorKind};
