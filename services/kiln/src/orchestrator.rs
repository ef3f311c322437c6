//! Resolving tags by building them.
//!
//! A tag is normalized, built into a tarball, indexed, and stored in the
//! backend. Concurrent requests for the same `(name, tag)` share one build,
//! and every successful build is remembered so that `HEAD` can answer for
//! the tag without building.

use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::backend::{Backend, Stored};
use crate::builder::ImageBuilder;
use crate::error::{RegistryError, RegistryResult};
use crate::flight::Flights;
use crate::image::ImageArchive;
use crate::reference::{DEFAULT_BRANCH, normalize_tag};

type Key = (String, String);
type Outcome = Result<Stored, Arc<RegistryError>>;

/// Builds images on demand and stores them in a backend.
#[derive(Debug)]
pub struct Orchestrator {
    backend: Arc<dyn Backend>,
    builder: Arc<dyn ImageBuilder>,
    default_branch: String,
    flights: Flights<Key, Outcome>,
    resolved: Arc<DashMap<Key, Stored>>,
}

impl Orchestrator {
    /// Build with `builder`, store into `backend`.
    pub fn new(backend: Arc<dyn Backend>, builder: Arc<dyn ImageBuilder>) -> Self {
        Self {
            backend,
            builder,
            default_branch: DEFAULT_BRANCH.to_owned(),
            flights: Flights::default(),
            resolved: Arc::default(),
        }
    }

    /// Set the branch that `latest` resolves to.
    pub fn with_default_branch(mut self, branch: impl Into<String>) -> Self {
        self.default_branch = branch.into();
        self
    }

    /// The backend images are stored in.
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// `latest` becomes the default branch; every other tag is unchanged.
    pub fn normalize<'a>(&'a self, tag: &'a str) -> &'a str {
        normalize_tag(tag, &self.default_branch)
    }

    /// The image a tag resolved to, if it has been built by this process.
    pub fn resolved(&self, name: &str, tag: &str) -> Option<Stored> {
        let key = (name.to_owned(), self.normalize(tag).to_owned());
        self.resolved.get(&key).map(|entry| entry.value().clone())
    }

    /// Build `name:tag` and store it, joining a build already in flight for
    /// the same name and normalized tag.
    pub async fn build(&self, name: &str, tag: &str) -> RegistryResult<Stored> {
        let tag = self.normalize(tag).to_owned();
        let key = (name.to_owned(), tag.clone());

        let backend = Arc::clone(&self.backend);
        let builder = Arc::clone(&self.builder);
        let resolved = Arc::clone(&self.resolved);
        let name = name.to_owned();

        let handle = self.flights.handle(key, move || {
            Box::pin(async move {
                let stored = build_and_store(backend.as_ref(), builder.as_ref(), &name, &tag)
                    .await
                    .map_err(Arc::new)?;
                resolved.insert((name, tag), stored.clone());
                Ok(stored)
            })
        });

        handle
            .await
            .map_err(|error| RegistryError::Internal(format!("build was abandoned: {error}")))?
            .map_err(RegistryError::Shared)
    }
}

#[tracing::instrument(skip(backend, builder), fields(backend = backend.name()))]
async fn build_and_store(
    backend: &dyn Backend,
    builder: &dyn ImageBuilder,
    name: &str,
    tag: &str,
) -> RegistryResult<Stored> {
    let started = Instant::now();
    let tarball = builder
        .build(name, tag)
        .await
        .map_err(|source| RegistryError::BuildFailed {
            name: name.to_owned(),
            source,
        })?;

    let image = ImageArchive::open(tarball.path()).await?;
    let stored = backend.store(&image, name, tag).await?;
    drop(tarball);

    tracing::info!(
        digest = %stored.digest,
        elapsed = ?started.elapsed(),
        "built {name}:{tag}"
    );
    Ok(stored)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::http::StatusCode;
    use camino::Utf8PathBuf;
    use storage::{MemoryStorage, Storage};

    use super::*;
    use crate::backend::BucketBackend;
    use crate::builder::{BuildError, ImageTarball};
    use crate::image::tests::write_oci_layout;

    #[derive(Debug)]
    struct StubBuilder {
        dir: tempfile::TempDir,
        calls: AtomicUsize,
        delay: Duration,
        fail: bool,
        references: parking_lot::Mutex<Vec<String>>,
    }

    impl StubBuilder {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
                fail: false,
                references: Default::default(),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn path(&self, name: &str, reference: &str) -> Utf8PathBuf {
            Utf8PathBuf::from_path_buf(self.dir.path().join(format!("{name}-{reference}.tar")))
                .unwrap()
        }
    }

    #[async_trait::async_trait]
    impl ImageBuilder for StubBuilder {
        async fn build(&self, name: &str, reference: &str) -> Result<ImageTarball, BuildError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.references.lock().push(reference.to_owned());
            tokio::time::sleep(self.delay).await;

            if name != "valheim" {
                return Err(BuildError::UnknownName {
                    name: name.to_owned(),
                    known: vec!["valheim".into()],
                });
            }
            if self.fail {
                return Err(BuildError::Config("stub failure".into()));
            }

            let path = self.path(name, reference);
            write_oci_layout(&path, &[reference.as_bytes()]);
            Ok(ImageTarball::new(path))
        }
    }

    fn memory_orchestrator(builder: &Arc<StubBuilder>) -> Orchestrator {
        let bucket = Storage::new(MemoryStorage::with_buckets(&["kiln"])).bucket("kiln");
        Orchestrator::new(
            Arc::new(BucketBackend::new(bucket)),
            Arc::clone(builder) as Arc<dyn ImageBuilder>,
        )
    }

    #[test]
    fn latest_is_the_default_branch() {
        let orchestrator = memory_orchestrator(&Arc::new(StubBuilder::new()));
        let once = orchestrator.normalize("latest");
        assert_eq!(once, "public");
        assert_eq!(orchestrator.normalize(once), once);
        assert_eq!(orchestrator.normalize("beta"), "beta");

        let orchestrator = orchestrator.with_default_branch("main");
        assert_eq!(orchestrator.normalize("latest"), "main");
    }

    #[tokio::test]
    async fn builds_are_remembered_under_the_normalized_tag() {
        let builder = Arc::new(StubBuilder::new());
        let orchestrator = memory_orchestrator(&builder);
        assert!(orchestrator.resolved("valheim", "latest").is_none());

        let stored = orchestrator.build("valheim", "latest").await.unwrap();
        assert_eq!(builder.references.lock().as_slice(), ["public"]);
        assert_eq!(orchestrator.resolved("valheim", "public"), Some(stored.clone()));
        assert_eq!(orchestrator.resolved("valheim", "latest"), Some(stored));
        assert!(orchestrator.resolved("valheim", "beta").is_none());
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_build() {
        let builder = Arc::new(StubBuilder {
            delay: Duration::from_millis(50),
            ..StubBuilder::new()
        });
        let orchestrator = Arc::new(memory_orchestrator(&builder));

        let tasks: Vec<_> = (0..5)
            .map(|i| {
                let orchestrator = Arc::clone(&orchestrator);
                let tag = if i % 2 == 0 { "latest" } else { "public" };
                tokio::spawn(async move { orchestrator.build("valheim", tag).await })
            })
            .collect();

        let mut digests = Vec::new();
        for task in tasks {
            digests.push(task.await.unwrap().unwrap().digest);
        }
        digests.dedup();
        assert_eq!(digests.len(), 1);
        assert_eq!(builder.calls(), 1);
    }

    #[tokio::test]
    async fn tarballs_are_removed_after_storing() {
        let builder = Arc::new(StubBuilder::new());
        let orchestrator = memory_orchestrator(&builder);

        orchestrator.build("valheim", "public").await.unwrap();
        assert!(!builder.path("valheim", "public").exists());
    }

    #[tokio::test]
    async fn build_failures_map_to_status() {
        let builder = Arc::new(StubBuilder::new());
        let orchestrator = memory_orchestrator(&builder);
        let error = orchestrator.build("minecraft", "public").await.unwrap_err();
        assert_eq!(error.status_code(), StatusCode::NOT_FOUND);

        let builder = Arc::new(StubBuilder {
            fail: true,
            ..StubBuilder::new()
        });
        let orchestrator = memory_orchestrator(&builder);
        let error = orchestrator.build("valheim", "public").await.unwrap_err();
        assert_eq!(error.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(orchestrator.resolved("valheim", "public").is_none());

        // Failures are not cached: the next request builds again.
        let _ = orchestrator.build("valheim", "public").await;
        assert_eq!(builder.calls(), 2);
    }
}
