use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use eyre::Context;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::Instrument;

use storage_driver::{
    Driver, Metadata, ObjectStream, Reader, StorageError, StorageErrorKind, UploadOptions, Writer,
};

const NAME: &str = "local";
const ATTRS_SUFFIX: &str = ".attrs";
const PARTIAL_SUFFIX: &str = ".partial";

/// Attributes persisted next to each object.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Attributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_type: Option<String>,
}

/// Storage driver backed by a directory on the local filesystem.
///
/// Objects live at `<root>/<bucket>/<path>`; the content type of each object is
/// kept in a `<path>.attrs` JSON sidecar. Writes land in a uniquely named
/// partial file which is renamed into place once complete, so a reader never
/// observes a half-written object.
#[derive(Debug)]
pub struct LocalDriver {
    root: Utf8PathBuf,
}

impl LocalDriver {
    /// Create a driver rooted at `root`.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn path(&self, bucket: &str, remote: &Utf8Path) -> Utf8PathBuf {
        self.bucket_root(bucket).join(remote)
    }

    fn bucket_root(&self, bucket: &str) -> Utf8PathBuf {
        if bucket.is_empty() {
            self.root.clone()
        } else {
            self.root.join(bucket)
        }
    }

    fn error(&self, bucket: &str, remote: &Utf8Path, err: std::io::Error) -> StorageError {
        StorageError::builder(NAME, StorageErrorKind::from_io_kind(err.kind()), err)
            .bucket(bucket)
            .path(remote.as_str())
            .build()
    }

    async fn read_attributes(&self, path: &Utf8Path) -> Attributes {
        let sidecar = sidecar(path);
        match tokio::fs::read(&sidecar).await {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|error| {
                tracing::warn!(%sidecar, %error, "Ignoring unreadable attributes");
                Attributes::default()
            }),
            Err(_) => Attributes::default(),
        }
    }
}

fn sidecar(path: &Utf8Path) -> Utf8PathBuf {
    let mut sidecar = path.as_str().to_owned();
    sidecar.push_str(ATTRS_SUFFIX);
    sidecar.into()
}

fn partial(path: &Utf8Path) -> Utf8PathBuf {
    format!("{path}.{}{PARTIAL_SUFFIX}", uuid::Uuid::new_v4().simple()).into()
}

#[async_trait::async_trait]
impl Driver for LocalDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn scheme(&self) -> &str {
        "file"
    }

    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let path = self.path(bucket, remote);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|err| self.error(bucket, remote, err))?;
        if !metadata.is_file() {
            return Err(StorageError::not_found(NAME, bucket, remote));
        }

        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map(Into::into)
            .unwrap_or_else(|_| Utc::now());
        let attributes = self.read_attributes(&path).await;

        Ok(Metadata {
            size: metadata.len(),
            created,
            content_type: attributes.content_type,
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|err| self.error(bucket, remote, err))?;
        if let Err(error) = tokio::fs::remove_file(sidecar(&path)).await {
            tracing::trace!(%error, "no attributes removed for {path}");
        }
        Ok(())
    }

    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Reader<'_>,
        options: &UploadOptions,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| self.error(bucket, remote, err))?;
        }

        let staging = partial(&path);
        let result = async {
            let mut writer = tokio::io::BufWriter::new(tokio::fs::File::create(&staging).await?);
            let written = tokio::io::copy_buf(local, &mut writer).await?;
            writer.shutdown().await?;

            if let Some(expected) = options.content_length {
                if written != expected {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("expected {expected} bytes, read {written}"),
                    ));
                }
            }

            let attributes = Attributes {
                content_type: options.content_type.clone(),
            };
            let encoded = serde_json::to_vec(&attributes).map_err(std::io::Error::other)?;
            tokio::fs::write(sidecar(&path), encoded).await?;
            tokio::fs::rename(&staging, &path).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(err) = result {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(self.error(bucket, remote, err));
        }

        tracing::trace!(%path, "stored object");
        Ok(())
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        local: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let path = self.path(bucket, remote);

        let mut reader = tokio::io::BufReader::new(
            tokio::fs::File::open(&path)
                .await
                .map_err(|err| self.error(bucket, remote, err))?,
        );

        tokio::io::copy(&mut reader, local)
            .await
            .map_err(|err| self.error(bucket, remote, err))?;

        local
            .flush()
            .await
            .map_err(|err| self.error(bucket, remote, err))?;

        Ok(())
    }

    async fn open(&self, bucket: &str, remote: &Utf8Path) -> Result<ObjectStream, StorageError> {
        let path = self.path(bucket, remote);
        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| self.error(bucket, remote, err))?;
        Ok(Box::pin(tokio::io::BufReader::new(file)))
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let base = self.bucket_root(bucket);
        let prefix = prefix.map(|p| p.as_str().to_owned()).unwrap_or_default();

        let items = tokio::task::spawn_blocking({
            let base = base.clone();
            move || collect_list(&base)
        })
        .in_current_span()
        .await
        .wrap_err("local driver: list task")
        .map_err(StorageError::with(NAME, StorageErrorKind::Other))?
        .map_err(StorageError::with(NAME, StorageErrorKind::Io))?;

        let items: Vec<String> = items
            .into_iter()
            .map(|p| p.to_string())
            .filter(|p| p.starts_with(&prefix))
            .collect();

        tracing::debug!("Found {} entries", items.len());
        Ok(items)
    }
}

#[tracing::instrument]
fn collect_list(base: &Utf8Path) -> eyre::Result<Vec<Utf8PathBuf>> {
    let mut files = Vec::new();
    if base.is_dir() {
        visit(base, &mut files)?;
    }

    Ok(files
        .into_iter()
        .filter(|p| {
            let name = p.as_str();
            !name.ends_with(ATTRS_SUFFIX) && !name.ends_with(PARTIAL_SUFFIX)
        })
        .filter_map(|p| p.strip_prefix(base).ok().map(|p| p.to_owned()))
        .collect())
}

fn visit(path: &Utf8Path, files: &mut Vec<Utf8PathBuf>) -> eyre::Result<()> {
    for entry in path.read_dir_utf8()? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            visit(entry.path(), files)?;
        } else {
            files.push(entry.path().to_owned())
        }
    }

    Ok(())
}
