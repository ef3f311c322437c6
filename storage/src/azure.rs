//! Azure Blob Storage, through the `object_store` client.
//!
//! A driver is bound to one container when it is built, so the `bucket`
//! passed to each call only labels errors.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use camino::Utf8Path;
use futures::TryStreamExt as _;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::path::Path;
use object_store::{
    Attribute, Attributes, GetOptions, ObjectStore, PutMultipartOpts, PutOptions, PutPayload,
};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

use storage_driver::{
    Driver, Metadata, ObjectStream, Reader, StorageError, StorageErrorKind, UploadOptions, Writer,
};

const NAME: &str = "azblob";

/// Objects larger than this are sent as a block list.
pub const BLOCK_SIZE: usize = 8 * 1024 * 1024;

/// Connection settings for an Azure storage account.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AzureConfig {
    /// Storage account name, else `AZURE_STORAGE_ACCOUNT` or `AZURE_STORAGE_ACCOUNT_NAME`.
    pub account: Option<String>,

    /// Blob service endpoint, for sovereign clouds and custom domains.
    pub endpoint: Option<String>,

    /// Talk to a local Azurite emulator.
    pub use_emulator: bool,

    /// Allow plain `http` endpoints.
    pub allow_http: bool,
}

/// Storage driver for Azure Blob Storage containers.
#[derive(Clone)]
pub struct AzureDriver {
    store: Arc<dyn ObjectStore>,
}

impl fmt::Debug for AzureDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureDriver")
            .field("store", &self.store.to_string())
            .finish()
    }
}

impl AzureDriver {
    /// Connect to `container`, reading credentials from the environment.
    ///
    /// Besides the `AZURE_*` variables `object_store` understands, the
    /// `AZURE_STORAGE_ACCOUNT` and `AZURE_STORAGE_KEY` pair is accepted.
    pub fn new(container: &str, config: &AzureConfig) -> Result<Self, StorageError> {
        let mut builder = MicrosoftAzureBuilder::from_env()
            .with_container_name(container)
            .with_use_emulator(config.use_emulator)
            .with_allow_http(config.allow_http || config.use_emulator);

        let account = config
            .account
            .clone()
            .or_else(|| std::env::var("AZURE_STORAGE_ACCOUNT").ok());
        if let Some(account) = account {
            builder = builder.with_account(account);
        }
        if let Ok(key) = std::env::var("AZURE_STORAGE_KEY") {
            builder = builder.with_access_key(key);
        }
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint.clone());
        }

        let store = builder.build().map_err(|error| {
            StorageError::builder(NAME, StorageErrorKind::InvalidRequest, error)
                .bucket(container)
                .build()
        })?;
        Ok(Self::with_store(Arc::new(store)))
    }

    /// Wrap an existing object store.
    pub fn with_store(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    async fn read_block(reader: &mut Reader<'_>) -> Result<Bytes, StorageError> {
        let mut block = Vec::with_capacity(BLOCK_SIZE);
        (&mut *reader)
            .take(BLOCK_SIZE as u64)
            .read_to_end(&mut block)
            .await
            .map_err(|err| StorageError::from_io(NAME, err))?;
        Ok(block.into())
    }
}

fn object_error(bucket: &str, remote: &Utf8Path, error: object_store::Error) -> StorageError {
    let kind = match &error {
        object_store::Error::NotFound { .. } => StorageErrorKind::NotFound,
        object_store::Error::AlreadyExists { .. } | object_store::Error::Precondition { .. } => {
            StorageErrorKind::AlreadyExists
        }
        object_store::Error::NotSupported { .. } | object_store::Error::NotImplemented => {
            StorageErrorKind::Unsupported
        }
        object_store::Error::InvalidPath { .. } => StorageErrorKind::InvalidRequest,
        _ => StorageErrorKind::Io,
    };
    StorageError::builder(NAME, kind, error)
        .bucket(bucket)
        .path(remote.as_str())
        .build()
}

fn attributes(options: &UploadOptions) -> Attributes {
    let mut attributes = Attributes::new();
    if let Some(content_type) = &options.content_type {
        attributes.insert(Attribute::ContentType, content_type.clone().into());
    }
    attributes
}

#[async_trait::async_trait]
impl Driver for AzureDriver {
    fn name(&self) -> &'static str {
        NAME
    }

    fn scheme(&self) -> &str {
        "azblob"
    }

    #[tracing::instrument(skip(self))]
    async fn metadata(&self, bucket: &str, remote: &Utf8Path) -> Result<Metadata, StorageError> {
        let mut options = GetOptions::default();
        options.head = true;
        let result = self
            .store
            .get_opts(&Path::from(remote.as_str()), options)
            .await
            .map_err(|error| object_error(bucket, remote, error))?;

        Ok(Metadata {
            size: result.meta.size as u64,
            created: result.meta.last_modified,
            content_type: result
                .attributes
                .get(&Attribute::ContentType)
                .map(|value| AsRef::<str>::as_ref(value).to_owned()),
        })
    }

    async fn delete(&self, bucket: &str, remote: &Utf8Path) -> Result<(), StorageError> {
        self.store
            .delete(&Path::from(remote.as_str()))
            .await
            .map_err(|error| object_error(bucket, remote, error))
    }

    #[tracing::instrument(skip(self, reader, options))]
    async fn upload(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        reader: &mut Reader<'_>,
        options: &UploadOptions,
    ) -> Result<(), StorageError> {
        let path = Path::from(remote.as_str());
        let first = Self::read_block(reader).await?;

        if first.len() < BLOCK_SIZE {
            let mut put = PutOptions::default();
            put.attributes = attributes(options);
            self.store
                .put_opts(&path, PutPayload::from(first), put)
                .await
                .map_err(|error| object_error(bucket, remote, error))?;
            return Ok(());
        }

        let mut opts = PutMultipartOpts::default();
        opts.attributes = attributes(options);
        let mut upload = self
            .store
            .put_multipart_opts(&path, opts)
            .await
            .map_err(|error| object_error(bucket, remote, error))?;

        let mut block = first;
        let mut blocks = 0usize;
        let result = loop {
            if block.is_empty() {
                break upload.complete().await.map(|_| ());
            }
            if let Err(error) = upload.put_part(PutPayload::from(block)).await {
                break Err(error);
            }
            blocks += 1;
            block = match Self::read_block(reader).await {
                Ok(block) => block,
                Err(error) => {
                    if let Err(abort) = upload.abort().await {
                        tracing::warn!(%remote, "failed to abort block upload: {abort}");
                    }
                    return Err(error);
                }
            };
        };

        match result {
            Ok(()) => {
                tracing::debug!(%remote, blocks, "committed block list");
                Ok(())
            }
            Err(error) => {
                if let Err(abort) = upload.abort().await {
                    tracing::warn!(%remote, "failed to abort block upload: {abort}");
                }
                Err(object_error(bucket, remote, error))
            }
        }
    }

    async fn download(
        &self,
        bucket: &str,
        remote: &Utf8Path,
        writer: &mut Writer<'_>,
    ) -> Result<(), StorageError> {
        let mut stream = self.open(bucket, remote).await?;
        tokio::io::copy(&mut stream, writer)
            .await
            .map_err(|err| StorageError::from_io(NAME, err))?;
        writer
            .flush()
            .await
            .map_err(|err| StorageError::from_io(NAME, err))?;
        Ok(())
    }

    async fn open(&self, bucket: &str, remote: &Utf8Path) -> Result<ObjectStream, StorageError> {
        let result = self
            .store
            .get(&Path::from(remote.as_str()))
            .await
            .map_err(|error| object_error(bucket, remote, error))?;
        let stream = result.into_stream().map_err(std::io::Error::other);
        Ok(Box::pin(tokio_util::io::StreamReader::new(stream)))
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: Option<&Utf8Path>,
    ) -> Result<Vec<String>, StorageError> {
        let prefix = prefix.map(|prefix| Path::from(prefix.as_str()));
        let objects: Vec<_> = self
            .store
            .list(prefix.as_ref())
            .try_collect()
            .await
            .map_err(|error| object_error(bucket, Utf8Path::new(""), error))?;
        Ok(objects
            .into_iter()
            .map(|object| object.location.to_string())
            .collect())
    }
}
