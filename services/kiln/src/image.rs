//! Reading built images out of tarballs.
//!
//! Two layouts are understood: an OCI image layout (`index.json` plus
//! `blobs/<alg>/<hex>`), whose manifest is served verbatim, and a
//! `docker save` archive (`manifest.json`), for which an OCI manifest is
//! synthesised. Either way blobs are read from the tarball by offset.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom};

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use oci_spec::image::{
    Descriptor, DescriptorBuilder, ImageIndex, ImageManifest, ImageManifestBuilder, MediaType,
};
use serde::Deserialize;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};

use crate::error::{RegistryError, RegistryResult};
use crate::reference::Digest;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// Reader over one blob inside an image tarball.
pub type BlobReader = tokio::io::BufReader<tokio::io::Take<tokio::fs::File>>;

/// A blob stored inside an image tarball.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedBlob {
    /// Content digest.
    pub digest: Digest,
    /// Media type recorded in the manifest.
    pub media_type: String,
    /// Size in bytes.
    pub size: u64,
    offset: u64,
}

/// A built image, indexed but not loaded: only the manifest is held in memory.
#[derive(Debug, Clone)]
pub struct ImageArchive {
    path: Utf8PathBuf,
    manifest: Bytes,
    digest: Digest,
    media_type: String,
    config: ArchivedBlob,
    layers: Vec<ArchivedBlob>,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    offset: u64,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct DockerManifest {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "Layers", default)]
    layers: Vec<String>,
}

fn invalid(message: impl std::fmt::Display) -> RegistryError {
    RegistryError::InvalidImage(message.to_string())
}

impl ImageArchive {
    /// Index an image tarball and validate its manifest and blobs.
    pub async fn open(path: impl Into<Utf8PathBuf>) -> RegistryResult<Self> {
        let path = path.into();
        tokio::task::spawn_blocking(move || Self::open_blocking(path))
            .await
            .map_err(|error| RegistryError::Internal(format!("archive reader failed: {error}")))?
    }

    fn open_blocking(path: Utf8PathBuf) -> RegistryResult<Self> {
        let mut file = std::fs::File::open(&path)?;
        let entries = index_entries(&mut file)?;

        let reader = ArchiveReader {
            file: &mut file,
            entries: &entries,
        };

        let (manifest, config, layers) = if entries.contains_key("index.json") {
            reader.oci_layout()?
        } else if entries.contains_key("manifest.json") {
            reader.docker_save()?
        } else {
            return Err(invalid(format!(
                "{path} has neither index.json nor manifest.json"
            )));
        };

        let parsed = ImageManifest::from_reader(&manifest[..]).map_err(invalid)?;
        let media_type = parsed
            .media_type()
            .clone()
            .unwrap_or(MediaType::ImageManifest)
            .to_string();

        let digest = Digest::sha256(&manifest);
        tracing::debug!(%path, %digest, layers = layers.len(), "indexed image archive");

        Ok(ImageArchive {
            path,
            manifest,
            digest,
            media_type,
            config,
            layers,
        })
    }

    /// Location of the tarball.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Raw manifest bytes, exactly as they are served.
    pub fn manifest(&self) -> &Bytes {
        &self.manifest
    }

    /// Digest of [`ImageArchive::manifest`].
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Manifest media type.
    pub fn media_type(&self) -> &str {
        &self.media_type
    }

    /// The image config blob.
    pub fn config(&self) -> &ArchivedBlob {
        &self.config
    }

    /// Layer blobs, in manifest order.
    pub fn layers(&self) -> &[ArchivedBlob] {
        &self.layers
    }

    /// Config followed by layers.
    pub fn blobs(&self) -> impl Iterator<Item = &ArchivedBlob> {
        std::iter::once(&self.config).chain(self.layers.iter())
    }

    /// Stream one blob out of the tarball.
    pub async fn open_blob(&self, blob: &ArchivedBlob) -> RegistryResult<BlobReader> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(blob.offset)).await?;
        Ok(tokio::io::BufReader::new(file.take(blob.size)))
    }
}

fn index_entries(file: &mut std::fs::File) -> RegistryResult<HashMap<String, Entry>> {
    let mut archive = tar::Archive::new(file);
    let mut entries = HashMap::new();

    for entry in archive.entries_with_seek()? {
        let entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry.path()?;
        let name = path.to_string_lossy();
        let name = name.trim_start_matches("./").to_owned();
        entries.insert(
            name,
            Entry {
                offset: entry.raw_file_position(),
                size: entry.size(),
            },
        );
    }

    Ok(entries)
}

struct ArchiveReader<'a> {
    file: &'a mut std::fs::File,
    entries: &'a HashMap<String, Entry>,
}

impl ArchiveReader<'_> {
    fn entry(&self, name: &str) -> RegistryResult<Entry> {
        self.entries
            .get(name.trim_start_matches("./"))
            .copied()
            .ok_or_else(|| invalid(format!("archive is missing {name}")))
    }

    fn read(&mut self, name: &str) -> RegistryResult<Bytes> {
        let entry = self.entry(name)?;
        self.file.seek(SeekFrom::Start(entry.offset))?;
        let mut buffer = Vec::with_capacity(entry.size as usize);
        (&mut *self.file).take(entry.size).read_to_end(&mut buffer)?;
        Ok(buffer.into())
    }

    fn hash(&mut self, entry: Entry) -> RegistryResult<Digest> {
        self.file.seek(SeekFrom::Start(entry.offset))?;
        let mut hasher = <sha2::Sha256 as sha2::Digest>::new();
        io::copy(&mut (&mut *self.file).take(entry.size), &mut hasher)?;
        Ok(Digest::from_sha256(hasher))
    }

    fn is_gzip(&mut self, entry: Entry) -> RegistryResult<bool> {
        if entry.size < 2 {
            return Ok(false);
        }
        self.file.seek(SeekFrom::Start(entry.offset))?;
        let mut magic = [0u8; 2];
        self.file.read_exact(&mut magic)?;
        Ok(magic == GZIP_MAGIC)
    }

    /// Look up and verify the blob a descriptor points at.
    fn blob(&mut self, descriptor: &Descriptor) -> RegistryResult<ArchivedBlob> {
        let digest = Digest::parse(&descriptor.digest().to_string())?;
        let entry = self.entry(&format!(
            "blobs/{}/{}",
            digest.algorithm(),
            digest.encoded()
        ))?;

        if entry.size != descriptor.size() {
            return Err(invalid(format!(
                "blob {digest} is {} bytes, descriptor says {}",
                entry.size,
                descriptor.size()
            )));
        }

        let actual = self.hash(entry)?;
        if digest.algorithm() == "sha256" && actual != digest {
            return Err(RegistryError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        Ok(ArchivedBlob {
            digest,
            media_type: descriptor.media_type().to_string(),
            size: entry.size,
            offset: entry.offset,
        })
    }

    fn oci_layout(mut self) -> RegistryResult<(Bytes, ArchivedBlob, Vec<ArchivedBlob>)> {
        let index = self.read("index.json")?;
        let index = ImageIndex::from_reader(&index[..]).map_err(invalid)?;

        let descriptor = index
            .manifests()
            .iter()
            .find(|d| {
                d.annotations()
                    .as_ref()
                    .is_some_and(|a| a.contains_key(REF_NAME_ANNOTATION))
            })
            .or_else(|| index.manifests().first())
            .ok_or_else(|| invalid("index.json lists no manifests"))?;

        if *descriptor.media_type() == MediaType::ImageIndex {
            return Err(invalid("nested image indexes are not supported"));
        }

        let digest = Digest::parse(&descriptor.digest().to_string())?;
        let manifest = self.read(&format!(
            "blobs/{}/{}",
            digest.algorithm(),
            digest.encoded()
        ))?;
        digest.verify(&manifest)?;

        let parsed = ImageManifest::from_reader(&manifest[..]).map_err(invalid)?;
        let config = self.blob(parsed.config())?;
        let layers = parsed
            .layers()
            .iter()
            .map(|layer| self.blob(layer))
            .collect::<RegistryResult<Vec<_>>>()?;

        Ok((manifest, config, layers))
    }

    fn docker_save(mut self) -> RegistryResult<(Bytes, ArchivedBlob, Vec<ArchivedBlob>)> {
        let manifests: Vec<DockerManifest> =
            serde_json::from_slice(&self.read("manifest.json")?).map_err(invalid)?;
        let image = manifests
            .into_iter()
            .next()
            .ok_or_else(|| invalid("manifest.json lists no images"))?;

        let entry = self.entry(&image.config)?;
        let config = ArchivedBlob {
            digest: self.hash(entry)?,
            media_type: MediaType::ImageConfig.to_string(),
            size: entry.size,
            offset: entry.offset,
        };

        let mut layers = Vec::with_capacity(image.layers.len());
        for name in &image.layers {
            let entry = self.entry(name)?;
            let media_type = if self.is_gzip(entry)? {
                MediaType::ImageLayerGzip
            } else {
                MediaType::ImageLayer
            };
            layers.push(ArchivedBlob {
                digest: self.hash(entry)?,
                media_type: media_type.to_string(),
                size: entry.size,
                offset: entry.offset,
            });
        }

        let descriptor = |blob: &ArchivedBlob, media_type: MediaType| {
            DescriptorBuilder::default()
                .media_type(media_type)
                .digest(
                    blob.digest
                        .as_str()
                        .parse::<oci_spec::image::Digest>()
                        .map_err(invalid)?,
                )
                .size(blob.size)
                .build()
                .map_err(invalid)
        };

        let manifest = ImageManifestBuilder::default()
            .schema_version(2u32)
            .media_type(MediaType::ImageManifest)
            .config(descriptor(&config, MediaType::ImageConfig)?)
            .layers(
                layers
                    .iter()
                    .map(|layer| descriptor(layer, MediaType::from(layer.media_type.as_str())))
                    .collect::<RegistryResult<Vec<_>>>()?,
            )
            .build()
            .map_err(invalid)?;

        let manifest = serde_json::to_vec(&manifest).map_err(invalid)?;
        Ok((manifest.into(), config, layers))
    }
}
