//! Service configuration.
//!
//! ```toml
//! listen = "0.0.0.0:5000"
//! backend = "s3://kiln-cache?use_signed_urls=true"
//! default_branch = "public"
//! workdir = "/var/tmp/kiln"
//!
//! [builder]
//! command = [
//!     "dagger", "call", "--mod", "{module}",
//!     "container", "--branch", "{reference}",
//!     "export", "--path", "{output}",
//! ]
//!
//! [builder.modules]
//! valheim = "valheim"
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::builder::{CommandBuilder, default_command, default_modules};
use crate::reference::DEFAULT_BRANCH;

/// Top level configuration for the `kiln` service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KilnConfig {
    /// Address to listen on.
    pub listen: SocketAddr,
    /// Backend URL, whose scheme picks the backend.
    pub backend: String,
    /// Branch that `latest` resolves to.
    pub default_branch: String,
    /// Where build tarballs are written.
    pub workdir: Utf8PathBuf,
    /// The image builder.
    pub builder: BuilderConfig,
}

impl Default for KilnConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 5000)),
            backend: "mem://".into(),
            default_branch: DEFAULT_BRANCH.into(),
            workdir: Utf8PathBuf::from_path_buf(std::env::temp_dir())
                .unwrap_or_else(|_| Utf8PathBuf::from("/tmp")),
            builder: BuilderConfig::default(),
        }
    }
}

/// The external build command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuilderConfig {
    /// argv, with `{name}`, `{module}`, `{reference}` and `{output}` placeholders.
    pub command: Vec<String>,
    /// Image name to build module.
    pub modules: BTreeMap<String, String>,
    /// Extra environment for the command.
    pub env: BTreeMap<String, String>,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            modules: default_modules(),
            env: BTreeMap::new(),
        }
    }
}

impl KilnConfig {
    /// Parse a TOML document.
    #[cfg(feature = "cli")]
    pub fn from_toml(document: &str) -> Result<Self, toml_edit::de::Error> {
        toml_edit::de::from_str(document)
    }

    /// The builder this configuration describes.
    pub fn command_builder(&self) -> CommandBuilder {
        CommandBuilder::new(self.builder.command.clone(), self.workdir.clone())
            .modules(self.builder.modules.clone())
            .env(self.builder.env.clone())
    }
}
