//! The seam between the registry and whatever produces image tarballs.

use std::collections::BTreeMap;
use std::fmt;
use std::process::ExitStatus;

use camino::{Utf8Path, Utf8PathBuf};

/// Errors from an [`ImageBuilder`].
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// The builder has no module for this name.
    #[error("invalid name {name}, try one of: {}", known.join(", "))]
    UnknownName {
        /// Requested name.
        name: String,
        /// Names the builder does know.
        known: Vec<String>,
    },

    /// The build command exited unsuccessfully.
    #[error("build command exited with {status}: {stderr}")]
    Command {
        /// Exit status.
        status: ExitStatus,
        /// Tail of the command's stderr.
        stderr: String,
    },

    /// The build command succeeded but left no tarball behind.
    #[error("build produced no tarball at {0}")]
    MissingOutput(Utf8PathBuf),

    /// Misconfigured builder.
    #[error("builder misconfigured: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// Whether this error means "no such image" rather than "the build broke".
    pub fn is_unknown_name(&self) -> bool {
        matches!(self, BuildError::UnknownName { .. })
    }
}

/// A tarball produced by a build. The file is removed when this is dropped.
#[derive(Debug)]
pub struct ImageTarball {
    path: Utf8PathBuf,
}

impl ImageTarball {
    /// Take ownership of a tarball on disk.
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Where the tarball lives.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

impl Drop for ImageTarball {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::trace!(path = %self.path, "removed image tarball"),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::warn!(path = %self.path, "failed to remove image tarball: {error}")
            }
        }
    }
}

/// Builds an image tarball for a name and a (normalized) reference.
#[async_trait::async_trait]
pub trait ImageBuilder: fmt::Debug + Send + Sync {
    /// Build `name` at `reference`.
    ///
    /// Returns [`BuildError::UnknownName`] when `name` is not something this
    /// builder can produce.
    async fn build(&self, name: &str, reference: &str) -> Result<ImageTarball, BuildError>;
}

/// Names (and Steam app ids) of the images the default modules build.
pub fn default_modules() -> BTreeMap<String, String> {
    [
        ("abioticfactor", "abioticfactor"),
        ("2857200", "abioticfactor"),
        ("astroneer", "astroneer"),
        ("728470", "astroneer"),
        ("corekeeper", "corekeeper"),
        ("1963720", "corekeeper"),
        ("enshrouded", "enshrouded"),
        ("2278520", "enshrouded"),
        ("palworld", "palworld"),
        ("2394010", "palworld"),
        ("valheim", "valheim"),
        ("896660", "valheim"),
        ("satisfactory", "satisfactory"),
        ("1690800", "satisfactory"),
    ]
    .into_iter()
    .map(|(name, module)| (name.to_owned(), module.to_owned()))
    .collect()
}

/// Default argv for [`CommandBuilder`].
pub fn default_command() -> Vec<String> {
    [
        "dagger",
        "call",
        "--mod",
        "{module}",
        "container",
        "--branch",
        "{reference}",
        "export",
        "--path",
        "{output}",
    ]
    .into_iter()
    .map(str::to_owned)
    .collect()
}

const STDERR_TAIL: usize = 4096;

/// Runs an external command which writes the image tarball to `{output}`.
///
/// Arguments may contain the placeholders `{name}`, `{module}`, `{reference}`
/// and `{output}`.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    command: Vec<String>,
    modules: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
    workdir: Utf8PathBuf,
}

impl CommandBuilder {
    /// A builder running `command` with the default module table.
    pub fn new(command: Vec<String>, workdir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            command,
            modules: default_modules(),
            env: BTreeMap::new(),
            workdir: workdir.into(),
        }
    }

    /// Replace the name to module table.
    pub fn modules(mut self, modules: BTreeMap<String, String>) -> Self {
        self.modules = modules;
        self
    }

    /// Extra environment for the command.
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// A fresh output path, so aliases of one module never share a tarball.
    fn output(&self, module: &str, reference: &str) -> Utf8PathBuf {
        let id = uuid::Uuid::new_v4().simple();
        self.workdir.join(format!("{module}-{reference}-{id}.tar"))
    }

    fn argv(&self, name: &str, module: &str, reference: &str, output: &Utf8Path) -> Vec<String> {
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{name}", name)
                    .replace("{module}", module)
                    .replace("{reference}", reference)
                    .replace("{output}", output.as_str())
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ImageBuilder for CommandBuilder {
    #[tracing::instrument(skip(self))]
    async fn build(&self, name: &str, reference: &str) -> Result<ImageTarball, BuildError> {
        let Some(module) = self.modules.get(name) else {
            return Err(BuildError::UnknownName {
                name: name.to_owned(),
                known: self.modules.keys().cloned().collect(),
            });
        };

        let output = self.output(module, reference);
        let argv = self.argv(name, module, reference, &output);
        let Some((program, args)) = argv.split_first() else {
            return Err(BuildError::Config("empty build command".into()));
        };

        tokio::fs::create_dir_all(&self.workdir).await?;
        // Removes partial output on every failure path below.
        let tarball = ImageTarball::new(output.clone());

        tracing::info!(%module, %output, "running {program}");
        let result = tokio::process::Command::new(program)
            .args(args)
            .envs(&self.env)
            .current_dir(&self.workdir)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let start = stderr.len().saturating_sub(STDERR_TAIL);
            let start = (start..stderr.len())
                .find(|&i| stderr.is_char_boundary(i))
                .unwrap_or(stderr.len());
            return Err(BuildError::Command {
                status: result.status,
                stderr: stderr[start..].trim().to_owned(),
            });
        }

        if !tokio::fs::try_exists(&output).await? {
            return Err(BuildError::MissingOutput(output));
        }

        Ok(tarball)
    }
}
