//! Container runtimes
//!
//! Thin wrappers around the `podman` and `apptainer` command line tools:
//! - Checking whether an image is present locally
//! - Pulling images from a registry
//! - Building the command that runs a job inside an image

use anyhow::{Context, Result};
use kiln_core::domain::image::ImageReference;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Which runtime fetches remote images
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RuntimeMode {
    /// Images are pulled and run through the primary runtime
    #[default]
    Primary,
    /// Images are pulled and run through the alternate, sandboxed runtime.
    /// Only remote images can be prepared in this mode.
    Alternate,
}

/// What to run inside an image
#[derive(Debug, Clone, Copy)]
pub struct ExecSpec<'a> {
    pub argv: &'a [String],
    /// Host directory mounted as `/workspace`
    pub workspace: Option<&'a Path>,
    pub env: &'a [(String, String)],
}

/// A container runtime driven through its command line tool
pub trait ContainerRuntime: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Checks whether an image with this name is in the local store
    fn image_exists(&self, image: &ImageReference) -> Result<bool>;

    /// Pulls the image, returning once the tool reports success
    fn pull(&self, image: &ImageReference) -> Result<()>;

    /// Builds the command that runs `spec` inside `image`
    fn command(&self, image: &ImageReference, spec: ExecSpec<'_>) -> Command;
}

/// Primary runtime backed by podman
#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    binary: String,
}

impl PodmanRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for PodmanRuntime {
    fn default() -> Self {
        Self::new("podman")
    }
}

impl ContainerRuntime for PodmanRuntime {
    fn name(&self) -> &str {
        &self.binary
    }

    fn image_exists(&self, image: &ImageReference) -> Result<bool> {
        let output = Command::new(&self.binary)
            .arg("images")
            .arg("--quiet")
            .arg(image.name())
            .output()
            .with_context(|| format!("Failed to execute '{} images'", self.binary))?;

        let output = check_output(&self.binary, "images", output)?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    fn pull(&self, image: &ImageReference) -> Result<()> {
        let reference = image.reference();
        info!("Pulling {} with {}", reference, self.binary);

        let output = Command::new(&self.binary)
            .arg("pull")
            .arg(&reference)
            .output()
            .with_context(|| format!("Failed to execute '{} pull'", self.binary))?;

        check_output(&self.binary, "pull", output)?;
        Ok(())
    }

    fn command(&self, image: &ImageReference, spec: ExecSpec<'_>) -> Command {
        let mut command = Command::new(&self.binary);
        command.arg("run").arg("--rm");

        if let Some(workspace) = spec.workspace {
            command
                .arg("-v")
                .arg(format!("{}:/workspace", workspace.display()))
                .arg("-w")
                .arg("/workspace");
        }
        for (key, value) in spec.env {
            command.arg("-e").arg(format!("{}={}", key, value));
        }

        command.arg(image.reference()).args(spec.argv);
        command
    }
}

/// Alternate sandboxed runtime backed by apptainer
///
/// Pulled images are stored as SIF files under `image_dir`.
#[derive(Debug, Clone)]
pub struct ApptainerRuntime {
    binary: String,
    image_dir: PathBuf,
}

impl ApptainerRuntime {
    pub fn new(binary: impl Into<String>, image_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            image_dir: image_dir.into(),
        }
    }

    /// Path of the SIF file a pull of `image` produces
    pub fn sif_path(&self, image: &ImageReference) -> PathBuf {
        let base = image.name().rsplit('/').next().unwrap_or(image.name());
        self.image_dir.join(format!("{}_{}.sif", base, image.tag()))
    }
}

impl ContainerRuntime for ApptainerRuntime {
    fn name(&self) -> &str {
        &self.binary
    }

    fn image_exists(&self, image: &ImageReference) -> Result<bool> {
        Ok(self.sif_path(image).exists())
    }

    fn pull(&self, image: &ImageReference) -> Result<()> {
        let uri = image.uri();
        info!("Pulling {} with {}", uri, self.binary);

        std::fs::create_dir_all(&self.image_dir).with_context(|| {
            format!("Failed to create image directory {}", self.image_dir.display())
        })?;

        let output = Command::new(&self.binary)
            .arg("pull")
            .arg("--force")
            .arg(self.sif_path(image))
            .arg(&uri)
            .output()
            .with_context(|| format!("Failed to execute '{} pull'", self.binary))?;

        check_output(&self.binary, "pull", output)?;
        Ok(())
    }

    fn command(&self, image: &ImageReference, spec: ExecSpec<'_>) -> Command {
        let mut command = Command::new(&self.binary);
        command.arg("exec").arg("--cleanenv");

        if let Some(workspace) = spec.workspace {
            command
                .arg("--bind")
                .arg(format!("{}:/workspace", workspace.display()))
                .arg("--pwd")
                .arg("/workspace");
        }
        for (key, value) in spec.env {
            command.arg("--env").arg(format!("{}={}", key, value));
        }

        let sif = self.sif_path(image);
        if sif.exists() {
            command.arg(sif);
        } else {
            command.arg(image.uri());
        }
        command.args(spec.argv);
        command
    }
}

/// Runtime selection shared by every image of a session
///
/// The mode is fixed at construction and handed to each image explicitly.
#[derive(Clone)]
pub struct Provisioning {
    mode: RuntimeMode,
    primary: Arc<dyn ContainerRuntime>,
    alternate: Arc<dyn ContainerRuntime>,
}

impl Provisioning {
    pub fn new(
        mode: RuntimeMode,
        primary: Arc<dyn ContainerRuntime>,
        alternate: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            mode,
            primary,
            alternate,
        }
    }

    pub fn mode(&self) -> RuntimeMode {
        self.mode
    }

    pub fn primary(&self) -> &Arc<dyn ContainerRuntime> {
        &self.primary
    }

    pub fn alternate(&self) -> &Arc<dyn ContainerRuntime> {
        &self.alternate
    }

    /// The runtime selected by the mode
    pub fn active(&self) -> &Arc<dyn ContainerRuntime> {
        match self.mode {
            RuntimeMode::Primary => &self.primary,
            RuntimeMode::Alternate => &self.alternate,
        }
    }
}

impl std::fmt::Debug for Provisioning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioning")
            .field("mode", &self.mode)
            .field("primary", &self.primary.name())
            .field("alternate", &self.alternate.name())
            .finish()
    }
}

/// Logs a tool's output and turns a non-zero exit into an error
fn check_output(binary: &str, action: &str, output: Output) -> Result<Output> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);

    if !stdout.trim().is_empty() {
        debug!("{} {} stdout: {}", binary, action, stdout.trim());
    }
    if !stderr.trim().is_empty() {
        debug!("{} {} stderr: {}", binary, action, stderr.trim());
    }

    if !output.status.success() {
        let exit_code = output.status.code().unwrap_or(-1);
        let message = format!(
            "'{} {}' failed: exit_code={}, stderr='{}'",
            binary,
            action,
            exit_code,
            stderr.trim()
        );
        error!("{}", message);
        anyhow::bail!(message);
    }

    Ok(output)
}
