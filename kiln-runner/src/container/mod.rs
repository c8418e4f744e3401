//! Container image provisioning
//!
//! Makes sure the image a job runs in is present before the job is
//! dispatched:
//! - Local images are only looked up; a miss is logged, not fatal
//! - Remote images are pulled through the runtime selected by the
//!   provisioning mode
//! - Preparation happens at most once per image instance

pub mod runtime;

use kiln_core::domain::image::ImageReference;
use kiln_core::{KilnError, Result};
use std::process::Command;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info, warn};

pub use runtime::{
    ApptainerRuntime, ContainerRuntime, ExecSpec, PodmanRuntime, Provisioning, RuntimeMode,
};

/// Where an image comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSource {
    /// Built on this machine
    Local,
    /// Fetched from a registry
    Remote,
}

/// A named, tagged image a job needs
#[derive(Debug)]
pub struct ContainerImage {
    reference: ImageReference,
    source: ImageSource,
    provisioning: Provisioning,
    prepared: Mutex<bool>,
}

impl ContainerImage {
    /// An image already built on this machine
    ///
    /// # Arguments
    /// * `reference` - `name` or `name:tag`
    /// * `tag` - Explicit tag, only when `reference` carries none
    /// * `provisioning` - Runtime selection used by `prepare`
    pub fn local(reference: &str, tag: Option<&str>, provisioning: Provisioning) -> Result<Self> {
        Ok(Self::with_reference(
            ImageReference::parse(reference, tag)?,
            ImageSource::Local,
            provisioning,
        ))
    }

    /// An image pulled from a registry
    ///
    /// `reference` may start with a `scheme://` prefix, which is stripped
    /// from the name and kept for the alternate runtime.
    pub fn remote(reference: &str, tag: Option<&str>, provisioning: Provisioning) -> Result<Self> {
        Ok(Self::with_reference(
            ImageReference::parse_remote(reference, tag)?,
            ImageSource::Remote,
            provisioning,
        ))
    }

    fn with_reference(
        reference: ImageReference,
        source: ImageSource,
        provisioning: Provisioning,
    ) -> Self {
        Self {
            reference,
            source,
            provisioning,
            prepared: Mutex::new(false),
        }
    }

    pub fn name(&self) -> &str {
        self.reference.name()
    }

    pub fn tag(&self) -> &str {
        self.reference.tag()
    }

    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    pub fn source(&self) -> ImageSource {
        self.source
    }

    /// Whether a previous `prepare` succeeded. Never triggers preparation.
    pub fn is_prepared(&self) -> bool {
        *self.prepared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ensures the image is available locally
    ///
    /// Returns immediately once the image has been prepared. Concurrent
    /// callers wait for the first one, so the external tool runs once.
    ///
    /// # Errors
    /// * `KilnError::Configuration` - a local image under the alternate runtime
    /// * `KilnError::PrepareFailed` - the pull failed; the image stays unprepared
    pub fn prepare(&self) -> Result<()> {
        let mut prepared = self.prepared.lock().unwrap_or_else(PoisonError::into_inner);
        if *prepared {
            debug!("Image {} already prepared", self.reference);
            return Ok(());
        }

        match self.source {
            ImageSource::Local => {
                if self.provisioning.mode() == RuntimeMode::Alternate {
                    return Err(KilnError::Configuration(format!(
                        "local image {} cannot be prepared with the alternate runtime",
                        self.reference
                    )));
                }

                let runtime = self.provisioning.primary();
                match runtime.image_exists(&self.reference) {
                    Ok(true) => {
                        info!("Found local image {}", self.reference);
                        *prepared = true;
                    }
                    Ok(false) => {
                        warn!("Local image {} not found in {}", self.reference, runtime.name());
                    }
                    Err(e) => {
                        warn!("Could not look up local image {}: {:#}", self.reference, e);
                    }
                }
            }
            ImageSource::Remote => {
                let runtime = self.provisioning.active();
                let target = match self.provisioning.mode() {
                    RuntimeMode::Primary => self.reference.reference(),
                    RuntimeMode::Alternate => self.reference.uri(),
                };

                runtime
                    .pull(&self.reference)
                    .map_err(|e| KilnError::prepare_failed(&target, format!("{:#}", e)))?;

                info!("Pulled image {} with {}", target, runtime.name());
                *prepared = true;
            }
        }

        Ok(())
    }

    /// Builds the command running `spec` inside this image
    ///
    /// Local images always run through the primary runtime; remote images
    /// through the runtime selected by the provisioning mode.
    pub fn command(&self, spec: ExecSpec<'_>) -> Command {
        let runtime = match self.source {
            ImageSource::Local => self.provisioning.primary(),
            ImageSource::Remote => self.provisioning.active(),
        };
        runtime.command(&self.reference, spec)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Container runtime fake used by tests

    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records lookups and pulls instead of running a tool
    pub struct FakeRuntime {
        name: String,
        present: bool,
        fail_pulls: bool,
        pub lookups: AtomicUsize,
        pub pulls: Mutex<Vec<String>>,
    }

    impl FakeRuntime {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                present: true,
                fail_pulls: false,
                lookups: AtomicUsize::new(0),
                pulls: Mutex::new(Vec::new()),
            }
        }

        pub fn missing(mut self) -> Self {
            self.present = false;
            self
        }

        pub fn failing(mut self) -> Self {
            self.fail_pulls = true;
            self
        }

        pub fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }

        pub fn pulls(&self) -> Vec<String> {
            self.pulls.lock().unwrap().clone()
        }
    }

    impl ContainerRuntime for FakeRuntime {
        fn name(&self) -> &str {
            &self.name
        }

        fn image_exists(&self, _image: &ImageReference) -> anyhow::Result<bool> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.present)
        }

        fn pull(&self, image: &ImageReference) -> anyhow::Result<()> {
            let target = if self.name == "alternate" {
                image.uri()
            } else {
                image.reference()
            };
            self.pulls.lock().unwrap().push(target);
            if self.fail_pulls {
                anyhow::bail!("registry unreachable");
            }
            Ok(())
        }

        fn command(&self, image: &ImageReference, spec: ExecSpec<'_>) -> Command {
            let mut command = Command::new(&self.name);
            command.arg(image.reference()).args(spec.argv);
            if let Some(workspace) = spec.workspace {
                command.current_dir(Path::new(workspace));
            }
            command
        }
    }

    pub fn provisioning(
        mode: RuntimeMode,
        primary: &Arc<FakeRuntime>,
        alternate: &Arc<FakeRuntime>,
    ) -> Provisioning {
        Provisioning::new(mode, primary.clone(), alternate.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{FakeRuntime, provisioning};
    use super::*;
    use std::sync::Arc;

    fn runtimes() -> (Arc<FakeRuntime>, Arc<FakeRuntime>) {
        (
            Arc::new(FakeRuntime::new("primary")),
            Arc::new(FakeRuntime::new("alternate")),
        )
    }

    #[test]
    fn test_reference_parsing() {
        let (primary, alternate) = runtimes();
        let p = provisioning(RuntimeMode::Primary, &primary, &alternate);

        let image = ContainerImage::local("repo/name", None, p.clone()).unwrap();
        assert_eq!(image.name(), "repo/name");
        assert_eq!(image.tag(), "latest");

        let image = ContainerImage::local("repo/name:v2", None, p.clone()).unwrap();
        assert_eq!(image.name(), "repo/name");
        assert_eq!(image.tag(), "v2");

        let err = ContainerImage::remote("repo/name:v2", Some("v3"), p).unwrap_err();
        assert!(matches!(err, KilnError::InvalidReference { .. }));
    }

    #[test]
    fn test_remote_prepare_runs_once() {
        let (primary, alternate) = runtimes();
        let image = ContainerImage::remote(
            "docker://library/alpine:3.19",
            None,
            provisioning(RuntimeMode::Primary, &primary, &alternate),
        )
        .unwrap();

        assert!(!image.is_prepared());
        image.prepare().unwrap();
        image.prepare().unwrap();

        assert!(image.is_prepared());
        assert_eq!(primary.pulls(), vec!["library/alpine:3.19".to_string()]);
        assert!(alternate.pulls().is_empty());
    }

    #[test]
    fn test_remote_prepare_uses_alternate_runtime() {
        let (primary, alternate) = runtimes();
        let image = ContainerImage::remote(
            "docker://library/alpine",
            None,
            provisioning(RuntimeMode::Alternate, &primary, &alternate),
        )
        .unwrap();

        image.prepare().unwrap();

        assert!(primary.pulls().is_empty());
        assert_eq!(
            alternate.pulls(),
            vec!["docker://library/alpine:latest".to_string()]
        );
    }

    #[test]
    fn test_failed_pull_leaves_image_unprepared() {
        let primary = Arc::new(FakeRuntime::new("primary").failing());
        let alternate = Arc::new(FakeRuntime::new("alternate"));
        let image = ContainerImage::remote(
            "alpine",
            None,
            provisioning(RuntimeMode::Primary, &primary, &alternate),
        )
        .unwrap();

        let err = image.prepare().unwrap_err();
        assert!(matches!(err, KilnError::PrepareFailed { .. }));
        assert!(err.to_string().contains("registry unreachable"));
        assert!(!image.is_prepared());

        // No internal retry; a second call tries again
        assert!(image.prepare().is_err());
        assert_eq!(primary.pulls().len(), 2);
    }

    #[test]
    fn test_local_prepare_checks_store_once() {
        let (primary, alternate) = runtimes();
        let image = ContainerImage::local(
            "builder",
            Some("dev"),
            provisioning(RuntimeMode::Primary, &primary, &alternate),
        )
        .unwrap();

        image.prepare().unwrap();
        image.prepare().unwrap();

        assert!(image.is_prepared());
        assert_eq!(primary.lookups(), 1);
        assert!(primary.pulls().is_empty());
    }

    #[test]
    fn test_missing_local_image_is_advisory() {
        let primary = Arc::new(FakeRuntime::new("primary").missing());
        let alternate = Arc::new(FakeRuntime::new("alternate"));
        let image = ContainerImage::local(
            "builder",
            None,
            provisioning(RuntimeMode::Primary, &primary, &alternate),
        )
        .unwrap();

        image.prepare().unwrap();
        assert!(!image.is_prepared());
    }

    #[test]
    fn test_local_prepare_rejected_in_alternate_mode() {
        let (primary, alternate) = runtimes();
        let image = ContainerImage::local(
            "builder",
            None,
            provisioning(RuntimeMode::Alternate, &primary, &alternate),
        )
        .unwrap();

        let err = image.prepare().unwrap_err();
        assert!(matches!(err, KilnError::Configuration(_)));
        assert!(!image.is_prepared());
        assert_eq!(primary.lookups(), 0);
    }

    #[test]
    fn test_is_prepared_is_observational() {
        let (primary, alternate) = runtimes();
        let image = ContainerImage::remote(
            "alpine",
            None,
            provisioning(RuntimeMode::Primary, &primary, &alternate),
        )
        .unwrap();

        assert!(!image.is_prepared());
        assert!(!image.is_prepared());
        assert!(primary.pulls().is_empty());
    }
}
