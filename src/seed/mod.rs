//! Seed bundle rendering and packaging.
//!
//! The seed bundle is the NoCloud data source handed to the guest on a
//! removable medium: `user-data`, `meta-data` and an optional
//! `network-config`, packed into an ISO labelled `cidata`.

use std::ffi::OsString;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::command::{CommandError, CommandRunner};
use crate::files;
use crate::params::DeploymentParameters;
use crate::primary_user::PrimaryUser;
use crate::render::{self, RenderError, Renderer, generate_instance_id};

/// Required user-data template name.
pub const USER_DATA_TEMPLATE: &str = "user-data.tmpl";
/// Required meta-data template name.
pub const META_DATA_TEMPLATE: &str = "meta-data.tmpl";
/// Optional network-config template name.
pub const NETWORK_CONFIG_TEMPLATE: &str = "network-config.tmpl";
/// Volume label cloud-init looks for.
pub const VOLUME_LABEL: &str = "cidata";
/// Guest directory holding scripts generated into `runcmd`.
pub const GUEST_SCRIPT_DIR: &str = "/opt/clonekit";
/// Image name used when no datastore path names one.
pub const DEFAULT_IMAGE_NAME: &str = "seed.iso";

/// Errors raised while building the seed bundle.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum SeedError {
    /// A template could not be loaded.
    #[error(transparent)]
    Template(#[from] RenderError),
    /// A rendered document could not be written.
    #[error("failed to stage {path}: {message}")]
    Stage {
        /// Destination path.
        path: String,
        /// Underlying I/O error.
        message: String,
    },
    /// The ISO builder could not be started.
    #[error("failed to run ISO builder: {0}")]
    Spawn(#[from] CommandError),
    /// The ISO builder exited unsuccessfully.
    #[error("{program} exited with status {status_text}: {stderr}")]
    Package {
        /// Builder program.
        program: String,
        /// Human readable exit status.
        status_text: String,
        /// Captured standard error.
        stderr: String,
    },
}

/// Rendered seed documents.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SeedDocuments {
    /// Rendered `user-data`.
    pub user_data: String,
    /// Rendered `meta-data`.
    pub meta_data: String,
    /// Rendered `network-config`, when a template exists.
    pub network_config: Option<String>,
    /// Instance identifier written into `meta-data`.
    pub instance_id: String,
}

impl SeedDocuments {
    /// Renders the seed templates found in `template_dir`.
    ///
    /// The instance identifier is `seed.instance_id` when set, otherwise
    /// generated from the VM name and `now`.
    ///
    /// # Errors
    ///
    /// Returns [`SeedError::Template`] when a required template is missing or
    /// any template cannot be read.
    pub fn render(
        params: &DeploymentParameters,
        primary: Option<&PrimaryUser>,
        template_dir: &Utf8Path,
        now: SystemTime,
    ) -> Result<Self, SeedError> {
        let user_template = render::load_template(template_dir, USER_DATA_TEMPLATE)?;
        let meta_template = render::load_template(template_dir, META_DATA_TEMPLATE)?;
        let network_template = render::load_optional_template(template_dir, NETWORK_CONFIG_TEMPLATE)?;

        let instance_id = params
            .instance_id()
            .map_or_else(|| generate_instance_id(&params.vm().name, now), str::to_owned);
        let mut renderer = Renderer::new(params, GUEST_SCRIPT_DIR).with_instance_id(&instance_id);
        if let Some(user) = primary {
            renderer = renderer.with_primary(user);
        }
        debug!(
            runcmd_entries = renderer.runcmd().len(),
            network_config = network_template.is_some(),
            "rendering seed documents"
        );

        Ok(Self {
            user_data: renderer.render(&user_template),
            meta_data: renderer.render(&meta_template),
            network_config: network_template.map(|template| renderer.render(&template)),
            instance_id,
        })
    }

    /// Writes the documents into `dir` under their NoCloud file names and
    /// returns the written paths.
    ///
    /// # Errors
    ///
    /// Returns [`SeedError::Stage`] when a file cannot be written.
    pub fn write_to(&self, dir: &Utf8Path) -> Result<Vec<Utf8PathBuf>, SeedError> {
        let mut documents = vec![("user-data", &self.user_data), ("meta-data", &self.meta_data)];
        if let Some(network) = &self.network_config {
            documents.push(("network-config", network));
        }
        documents
            .into_iter()
            .map(|(name, contents)| {
                files::write_file(dir, name, contents).map_err(|message| SeedError::Stage {
                    path: dir.join(name).to_string(),
                    message,
                })
            })
            .collect()
    }
}

/// Rendered documents plus the packaged image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SeedBundle {
    /// The rendered documents.
    pub documents: SeedDocuments,
    /// Local path of the packaged ISO.
    pub image: Utf8PathBuf,
}

/// Packs seed documents into a `cidata` ISO with an external builder.
#[derive(Debug)]
pub struct SeedPackager<'a, R: ?Sized> {
    runner: &'a R,
    program: &'a str,
}

impl<'a, R: CommandRunner + ?Sized> SeedPackager<'a, R> {
    /// Creates a packager invoking `program` (a `genisoimage`-compatible
    /// builder).
    #[must_use]
    pub const fn new(runner: &'a R, program: &'a str) -> Self {
        Self { runner, program }
    }

    /// Stages `documents` in a fresh subdirectory of `staging_dir` and packs
    /// them into `image_name`.
    ///
    /// # Errors
    ///
    /// Returns [`SeedError`] when staging fails or the builder cannot run or
    /// exits unsuccessfully.
    pub fn package(
        &self,
        documents: SeedDocuments,
        staging_dir: &Utf8Path,
        image_name: &str,
    ) -> Result<SeedBundle, SeedError> {
        let dir = staging_dir.join(Uuid::new_v4().to_string());
        let staged = documents.write_to(&dir)?;
        let image = dir.join(image_name);

        let mut args: Vec<OsString> = [
            "-output",
            image.as_str(),
            "-volid",
            VOLUME_LABEL,
            "-joliet",
            "-rock",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();
        args.extend(staged.iter().map(|path| OsString::from(path.as_str())));

        let output = self.runner.run(self.program, &args)?;
        if !output.is_success() {
            return Err(SeedError::Package {
                program: self.program.to_owned(),
                status_text: output.status_text(),
                stderr: output.stderr.trim().to_owned(),
            });
        }
        info!(image = %image, files = staged.len(), "packaged seed image");
        Ok(SeedBundle { documents, image })
    }
}
