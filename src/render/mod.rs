//! Template rendering engine.
//!
//! Templates use `{{dotted.path}}` placeholders. Block generators own the
//! composite values (SSH key lists, nameserver lists, the `runcmd` list) and
//! are consulted before the leaf lookup walks the parameter tree. Generated
//! text is never rescanned. Placeholders that resolve to nothing are left in
//! the output verbatim.

mod blocks;
mod context;
mod placeholder;
mod runcmd;

use std::time::{SystemTime, UNIX_EPOCH};

use camino::Utf8Path;
use thiserror::Error;
use tracing::debug;

use crate::files;
use crate::params::DeploymentParameters;
use crate::primary_user::PrimaryUser;

pub use blocks::{EMPTY_SEQUENCE, inline_sequence, quoted_sequence, yaml_quote};
pub use context::{INSTANCE_ID_KEY, RenderContext};
pub use runcmd::{RuncmdEntry, SWAP_SCRIPT_NAME, compose_runcmd, runcmd_block, swap_script};

/// Synthetic placeholder replaced by the composed `runcmd` list.
pub const RUNCMD_PLACEHOLDER: &str = "runcmd_block";
const SSH_BLOCK_SUFFIX: &str = "ssh_keys_block";
const DNS_INLINE_SUFFIX: &str = "nameservers_inline";

/// Errors raised while loading templates.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RenderError {
    /// A required template does not exist in the template directory.
    #[error("required template {path} is missing")]
    MissingTemplate {
        /// Expected template location.
        path: String,
    },
    /// A template exists but could not be read.
    #[error("failed to read template {path}: {message}")]
    Read {
        /// Template location.
        path: String,
        /// Underlying I/O error.
        message: String,
    },
}

/// Reads a template that must exist.
///
/// # Errors
///
/// Returns [`RenderError::MissingTemplate`] when the file is absent and
/// [`RenderError::Read`] when it cannot be read.
pub fn load_template(dir: &Utf8Path, name: &str) -> Result<String, RenderError> {
    load_optional_template(dir, name)?.ok_or_else(|| RenderError::MissingTemplate {
        path: dir.join(name).to_string(),
    })
}

/// Reads a template that may be absent.
///
/// # Errors
///
/// Returns [`RenderError::Read`] when the file exists but cannot be read.
pub fn load_optional_template(dir: &Utf8Path, name: &str) -> Result<Option<String>, RenderError> {
    let path = dir.join(name);
    files::read_optional(&path).map_err(|message| RenderError::Read {
        path: path.to_string(),
        message,
    })
}

/// Generates the default instance identifier `<vm>-<unix seconds>`.
#[must_use]
pub fn generate_instance_id(vm_name: &str, now: SystemTime) -> String {
    let secs = now
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default();
    format!("{vm_name}-{secs}")
}

/// Renders templates for one deployment.
///
/// The `runcmd` list is composed once at construction, so every document
/// rendered by the same instance sees identical entries.
#[derive(Clone, Debug)]
pub struct Renderer<'a> {
    params: &'a DeploymentParameters,
    context: RenderContext<'a>,
    runcmd: Vec<RuncmdEntry>,
}

impl<'a> Renderer<'a> {
    /// Creates a renderer whose generated first-boot scripts live in
    /// `script_dir` inside the guest.
    #[must_use]
    pub fn new(params: &'a DeploymentParameters, script_dir: &str) -> Self {
        Self {
            params,
            context: RenderContext::new(params.tree()),
            runcmd: compose_runcmd(params, script_dir),
        }
    }

    /// Exposes the primary-user projection to templates.
    #[must_use]
    pub fn with_primary(mut self, primary: &PrimaryUser) -> Self {
        self.context = self.context.with_primary(primary);
        self
    }

    /// Exposes the instance identifier as `{{instance.id}}`.
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: &str) -> Self {
        self.context = self.context.with_derived(INSTANCE_ID_KEY, instance_id);
        self
    }

    /// The composed `runcmd` entries.
    #[must_use]
    pub fn runcmd(&self) -> &[RuncmdEntry] {
        &self.runcmd
    }

    /// Renders `template`. Output is a pure function of the template, the
    /// parameters and the derived values.
    ///
    /// Block placeholders take precedence over tree leaves. Generated block
    /// text is emitted as-is, so braces inside an SSH key, a nameserver or a
    /// runcmd entry are never substituted.
    #[must_use]
    pub fn render(&self, template: &str) -> String {
        placeholder::substitute_each(template, |path, indent| {
            if let Some(block) = self.block(path, indent) {
                return Some(block);
            }
            let resolved = self.context.lookup(path);
            if resolved.is_none() {
                debug!(placeholder = path, "placeholder left unresolved");
            }
            resolved
        })
    }

    /// Output of the block generator owning `path`, if any.
    fn block(&self, path: &str, indent: usize) -> Option<String> {
        if path == RUNCMD_PLACEHOLDER {
            return Some(runcmd_block(&self.runcmd, indent));
        }
        let (group, suffix) = path.split_once('.')?;
        match suffix {
            SSH_BLOCK_SUFFIX => self
                .params
                .users()
                .iter()
                .find(|user| user.key() == group)
                .map(|user| quoted_sequence(&user.ssh_keys, indent)),
            DNS_INLINE_SUFFIX => self
                .params
                .interfaces()
                .iter()
                .find(|interface| interface.key() == group)
                .map(|interface| inline_sequence(&interface.nameservers)),
            _ => None,
        }
    }
}
