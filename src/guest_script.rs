//! Staging, upload and elevated execution of generated guest scripts.

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::command::CommandOutput;
use crate::control::{GuestChannel, GuestError};
use crate::files;
use crate::primary_user::PrimaryUser;

/// Errors raised before a script produces output.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ScriptError {
    /// The script could not be written locally.
    #[error("failed to stage {name}: {message}")]
    Stage {
        /// Script name.
        name: String,
        /// Underlying I/O error.
        message: String,
    },
    /// The script could not be copied into the guest.
    #[error("failed to upload {name}: {source}")]
    Upload {
        /// Script name.
        name: String,
        /// Channel failure.
        #[source]
        source: GuestError,
    },
    /// The script could not be started in the guest.
    #[error("failed to run {name}: {source}")]
    Run {
        /// Script name.
        name: String,
        /// Channel failure.
        #[source]
        source: GuestError,
    },
}

/// Output of one script execution plus any cleanup problem.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScriptRun {
    /// Captured guest output.
    pub output: CommandOutput,
    /// Set when the script could not be removed from the guest.
    pub cleanup_warning: Option<String>,
}

/// Runs generated scripts inside one guest.
#[derive(Debug)]
pub struct GuestScripts<'a, G: ?Sized> {
    guest: &'a G,
    vm: &'a str,
    user: &'a PrimaryUser,
    staging_dir: Utf8PathBuf,
    guest_dir: String,
    elevate: String,
}

impl<'a, G: GuestChannel + ?Sized> GuestScripts<'a, G> {
    /// Creates a runner staging locally in `staging_dir` and executing from
    /// `guest_dir` with the `elevate` prefix.
    #[must_use]
    pub fn new(
        guest: &'a G,
        vm: &'a str,
        user: &'a PrimaryUser,
        staging_dir: &Utf8Path,
        guest_dir: &str,
        elevate: &str,
    ) -> Self {
        Self {
            guest,
            vm,
            user,
            staging_dir: staging_dir.to_path_buf(),
            guest_dir: guest_dir.trim_end_matches('/').to_owned(),
            elevate: elevate.trim().to_owned(),
        }
    }

    /// Guest path a script named `name` is uploaded to.
    #[must_use]
    pub fn remote_path(&self, name: &str) -> String {
        format!("{}/{name}", self.guest_dir)
    }

    /// Stages, uploads and runs `body` elevated, then removes it from the
    /// guest. A non-zero script exit is reported through the output, not as
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns [`ScriptError`] when staging, upload or launch fails.
    pub fn execute(&self, name: &str, body: &str) -> Result<ScriptRun, ScriptError> {
        let local_name = format!("{}-{name}", Uuid::new_v4());
        let local = files::write_file(&self.staging_dir, &local_name, body).map_err(|message| {
            ScriptError::Stage {
                name: name.to_owned(),
                message,
            }
        })?;
        let remote = self.remote_path(name);
        let quoted_dir = escape(self.guest_dir.as_str().into());
        let quoted_remote = escape(remote.as_str().into()).into_owned();

        if let Err(err) = self.guest.run(self.vm, self.user, &format!("mkdir -p {quoted_dir}")) {
            debug!(vm = self.vm, error = %err, "guest work directory creation failed");
        }
        self.guest
            .upload(self.vm, self.user, &local, &remote)
            .map_err(|source| ScriptError::Upload {
                name: name.to_owned(),
                source,
            })?;
        let command = if self.elevate.is_empty() {
            format!("/bin/sh {quoted_remote}")
        } else {
            format!("{} /bin/sh {quoted_remote}", self.elevate)
        };
        let result = self.guest.run(self.vm, self.user, &command);
        let cleanup_warning = self.remove(&quoted_remote, name);
        let output = result.map_err(|source| ScriptError::Run {
            name: name.to_owned(),
            source,
        })?;
        Ok(ScriptRun {
            output,
            cleanup_warning,
        })
    }

    fn remove(&self, quoted_remote: &str, name: &str) -> Option<String> {
        let command = if self.elevate.is_empty() {
            format!("rm -f {quoted_remote}")
        } else {
            format!("{} rm -f {quoted_remote}", self.elevate)
        };
        let problem = match self.guest.run(self.vm, self.user, &command) {
            Ok(output) if output.is_success() => return None,
            Ok(output) => format!("exit status {}", output.status_text()),
            Err(err) => err.to_string(),
        };
        let message = format!("could not remove {name} from guest: {problem}");
        warn!(vm = self.vm, "{message}");
        Some(message)
    }
}
