//! Control-plane and guest command channel abstractions.
//!
//! Both surfaces are synchronous: each call is one round trip to the
//! hypervisor tooling. [`Govc`] implements them by shelling out to `govc`;
//! tests substitute in-memory doubles from [`crate::test_support`].

mod govc;
mod retry;

use camino::Utf8Path;
use thiserror::Error;

use crate::command::{CommandError, CommandOutput};
use crate::params::{DatastorePath, VmSpec};
use crate::primary_user::PrimaryUser;

pub use govc::Govc;
pub use retry::{LookupError, LookupRetry};

/// Power state reported by the control plane.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PowerState {
    /// The VM is running.
    On,
    /// The VM is powered off.
    Off,
    /// The VM is suspended.
    Suspended,
}

/// Point-in-time view of a VM. Never reused across a wait.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VmSnapshot {
    /// Inventory name.
    pub name: String,
    /// Current power state.
    pub power: PowerState,
    /// Whether the guest agent reports its command channel as running.
    pub tools_running: bool,
}

impl VmSnapshot {
    /// Returns `true` when powered on.
    #[must_use]
    pub fn is_on(&self) -> bool {
        self.power == PowerState::On
    }
}

/// Errors raised by control-plane operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ControlPlaneError {
    /// The tooling could not be started.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// The tooling ran but reported failure.
    #[error("{operation} exited with status {status_text}: {stderr}")]
    Failed {
        /// Operation that failed (for example `vm.clone`).
        operation: String,
        /// Human readable exit status.
        status_text: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Output could not be parsed.
    #[error("failed to parse {operation} output: {message}")]
    Parse {
        /// Operation whose output was malformed.
        operation: String,
        /// Parser error message.
        message: String,
    },
}

/// Errors raised by the guest command channel.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum GuestError {
    /// The tooling could not be started.
    #[error(transparent)]
    Command(#[from] CommandError),
    /// The channel reported a transport failure.
    #[error("{operation} failed with status {status_text}: {stderr}")]
    Failed {
        /// Operation that failed (for example `guest.upload`).
        operation: String,
        /// Human readable exit status.
        status_text: String,
        /// Captured standard error.
        stderr: String,
    },
}

/// Hypervisor management operations.
pub trait ControlPlane {
    /// Looks a VM up by name; `Ok(None)` when it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError`] when the lookup itself fails.
    fn lookup_vm(&self, name: &str) -> Result<Option<VmSnapshot>, ControlPlaneError>;

    /// Clones `spec.template` into a new, powered-off VM named `spec.name`.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError`] when the clone is refused.
    fn clone_vm(&self, spec: &VmSpec) -> Result<(), ControlPlaneError>;

    /// Applies CPU and memory sizing.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError`] when reconfiguration fails.
    fn set_compute(
        &self,
        name: &str,
        cpus: Option<u32>,
        memory_mb: Option<u64>,
    ) -> Result<(), ControlPlaneError>;

    /// Grows a virtual disk.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError`] when the resize fails.
    fn resize_disk(&self, name: &str, disk: &str, size_gb: u64) -> Result<(), ControlPlaneError>;

    /// Requests power-on.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError`] when the request is refused.
    fn power_on(&self, name: &str) -> Result<(), ControlPlaneError>;

    /// Requests a guest-initiated shutdown.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError`] when the request is refused.
    fn shutdown_guest(&self, name: &str) -> Result<(), ControlPlaneError>;

    /// Inserts the seed medium into the VM's removable-media drive.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError`] when the medium cannot be attached.
    fn attach_seed(&self, name: &str, iso: &DatastorePath) -> Result<(), ControlPlaneError>;

    /// Ejects whatever medium is attached.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError`] when the eject fails.
    fn detach_seed(&self, name: &str) -> Result<(), ControlPlaneError>;

    /// Checks whether a datastore file exists.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError`] when the check cannot be answered.
    fn datastore_exists(&self, path: &DatastorePath) -> Result<bool, ControlPlaneError>;

    /// Uploads a local file to the datastore.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError`] when the upload fails.
    fn datastore_upload(&self, local: &Utf8Path, path: &DatastorePath)
    -> Result<(), ControlPlaneError>;

    /// Deletes a datastore file.
    ///
    /// # Errors
    ///
    /// Returns [`ControlPlaneError`] when the delete fails.
    fn datastore_remove(&self, path: &DatastorePath) -> Result<(), ControlPlaneError>;
}

/// In-guest command execution and file transfer.
pub trait GuestChannel {
    /// Reports whether the guest agent is ready to accept commands.
    ///
    /// # Errors
    ///
    /// Returns [`GuestError`] when readiness cannot be queried.
    fn tools_ready(&self, vm: &str) -> Result<bool, GuestError>;

    /// Runs a shell command line as `user` and captures its output. A
    /// non-zero guest exit status is reported through [`CommandOutput`].
    ///
    /// # Errors
    ///
    /// Returns [`GuestError`] when the command cannot be delivered.
    fn run(&self, vm: &str, user: &PrimaryUser, command: &str) -> Result<CommandOutput, GuestError>;

    /// Copies a local file into the guest, overwriting `remote`.
    ///
    /// # Errors
    ///
    /// Returns [`GuestError`] when the transfer fails.
    fn upload(
        &self,
        vm: &str,
        user: &PrimaryUser,
        local: &Utf8Path,
        remote: &str,
    ) -> Result<(), GuestError>;
}
