//! Error types for the deployment phase state machine.

use thiserror::Error;

use crate::config::ConfigError;
use crate::control::{ControlPlaneError, GuestError, LookupError, PowerState};
use crate::detect::DetectError;
use crate::guest_script::ScriptError;
use crate::power::{Cancelled, PowerOutcome};
use crate::primary_user::PrimaryUserError;
use crate::render::RenderError;
use crate::seed::SeedError;

use super::PhaseSelectionError;

/// Fatal outcomes that stop the current invocation.
///
/// Degraded outcomes are reported through
/// [`crate::phases::Warnings`] instead.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum DeployError {
    /// Raised when the requested phases are not a contiguous run.
    #[error(transparent)]
    Phases(#[from] PhaseSelectionError),
    /// Raised when the effective timing budget is invalid.
    #[error("invalid timing configuration: {0}")]
    Config(#[from] ConfigError),
    /// Raised when in-guest credentials are needed but unusable.
    #[error("credential check failed: {0}")]
    Credentials(#[from] PrimaryUserError),
    /// Raised when Clone finds a VM with the target name.
    #[error("a VM named {vm} already exists (power {power:?})")]
    NameCollision {
        /// Target VM name.
        vm: String,
        /// Power state of the existing VM.
        power: PowerState,
    },
    /// Raised when Clone has no template to copy.
    #[error("vm.template is required to clone {vm}")]
    CloneSourceMissing {
        /// Target VM name.
        vm: String,
    },
    /// Raised when SeedAndPersonalize has no datastore path.
    #[error("seed.iso_path is required for personalization")]
    SeedPathMissing,
    /// Raised when the VM cannot be resolved.
    #[error(transparent)]
    Lookup(LookupError),
    /// Raised when a control-plane request fails.
    #[error("control plane request failed: {0}")]
    ControlPlane(#[from] ControlPlaneError),
    /// Raised when a direct guest command cannot be issued.
    #[error("guest command failed: {0}")]
    Guest(#[from] GuestError),
    /// Raised when a required template is missing or unreadable.
    #[error(transparent)]
    Template(#[from] RenderError),
    /// Raised when the seed bundle cannot be built.
    #[error("seed bundle failed: {0}")]
    Seed(#[from] SeedError),
    /// Raised when a guest script cannot be delivered.
    #[error(transparent)]
    Script(#[from] ScriptError),
    /// Raised when the guest preparation routine fails.
    #[error("guest preparation exited with status {status_text}: {stderr}")]
    GuestPrep {
        /// Human readable exit status.
        status_text: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when the permanent-disable marker is already present.
    #[error("personalization is permanently disabled on {vm} ({path}); refusing to attach a seed")]
    PersonalizationDisabled {
        /// Target VM name.
        vm: String,
        /// Marker path.
        path: String,
    },
    /// Raised when the seed artifact already exists on the datastore.
    #[error("datastore artifact {path} already exists; remove it or finalize the previous run")]
    ArtifactExists {
        /// Datastore path.
        path: String,
    },
    /// Raised when the VM cannot be started.
    #[error("failed to start {vm}: {outcome}")]
    PowerStart {
        /// Target VM name.
        vm: String,
        /// Reported power outcome.
        outcome: PowerOutcome,
    },
    /// Raised when the VM cannot be stopped before attaching the seed.
    #[error("failed to stop {vm}: {outcome}")]
    PowerStop {
        /// Target VM name.
        vm: String,
        /// Reported power outcome.
        outcome: PowerOutcome,
    },
    /// Raised when the guest command channel is required but unavailable.
    #[error("guest channel on {vm} unavailable ({outcome})")]
    GuestUnavailable {
        /// Target VM name.
        vm: String,
        /// Reported power outcome.
        outcome: PowerOutcome,
    },
    /// Raised when the quick check finds no activity after T0.
    #[error("personalization did not run on {vm} after T0={t0}")]
    NotRan {
        /// Target VM name.
        vm: String,
        /// Reference instant in epoch seconds.
        t0: u64,
    },
    /// Raised when the disable marker appears during the completion poll.
    #[error("personalization was disabled on {vm} while waiting for completion")]
    DisabledDuringPoll {
        /// Target VM name.
        vm: String,
    },
    /// Raised when detection cannot reach a verdict.
    #[error("activation detection failed: {0}")]
    Detection(DetectError),
    /// Raised when the irreversible Finalize step fails in the guest.
    #[error("disabling future personalization failed with status {status_text}: {stderr}")]
    DisableFailed {
        /// Human readable exit status.
        status_text: String,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when cancellation is requested.
    #[error("deployment cancelled")]
    Cancelled,
}

impl From<Cancelled> for DeployError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl From<LookupError> for DeployError {
    fn from(value: LookupError) -> Self {
        match value {
            LookupError::Cancelled { .. } => Self::Cancelled,
            err @ LookupError::Exhausted { .. } => Self::Lookup(err),
        }
    }
}

impl DeployError {
    pub(super) fn from_detection(vm: &str, err: DetectError) -> Self {
        match err {
            DetectError::Disabled { path } => Self::PersonalizationDisabled {
                vm: vm.to_owned(),
                path,
            },
            DetectError::NotRan { t0 } => Self::NotRan {
                vm: vm.to_owned(),
                t0,
            },
            DetectError::DisabledDuringPoll => Self::DisabledDuringPoll { vm: vm.to_owned() },
            DetectError::Cancelled => Self::Cancelled,
            other => Self::Detection(other),
        }
    }
}
