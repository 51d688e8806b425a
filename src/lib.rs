//! Core library for the clonekit VM deployment tool.
//!
//! The crate drives a cloned virtual machine through four ordered phases:
//! clone, guest preparation, seed-and-personalize and finalize. It renders
//! cloud-init seed documents from templates and a parameter file, packs them
//! onto a removable medium, and decides from timestamp evidence inside the
//! guest whether first-boot personalization ran and finished on this boot.
//! The hypervisor and the in-guest command channel are reached through the
//! [`ControlPlane`] and [`GuestChannel`] traits; [`Govc`] implements both.

pub mod command;
pub mod config;
pub mod control;
pub mod detect;
pub mod files;
pub mod guest_script;
pub mod params;
pub mod phases;
pub mod power;
pub mod primary_user;
pub mod render;
pub mod seed;
pub mod test_support;

pub use command::{CommandError, CommandOutput, CommandRunner, ProcessCommandRunner};
pub use config::{ConfigError, Timings, ToolConfig};
pub use control::{
    ControlPlane, ControlPlaneError, Govc, GuestChannel, GuestError, LookupError, LookupRetry,
    PowerState, VmSnapshot,
};
pub use detect::{
    ActivationDetector, Completion, CompletionSignal, DetectError, DetectionReport, Evidence,
    EvidenceLabel, PollState,
};
pub use guest_script::{GuestScripts, ScriptError, ScriptRun};
pub use params::{DatastorePath, DeploymentParameters, ParamsError};
pub use phases::{
    DeployError, DeployOptions, DeploymentReport, DeploymentRunner, Personalization, Phase,
    PhaseSelection, PhaseSelectionError, Warning, WarningKind, Warnings,
};
pub use power::{PowerController, PowerOutcome};
pub use primary_user::{PrimaryUser, PrimaryUserError, resolve_primary, select_primary};
pub use render::{RenderError, Renderer};
pub use seed::{SeedBundle, SeedDocuments, SeedError, SeedPackager};
