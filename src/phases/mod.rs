//! Deployment phase state machine.
//!
//! A deployment runs a contiguous subset of four ordered phases:
//! Clone, GuestInit, SeedAndPersonalize and Finalize. Phases share nothing
//! but the VM name and datastore artifacts, with one exception: when
//! SeedAndPersonalize and Finalize run in the same invocation, the
//! personalization verdict is handed to Finalize to gate its irreversible
//! step.

mod clone;
mod error;
mod finalize;
mod guest_init;
mod personalize;
mod report;

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::command::CommandRunner;
use crate::config::ToolConfig;
use crate::control::{ControlPlane, GuestChannel, VmSnapshot};
use crate::files;
use crate::guest_script::GuestScripts;
use crate::params::DeploymentParameters;
use crate::power::PowerController;
use crate::primary_user::{PrimaryUser, PrimaryUserError, resolve_primary};

pub use error::DeployError;
pub use guest_init::GUEST_PREP_TEMPLATE;
pub use report::{
    DeploymentReport, Personalization, PhaseReport, Warning, WarningKind, Warnings,
};

/// Marker whose presence permanently disables cloud-init on the guest.
pub const DISABLED_MARKER: &str = "/etc/cloud/cloud-init.disabled";

/// One deployment phase, ordered by number.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Phase {
    /// Clone the template and size the copy.
    Clone = 1,
    /// Run the guest preparation routine.
    GuestInit = 2,
    /// Attach the seed medium, boot and detect personalization.
    SeedAndPersonalize = 3,
    /// Detach the seed and disable future personalization.
    Finalize = 4,
}

impl Phase {
    /// All phases in order.
    pub const ALL: [Self; 4] = [
        Self::Clone,
        Self::GuestInit,
        Self::SeedAndPersonalize,
        Self::Finalize,
    ];

    /// Phase number as used on the command line.
    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// Phase for `number`, if any.
    #[must_use]
    pub const fn from_number(number: u8) -> Option<Self> {
        match number {
            1 => Some(Self::Clone),
            2 => Some(Self::GuestInit),
            3 => Some(Self::SeedAndPersonalize),
            4 => Some(Self::Finalize),
            _ => None,
        }
    }

    /// Stable kebab-case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::GuestInit => "guest-init",
            Self::SeedAndPersonalize => "seed-and-personalize",
            Self::Finalize => "finalize",
        }
    }

    /// Whether the phase needs in-guest credentials.
    #[must_use]
    pub const fn needs_credentials(self, skip_reset: bool) -> bool {
        match self {
            Self::Clone => false,
            Self::GuestInit | Self::SeedAndPersonalize => true,
            Self::Finalize => !skip_reset,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Errors raised while parsing a phase request.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum PhaseSelectionError {
    /// Raised when no phase was requested.
    #[error("at least one phase must be requested")]
    Empty,
    /// Raised when a token is not a number or range.
    #[error("invalid phase token `{token}`; use forms like 1,2,3 or 2-4")]
    InvalidToken {
        /// Offending token.
        token: String,
    },
    /// Raised when a number names no phase.
    #[error("phase {number} does not exist; phases are numbered 1 to 4")]
    OutOfRange {
        /// Offending number.
        number: u8,
    },
    /// Raised when the sorted request has a gap.
    #[error("phases must be consecutive, got {requested}")]
    NotContiguous {
        /// Sorted request.
        requested: String,
    },
}

/// A validated, ascending, contiguous run of phases.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PhaseSelection {
    phases: Vec<Phase>,
}

impl PhaseSelection {
    /// Validates a set of requested phases.
    ///
    /// # Errors
    ///
    /// Returns [`PhaseSelectionError::Empty`] or
    /// [`PhaseSelectionError::NotContiguous`].
    pub fn new(requested: impl IntoIterator<Item = Phase>) -> Result<Self, PhaseSelectionError> {
        let sorted: BTreeSet<Phase> = requested.into_iter().collect();
        let (Some(first), Some(last)) = (sorted.first(), sorted.last()) else {
            return Err(PhaseSelectionError::Empty);
        };
        let span = usize::from(last.number() - first.number()) + 1;
        if span != sorted.len() {
            let listed = sorted
                .iter()
                .map(|phase| phase.number().to_string())
                .collect::<Vec<_>>()
                .join(",");
            return Err(PhaseSelectionError::NotContiguous { requested: listed });
        }
        Ok(Self {
            phases: sorted.into_iter().collect(),
        })
    }

    /// Phases in execution order.
    #[must_use]
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Whether `phase` was requested.
    #[must_use]
    pub fn contains(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }

    /// Whether any requested phase needs in-guest credentials.
    #[must_use]
    pub fn needs_credentials(&self, skip_reset: bool) -> bool {
        self.phases
            .iter()
            .any(|phase| phase.needs_credentials(skip_reset))
    }
}

fn parse_number(token: &str) -> Result<u8, PhaseSelectionError> {
    let number: u8 = token
        .trim()
        .parse()
        .map_err(|_| PhaseSelectionError::InvalidToken {
            token: token.trim().to_owned(),
        })?;
    if Phase::from_number(number).is_none() {
        return Err(PhaseSelectionError::OutOfRange { number });
    }
    Ok(number)
}

impl FromStr for PhaseSelection {
    type Err = PhaseSelectionError;

    /// Parses `1,2,3`, `2-4` or a single number.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut requested = Vec::new();
        for token in value.split(',').filter(|token| !token.trim().is_empty()) {
            let (start, end) = match token.split_once('-') {
                Some((low, high)) => (parse_number(low)?, parse_number(high)?),
                None => {
                    let number = parse_number(token)?;
                    (number, number)
                }
            };
            if start > end {
                return Err(PhaseSelectionError::InvalidToken {
                    token: token.trim().to_owned(),
                });
            }
            requested.extend((start..=end).filter_map(Phase::from_number));
        }
        Self::new(requested)
    }
}

/// Operator switches for one invocation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct DeployOptions {
    /// Never change power state unless forced.
    pub no_power_change: bool,
    /// Skip Finalize's irreversible step.
    pub skip_reset: bool,
    /// Operator confirms personalization finished out of band.
    pub confirm_personalized: bool,
    /// Allow power-on in no-power-change mode.
    pub force_power: bool,
}

/// Runs phases against one VM.
#[derive(Debug)]
pub struct DeploymentRunner<'a, C: ?Sized, G: ?Sized, R: ?Sized> {
    control: &'a C,
    guest: &'a G,
    runner: &'a R,
    config: &'a ToolConfig,
    params: &'a DeploymentParameters,
    options: DeployOptions,
    cancel: &'a CancellationToken,
    clock: fn() -> SystemTime,
}

impl<'a, C, G, R> DeploymentRunner<'a, C, G, R>
where
    C: ControlPlane + ?Sized,
    G: GuestChannel + ?Sized,
    R: CommandRunner + ?Sized,
{
    /// Creates a runner. `runner` executes the ISO builder.
    #[must_use]
    pub fn new(
        control: &'a C,
        guest: &'a G,
        runner: &'a R,
        config: &'a ToolConfig,
        params: &'a DeploymentParameters,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            control,
            guest,
            runner,
            config,
            params,
            options: DeployOptions::default(),
            cancel,
            clock: SystemTime::now,
        }
    }

    /// Applies operator switches.
    #[must_use]
    pub const fn with_options(mut self, options: DeployOptions) -> Self {
        self.options = options;
        self
    }

    /// Replaces the wall clock used for T0 and instance identifiers.
    #[must_use]
    pub const fn with_clock(mut self, clock: fn() -> SystemTime) -> Self {
        self.clock = clock;
        self
    }

    fn vm_name(&self) -> &'a str {
        &self.params.vm().name
    }

    fn now_secs(&self) -> u64 {
        (self.clock)()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default()
    }

    fn staging_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(files::expand_tilde(&self.config.staging_dir))
    }

    fn template_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(files::expand_tilde(&self.config.template_dir))
    }

    fn scripts<'s>(
        &'s self,
        user: &'s PrimaryUser,
        staging: &'s Utf8Path,
    ) -> GuestScripts<'s, G> {
        GuestScripts::new(
            self.guest,
            self.vm_name(),
            user,
            staging,
            &self.config.guest_work_dir,
            &self.config.elevate_command,
        )
    }

    fn resolve_credentials(
        &self,
        selection: &PhaseSelection,
    ) -> Result<Option<PrimaryUser>, DeployError> {
        if selection.needs_credentials(self.options.skip_reset) {
            return Ok(Some(resolve_primary(self.params.users())?));
        }
        Ok(resolve_primary(self.params.users()).ok())
    }

    async fn require_vm(
        &self,
        power: &PowerController<'_, C, G>,
    ) -> Result<VmSnapshot, DeployError> {
        Ok(power
            .retry()
            .require(self.control, self.vm_name(), self.cancel)
            .await?)
    }

    /// Runs `selection` in order, stopping at the first fatal error.
    ///
    /// # Errors
    ///
    /// Returns [`DeployError`] for every fatal outcome; degraded outcomes
    /// are reported in [`DeploymentReport::warnings`].
    pub async fn run(&self, selection: &PhaseSelection) -> Result<DeploymentReport, DeployError> {
        let primary = self.resolve_credentials(selection)?;
        let timings = self
            .config
            .timings()
            .with_overrides(self.params.timeouts());
        timings.validate()?;
        let power = PowerController::new(
            self.control,
            self.guest,
            timings,
            self.options.no_power_change,
            self.cancel,
        );

        let mut report = DeploymentReport::new(self.vm_name());
        for &phase in selection.phases() {
            if self.cancel.is_cancelled() {
                return Err(DeployError::Cancelled);
            }
            info!(vm = self.vm_name(), phase = %phase, "phase starting");
            let summary = match phase {
                Phase::Clone => self.run_clone(&power).await?,
                Phase::GuestInit => {
                    let user = required(primary.as_ref())?;
                    self.run_guest_init(&power, user, &mut report).await?
                }
                Phase::SeedAndPersonalize => {
                    let user = required(primary.as_ref())?;
                    self.run_personalize(&power, user, &mut report).await?
                }
                Phase::Finalize => {
                    self.run_finalize(&power, primary.as_ref(), &mut report)
                        .await?
                }
            };
            info!(vm = self.vm_name(), phase = %phase, summary = %summary, "phase finished");
            report.record(phase, summary);
        }
        Ok(report)
    }
}

fn required(primary: Option<&PrimaryUser>) -> Result<&PrimaryUser, DeployError> {
    primary.ok_or(DeployError::Credentials(PrimaryUserError::NoUsers))
}

#[cfg(test)]
mod tests;
