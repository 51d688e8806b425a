//! Phase 4: detach the seed and disable future personalization.

use tracing::info;

use crate::command::CommandRunner;
use crate::control::{ControlPlane, GuestChannel};
use crate::power::PowerController;
use crate::primary_user::PrimaryUser;

use super::{
    DISABLED_MARKER, DeployError, DeploymentReport, DeploymentRunner, Personalization, Phase,
    WarningKind, required,
};

impl<C, G, R> DeploymentRunner<'_, C, G, R>
where
    C: ControlPlane + ?Sized,
    G: GuestChannel + ?Sized,
    R: CommandRunner + ?Sized,
{
    pub(super) async fn run_finalize(
        &self,
        power: &PowerController<'_, C, G>,
        user: Option<&PrimaryUser>,
        report: &mut DeploymentReport,
    ) -> Result<String, DeployError> {
        if report.personalization == Some(Personalization::PowerBlocked) {
            report.warnings.push(
                Phase::Finalize,
                WarningKind::FinalizeRefused,
                "personalization never had a qualifying boot in this run; Finalize was not attempted",
            );
            return Ok(String::from("refused"));
        }
        self.require_vm(power).await?;
        self.detach_artifact(report);

        if self.options.skip_reset {
            info!(vm = self.vm_name(), "irreversible step skipped on request");
            return Ok(String::from("seed detached; irreversible step skipped"));
        }
        let completed = report.personalization == Some(Personalization::Completed);
        if !(completed || self.options.confirm_personalized) {
            report.warnings.push(
                Phase::Finalize,
                WarningKind::IrreversibleStepBlocked,
                "personalization completion is not confirmed; pass --confirm-personalized once verified",
            );
            return Ok(String::from("seed detached; irreversible step blocked"));
        }
        self.disable_personalization(power, required(user)?, report)
            .await
    }

    fn detach_artifact(&self, report: &mut DeploymentReport) {
        self.eject_seed(Phase::Finalize, report);
        self.remove_artifact(Phase::Finalize, report);
    }

    /// Ejects the seed medium; failure is a cleanup warning.
    pub(super) fn eject_seed(&self, phase: Phase, report: &mut DeploymentReport) {
        let vm = self.vm_name();
        if let Err(err) = self.control.detach_seed(vm) {
            report.warnings.push(
                phase,
                WarningKind::Cleanup,
                format!("failed to eject the seed medium from {vm}: {err}"),
            );
        }
    }

    /// Deletes the datastore artifact; failure is a cleanup warning.
    pub(super) fn remove_artifact(&self, phase: Phase, report: &mut DeploymentReport) {
        let Some(iso) = self.params.seed_iso() else {
            info!(vm = self.vm_name(), "no seed.iso_path configured; nothing to remove");
            return;
        };
        if let Err(err) = self.control.datastore_remove(iso) {
            report.warnings.push(
                phase,
                WarningKind::Cleanup,
                format!("failed to remove datastore artifact {iso}: {err}"),
            );
        }
    }

    async fn disable_personalization(
        &self,
        power: &PowerController<'_, C, G>,
        user: &PrimaryUser,
        report: &mut DeploymentReport,
    ) -> Result<String, DeployError> {
        let vm = self.vm_name();
        let timings = power.timings();
        if !power
            .wait_channel_ready(vm, timings.channel_probe_timeout, timings.channel_poll_interval)
            .await?
        {
            report.warnings.push(
                Phase::Finalize,
                WarningKind::IrreversibleStepBlocked,
                format!("guest channel on {vm} unavailable; {DISABLED_MARKER} was not created"),
            );
            return Ok(String::from("seed detached; irreversible step blocked"));
        }
        let command = format!("{} touch {DISABLED_MARKER}", self.config.elevate_command.trim())
            .trim()
            .to_owned();
        let output = self.guest.run(vm, user, &command)?;
        if !output.is_success() {
            return Err(DeployError::DisableFailed {
                status_text: output.status_text(),
                stderr: output.stderr.trim().to_owned(),
            });
        }
        info!(vm, marker = DISABLED_MARKER, "future personalization disabled");
        Ok(String::from("seed detached; personalization disabled"))
    }
}
