//! Phase 2: run the guest preparation routine.

use tracing::info;

use crate::command::CommandRunner;
use crate::control::{ControlPlane, GuestChannel};
use crate::power::{PowerController, PowerOutcome};
use crate::primary_user::PrimaryUser;
use crate::render::{self, Renderer};
use crate::seed::GUEST_SCRIPT_DIR;

use super::{DeployError, DeploymentReport, DeploymentRunner, Phase, WarningKind};

/// Template executed inside the guest during GuestInit.
pub const GUEST_PREP_TEMPLATE: &str = "guest-prep.sh";
const GUEST_PREP_SCRIPT: &str = "clonekit-guest-prep.sh";

impl<C, G, R> DeploymentRunner<'_, C, G, R>
where
    C: ControlPlane + ?Sized,
    G: GuestChannel + ?Sized,
    R: CommandRunner + ?Sized,
{
    /// Powers the VM on when needed and waits for the command channel.
    pub(super) async fn ensure_guest_ready(
        &self,
        power: &PowerController<'_, C, G>,
    ) -> Result<PowerOutcome, DeployError> {
        let vm = self.vm_name();
        let outcome = power.ensure_started(vm, self.options.force_power).await?;
        match outcome {
            PowerOutcome::Success => Ok(outcome),
            PowerOutcome::AlreadyStarted => {
                let timings = power.timings();
                if power
                    .wait_channel_ready(vm, timings.channel_ready_timeout, timings.channel_poll_interval)
                    .await?
                {
                    Ok(outcome)
                } else {
                    Err(DeployError::GuestUnavailable {
                        vm: vm.to_owned(),
                        outcome: PowerOutcome::Timeout,
                    })
                }
            }
            PowerOutcome::Skipped | PowerOutcome::Timeout => Err(DeployError::GuestUnavailable {
                vm: vm.to_owned(),
                outcome,
            }),
            PowerOutcome::StartFailed
            | PowerOutcome::StatUnknown
            | PowerOutcome::StopFailed
            | PowerOutcome::AlreadyStopped => Err(DeployError::PowerStart {
                vm: vm.to_owned(),
                outcome,
            }),
        }
    }

    pub(super) async fn run_guest_init(
        &self,
        power: &PowerController<'_, C, G>,
        user: &PrimaryUser,
        report: &mut DeploymentReport,
    ) -> Result<String, DeployError> {
        self.require_vm(power).await?;
        let template = render::load_template(&self.template_dir(), GUEST_PREP_TEMPLATE)?;
        let outcome = self.ensure_guest_ready(power).await?;

        let body = Renderer::new(self.params, GUEST_SCRIPT_DIR)
            .with_primary(user)
            .render(&template);
        let staging = self.staging_dir();
        let run = self
            .scripts(user, &staging)
            .execute(GUEST_PREP_SCRIPT, &body)?;
        if let Some(message) = run.cleanup_warning {
            report
                .warnings
                .push(Phase::GuestInit, WarningKind::Cleanup, message);
        }
        if !run.output.is_success() {
            return Err(DeployError::GuestPrep {
                status_text: run.output.status_text(),
                stderr: run.output.stderr.trim().to_owned(),
            });
        }
        info!(vm = self.vm_name(), "guest preparation finished");
        Ok(format!("guest prepared (power {outcome})"))
    }
}
