//! Phase 3: attach the seed medium, boot and detect personalization.

use tracing::{debug, info};

use crate::command::CommandRunner;
use crate::control::{ControlPlane, GuestChannel, VmSnapshot};
use crate::detect::{ActivationDetector, Completion, DetectionReport};
use crate::power::{PowerController, PowerOutcome};
use crate::primary_user::PrimaryUser;
use crate::seed::{SeedDocuments, SeedPackager};

use super::{
    DISABLED_MARKER, DeployError, DeploymentReport, DeploymentRunner, Personalization, Phase,
    WarningKind,
};

const MARKER_PROBE_ATTEMPTS: u32 = 2;
const STOP_TRANSITION: &str = "powering off before attaching the seed";
const WITHDRAWN: &str = "the uploaded seed was withdrawn";
const START_TRANSITION: &str = "powering on for detection";

impl<C, G, R> DeploymentRunner<'_, C, G, R>
where
    C: ControlPlane + ?Sized,
    G: GuestChannel + ?Sized,
    R: CommandRunner + ?Sized,
{
    pub(super) async fn run_personalize(
        &self,
        power: &PowerController<'_, C, G>,
        user: &PrimaryUser,
        report: &mut DeploymentReport,
    ) -> Result<String, DeployError> {
        let vm = self.vm_name();
        let iso = self.params.seed_iso().ok_or(DeployError::SeedPathMissing)?;
        let snapshot = self.require_vm(power).await?;
        if snapshot.is_on() {
            self.refuse_if_disabled(power, user, report).await?;
        }
        if let Some(transition) = self.forbidden_transition(&snapshot) {
            return Ok(power_blocked(report, transition, "nothing was uploaded"));
        }

        let staging = self.staging_dir();
        let documents =
            SeedDocuments::render(self.params, Some(user), &self.template_dir(), (self.clock)())?;
        let bundle = SeedPackager::new(self.runner, &self.config.iso_builder_bin).package(
            documents,
            &staging,
            iso.file_name(),
        )?;
        if self.control.datastore_exists(iso)? {
            return Err(DeployError::ArtifactExists {
                path: iso.to_string(),
            });
        }
        self.control.datastore_upload(&bundle.image, iso)?;
        info!(vm, iso = %iso, instance_id = %bundle.documents.instance_id, "seed uploaded");

        match power.ensure_stopped(vm).await? {
            PowerOutcome::AlreadyStopped | PowerOutcome::Success => {}
            PowerOutcome::Skipped => {
                self.remove_artifact(Phase::SeedAndPersonalize, report);
                return Ok(power_blocked(report, STOP_TRANSITION, WITHDRAWN));
            }
            outcome => {
                return Err(DeployError::PowerStop {
                    vm: vm.to_owned(),
                    outcome,
                });
            }
        }
        self.control.attach_seed(vm, iso)?;
        let t0 = self.now_secs();
        info!(vm, t0, "seed attached");

        match power.ensure_started(vm, self.options.force_power).await? {
            PowerOutcome::Success | PowerOutcome::AlreadyStarted | PowerOutcome::Timeout => {}
            PowerOutcome::Skipped => {
                self.eject_seed(Phase::SeedAndPersonalize, report);
                self.remove_artifact(Phase::SeedAndPersonalize, report);
                return Ok(power_blocked(report, START_TRANSITION, WITHDRAWN));
            }
            outcome => {
                return Err(DeployError::PowerStart {
                    vm: vm.to_owned(),
                    outcome,
                });
            }
        }

        let scripts = self.scripts(user, &staging);
        let detector = ActivationDetector::new(power, &scripts, vm, self.cancel);
        let result = detector.detect(t0).await;
        for message in detector.take_cleanup_warnings() {
            report
                .warnings
                .push(Phase::SeedAndPersonalize, WarningKind::Cleanup, message);
        }
        let detection = result.map_err(|err| DeployError::from_detection(vm, err))?;
        Ok(record_detection(report, detection))
    }

    /// The power transition no-power-change mode would forbid, decided before
    /// anything is uploaded or attached.
    fn forbidden_transition(&self, snapshot: &VmSnapshot) -> Option<&'static str> {
        if !self.options.no_power_change {
            return None;
        }
        if snapshot.is_on() {
            return Some(STOP_TRANSITION);
        }
        (!self.options.force_power).then_some(START_TRANSITION)
    }

    /// Probes the disabled marker on a running guest. Each attempt waits for
    /// the command channel first; when no attempt gets an answer the check
    /// is reported as a warning and the quick check catches the marker later.
    async fn refuse_if_disabled(
        &self,
        power: &PowerController<'_, C, G>,
        user: &PrimaryUser,
        report: &mut DeploymentReport,
    ) -> Result<(), DeployError> {
        let vm = self.vm_name();
        let timings = power.timings();
        let probe = format!("if [ -e {DISABLED_MARKER} ]; then echo present; fi");
        for attempt in 1..=MARKER_PROBE_ATTEMPTS {
            if !power
                .wait_channel_ready(vm, timings.channel_probe_timeout, timings.channel_poll_interval)
                .await?
            {
                debug!(vm, attempt, "guest channel unavailable for the disabled-marker check");
                continue;
            }
            match self.guest.run(vm, user, &probe) {
                Ok(output) if output.is_success() => {
                    if output.stdout.trim() == "present" {
                        return Err(DeployError::PersonalizationDisabled {
                            vm: vm.to_owned(),
                            path: String::from(DISABLED_MARKER),
                        });
                    }
                    return Ok(());
                }
                Ok(output) => {
                    debug!(vm, attempt, status = %output.status_text(), "disabled-marker check failed");
                }
                Err(err) => debug!(vm, attempt, error = %err, "disabled-marker check failed"),
            }
        }
        report.warnings.push(
            Phase::SeedAndPersonalize,
            WarningKind::MarkerUnchecked,
            format!(
                "could not check {DISABLED_MARKER} on {vm} after {MARKER_PROBE_ATTEMPTS} attempts; \
                 continuing, the quick check reports it after reboot"
            ),
        );
        Ok(())
    }
}

fn power_blocked(report: &mut DeploymentReport, transition: &str, seed: &str) -> String {
    report.personalization = Some(Personalization::PowerBlocked);
    report.warnings.push(
        Phase::SeedAndPersonalize,
        WarningKind::PowerModeBlocked,
        format!("no-power-change mode forbids {transition}; {seed} and detection was not run"),
    );
    String::from("blocked by no-power-change mode")
}

fn record_detection(report: &mut DeploymentReport, detection: DetectionReport) -> String {
    let label = detection.evidence.label;
    if label.is_weak() {
        report.warnings.push(
            Phase::SeedAndPersonalize,
            WarningKind::WeakEvidence,
            format!(
                "only weak evidence ({label}) found; completion wait limited to {}s",
                detection.poll.ceiling.as_secs()
            ),
        );
    }
    let summary = match &detection.completion {
        Completion::Ready(signal) => {
            report.personalization = Some(Personalization::Completed);
            format!("personalization completed ({signal}, evidence {label})")
        }
        Completion::TimedOut { waited } => {
            report.personalization = Some(Personalization::Unconfirmed);
            report.warnings.push(
                Phase::SeedAndPersonalize,
                WarningKind::CompletionTimeout,
                format!(
                    "personalization started (evidence {label}) but did not finish within {}s; \
                     verify the guest and run Finalize with --confirm-personalized",
                    waited.as_secs()
                ),
            );
            format!("personalization unconfirmed (evidence {label})")
        }
    };
    report.detection = Some(detection);
    summary
}
