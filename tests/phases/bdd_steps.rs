//! BDD step definitions for phase sequencing.

use clonekit::control::PowerState;
use clonekit::test_support::observation;
use clonekit::{
    DatastorePath, DeployError, DeploymentParameters, DeploymentReport, DeploymentRunner,
    Personalization, PhaseSelection,
};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Builder;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{
    COMPLETION_CHECK, PhasesContext, PhasesFailure, PhasesResult, PhasesTestError, QUICK_CHECK,
    T0, failure_kind, fixed_clock,
};

const SEED_ISO: &str = "[ds1] seeds/web01.iso";
const DISABLE_COMMAND: &str = "touch /etc/cloud/cloud-init.disabled";

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error(transparent)]
    Setup(#[from] PhasesTestError),
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a parameter file for \"{vm}\" cloned from \"{template}\"")]
fn parameter_file(mut phases_context: PhasesContext, vm: String, template: String) -> PhasesContext {
    phases_context.params = format!(
        "vm:\n  name: {vm}\n  template: {template}\n  cpus: 2\n\
         disks:\n  - size_gb: 40\n\
         user1:\n  name: ops\n  password: hunter2\n\
         seed:\n  iso_path: '{SEED_ISO}'\n"
    );
    phases_context
}

#[given("the VM \"{vm}\" exists and is powered on")]
fn vm_powered_on(phases_context: PhasesContext, vm: String) -> PhasesContext {
    phases_context.control.add_vm(&vm, PowerState::On);
    phases_context
}

#[given("the VM \"{vm}\" exists and is powered off")]
fn vm_powered_off(phases_context: PhasesContext, vm: String) -> PhasesContext {
    phases_context.control.add_vm(&vm, PowerState::Off);
    phases_context
}

#[given("no-power-change mode is enabled")]
fn no_power_change(mut phases_context: PhasesContext) -> PhasesContext {
    phases_context.options.no_power_change = true;
    phases_context
}

#[given("the operator confirms personalization")]
fn operator_confirms(mut phases_context: PhasesContext) -> PhasesContext {
    phases_context.options.confirm_personalized = true;
    phases_context
}

#[given("the guest reports strong activation evidence")]
fn strong_evidence(phases_context: PhasesContext) -> PhasesContext {
    phases_context.guest.respond(
        QUICK_CHECK,
        0,
        observation("instance_id", T0 + 5, "/var/lib/cloud/data/instance-id"),
    );
    phases_context
}

#[given("the guest reports weak activation evidence")]
fn weak_evidence(phases_context: PhasesContext) -> PhasesContext {
    phases_context.guest.respond(
        QUICK_CHECK,
        0,
        observation("log", T0 + 3, "/var/log/cloud-init.log"),
    );
    phases_context
}

#[given("the guest reports only stale activation evidence")]
fn stale_evidence(phases_context: PhasesContext) -> PhasesContext {
    phases_context.guest.respond(
        QUICK_CHECK,
        0,
        observation("log", T0 - 10, "/var/log/cloud-init.log"),
    );
    phases_context
}

#[given("cloud-init reports completion")]
fn completion_reported(phases_context: PhasesContext) -> PhasesContext {
    phases_context
        .guest
        .respond(COMPLETION_CHECK, 0, observation("status", "done", "cloud-init"));
    phases_context
}

#[given("cloud-init never reports completion")]
fn completion_never_reported(phases_context: PhasesContext) -> PhasesContext {
    phases_context
        .guest
        .respond(COMPLETION_CHECK, 0, observation("status", "running", "cloud-init"));
    phases_context
}

#[given("the seed artifact already exists on the datastore")]
fn artifact_exists(phases_context: PhasesContext) -> PhasesContext {
    let iso: DatastorePath = SEED_ISO
        .parse()
        .unwrap_or_else(|err| panic!("seed path should parse: {err}"));
    phases_context.control.add_datastore_file(&iso);
    phases_context
}

#[when("I run phases \"{phases}\"")]
fn run_phases(phases_context: PhasesContext, phases: String) -> Result<PhasesContext, StepError> {
    let runtime = Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    let params = DeploymentParameters::from_yaml_str(&phases_context.params)
        .map_err(|err| PhasesTestError::Fixture(format!("parameters: {err}")))?;

    let result = match phases.parse::<PhaseSelection>() {
        Ok(selection) => {
            let cancel = CancellationToken::new();
            let runner = DeploymentRunner::new(
                &phases_context.control,
                &phases_context.guest,
                &phases_context.iso_builder,
                &phases_context.config,
                &params,
                &cancel,
            )
            .with_options(phases_context.options)
            .with_clock(fixed_clock);
            runtime.block_on(runner.run(&selection))
        }
        Err(err) => Err(DeployError::from(err)),
    };
    let outcome = match result {
        Ok(report) => PhasesResult::Success(report),
        Err(err) => PhasesResult::Failure(PhasesFailure {
            kind: failure_kind(&err),
            message: err.to_string(),
        }),
    };

    Ok(PhasesContext {
        outcome: Some(outcome),
        ..phases_context
    })
}

fn report(phases_context: &PhasesContext) -> Result<&DeploymentReport, StepError> {
    match &phases_context.outcome {
        Some(PhasesResult::Success(report)) => Ok(report),
        Some(PhasesResult::Failure(failure)) => Err(StepError::Assertion(format!(
            "expected success, got failure: {}",
            failure.message
        ))),
        None => Err(StepError::Assertion(String::from("missing outcome"))),
    }
}

fn control_calls_starting(phases_context: &PhasesContext, prefix: &str) -> usize {
    phases_context
        .control
        .calls()
        .iter()
        .filter(|call| call.starts_with(prefix))
        .count()
}

fn disabled_future_personalization(phases_context: &PhasesContext) -> bool {
    phases_context
        .guest
        .commands()
        .iter()
        .any(|command| command.ends_with(DISABLE_COMMAND))
}

#[then("the deployment succeeds")]
fn deployment_succeeds(phases_context: &PhasesContext) -> Result<(), StepError> {
    report(phases_context).map(drop)
}

#[then("the deployment fails with \"{kind}\"")]
fn deployment_fails(phases_context: &PhasesContext, kind: String) -> Result<(), StepError> {
    let Some(PhasesResult::Failure(failure)) = &phases_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected failure outcome",
        )));
    };
    if failure.kind == kind {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected failure kind {kind}, got {} ({})",
            failure.kind, failure.message
        )))
    }
}

#[then("personalization is \"{state}\"")]
fn personalization_is(phases_context: &PhasesContext, state: String) -> Result<(), StepError> {
    let expected = match state.as_str() {
        "completed" => Personalization::Completed,
        "unconfirmed" => Personalization::Unconfirmed,
        "power-blocked" => Personalization::PowerBlocked,
        _ => {
            return Err(StepError::Assertion(format!(
                "unknown personalization state: {state}"
            )));
        }
    };
    let actual = report(phases_context)?.personalization;
    if actual == Some(expected) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected personalization {expected:?}, got {actual:?}"
        )))
    }
}

#[then("no warnings are raised")]
fn no_warnings(phases_context: &PhasesContext) -> Result<(), StepError> {
    let warnings = &report(phases_context)?.warnings;
    if warnings.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no warnings, got {warnings:?}"
        )))
    }
}

#[then("a \"{kind}\" warning is raised")]
fn warning_raised(phases_context: &PhasesContext, kind: String) -> Result<(), StepError> {
    let warnings = &report(phases_context)?.warnings;
    if warnings
        .entries()
        .iter()
        .any(|warning| warning.kind.as_str() == kind)
    {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected a {kind} warning, got {warnings:?}"
        )))
    }
}

#[then("the seed is attached before it is detached")]
fn attached_before_detached(phases_context: &PhasesContext) -> Result<(), StepError> {
    let calls = phases_context.control.calls();
    let position = |prefix: &str| calls.iter().position(|call| call.starts_with(prefix));
    match (position("attach_seed"), position("detach_seed")) {
        (Some(attach), Some(detach)) if attach < detach => Ok(()),
        _ => Err(StepError::Assertion(format!(
            "expected attach_seed before detach_seed, got {calls:?}"
        ))),
    }
}

#[then("the seed is never attached")]
fn never_attached(phases_context: &PhasesContext) -> Result<(), StepError> {
    if control_calls_starting(phases_context, "attach_seed") == 0 {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "seed should not be attached",
        )))
    }
}

#[then("the seed is never uploaded")]
fn never_uploaded(phases_context: &PhasesContext) -> Result<(), StepError> {
    if control_calls_starting(phases_context, "datastore_upload") == 0 {
        Ok(())
    } else {
        Err(StepError::Assertion(String::from(
            "existing artifact should not be overwritten",
        )))
    }
}

#[then("the seed is attached but never detached")]
fn attached_not_detached(phases_context: &PhasesContext) -> Result<(), StepError> {
    let attached = control_calls_starting(phases_context, "attach_seed");
    let detached = control_calls_starting(phases_context, "detach_seed");
    if attached == 1 && detached == 0 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected one attach and no detach, got {:?}",
            phases_context.control.calls()
        )))
    }
}

#[then("the hypervisor is not touched")]
fn hypervisor_untouched(phases_context: &PhasesContext) -> Result<(), StepError> {
    let calls = phases_context.control.calls();
    if calls.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no control-plane calls, got {calls:?}"
        )))
    }
}

#[then("future personalization is disabled")]
fn personalization_disabled(phases_context: &PhasesContext) -> Result<(), StepError> {
    if disabled_future_personalization(phases_context) {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected the disable marker to be written, guest commands: {:?}",
            phases_context.guest.commands()
        )))
    }
}

#[then("future personalization is not disabled")]
fn personalization_not_disabled(phases_context: &PhasesContext) -> Result<(), StepError> {
    if disabled_future_personalization(phases_context) {
        Err(StepError::Assertion(String::from(
            "disable marker must not be written without confirmation",
        )))
    } else {
        Ok(())
    }
}
