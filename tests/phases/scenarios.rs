//! BDD scenarios for phase sequencing.

use rstest_bdd_macros::scenario;

use super::test_helpers::{PhasesContext, PhasesContextResult, phases_context, phases_context_result};

#[scenario(
    path = "tests/features/phases.feature",
    name = "Run every phase against a fresh clone"
)]
fn scenario_full_run(
    phases_context_result: PhasesContextResult,
    phases_context: PhasesContext,
) {
    drop(phases_context_result);
}

#[scenario(
    path = "tests/features/phases.feature",
    name = "Refuse a non-contiguous phase request"
)]
fn scenario_non_contiguous(
    phases_context_result: PhasesContextResult,
    phases_context: PhasesContext,
) {
    drop(phases_context_result);
}

#[scenario(
    path = "tests/features/phases.feature",
    name = "No-power-change mode blocks detection and finalize"
)]
fn scenario_no_power_change(
    phases_context_result: PhasesContextResult,
    phases_context: PhasesContext,
) {
    drop(phases_context_result);
}

#[scenario(
    path = "tests/features/phases.feature",
    name = "A completion timeout blocks the irreversible step"
)]
fn scenario_completion_timeout(
    phases_context_result: PhasesContextResult,
    phases_context: PhasesContext,
) {
    drop(phases_context_result);
}

#[scenario(
    path = "tests/features/phases.feature",
    name = "Operator confirmation unlocks the irreversible step"
)]
fn scenario_operator_confirmation(
    phases_context_result: PhasesContextResult,
    phases_context: PhasesContext,
) {
    drop(phases_context_result);
}

#[scenario(
    path = "tests/features/phases.feature",
    name = "Never overwrite an existing seed artifact"
)]
fn scenario_existing_artifact(
    phases_context_result: PhasesContextResult,
    phases_context: PhasesContext,
) {
    drop(phases_context_result);
}

#[scenario(
    path = "tests/features/phases.feature",
    name = "Stale evidence means personalization did not run"
)]
fn scenario_not_ran(
    phases_context_result: PhasesContextResult,
    phases_context: PhasesContext,
) {
    drop(phases_context_result);
}
