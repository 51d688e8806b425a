//! Unit tests for phase selection and the phase runners.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use camino::Utf8PathBuf;
use rstest::rstest;
use tempfile::TempDir;

use super::*;
use crate::control::PowerState;
use crate::seed::{META_DATA_TEMPLATE, USER_DATA_TEMPLATE};
use crate::test_support::{FakeControlPlane, FakeGuest, ScriptedRunner, observation, tool_config};

const T0: u64 = 1_700_000_000;
const QUICK: &str = "/bin/sh /tmp/clonekit/clonekit-quick-check.sh";
const COMPLETION: &str = "/bin/sh /tmp/clonekit/clonekit-completion-check.sh";
const PARAMS: &str = "
vm:
  name: web01
  template: ubuntu-2404
  cpus: 2
disks:
  - size_gb: 40
user1:
  name: ops
  password: hunter2
seed:
  iso_path: '[ds1] seeds/web01.iso'
";

fn fixed_clock() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(T0)
}

#[rstest]
#[case("1,2,3", &[1, 2, 3])]
#[case("2-4", &[2, 3, 4])]
#[case("3", &[3])]
#[case(" 4 , 3 ", &[3, 4])]
#[case("1-2,3", &[1, 2, 3])]
fn parses_contiguous_requests(#[case] input: &str, #[case] expected: &[u8]) {
    let selection: PhaseSelection = input.parse().expect("selection parses");
    let numbers: Vec<u8> = selection.phases().iter().map(|phase| phase.number()).collect();
    assert_eq!(numbers, expected);
}

#[rstest]
#[case("1,3", PhaseSelectionError::NotContiguous { requested: String::from("1,3") })]
#[case("1,2,4", PhaseSelectionError::NotContiguous { requested: String::from("1,2,4") })]
#[case("0", PhaseSelectionError::OutOfRange { number: 0 })]
#[case("5", PhaseSelectionError::OutOfRange { number: 5 })]
#[case("x", PhaseSelectionError::InvalidToken { token: String::from("x") })]
#[case("4-2", PhaseSelectionError::InvalidToken { token: String::from("4-2") })]
#[case("", PhaseSelectionError::Empty)]
fn rejects_invalid_requests(#[case] input: &str, #[case] expected: PhaseSelectionError) {
    assert_eq!(input.parse::<PhaseSelection>(), Err(expected));
}

#[rstest]
#[case(Phase::Clone, false, false)]
#[case(Phase::GuestInit, false, true)]
#[case(Phase::SeedAndPersonalize, true, true)]
#[case(Phase::Finalize, false, true)]
#[case(Phase::Finalize, true, false)]
fn credential_needs(#[case] phase: Phase, #[case] skip_reset: bool, #[case] expected: bool) {
    assert_eq!(phase.needs_credentials(skip_reset), expected);
}

struct World {
    _dirs: TempDir,
    config: ToolConfig,
    params: DeploymentParameters,
    control: FakeControlPlane,
    guest: FakeGuest,
    iso_builder: ScriptedRunner,
    cancel: CancellationToken,
}

impl World {
    fn new(params: &str) -> Self {
        let dirs = TempDir::new().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dirs.path().to_path_buf()).expect("utf8 temp dir");
        let templates = root.join("templates");
        files::write_file(&templates, USER_DATA_TEMPLATE, "#cloud-config\nhostname: {{vm.name}}\n")
            .expect("user-data template");
        files::write_file(&templates, META_DATA_TEMPLATE, "instance-id: {{instance.id}}\n")
            .expect("meta-data template");
        files::write_file(&templates, GUEST_PREP_TEMPLATE, "#!/bin/sh\necho {{user.name}}\n")
            .expect("guest-prep template");
        let config = ToolConfig {
            template_dir: templates.to_string(),
            staging_dir: root.join("staging").to_string(),
            ..tool_config()
        };
        let iso_builder = ScriptedRunner::new();
        iso_builder.push_success();
        Self {
            _dirs: dirs,
            config,
            params: DeploymentParameters::from_yaml_str(params).expect("parameters parse"),
            control: FakeControlPlane::default(),
            guest: FakeGuest::new(),
            iso_builder,
            cancel: CancellationToken::new(),
        }
    }

    fn activation_completes(&self) {
        self.guest
            .respond(QUICK, 0, observation("instance_id", T0 + 5, "/var/lib/cloud/data/instance-id"));
        self.guest
            .respond(COMPLETION, 0, observation("status", "done", "cloud-init"));
    }

    async fn run(&self, phases: &str, options: DeployOptions) -> Result<DeploymentReport, DeployError> {
        let selection: PhaseSelection = phases.parse().expect("selection parses");
        DeploymentRunner::new(
            &self.control,
            &self.guest,
            &self.iso_builder,
            &self.config,
            &self.params,
            &self.cancel,
        )
        .with_options(options)
        .with_clock(fixed_clock)
        .run(&selection)
        .await
    }
}

#[tokio::test(start_paused = true)]
async fn full_run_clones_personalizes_and_finalizes() {
    let world = World::new(PARAMS);
    world.activation_completes();

    let report = world
        .run("1-4", DeployOptions::default())
        .await
        .expect("deployment succeeds");

    assert_eq!(report.phases.len(), 4);
    assert_eq!(report.personalization, Some(Personalization::Completed));
    assert!(report.warnings.is_empty(), "{:?}", report.warnings);
    let calls = world.control.calls();
    let position = |call: &str| {
        calls
            .iter()
            .position(|entry| entry.starts_with(call))
            .unwrap_or_else(|| panic!("missing call {call} in {calls:?}"))
    };
    assert!(position("clone_vm") < position("resize_disk web01 disk-1000-0 40"));
    assert!(position("datastore_upload [ds1] seeds/web01.iso") < position("attach_seed"));
    assert!(position("attach_seed") < position("detach_seed"));
    assert!(position("detach_seed") < position("datastore_remove"));
    assert!(
        world
            .guest
            .commands()
            .iter()
            .any(|command| command == "sudo -n touch /etc/cloud/cloud-init.disabled")
    );
}

#[tokio::test]
async fn guest_phases_need_credentials() {
    let world = World::new("vm: {name: web01, template: tpl}\n");
    assert_eq!(
        world.run("1-2", DeployOptions::default()).await,
        Err(DeployError::Credentials(PrimaryUserError::NoUsers))
    );
    assert!(world.control.calls().is_empty(), "no phase may run");
}

#[tokio::test(start_paused = true)]
async fn finalize_with_skip_reset_needs_no_credentials() {
    let world = World::new("vm: {name: web01}\nseed: {iso_path: '[ds1] s/web01.iso'}\n");
    world.control.add_vm("web01", PowerState::On);
    let options = DeployOptions {
        skip_reset: true,
        ..DeployOptions::default()
    };
    let report = world.run("4", options).await.expect("finalize succeeds");
    assert_eq!(report.phases[0].summary, "seed detached; irreversible step skipped");
}

#[tokio::test(start_paused = true)]
async fn clone_refuses_existing_vm() {
    let world = World::new(PARAMS);
    world.control.add_vm("web01", PowerState::Off);
    let err = world
        .run("1", DeployOptions::default())
        .await
        .expect_err("name collision");
    assert_eq!(
        err,
        DeployError::NameCollision {
            vm: String::from("web01"),
            power: PowerState::Off,
        }
    );
}

#[tokio::test(start_paused = true)]
async fn existing_artifact_is_never_overwritten() {
    let world = World::new(PARAMS);
    world.control.add_vm("web01", PowerState::Off);
    let iso = world.params.seed_iso().expect("seed path").clone();
    world.control.add_datastore_file(&iso);

    let err = world
        .run("3", DeployOptions::default())
        .await
        .expect_err("artifact exists");

    assert!(matches!(err, DeployError::ArtifactExists { .. }));
    assert!(
        !world
            .control
            .calls()
            .iter()
            .any(|call| call.starts_with("datastore_upload"))
    );
}

#[tokio::test(start_paused = true)]
async fn disabled_marker_stops_before_attach() {
    let world = World::new(PARAMS);
    world.control.add_vm("web01", PowerState::On);
    world.guest.respond("cloud-init.disabled ]", 0, "present\n");

    let err = world
        .run("3", DeployOptions::default())
        .await
        .expect_err("marker present");

    assert!(matches!(err, DeployError::PersonalizationDisabled { .. }));
    assert!(world.control.calls().is_empty(), "{:?}", world.control.calls());
}

#[tokio::test(start_paused = true)]
async fn no_power_change_blocks_detection_and_finalize() {
    let world = World::new(PARAMS);
    world.control.add_vm("web01", PowerState::On);
    let options = DeployOptions {
        no_power_change: true,
        ..DeployOptions::default()
    };

    let report = world.run("3-4", options).await.expect("run is not fatal");

    assert_eq!(report.personalization, Some(Personalization::PowerBlocked));
    assert!(report.warnings.contains(WarningKind::PowerModeBlocked));
    assert!(report.warnings.contains(WarningKind::FinalizeRefused));
    assert!(report.detection.is_none());
    let calls = world.control.calls();
    assert!(!calls.iter().any(|call| call.starts_with("attach_seed")));
    assert!(!calls.iter().any(|call| call.starts_with("detach_seed")));
}

#[rstest]
#[case::running_vm(PowerState::On)]
#[case::stopped_vm(PowerState::Off)]
#[tokio::test(start_paused = true)]
async fn power_blocked_run_leaves_no_artifact(#[case] initial: PowerState) {
    let world = World::new(PARAMS);
    world.control.add_vm("web01", initial);
    let iso = world.params.seed_iso().expect("seed path").clone();
    let options = DeployOptions {
        no_power_change: true,
        ..DeployOptions::default()
    };

    let report = world.run("3", options).await.expect("run is not fatal");

    assert_eq!(report.personalization, Some(Personalization::PowerBlocked));
    assert!(!world.control.has_datastore_file(&iso));
    assert!(world.iso_builder.invocations().is_empty(), "nothing is packaged");
    assert!(world.control.calls().is_empty(), "{:?}", world.control.calls());

    world.activation_completes();
    let rerun = world
        .run("3", DeployOptions::default())
        .await
        .expect("a later run is not blocked by leftovers");
    assert_eq!(rerun.personalization, Some(Personalization::Completed));
}

#[tokio::test(start_paused = true)]
async fn disabled_marker_check_waits_for_the_channel_and_retries() {
    let world = World::new(PARAMS);
    world.control.add_vm("web01", PowerState::On);
    world.guest.not_ready_for(3);
    world.guest.respond("cloud-init.disabled ]", 1, "");
    world.guest.respond("cloud-init.disabled ]", 0, "present\n");

    let err = world
        .run("3", DeployOptions::default())
        .await
        .expect_err("marker found on the second attempt");

    assert!(matches!(err, DeployError::PersonalizationDisabled { .. }));
    assert!(world.control.calls().is_empty(), "{:?}", world.control.calls());
}

#[tokio::test(start_paused = true)]
async fn unanswered_disabled_marker_check_is_a_warning() {
    let world = World::new(PARAMS);
    world.control.add_vm("web01", PowerState::On);
    world.guest.respond("cloud-init.disabled ]", 1, "");
    world.activation_completes();

    let report = world
        .run("3", DeployOptions::default())
        .await
        .expect("deployment proceeds");

    assert!(report.warnings.contains(WarningKind::MarkerUnchecked));
    assert!(!WarningKind::MarkerUnchecked.is_blocking());
    let checks = world
        .guest
        .commands()
        .iter()
        .filter(|command| command.contains("cloud-init.disabled ]"))
        .count();
    assert_eq!(checks, 2);
    assert_eq!(report.personalization, Some(Personalization::Completed));
}

#[rstest]
#[case(false, true)]
#[case(true, false)]
#[tokio::test(start_paused = true)]
async fn unconfirmed_completion_gates_irreversible_step(
    #[case] confirm_personalized: bool,
    #[case] expect_blocked: bool,
) {
    let world = World::new(PARAMS);
    world.control.add_vm("web01", PowerState::Off);
    world
        .guest
        .respond(QUICK, 0, observation("log", T0 + 3, "/var/log/cloud-init.log"));
    world
        .guest
        .respond(COMPLETION, 0, observation("status", "running", "cloud-init"));
    let options = DeployOptions {
        confirm_personalized,
        ..DeployOptions::default()
    };

    let report = world.run("3-4", options).await.expect("run is not fatal");

    assert_eq!(report.personalization, Some(Personalization::Unconfirmed));
    assert!(report.warnings.contains(WarningKind::CompletionTimeout));
    assert_eq!(
        report.warnings.contains(WarningKind::IrreversibleStepBlocked),
        expect_blocked
    );
    let touched = world
        .guest
        .commands()
        .iter()
        .any(|command| command.ends_with("touch /etc/cloud/cloud-init.disabled"));
    assert_eq!(touched, !expect_blocked);
    assert!(world.control.calls().iter().any(|call| call.starts_with("datastore_remove")));
}

#[tokio::test(start_paused = true)]
async fn not_ran_is_fatal() {
    let world = World::new(PARAMS);
    world.control.add_vm("web01", PowerState::Off);
    world
        .guest
        .respond(QUICK, 0, observation("log", T0 - 10, "/var/log/cloud-init.log"));

    let err = world
        .run("3-4", DeployOptions::default())
        .await
        .expect_err("stale evidence");

    assert_eq!(
        err,
        DeployError::NotRan {
            vm: String::from("web01"),
            t0: T0,
        }
    );
    assert!(!world.control.calls().iter().any(|call| call.starts_with("detach_seed")));
}

#[tokio::test(start_paused = true)]
async fn guest_init_runs_prep_elevated() {
    let world = World::new(PARAMS);
    world.control.add_vm("web01", PowerState::Off);

    let report = world
        .run("2", DeployOptions::default())
        .await
        .expect("guest init succeeds");

    assert_eq!(world.control.calls(), ["power_on web01"]);
    let uploads = world.guest.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].contents, "#!/bin/sh\necho ops\n");
    assert!(
        world
            .guest
            .commands()
            .contains(&String::from("sudo -n /bin/sh /tmp/clonekit/clonekit-guest-prep.sh"))
    );
    assert_eq!(report.phases[0].phase, Phase::GuestInit);
}
