//! Unit tests for the two-stage activation detector.

use std::time::Duration;

use camino::Utf8PathBuf;
use rstest::rstest;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::control::PowerState;
use crate::primary_user::PrimaryUser;
use crate::test_support::{FakeControlPlane, FakeGuest, observation, tool_config};

const T0: u64 = 1_700_000_000;
const QUICK: &str = "/bin/sh /tmp/clonekit/clonekit-quick-check.sh";
const COMPLETION: &str = "/bin/sh /tmp/clonekit/clonekit-completion-check.sh";

struct Harness {
    control: FakeControlPlane,
    guest: FakeGuest,
    user: PrimaryUser,
    staging: TempDir,
    cancel: CancellationToken,
}

impl Harness {
    fn new() -> Self {
        Self {
            control: FakeControlPlane::with_vm("web01", PowerState::On),
            guest: FakeGuest::new(),
            user: PrimaryUser {
                number: 1,
                name: String::from("ops"),
                password: String::from("pw"),
            },
            staging: TempDir::new().expect("temp dir"),
            cancel: CancellationToken::new(),
        }
    }

    fn staging_dir(&self) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.staging.path().to_path_buf()).expect("utf8 temp dir")
    }

    async fn detect(&self) -> (Result<DetectionReport, DetectError>, Vec<String>) {
        let power = PowerController::new(
            &self.control,
            &self.guest,
            tool_config().timings(),
            false,
            &self.cancel,
        );
        let staging = self.staging_dir();
        let scripts = GuestScripts::new(
            &self.guest,
            "web01",
            &self.user,
            &staging,
            "/tmp/clonekit",
            "sudo -n",
        );
        let detector = ActivationDetector::new(&power, &scripts, "web01", &self.cancel);
        let result = detector.detect(T0).await;
        (result, detector.take_cleanup_warnings())
    }
}

fn fresh(key: &str, path: &str) -> String {
    observation(key, T0 + 5, path)
}

#[test]
fn probes_embed_t0() {
    assert!(quick_check_script(T0).contains("-newermt @1700000000"));
    assert!(!quick_check_script(T0).contains("{{t0}}"));
    assert!(!completion_check_script(T0).contains("{{"));
}

#[tokio::test(start_paused = true)]
async fn strong_evidence_then_completion() {
    let harness = Harness::new();
    harness.guest.respond(
        QUICK,
        0,
        format!(
            "{}{}",
            fresh("instance_id", "/var/lib/cloud/data/instance-id"),
            observation("instance_id_value", "web01-1700000000", "/var/lib/cloud/data/instance-id"),
        ),
    );
    harness.guest.respond(COMPLETION, 0, observation("status", "running", "cloud-init"));
    harness.guest.respond(COMPLETION, 0, observation("status", "done", "cloud-init"));

    let (result, warnings) = harness.detect().await;
    let report = result.expect("detection succeeds");

    assert_eq!(report.evidence.label, EvidenceLabel::InstanceId);
    assert_eq!(report.evidence.instance_id.as_deref(), Some("web01-1700000000"));
    assert!(report.completed());
    assert_eq!(report.poll.ceiling, Duration::from_secs(1800));
    assert!(report.poll.elapsed >= Duration::from_secs(10));
    assert!(warnings.is_empty());
}

#[tokio::test(start_paused = true)]
async fn weak_evidence_times_out_at_clamped_ceiling() {
    let harness = Harness::new();
    harness.guest.respond(
        QUICK,
        0,
        fresh("network_artifact", "/etc/netplan/50-cloud-init.yaml"),
    );
    harness.guest.respond(COMPLETION, 0, observation("status", "running", "cloud-init"));

    let (result, _) = harness.detect().await;
    let report = result.expect("detection succeeds");

    assert_eq!(report.evidence.label, EvidenceLabel::NetworkArtifact);
    assert_eq!(report.poll.ceiling, Duration::from_secs(45));
    assert_eq!(
        report.completion,
        Completion::TimedOut {
            waited: Duration::from_secs(45)
        }
    );
}

#[rstest]
#[case(observation("disabled", "present", "/etc/cloud/cloud-init.disabled"), true)]
#[case(observation("log", T0 - 100, "/var/log/cloud-init.log"), false)]
#[case(String::new(), false)]
#[tokio::test(start_paused = true)]
async fn quick_check_aborts(#[case] stdout: String, #[case] disabled: bool) {
    let harness = Harness::new();
    harness.guest.respond(QUICK, 0, stdout);

    let (result, _) = harness.detect().await;
    let err = result.expect_err("detection aborts");

    if disabled {
        assert!(matches!(err, DetectError::Disabled { .. }));
    } else {
        assert_eq!(err, DetectError::NotRan { t0: T0 });
    }
    assert!(
        !harness.guest.commands().iter().any(|cmd| cmd.contains(COMPLETION)),
        "completion poll must not start"
    );
}

#[tokio::test(start_paused = true)]
async fn disable_marker_during_poll_is_fatal() {
    let harness = Harness::new();
    harness
        .guest
        .respond(QUICK, 0, fresh("log", "/var/log/cloud-init.log"));
    harness.guest.respond(COMPLETION, 0, observation("status", "running", "cloud-init"));
    harness.guest.respond(
        COMPLETION,
        0,
        observation("disabled", "present", "/etc/cloud/cloud-init.disabled"),
    );

    let (result, _) = harness.detect().await;
    assert_eq!(result, Err(DetectError::DisabledDuringPoll));
}

#[tokio::test(start_paused = true)]
async fn channel_unavailable_for_quick_check() {
    let harness = Harness::new();
    harness.guest.never_ready();

    let (result, _) = harness.detect().await;
    assert_eq!(
        result,
        Err(DetectError::ChannelUnavailable {
            waited: Duration::from_secs(60)
        })
    );
}

#[tokio::test(start_paused = true)]
async fn failed_probe_cleanup_is_reported() {
    let harness = Harness::new();
    harness
        .guest
        .respond(QUICK, 0, fresh("module_semaphore", "/var/lib/cloud/instance/sem/config_x"));
    harness.guest.respond(
        COMPLETION,
        0,
        fresh("boot_finished", "/var/lib/cloud/instance/boot-finished"),
    );
    harness.guest.respond("rm -f", 1, "");

    let (result, warnings) = harness.detect().await;
    let report = result.expect("detection succeeds");

    assert_eq!(
        report.completion,
        Completion::Ready(CompletionSignal::BootFinished)
    );
    assert_eq!(warnings.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_the_poll() {
    let harness = Harness::new();
    harness
        .guest
        .respond(QUICK, 0, fresh("log", "/var/log/cloud-init.log"));
    harness.guest.respond(COMPLETION, 0, observation("status", "running", "cloud-init"));
    let cancel = harness.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(25)).await;
        cancel.cancel();
    });

    let (result, _) = harness.detect().await;
    assert_eq!(result, Err(DetectError::Cancelled));
}
