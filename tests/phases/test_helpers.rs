//! Shared fixtures for phase sequencing scenarios.

use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use camino::Utf8PathBuf;
use clonekit::test_support::{FakeControlPlane, FakeGuest, ScriptedRunner, tool_config};
use cap_std::{ambient_authority, fs_utf8::Dir};
use clonekit::{DeployError, DeployOptions, DeploymentReport, ToolConfig};
use rstest::fixture;
use tempfile::TempDir;
use thiserror::Error;

/// Activation timestamp every scenario runs at.
pub const T0: u64 = 1_700_000_000;
/// Command fragment that runs the uploaded quick-check probe.
pub const QUICK_CHECK: &str = "/bin/sh /tmp/clonekit/clonekit-quick-check.sh";
/// Command fragment that runs the uploaded completion probe.
pub const COMPLETION_CHECK: &str = "/bin/sh /tmp/clonekit/clonekit-completion-check.sh";

pub type PhasesContextResult = Result<PhasesContext, PhasesTestError>;

#[derive(Clone, Debug)]
pub struct PhasesContext {
    pub workspace: Rc<TempDir>,
    pub config: ToolConfig,
    pub params: String,
    pub control: FakeControlPlane,
    pub guest: FakeGuest,
    pub iso_builder: ScriptedRunner,
    pub options: DeployOptions,
    pub outcome: Option<PhasesResult>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PhasesFailure {
    pub kind: &'static str,
    pub message: String,
}

#[derive(Clone, Debug)]
pub enum PhasesResult {
    Success(DeploymentReport),
    Failure(PhasesFailure),
}

#[derive(Clone, Debug, Error)]
pub enum PhasesTestError {
    #[error("invalid phases fixture: {0}")]
    Fixture(String),
}

#[fixture]
pub fn phases_context_result() -> PhasesContextResult {
    build_phases_context()
}

#[fixture]
pub fn phases_context(phases_context_result: PhasesContextResult) -> PhasesContext {
    phases_context_result
        .unwrap_or_else(|err| panic!("phases context fixture should initialise: {err}"))
}

pub fn fixed_clock() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(T0)
}

pub const fn failure_kind(err: &DeployError) -> &'static str {
    match err {
        DeployError::Phases(_) => "phases",
        DeployError::Credentials(_) => "credentials",
        DeployError::NameCollision { .. } => "name-collision",
        DeployError::ArtifactExists { .. } => "artifact-exists",
        DeployError::PersonalizationDisabled { .. } => "personalization-disabled",
        DeployError::NotRan { .. } => "not-ran",
        DeployError::DisabledDuringPoll { .. } => "disabled-during-poll",
        DeployError::Cancelled => "cancelled",
        _ => "other",
    }
}

fn build_phases_context() -> PhasesContextResult {
    let workspace =
        TempDir::new().map_err(|err| PhasesTestError::Fixture(format!("tempdir: {err}")))?;
    let root = Utf8PathBuf::from_path_buf(workspace.path().to_path_buf()).map_err(|path| {
        PhasesTestError::Fixture(format!("temp dir should be utf8: {}", path.display()))
    })?;
    let templates = root.join("templates");
    Dir::create_ambient_dir_all(&templates, ambient_authority())
        .map_err(|err| PhasesTestError::Fixture(format!("create templates: {err}")))?;
    let template_dir = Dir::open_ambient_dir(&templates, ambient_authority())
        .map_err(|err| PhasesTestError::Fixture(format!("open templates: {err}")))?;
    let documents = [
        (
            "user-data.tmpl",
            "#cloud-config\nhostname: {{vm.name}}\nusers:\n  - name: {{user1.name}}\n",
        ),
        (
            "meta-data.tmpl",
            "instance-id: {{instance.id}}\nlocal-hostname: {{vm.name}}\n",
        ),
        ("guest-prep.sh", "#!/bin/sh\ncloud-init clean --logs\n"),
    ];
    for (name, contents) in documents {
        template_dir
            .write(name, contents)
            .map_err(|err| PhasesTestError::Fixture(format!("write {name}: {err}")))?;
    }

    let iso_builder = ScriptedRunner::new();
    iso_builder.push_success();
    Ok(PhasesContext {
        workspace: Rc::new(workspace),
        config: ToolConfig {
            template_dir: templates.to_string(),
            staging_dir: root.join("staging").to_string(),
            ..tool_config()
        },
        params: String::new(),
        control: FakeControlPlane::default(),
        guest: FakeGuest::new(),
        iso_builder,
        options: DeployOptions::default(),
        outcome: None,
    })
}
