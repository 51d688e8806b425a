//! Test support utilities shared across unit and integration tests.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::rc::Rc;

use camino::Utf8Path;
use tokio::sync::{Mutex, MutexGuard};

use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::config::ToolConfig;
use crate::control::{
    ControlPlane, ControlPlaneError, GuestChannel, GuestError, PowerState, VmSnapshot,
};
use crate::files;
use crate::params::{DatastorePath, VmSpec};
use crate::primary_user::PrimaryUser;

/// Tool configuration with default-style values and no file or environment
/// input.
#[must_use]
pub fn tool_config() -> ToolConfig {
    ToolConfig {
        govc_bin: String::from("govc"),
        iso_builder_bin: String::from("genisoimage"),
        template_dir: String::from("templates"),
        staging_dir: String::from("/tmp/clonekit"),
        guest_work_dir: String::from("/tmp/clonekit"),
        elevate_command: String::from("sudo -n"),
        lookup_attempts: 5,
        lookup_delay_secs: 3,
        power_poll_interval_secs: 5,
        power_wait_secs: 300,
        power_lookup_failures: 3,
        channel_ready_timeout_secs: 300,
        channel_poll_interval_secs: 5,
        channel_probe_timeout_secs: 60,
        completion_interval_secs: 10,
        completion_ceiling_secs: 1800,
        weak_ceiling_secs: 45,
    }
}

fn output(code: Option<i32>, stdout: impl Into<String>, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        code,
        stdout: stdout.into(),
        stderr: stderr.into(),
    }
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Rc<RefCell<VecDeque<CommandOutput>>>,
    invocations: Rc<RefCell<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.invocations.borrow().clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.responses.borrow_mut().push_back(output(Some(0), "", ""));
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.responses
            .borrow_mut()
            .push_back(output(Some(code), "", "simulated failure"));
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.responses
            .borrow_mut()
            .push_back(output(code, stdout, stderr));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        self.invocations.borrow_mut().push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        self.responses
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

#[derive(Debug, Default)]
struct ControlState {
    vms: BTreeMap<String, VmSnapshot>,
    lookup_failures: u32,
    lookup_failures_after_power_on: u32,
    lookups: u32,
    calls: Vec<String>,
    datastore: BTreeSet<String>,
    failing: BTreeSet<String>,
    ignore_power_on: bool,
    ignore_shutdown: bool,
    tools_after_boot: bool,
}

/// In-memory control plane. Power requests take effect immediately unless
/// configured otherwise.
#[derive(Clone, Debug)]
pub struct FakeControlPlane {
    state: Rc<RefCell<ControlState>>,
}

impl Default for FakeControlPlane {
    fn default() -> Self {
        Self {
            state: Rc::new(RefCell::new(ControlState {
                tools_after_boot: true,
                ..ControlState::default()
            })),
        }
    }
}

impl FakeControlPlane {
    /// Creates a control plane holding one VM.
    #[must_use]
    pub fn with_vm(name: &str, power: PowerState) -> Self {
        let fake = Self::default();
        fake.add_vm(name, power);
        fake
    }

    /// Adds or replaces a VM; tools run whenever it is on.
    pub fn add_vm(&self, name: &str, power: PowerState) {
        self.state.borrow_mut().vms.insert(
            name.to_owned(),
            VmSnapshot {
                name: name.to_owned(),
                power,
                tools_running: power == PowerState::On,
            },
        );
    }

    /// Makes the next `count` lookups fail.
    pub fn fail_lookups(&self, count: u32) {
        self.state.borrow_mut().lookup_failures = count;
    }

    /// Makes the `count` lookups issued after the next power-on fail.
    pub fn fail_lookups_after_power_on(&self, count: u32) {
        self.state.borrow_mut().lookup_failures_after_power_on = count;
    }

    /// Makes every call to `operation` fail (for example `detach_seed`).
    pub fn fail_operation(&self, operation: &str) {
        self.state.borrow_mut().failing.insert(operation.to_owned());
    }

    /// Accepts power-on requests without changing state.
    pub fn ignore_power_on(&self) {
        self.state.borrow_mut().ignore_power_on = true;
    }

    /// Accepts shutdown requests without changing state.
    pub fn ignore_shutdown(&self) {
        self.state.borrow_mut().ignore_shutdown = true;
    }

    /// Registers an existing datastore file.
    pub fn add_datastore_file(&self, path: &DatastorePath) {
        self.state.borrow_mut().datastore.insert(path.to_string());
    }

    /// Whether a datastore file exists.
    #[must_use]
    pub fn has_datastore_file(&self, path: &DatastorePath) -> bool {
        self.state.borrow().datastore.contains(&path.to_string())
    }

    /// Current power state of `name`, if it exists.
    #[must_use]
    pub fn power_of(&self, name: &str) -> Option<PowerState> {
        self.state.borrow().vms.get(name).map(|vm| vm.power)
    }

    /// Number of lookups attempted.
    #[must_use]
    pub fn lookup_count(&self) -> u32 {
        self.state.borrow().lookups
    }

    /// Mutating calls in order, formatted as `operation target`.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    fn record(&self, operation: &str, target: &str) -> Result<(), ControlPlaneError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(format!("{operation} {target}"));
        if state.failing.contains(operation) {
            return Err(ControlPlaneError::Failed {
                operation: operation.to_owned(),
                status_text: String::from("1"),
                stderr: String::from("simulated failure"),
            });
        }
        Ok(())
    }

    fn set_power(&self, name: &str, power: PowerState) {
        let mut state = self.state.borrow_mut();
        let tools = state.tools_after_boot && power == PowerState::On;
        if let Some(vm) = state.vms.get_mut(name) {
            vm.power = power;
            vm.tools_running = tools;
        }
    }
}

impl ControlPlane for FakeControlPlane {
    fn lookup_vm(&self, name: &str) -> Result<Option<VmSnapshot>, ControlPlaneError> {
        let mut state = self.state.borrow_mut();
        state.lookups += 1;
        if state.lookup_failures > 0 {
            state.lookup_failures -= 1;
            return Err(ControlPlaneError::Failed {
                operation: String::from("vm.info"),
                status_text: String::from("1"),
                stderr: String::from("simulated inventory lag"),
            });
        }
        Ok(state.vms.get(name).cloned())
    }

    fn clone_vm(&self, spec: &VmSpec) -> Result<(), ControlPlaneError> {
        self.record("clone_vm", &spec.name)?;
        self.add_vm(&spec.name, PowerState::Off);
        Ok(())
    }

    fn set_compute(
        &self,
        name: &str,
        _cpus: Option<u32>,
        _memory_mb: Option<u64>,
    ) -> Result<(), ControlPlaneError> {
        self.record("set_compute", name)
    }

    fn resize_disk(&self, name: &str, disk: &str, size_gb: u64) -> Result<(), ControlPlaneError> {
        self.record("resize_disk", &format!("{name} {disk} {size_gb}"))
    }

    fn power_on(&self, name: &str) -> Result<(), ControlPlaneError> {
        self.record("power_on", name)?;
        {
            let mut state = self.state.borrow_mut();
            state.lookup_failures = std::mem::take(&mut state.lookup_failures_after_power_on);
        }
        if !self.state.borrow().ignore_power_on {
            self.set_power(name, PowerState::On);
        }
        Ok(())
    }

    fn shutdown_guest(&self, name: &str) -> Result<(), ControlPlaneError> {
        self.record("shutdown_guest", name)?;
        if !self.state.borrow().ignore_shutdown {
            self.set_power(name, PowerState::Off);
        }
        Ok(())
    }

    fn attach_seed(&self, name: &str, iso: &DatastorePath) -> Result<(), ControlPlaneError> {
        self.record("attach_seed", &format!("{name} {iso}"))
    }

    fn detach_seed(&self, name: &str) -> Result<(), ControlPlaneError> {
        self.record("detach_seed", name)
    }

    fn datastore_exists(&self, path: &DatastorePath) -> Result<bool, ControlPlaneError> {
        Ok(self.has_datastore_file(path))
    }

    fn datastore_upload(
        &self,
        _local: &Utf8Path,
        path: &DatastorePath,
    ) -> Result<(), ControlPlaneError> {
        self.record("datastore_upload", &path.to_string())?;
        self.add_datastore_file(path);
        Ok(())
    }

    fn datastore_remove(&self, path: &DatastorePath) -> Result<(), ControlPlaneError> {
        self.record("datastore_remove", &path.to_string())?;
        self.state.borrow_mut().datastore.remove(&path.to_string());
        Ok(())
    }
}

/// File copied into the guest through [`FakeGuest`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GuestUpload {
    /// Destination path in the guest.
    pub remote: String,
    /// File contents at upload time.
    pub contents: String,
}

#[derive(Debug, Default)]
struct GuestState {
    not_ready_polls: u32,
    never_ready: bool,
    responses: Vec<(String, VecDeque<CommandOutput>)>,
    commands: Vec<String>,
    uploads: Vec<GuestUpload>,
    fail_uploads: bool,
}

/// In-memory guest command channel.
///
/// Commands are answered by the first registered pattern they contain. The
/// last queued response for a pattern is sticky; unmatched commands succeed
/// with empty output.
#[derive(Clone, Debug, Default)]
pub struct FakeGuest {
    state: Rc<RefCell<GuestState>>,
}

impl FakeGuest {
    /// Creates a guest whose channel is immediately ready.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports not-ready for the next `polls` readiness checks.
    pub fn not_ready_for(&self, polls: u32) {
        self.state.borrow_mut().not_ready_polls = polls;
    }

    /// Never reports ready.
    pub fn never_ready(&self) {
        self.state.borrow_mut().never_ready = true;
    }

    /// Makes every upload fail.
    pub fn fail_uploads(&self) {
        self.state.borrow_mut().fail_uploads = true;
    }

    /// Queues a response for commands containing `pattern`.
    pub fn respond(&self, pattern: &str, code: i32, stdout: impl Into<String>) {
        let response = output(Some(code), stdout, "");
        let mut state = self.state.borrow_mut();
        if let Some((_, queue)) = state
            .responses
            .iter_mut()
            .find(|(existing, _)| existing == pattern)
        {
            queue.push_back(response);
            return;
        }
        state
            .responses
            .push((pattern.to_owned(), VecDeque::from([response])));
    }

    /// Commands run so far.
    #[must_use]
    pub fn commands(&self) -> Vec<String> {
        self.state.borrow().commands.clone()
    }

    /// Files uploaded so far.
    #[must_use]
    pub fn uploads(&self) -> Vec<GuestUpload> {
        self.state.borrow().uploads.clone()
    }
}

impl GuestChannel for FakeGuest {
    fn tools_ready(&self, _vm: &str) -> Result<bool, GuestError> {
        let mut state = self.state.borrow_mut();
        if state.never_ready {
            return Ok(false);
        }
        if state.not_ready_polls > 0 {
            state.not_ready_polls -= 1;
            return Ok(false);
        }
        Ok(true)
    }

    fn run(&self, _vm: &str, _user: &PrimaryUser, command: &str) -> Result<CommandOutput, GuestError> {
        let mut state = self.state.borrow_mut();
        state.commands.push(command.to_owned());
        let Some((_, queue)) = state
            .responses
            .iter_mut()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
        else {
            return Ok(output(Some(0), "", ""));
        };
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(response.unwrap_or_else(|| output(Some(0), "", "")))
    }

    fn upload(
        &self,
        _vm: &str,
        _user: &PrimaryUser,
        local: &Utf8Path,
        remote: &str,
    ) -> Result<(), GuestError> {
        if self.state.borrow().fail_uploads {
            return Err(GuestError::Failed {
                operation: String::from("guest.upload"),
                status_text: String::from("1"),
                stderr: String::from("simulated upload failure"),
            });
        }
        let contents = files::read_to_string(local).unwrap_or_default();
        self.state.borrow_mut().uploads.push(GuestUpload {
            remote: remote.to_owned(),
            contents,
        });
        Ok(())
    }
}

/// Formats one guest observation line (`key<TAB>value<TAB>path`).
#[must_use]
pub fn observation(key: &str, value: impl std::fmt::Display, path: &str) -> String {
    format!("{key}\t{value}\t{path}\n")
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}
