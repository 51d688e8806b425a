//! `govc`-backed control plane and guest channel.

use std::ffi::OsString;

use camino::Utf8Path;
use serde::Deserialize;

use super::{ControlPlane, ControlPlaneError, GuestChannel, GuestError, PowerState, VmSnapshot};
use crate::command::{CommandOutput, CommandRunner, ProcessCommandRunner};
use crate::params::{DatastorePath, VmSpec};
use crate::primary_user::PrimaryUser;

const TOOLS_RUNNING: &str = "guestToolsRunning";
const GUEST_SHELL: &str = "/bin/sh";

/// Drives vSphere through the `govc` CLI. Credentials and the endpoint come
/// from govc's own `GOVC_*` environment.
#[derive(Clone, Debug)]
pub struct Govc<R: CommandRunner> {
    bin: String,
    datacenter: Option<String>,
    runner: R,
}

impl Govc<ProcessCommandRunner> {
    /// Creates an adapter wired to the real process runner.
    #[must_use]
    pub fn with_process_runner(bin: impl Into<String>) -> Self {
        Self::new(bin, ProcessCommandRunner)
    }
}

impl<R: CommandRunner> Govc<R> {
    /// Creates an adapter using `runner` to execute `bin`.
    #[must_use]
    pub fn new(bin: impl Into<String>, runner: R) -> Self {
        Self {
            bin: bin.into(),
            datacenter: None,
            runner,
        }
    }

    /// Scopes every inventory path to `datacenter`.
    #[must_use]
    pub fn with_datacenter(mut self, datacenter: Option<String>) -> Self {
        self.datacenter = datacenter;
        self
    }

    fn args(&self, operation: &str) -> Vec<OsString> {
        let mut args = vec![OsString::from(operation)];
        if let Some(datacenter) = &self.datacenter {
            args.push(OsString::from("-dc"));
            args.push(OsString::from(datacenter));
        }
        args
    }

    fn invoke(&self, operation: &str, args: &[OsString]) -> Result<CommandOutput, ControlPlaneError> {
        let output = self.runner.run(&self.bin, args)?;
        if output.is_success() {
            return Ok(output);
        }
        Err(ControlPlaneError::Failed {
            operation: operation.to_owned(),
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }

    fn run_op<I, S>(&self, operation: &str, extra: I) -> Result<CommandOutput, ControlPlaneError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut args = self.args(operation);
        args.extend(extra.into_iter().map(Into::into));
        self.invoke(operation, &args)
    }

    fn login(user: &PrimaryUser) -> OsString {
        OsString::from(format!("{}:{}", user.name, user.password))
    }
}

#[derive(Debug, Default, Deserialize)]
struct VmInfoOutput {
    #[serde(rename = "VirtualMachines", alias = "virtualMachines", default)]
    virtual_machines: Option<Vec<VmInfo>>,
}

#[derive(Debug, Deserialize)]
struct VmInfo {
    #[serde(rename = "Name", alias = "name")]
    name: String,
    #[serde(rename = "Runtime", alias = "runtime")]
    runtime: VmRuntime,
    #[serde(rename = "Guest", alias = "guest", default)]
    guest: Option<VmGuest>,
}

#[derive(Debug, Deserialize)]
struct VmRuntime {
    #[serde(rename = "PowerState", alias = "powerState")]
    power_state: String,
}

#[derive(Debug, Default, Deserialize)]
struct VmGuest {
    #[serde(rename = "ToolsRunningStatus", alias = "toolsRunningStatus", default)]
    tools_running_status: Option<String>,
}

fn parse_power_state(raw: &str) -> Result<PowerState, ControlPlaneError> {
    match raw {
        "poweredOn" => Ok(PowerState::On),
        "poweredOff" => Ok(PowerState::Off),
        "suspended" => Ok(PowerState::Suspended),
        other => Err(ControlPlaneError::Parse {
            operation: String::from("vm.info"),
            message: format!("unknown power state {other}"),
        }),
    }
}

fn parse_vm_info(stdout: &str) -> Result<Option<VmSnapshot>, ControlPlaneError> {
    if stdout.trim().is_empty() {
        return Ok(None);
    }
    let parsed: VmInfoOutput =
        serde_json::from_str(stdout).map_err(|err| ControlPlaneError::Parse {
            operation: String::from("vm.info"),
            message: err.to_string(),
        })?;
    let Some(info) = parsed.virtual_machines.unwrap_or_default().into_iter().next() else {
        return Ok(None);
    };
    Ok(Some(VmSnapshot {
        power: parse_power_state(&info.runtime.power_state)?,
        tools_running: info
            .guest
            .and_then(|guest| guest.tools_running_status)
            .is_some_and(|status| status == TOOLS_RUNNING),
        name: info.name,
    }))
}

fn is_not_found(stderr: &str) -> bool {
    let lowered = stderr.to_ascii_lowercase();
    lowered.contains("not found") || lowered.contains("no such file")
}

impl<R: CommandRunner> ControlPlane for Govc<R> {
    fn lookup_vm(&self, name: &str) -> Result<Option<VmSnapshot>, ControlPlaneError> {
        let output = self.run_op("vm.info", ["-json", name])?;
        parse_vm_info(&output.stdout)
    }

    fn clone_vm(&self, spec: &VmSpec) -> Result<(), ControlPlaneError> {
        let template = spec.template.as_deref().unwrap_or_default();
        let mut extra: Vec<OsString> = vec![
            OsString::from("-vm"),
            OsString::from(template),
            OsString::from("-on=false"),
        ];
        let placement = [
            ("-ds", &spec.datastore),
            ("-pool", &spec.resource_pool),
            ("-folder", &spec.folder),
            ("-host", &spec.host),
        ];
        for (flag, value) in placement {
            if let Some(setting) = value {
                extra.push(OsString::from(flag));
                extra.push(OsString::from(setting));
            }
        }
        extra.push(OsString::from(&spec.name));
        self.run_op("vm.clone", extra).map(drop)
    }

    fn set_compute(
        &self,
        name: &str,
        cpus: Option<u32>,
        memory_mb: Option<u64>,
    ) -> Result<(), ControlPlaneError> {
        let mut extra = vec![OsString::from("-vm"), OsString::from(name)];
        if let Some(count) = cpus {
            extra.push(OsString::from("-c"));
            extra.push(OsString::from(count.to_string()));
        }
        if let Some(memory) = memory_mb {
            extra.push(OsString::from("-m"));
            extra.push(OsString::from(memory.to_string()));
        }
        if extra.len() == 2 {
            return Ok(());
        }
        self.run_op("vm.change", extra).map(drop)
    }

    fn resize_disk(&self, name: &str, disk: &str, size_gb: u64) -> Result<(), ControlPlaneError> {
        self.run_op(
            "vm.disk.change",
            [
                OsString::from("-vm"),
                OsString::from(name),
                OsString::from("-disk.name"),
                OsString::from(disk),
                OsString::from("-size"),
                OsString::from(format!("{size_gb}G")),
            ],
        )
        .map(drop)
    }

    fn power_on(&self, name: &str) -> Result<(), ControlPlaneError> {
        self.run_op("vm.power", ["-on", name]).map(drop)
    }

    fn shutdown_guest(&self, name: &str) -> Result<(), ControlPlaneError> {
        self.run_op("vm.power", ["-s", name]).map(drop)
    }

    fn attach_seed(&self, name: &str, iso: &DatastorePath) -> Result<(), ControlPlaneError> {
        self.run_op(
            "device.cdrom.insert",
            ["-vm", name, "-ds", iso.datastore(), iso.path()],
        )
        .map(drop)
    }

    fn detach_seed(&self, name: &str) -> Result<(), ControlPlaneError> {
        self.run_op("device.cdrom.eject", ["-vm", name]).map(drop)
    }

    fn datastore_exists(&self, path: &DatastorePath) -> Result<bool, ControlPlaneError> {
        match self.run_op("datastore.ls", ["-ds", path.datastore(), path.path()]) {
            Ok(_) => Ok(true),
            Err(ControlPlaneError::Failed { stderr, .. }) if is_not_found(&stderr) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn datastore_upload(
        &self,
        local: &Utf8Path,
        path: &DatastorePath,
    ) -> Result<(), ControlPlaneError> {
        if let Some((folder, _)) = path.path().rsplit_once('/') {
            self.run_op("datastore.mkdir", ["-p", "-ds", path.datastore(), folder])?;
        }
        self.run_op(
            "datastore.upload",
            ["-ds", path.datastore(), local.as_str(), path.path()],
        )
        .map(drop)
    }

    fn datastore_remove(&self, path: &DatastorePath) -> Result<(), ControlPlaneError> {
        self.run_op("datastore.rm", ["-ds", path.datastore(), path.path()])
            .map(drop)
    }
}

impl<R: CommandRunner> GuestChannel for Govc<R> {
    fn tools_ready(&self, vm: &str) -> Result<bool, GuestError> {
        match self.lookup_vm(vm) {
            Ok(snapshot) => Ok(snapshot.is_some_and(|found| found.is_on() && found.tools_running)),
            Err(ControlPlaneError::Command(err)) => Err(GuestError::Command(err)),
            Err(other) => Err(GuestError::Failed {
                operation: String::from("vm.info"),
                status_text: String::from("unknown"),
                stderr: other.to_string(),
            }),
        }
    }

    fn run(&self, vm: &str, user: &PrimaryUser, command: &str) -> Result<CommandOutput, GuestError> {
        let mut args = self.args("guest.run");
        args.extend([
            OsString::from("-vm"),
            OsString::from(vm),
            OsString::from("-l"),
            Self::login(user),
            OsString::from(GUEST_SHELL),
            OsString::from("-c"),
            OsString::from(command),
        ]);
        Ok(self.runner.run(&self.bin, &args)?)
    }

    fn upload(
        &self,
        vm: &str,
        user: &PrimaryUser,
        local: &Utf8Path,
        remote: &str,
    ) -> Result<(), GuestError> {
        let mut args = self.args("guest.upload");
        args.extend([
            OsString::from("-vm"),
            OsString::from(vm),
            OsString::from("-l"),
            Self::login(user),
            OsString::from("-f"),
            OsString::from(local.as_str()),
            OsString::from(remote),
        ]);
        let output = self.runner.run(&self.bin, &args)?;
        if output.is_success() {
            return Ok(());
        }
        Err(GuestError::Failed {
            operation: String::from("guest.upload"),
            status_text: output.status_text(),
            stderr: output.stderr.trim().to_owned(),
        })
    }
}
