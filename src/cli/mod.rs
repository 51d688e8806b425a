//! Command-line interface definitions for the `clonekit` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::{ArgAction, Parser, Subcommand};

/// Top-level CLI for the `clonekit` binary.
#[derive(Debug, Parser)]
#[command(
    name = "clonekit",
    about = "Clone, prepare, personalize and finalize a vSphere VM with cloud-init",
    arg_required_else_help = true
)]
pub(crate) struct Cli {
    /// Raise log verbosity (-v debug, -vv trace). `CLONEKIT_LOG` overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub(crate) verbose: u8,
    /// Subcommand to run.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Subcommands of `clonekit`.
#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Run deployment phases against the VM named in the parameter file.
    #[command(name = "deploy")]
    Deploy(DeployCommand),
    /// Render the seed documents locally without touching the hypervisor.
    #[command(name = "render")]
    Render(RenderCommand),
}

/// Arguments for `clonekit deploy`.
#[derive(Debug, Parser)]
pub(crate) struct DeployCommand {
    /// Deployment parameter file (YAML).
    #[arg(long, value_name = "FILE")]
    pub(crate) params: String,
    /// Phases to run: 1 clone, 2 guest-init, 3 seed-and-personalize,
    /// 4 finalize. Accepts `1,2,3`, `2-4` or a single number.
    #[arg(long, value_name = "PHASES", default_value = "1-4")]
    pub(crate) phases: String,
    /// Never change the VM's power state unless `--force-power` is given.
    #[arg(long)]
    pub(crate) no_power_change: bool,
    /// Skip Finalize's irreversible step of disabling future personalization.
    #[arg(long)]
    pub(crate) skip_reset: bool,
    /// Confirm out of band that personalization finished, allowing Finalize's
    /// irreversible step without an in-run confirmation.
    #[arg(long)]
    pub(crate) confirm_personalized: bool,
    /// Allow power-on even with `--no-power-change`.
    #[arg(long)]
    pub(crate) force_power: bool,
}

/// Arguments for `clonekit render`.
#[derive(Debug, Parser)]
pub(crate) struct RenderCommand {
    /// Deployment parameter file (YAML).
    #[arg(long, value_name = "FILE")]
    pub(crate) params: String,
    /// Output directory for `user-data`, `meta-data` and `network-config`.
    #[arg(long, value_name = "DIR")]
    pub(crate) out: String,
}
