//! Binary entry point for the clonekit CLI.

use std::io::{self, Write};
use std::process;
use std::time::SystemTime;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

use clonekit::{
    ConfigError, DeployError, DeployOptions, DeploymentParameters, DeploymentReport,
    DeploymentRunner, Govc, ParamsError, PhaseSelection, PhaseSelectionError,
    ProcessCommandRunner, SeedDocuments, SeedError, ToolConfig, files, resolve_primary,
};

mod cli;

use cli::{Cli, Command, DeployCommand, RenderCommand};

/// Environment variable holding an `EnvFilter` directive.
const LOG_ENV: &str = "CLONEKIT_LOG";
/// Exit status when the run finished but a blocking warning was raised.
const EXIT_BLOCKED: i32 = 2;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("parameter file error: {0}")]
    Params(#[from] ParamsError),
    #[error("invalid --phases: {0}")]
    Phases(#[from] PhaseSelectionError),
    #[error("{0}")]
    Deploy(#[from] DeployError),
    #[error("render failed: {0}")]
    Render(#[from] SeedError),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling");
            on_signal.cancel();
        }
    });

    let exit_code = match dispatch(cli.command, &cancel).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };
    process::exit(exit_code);
}

fn init_logging(verbosity: u8) {
    let fallback = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}

async fn dispatch(command: Command, cancel: &CancellationToken) -> Result<i32, CliError> {
    match command {
        Command::Deploy(args) => deploy(&args, cancel).await,
        Command::Render(args) => render(&args),
    }
}

async fn deploy(args: &DeployCommand, cancel: &CancellationToken) -> Result<i32, CliError> {
    let selection: PhaseSelection = args.phases.parse()?;
    let config = ToolConfig::load_without_cli_args()?;
    config.validate()?;
    let params = load_params(&args.params)?;

    let govc = Govc::with_process_runner(config.govc_bin.clone())
        .with_datacenter(params.vm().datacenter.clone());
    let iso_builder = ProcessCommandRunner;
    let options = DeployOptions {
        no_power_change: args.no_power_change,
        skip_reset: args.skip_reset,
        confirm_personalized: args.confirm_personalized,
        force_power: args.force_power,
    };
    debug!(phases = ?selection.phases(), ?options, "starting deployment");

    let report = DeploymentRunner::new(&govc, &govc, &iso_builder, &config, &params, cancel)
        .with_options(options)
        .run(&selection)
        .await?;
    write_report(io::stdout(), &report)?;
    Ok(exit_code_for(&report))
}

fn render(args: &RenderCommand) -> Result<i32, CliError> {
    let config = ToolConfig::load_without_cli_args()?;
    let params = load_params(&args.params)?;
    let primary = resolve_primary(params.users()).ok();
    let template_dir = Utf8PathBuf::from(files::expand_tilde(&config.template_dir));
    let documents =
        SeedDocuments::render(&params, primary.as_ref(), &template_dir, SystemTime::now())?;
    let out = Utf8PathBuf::from(files::expand_tilde(&args.out));
    let written = documents.write_to(&out)?;

    let mut stdout = io::stdout();
    for path in written {
        writeln!(stdout, "{path}")?;
    }
    Ok(0)
}

fn load_params(path: &str) -> Result<DeploymentParameters, CliError> {
    let expanded = Utf8PathBuf::from(files::expand_tilde(path));
    Ok(DeploymentParameters::load(&expanded)?)
}

fn exit_code_for(report: &DeploymentReport) -> i32 {
    let blocked = report
        .warnings
        .entries()
        .iter()
        .any(|warning| warning.kind.is_blocking());
    if blocked { EXIT_BLOCKED } else { 0 }
}

fn write_report(mut target: impl Write, report: &DeploymentReport) -> io::Result<()> {
    writeln!(target, "{}", report.render())
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}
