use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mountwright_core::{
    BatchSummary, FilesystemType, ProvisionConfig, ProvisionError, ProvisionMode,
};
use mountwright_engine::{BatchOrchestrator, PlannedAction};
use mountwright_host_linux::LinuxHost;
use mountwright_report::{create_report_bundle, render_outcome_table};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EXIT_DEVICE_FAILED: u8 = 1;
const EXIT_SETUP_FAILED: u8 = 2;

#[derive(Parser)]
#[command(name = "mountwright", version, about = "Idempotent data-disk provisioning")]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG).
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print enumerated block devices with their classification and slot.
    Devices {
        #[command(flatten)]
        config: ConfigArgs,
        #[arg(long)]
        pretty: bool,
    },
    /// Show what provision-disks would do to each eligible device.
    Plan {
        #[command(flatten)]
        target: TargetArgs,
        #[arg(long)]
        json: bool,
    },
    /// Partition, format, mount and record every eligible data disk.
    ProvisionDisks(ProvisionArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// JSON configuration file; flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    mount_prefix: Option<String>,
    #[arg(long)]
    metadata_label: Option<String>,
}

/// Everything that decides a device's state and the action taken on it,
/// shared by `plan` and `provision-disks`.
#[derive(Args)]
struct TargetArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[arg(long)]
    filesystem: Option<FilesystemType>,
    /// Wipe and reformat every eligible device, whatever it holds.
    #[arg(long)]
    force_reformat: bool,
}

#[derive(Args)]
struct ProvisionArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Provision all devices concurrently.
    #[arg(long)]
    parallel: bool,
    /// Per-device deadline in seconds.
    #[arg(long)]
    device_timeout: Option<u64>,
    /// Treat zero eligible devices as an error.
    #[arg(long)]
    require_devices: bool,
    /// Write a report bundle under <DIR>/reports/<run-id>/.
    #[arg(long, value_name = "DIR")]
    report_base: Option<PathBuf>,
}

impl ConfigArgs {
    fn load(&self) -> Result<ProvisionConfig, ProvisionError> {
        let mut config = match &self.config {
            Some(path) => ProvisionConfig::load(path)?,
            None => ProvisionConfig::default(),
        };
        if let Some(prefix) = &self.mount_prefix {
            config.mount_prefix = prefix.clone();
        }
        if let Some(label) = &self.metadata_label {
            config.metadata_label = label.clone();
        }
        Ok(config)
    }
}

impl TargetArgs {
    fn load(&self) -> Result<ProvisionConfig, ProvisionError> {
        let mut config = self.config.load()?;
        if let Some(filesystem) = self.filesystem {
            config.filesystem = filesystem;
        }
        if self.force_reformat {
            config.mode = ProvisionMode::ForceReformat;
        }
        Ok(config)
    }
}

impl ProvisionArgs {
    fn load(&self) -> Result<ProvisionConfig, ProvisionError> {
        let mut config = self.target.load()?;
        if self.parallel {
            config.parallel = true;
        }
        if let Some(secs) = self.device_timeout {
            config.device_timeout_secs = secs;
        }
        if self.require_devices {
            config.allow_empty = false;
        }
        Ok(config)
    }
}

/// 0 when every device converged, 1 when any device failed or timed out,
/// 2 when the batch never started.
fn batch_exit_code(result: &Result<BatchSummary, ProvisionError>) -> u8 {
    match result {
        Ok(summary) if summary.all_converged() => 0,
        Ok(_) => EXIT_DEVICE_FAILED,
        Err(_) => EXIT_SETUP_FAILED,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli.command) {
        Ok(code) => code,
        Err(err) => {
            error!("{:#}", err);
            eprintln!("error: {:#}", err);
            ExitCode::from(EXIT_SETUP_FAILED)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init();
}

fn run(command: Command) -> Result<ExitCode> {
    match command {
        Command::Devices { config, pretty } => {
            let orchestrator = orchestrator(config.load()?)?;
            let (_, inventory) = orchestrator.inventory()?;
            print_json(&inventory, pretty)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Plan { target, json } => {
            let orchestrator = orchestrator(target.load()?)?;
            let plan = orchestrator.plan()?;
            if json {
                print_json(&plan, true)?;
            } else {
                println!("mode: {}", orchestrator.config().mode.as_str());
                for entry in &plan.entries {
                    let state = entry
                        .state
                        .map(|state| state.to_string())
                        .unwrap_or_else(|| "-".to_string());
                    println!(
                        "{} -> {}  state={}  {}",
                        entry.assignment.device.path.display(),
                        entry.assignment.mount_point.display(),
                        state,
                        describe(&entry.action)
                    );
                }
                if plan.entries.is_empty() {
                    println!("no eligible devices");
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::ProvisionDisks(args) => provision(args),
    }
}

fn provision(args: ProvisionArgs) -> Result<ExitCode> {
    let config = args.load()?;
    info!(
        mode = config.mode.as_str(),
        filesystem = %config.filesystem,
        mount_prefix = %config.mount_prefix,
        parallel = config.parallel,
        "provisioning data disks"
    );
    let orchestrator = orchestrator(config)?;
    let result = orchestrator.run();
    let code = batch_exit_code(&result);

    match &result {
        Ok(summary) => {
            print!("{}", render_outcome_table(summary));
            if let Some(base) = &args.report_base {
                match create_report_bundle(base, summary, orchestrator.config()) {
                    Ok(paths) => info!(report = %paths.root.display(), "report bundle written"),
                    Err(err) => warn!(error = %format!("{:#}", err), "report bundle not written"),
                }
            }
        }
        Err(err) => {
            error!("{}", err);
            eprintln!("error: {}", err);
        }
    }
    Ok(ExitCode::from(code))
}

fn describe(action: &PlannedAction) -> String {
    match action {
        PlannedAction::Provision => "provision".to_string(),
        PlannedAction::Skip => "skip (already converged)".to_string(),
        PlannedAction::Refuse(reason) => format!("refuse: {}", reason),
        PlannedAction::Unknown(reason) => format!("unknown: {}", reason),
    }
}

fn orchestrator(config: ProvisionConfig) -> Result<BatchOrchestrator> {
    config.validate()?;
    Ok(BatchOrchestrator::new(Arc::new(LinuxHost::new()), config))
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let rendered = if pretty {
        serde_json::to_string_pretty(value)
    } else {
        serde_json::to_string(value)
    }
    .context("serialize output")?;
    println!("{}", rendered);
    Ok(())
}
