use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nix::unistd::geteuid;
use relup_core::{UpgradeConfig, DEFAULT_CONFIG_PATH};
use relup_host::{
    CommandRunner, FileStateStore, HostLayout, PidFileLock, RunJournal, ShutdownRebooter,
    SystemCommandRunner, SystemdBootScheduler,
};
use relup_stages::{HostPreconditions, HostStages, ServiceWatchdog};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

mod orchestrator;
mod render;
mod status;
mod system_log;

use orchestrator::{Collaborators, Orchestrator, RunError, RunOutcome, RunSettings, EXIT_GENERIC};
use render::{Badge, TerminalRenderer};
use system_log::{ErrorMirrorLayer, LoggerSink};

#[derive(Parser, Debug)]
#[command(name = "relup")]
#[command(about = "Resumable Ubuntu LTS release upgrade orchestrator", long_about = None)]
struct Cli {
    #[arg(long, value_name = "PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the persisted state, lock owner, boot hook and recent runs.
    Status,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run_cli(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report_error(&err);
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn run_cli(cli: &Cli) -> Result<()> {
    let config = UpgradeConfig::load(&cli.config)?;

    match cli.command {
        Some(Commands::Status) => {
            init_tracing(None, Arc::new(SystemCommandRunner))?;
            let renderer = TerminalRenderer::for_stdout();
            let report = status::collect_status(&config)?;
            renderer.print_lines(&status::status_lines(renderer.style(), &report));
        }
        None => {
            ensure_privileged()?;
            let layout = HostLayout::new(&config.base_dir);
            layout.ensure_base_dirs()?;
            let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
            init_tracing(Some(layout.log_path().as_path()), Arc::clone(&runner))?;

            let resume_command = resolve_resume_command(&config, &cli.config)?;
            let orchestrator = build_orchestrator(&config, &layout, runner, resume_command);
            let outcome = orchestrator.run()?;
            print_outcome(&config, outcome);
        }
    }

    Ok(())
}

fn build_orchestrator(
    config: &UpgradeConfig,
    layout: &HostLayout,
    runner: Arc<dyn CommandRunner>,
    resume_command: Vec<String>,
) -> Orchestrator {
    let collaborators = Collaborators {
        lock: Box::new(PidFileLock::new(layout.lock_path())),
        state: Box::new(FileStateStore::new(layout.state_path())),
        preconditions: Box::new(HostPreconditions::from_config(config, Arc::clone(&runner))),
        stages: Box::new(HostStages::from_config(config, Arc::clone(&runner))),
        monitor: Box::new(ServiceWatchdog::from_config(config, Arc::clone(&runner))),
        boot: Box::new(SystemdBootScheduler::new(
            config.unit_path(),
            layout.base_dir(),
            config.boot_start_timeout(),
            config.command_timeout(),
            Arc::clone(&runner),
        )),
        rebooter: Box::new(ShutdownRebooter::new(runner, config.command_timeout())),
        journal: Some(RunJournal::new(layout.journal_path())),
    };
    Orchestrator::new(
        RunSettings {
            resume_command,
            reboot_delay_minutes: config.reboot.delay_minutes,
        },
        collaborators,
    )
}

fn ensure_privileged() -> Result<(), RunError> {
    let euid = geteuid();
    if euid.is_root() {
        return Ok(());
    }
    Err(RunError::NotPrivileged {
        euid: euid.as_raw(),
    })
}

/// The boot hook re-runs this executable, forwarding a non-default config path.
fn resolve_resume_command(config: &UpgradeConfig, config_path: &Path) -> Result<Vec<String>> {
    let program = match &config.resume_command {
        Some(command) => command.clone(),
        None => std::env::current_exe().context("failed to resolve relup executable path")?,
    };
    let mut argv = vec![path_word(&program)?];
    if config_path != Path::new(DEFAULT_CONFIG_PATH) {
        let config_path = std::path::absolute(config_path).with_context(|| {
            format!("failed to resolve config path: {}", config_path.display())
        })?;
        argv.push("--config".to_string());
        argv.push(path_word(&config_path)?);
    }
    Ok(argv)
}

fn path_word(path: &Path) -> Result<String> {
    path.to_str()
        .map(str::to_string)
        .with_context(|| format!("path is not valid UTF-8: {}", path.display()))
}

fn init_tracing(log_path: Option<&Path>, runner: Arc<dyn CommandRunner>) -> Result<()> {
    let file_layer = match log_path {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file: {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(env_filter()),
            )
        }
        None => None,
    };

    // RUST_LOG scopes the stderr and file layers only; ERRORs always reach the system log
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr).with_filter(env_filter()))
        .with(file_layer)
        .with(ErrorMirrorLayer::new(Arc::new(LoggerSink::new(runner))))
        .try_init()
        .context("failed to install tracing subscriber")?;
    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn print_outcome(config: &UpgradeConfig, outcome: RunOutcome) {
    let renderer = TerminalRenderer::for_stdout();
    match outcome {
        RunOutcome::Advanced { from, to } => {
            renderer.print_status(
                Badge::Ok,
                &format!("stage {} complete; state advanced to {to}", from.stage()),
            );
            renderer.print_status(
                Badge::Info,
                &format!(
                    "reboot scheduled in {} minute(s); {} resumes after boot",
                    config.reboot.delay_minutes,
                    to.stage()
                ),
            );
        }
        RunOutcome::Completed => {
            renderer.print_status(Badge::Ok, "upgrade pipeline complete; boot hook removed");
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<RunError>()
        .map_or(EXIT_GENERIC, RunError::exit_code)
}

fn report_error(err: &anyhow::Error) {
    let renderer = TerminalRenderer::for_stderr();
    renderer.eprint_status(Badge::Err, &format!("{err:#}"));
    if let Some(RunError::StageFailed {
        diagnostic_tail, ..
    }) = err.downcast_ref::<RunError>()
    {
        if !diagnostic_tail.is_empty() {
            renderer.eprint_status(Badge::Warn, "last tool output:");
            for line in diagnostic_tail.lines() {
                eprintln!("  {line}");
            }
        }
    }
}
