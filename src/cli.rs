use crate::config::types::{BackendKind, ExecutionStatus, SandboxConfig, DEFAULT_CGROUP_ROOT};
use crate::core::controller::{LaunchRequest, SandboxedProcess};
use crate::kernel::cgroup::backend::{backend_name, cgroup_v2_available, detect_backend};
use crate::verdict::stats::ExecutionReport;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Exit code for judge infrastructure failures.
const INTERNAL_ERROR_EXIT: i32 = 2;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a program under time and memory limits and print a JSON report
    Run {
        /// Time limit in seconds (CPU and wall clock)
        #[arg(long)]
        time: f64,
        /// Memory limit in KiB
        #[arg(long)]
        memory: u64,
        /// Working directory of the program
        #[arg(long, default_value = ".")]
        cwd: PathBuf,
        /// File fed to the program's stdin
        #[arg(long)]
        stdin: Option<PathBuf>,
        /// Keep at most this many bytes of stdout
        #[arg(long)]
        stdout_limit: Option<usize>,
        /// Keep at most this many bytes of stderr
        #[arg(long)]
        stderr_limit: Option<usize>,
        /// Group backend: auto, cgroup_v2 or rlimit
        #[arg(long)]
        backend: Option<String>,
        /// Allow the rlimit fallback when cgroups are unusable
        #[arg(long)]
        permissive: bool,
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Program and its arguments
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Run a program without any limits and pass its exit code through
    RunUnsafe {
        #[arg(long, default_value = ".")]
        cwd: PathBuf,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },
    /// Print the backend this host would use
    Probe,
}

fn build_config(
    path: Option<&PathBuf>,
    backend: Option<&str>,
    permissive: bool,
) -> Result<SandboxConfig> {
    let mut config = match path {
        Some(path) => SandboxConfig::load(path)?,
        None => SandboxConfig::default(),
    };
    if permissive {
        config.strict_mode = false;
    }
    config = config.with_env_overrides()?;
    if let Some(name) = backend {
        config.backend = match BackendKind::parse(name) {
            Some(kind) => kind,
            None => bail!("unknown backend '{}'", name),
        };
    }
    // Flags win over the environment.
    if permissive {
        config.strict_mode = false;
    }
    config.validate()?;
    Ok(config)
}

fn print_report(report: &ExecutionReport) -> Result<()> {
    println!("{}", report.to_json()?);
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_sandboxed(
    time: f64,
    memory: u64,
    cwd: PathBuf,
    stdin: Option<PathBuf>,
    stdout_limit: Option<usize>,
    stderr_limit: Option<usize>,
    config: SandboxConfig,
    command: Vec<String>,
) -> Result<()> {
    let started_at = Utc::now();
    let input = match stdin {
        Some(path) => Some(
            std::fs::read(&path).with_context(|| format!("reading {}", path.display()))?,
        ),
        None => None,
    };
    let request = LaunchRequest::new(&command[0], cwd, time, memory).args(command[1..].iter().cloned());

    let mut process = match SandboxedProcess::launch(&request, &config) {
        Ok(process) => process,
        Err(e) if e.is_setup_failure() => {
            log::error!("Launch failed: {}", e);
            let report = ExecutionReport::internal_error(
                e.to_string(),
                backend_name(config.backend),
                started_at,
            );
            print_report(&report)?;
            std::process::exit(INTERNAL_ERROR_EXIT);
        }
        Err(e) => return Err(e.into()),
    };

    let exchanged = if stdout_limit.is_some() || stderr_limit.is_some() {
        process.safe_communicate(
            input.as_deref(),
            stdout_limit.unwrap_or(usize::MAX),
            stderr_limit.unwrap_or(usize::MAX),
        )
    } else {
        process.communicate(input.as_deref())
    };

    let mut report = process.report();
    if let Err(e) = exchanged {
        log::error!("Run of {} failed: {}", command[0], e);
        report.status = ExecutionStatus::InternalError;
        report.error = Some(e.to_string());
        print_report(&report)?;
        drop(process);
        std::process::exit(INTERNAL_ERROR_EXIT);
    }
    print_report(&report)
}

fn run_unsafe(cwd: PathBuf, command: Vec<String>) -> Result<()> {
    let status = std::process::Command::new(&command[0])
        .args(&command[1..])
        .current_dir(&cwd)
        .status()
        .with_context(|| format!("starting {}", command[0]))?;
    let code = match status.code() {
        Some(code) => code,
        None => {
            use std::os::unix::process::ExitStatusExt;
            128 + status.signal().unwrap_or(0)
        }
    };
    std::process::exit(code);
}

fn probe() -> Result<()> {
    let report = serde_json::json!({
        "detected": backend_name(detect_backend()),
        "cgroup_v2_mounted": cgroup_v2_available(),
        "default_cgroup_root": DEFAULT_CGROUP_ROOT,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            time,
            memory,
            cwd,
            stdin,
            stdout_limit,
            stderr_limit,
            backend,
            permissive,
            config,
            command,
        } => {
            let config = build_config(config.as_ref(), backend.as_deref(), permissive)?;
            run_sandboxed(
                time,
                memory,
                cwd,
                stdin,
                stdout_limit,
                stderr_limit,
                config,
                command,
            )
        }
        Commands::RunUnsafe { cwd, command } => run_unsafe(cwd, command),
        Commands::Probe => probe(),
    }
}
