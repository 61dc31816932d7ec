//! `execute`: re-run a program snapshot from a workspace directory.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

use tracery_cache::Lifter;
use tracery_decode::{Aarch64Arch, GuestArch, X86Arch};
use tracery_exec::{Executor, GenericRuntime, Workspace};
use tracery_lift_x86::X86TraceLifter;
use tracery_snapshot::{load_snapshot, ProgramSnapshot};

/// Exit code for unrecoverable decode/lift/compile errors.
const EXIT_GUEST_ERROR: u8 = 1;
/// Exit code for a missing or malformed snapshot.
const EXIT_BAD_SNAPSHOT: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum GuestArchName {
    X86,
    Amd64,
    Aarch64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum GuestOs {
    Linux,
}

#[derive(Debug, Parser)]
#[command(about = "Execute a program snapshot against an emulated address space")]
struct Args {
    /// Workspace holding the snapshot, code-cache index, and memory files.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Guest architecture the snapshot was captured from.
    #[arg(long, value_enum, default_value = "amd64")]
    arch: GuestArchName,

    /// Guest operating system.
    #[arg(long, value_enum, default_value = "linux")]
    os: GuestOs,

    /// Runtime name or path; defaults to `<os>_<arch>`.
    #[arg(long)]
    runtime: Option<String>,

    /// Instrumentation tools to run (colon-separated on POSIX, semicolons on
    /// Windows).
    #[arg(long, default_value = "")]
    tool: String,

    /// Log progress at debug level.
    #[arg(long)]
    verbose: bool,

    /// Track self-modifying code with per-range code versions.
    #[arg(long = "version_code")]
    version_code: bool,

    /// Number of lifter worker threads.
    #[arg(long, default_value_t = 2)]
    lift_workers: usize,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(&args) {
        Ok(faulted) if faulted == 0 => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(EXIT_GUEST_ERROR),
        Err(err) => {
            let code = if err.is::<tracery_snapshot::SnapshotError>() {
                EXIT_BAD_SNAPSHOT
            } else {
                EXIT_GUEST_ERROR
            };
            eprintln!("error: {err:#}");
            ExitCode::from(code)
        }
    }
}

fn run(args: &Args) -> Result<u64> {
    let workspace = Workspace::open(&args.workspace)
        .with_context(|| format!("failed to open workspace {}", args.workspace.display()))?;

    let runtime_name = args
        .runtime
        .clone()
        .unwrap_or_else(|| format!("{}_{}", os_name(args.os), arch_name(args.arch)));
    let tools = split_tools(&args.tool);
    if !tools.is_empty() {
        // Tool libraries land in a per-combination directory; the tools
        // themselves are external plugins.
        let lib_dir = workspace.library_dir(&runtime_name, &args.tool)?;
        info!("tool libraries will be placed in {}", lib_dir.display());
    }

    let snapshot_path = workspace.snapshot_path();
    let snapshot = ProgramSnapshot::load(&snapshot_path)
        .with_context(|| format!("failed to load snapshot {}", snapshot_path.display()))?;

    let arch = make_arch(args.arch);
    let lifter = make_lifter(args.arch, &runtime_name)?;

    let program = load_snapshot(
        &snapshot,
        &workspace.memory_dir()?,
        arch.address_width(),
        args.version_code,
    )?;

    let mut executor = Executor::new(
        arch,
        Box::new(GenericRuntime),
        lifter,
        &workspace,
        args.lift_workers,
    )?;
    for task in &program.tasks {
        executor.add_initial_task(&task.state, task.pc, task.memory.clone());
    }

    let summary = executor.run()?;
    info!(
        "run finished: {} exited, {} faulted",
        summary.exited, summary.faulted
    );
    if summary.faulted > 0 {
        warn!("{} task(s) stopped on guest errors", summary.faulted);
    }
    Ok(summary.faulted)
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_filter = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn make_arch(name: GuestArchName) -> Arc<dyn GuestArch> {
    match name {
        GuestArchName::X86 => Arc::new(X86Arch::x86()),
        GuestArchName::Amd64 => Arc::new(X86Arch::amd64()),
        GuestArchName::Aarch64 => Arc::new(Aarch64Arch),
    }
}

fn make_lifter(arch: GuestArchName, runtime: &str) -> Result<Arc<dyn Lifter>> {
    if !matches!(runtime, "generic") && !runtime.starts_with("linux_") {
        warn!("unknown runtime {runtime:?}; using the generic runtime");
    }
    match arch {
        GuestArchName::X86 => Ok(Arc::new(X86TraceLifter::x86())),
        GuestArchName::Amd64 => Ok(Arc::new(X86TraceLifter::amd64())),
        GuestArchName::Aarch64 => {
            bail!("no built-in lifter backend for aarch64; link an external one")
        }
    }
}

fn arch_name(arch: GuestArchName) -> &'static str {
    match arch {
        GuestArchName::X86 => "x86",
        GuestArchName::Amd64 => "amd64",
        GuestArchName::Aarch64 => "aarch64",
    }
}

fn os_name(os: GuestOs) -> &'static str {
    match os {
        GuestOs::Linux => "linux",
    }
}

fn split_tools(raw: &str) -> Vec<&str> {
    let separator = if cfg!(windows) { ';' } else { ':' };
    raw.split(separator)
        .filter(|part| !part.is_empty())
        .collect()
}
