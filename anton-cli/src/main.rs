//! Anton CLI - autonomous coding-task supervisor.
//!
//! One command: point it at a markdown task file inside a git repository
//! and it drives the configured agent harness through the task list.

#![allow(clippy::print_stdout)] // CLI program intentionally uses stdout

mod harness;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use clap::Parser;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use anton::config::RunConfig;
use anton::controller::RunController;
use anton::error::{Error, Result};
use anton::git::ProcessGit;
use anton::vault::MemoryVault;
use anton::verify::ProcessRunner;

use harness::HarnessFactory;

/// Anton - drive a coding agent through a markdown task list.
#[derive(Parser)]
#[command(name = "anton")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Markdown task file with `- [ ]` checkboxes
    task_file: PathBuf,

    /// TOML configuration bundle
    #[arg(short, long, env = "ANTON_CONFIG")]
    config: Option<PathBuf>,

    /// Repository to operate on (defaults to the task file's directory)
    #[arg(long)]
    project_dir: Option<PathBuf>,

    /// Shell command that runs one agent harness session
    #[arg(long, env = "ANTON_AGENT_CMD")]
    agent_cmd: Option<String>,

    /// Report the would-run task list and exit
    #[arg(long)]
    dry_run: bool,

    /// Tolerate a dirty working tree at startup
    #[arg(long)]
    allow_dirty: bool,

    /// Create and switch to this branch first
    #[arg(long)]
    branch: Option<String>,

    /// Skip tasks that fail terminally instead of stopping
    #[arg(long)]
    skip_on_fail: bool,

    /// Do not commit verified tasks
    #[arg(long)]
    no_commit: bool,

    /// Ceiling on tasks attempted in this run
    #[arg(long)]
    max_tasks: Option<u32>,

    /// Whole-run token budget
    #[arg(long)]
    max_total_tokens: Option<u64>,

    /// Verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
    match rt.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

/// Initialize logging with the given verbosity level.
fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("anton={level},anton_cli={level},warn")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbosity >= 2)
        .init();
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let config = build_config(&cli).await?;

    let Some(agent_cmd) = cli.agent_cmd.clone() else {
        if !cli.dry_run {
            return Err(Error::config(
                "no agent harness configured; pass --agent-cmd or set ANTON_AGENT_CMD",
            ));
        }
        // Dry runs never spawn sessions; any command satisfies the wiring.
        return launch(cli, config, "false".to_string()).await;
    };
    launch(cli, config, agent_cmd).await
}

async fn launch(cli: Cli, config: RunConfig, agent_cmd: String) -> Result<ExitCode> {
    let controller = RunController::new(
        config,
        Arc::new(ProcessGit),
        Arc::new(MemoryVault::new()),
        Arc::new(HarnessFactory::new(agent_cmd)),
        Arc::new(ProcessRunner),
    );

    // First Ctrl-C aborts gracefully; the second one exits immediately.
    let abort = controller.abort_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nabort requested; finishing the in-flight attempt (Ctrl-C again to quit)");
            abort.store(true, Ordering::SeqCst);
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(130);
        }
    });

    let summary = controller.run(&cli.task_file).await?;
    print_summary(&summary);
    Ok(ExitCode::from(summary.stop_reason.exit_code()))
}

/// Load the config bundle and apply CLI overrides.
async fn build_config(cli: &Cli) -> Result<RunConfig> {
    let mut config = if let Some(path) = &cli.config {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::config(format!("failed to read config: {e}")))?;
        toml::from_str(&content)
            .map_err(|e| Error::config(format!("failed to parse config: {e}")))?
    } else {
        RunConfig::default()
    };

    if let Some(dir) = &cli.project_dir {
        config.project_dir = dir.clone();
    } else if config.project_dir == PathBuf::from(".")
        && let Some(parent) = cli.task_file.parent()
        && parent.as_os_str() != ""
    {
        config.project_dir = parent.to_path_buf();
    }

    config.dry_run |= cli.dry_run;
    config.allow_dirty |= cli.allow_dirty;
    config.skip_on_fail |= cli.skip_on_fail;
    if cli.no_commit {
        config.auto_commit = false;
    }
    if let Some(branch) = &cli.branch {
        config.branch = Some(branch.clone());
    }
    if let Some(max_tasks) = cli.max_tasks {
        config.max_tasks = max_tasks;
    }
    if let Some(tokens) = cli.max_total_tokens {
        config.max_total_tokens = tokens;
    }

    config.validate()?;
    Ok(config)
}

fn print_summary(summary: &anton::RunSummary) {
    println!();
    println!("Run finished: {}", summary.stop_reason.as_str());
    println!("  completed:      {}", summary.completed);
    println!("  auto-completed: {}", summary.auto_completed);
    println!("  pre-completed:  {}", summary.pre_completed);
    println!("  skipped:        {}", summary.skipped);
    println!("  failed:         {}", summary.failed);
    println!("  remaining:      {}", summary.remaining);
    println!("  total tasks:    {}", summary.total_tasks);
    println!("  commits:        {}", summary.commits);
    println!("  tokens:         {}", summary.total_tokens);
    println!("  duration:       {:.1}s", summary.duration.as_secs_f64());
}
