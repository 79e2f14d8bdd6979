//! Parallel task orchestrator.
//!
//! Reads a JSON task file, runs independent tasks concurrently in isolated
//! git worktrees, and merges the ones that pass verification back into the
//! base branch. State lives under `.up/` in the repository root.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::warn;

use orchestrator::core::file_map::PathTokenEstimator;
use orchestrator::events::{EVENTS_FILE, JsonlSink};
use orchestrator::exit_codes;
use orchestrator::io::executor::CliExecutor;
use orchestrator::io::knowledge::SharedKnowledge;
use orchestrator::io::process::CancelToken;
use orchestrator::io::provenance::{ProvenanceLedger, ProvenanceStats};
use orchestrator::io::state_store::{ContextStatus, StateStore, UnifiedState};
use orchestrator::io::task_source::TaskSource;
use orchestrator::io::verifier::CommandVerifier;
use orchestrator::io::worktree::{WorktreeInfo, WorktreeManager};
use orchestrator::logging;
use orchestrator::orchestrate::{self, RunContext, RunOptions, RunStop, RunSummary};
use orchestrator::pipeline::PROVENANCE_DIR;

#[derive(Parser)]
#[command(
    name = "orchestrator",
    version,
    about = "Run tasks in parallel git worktrees and merge what passes"
)]
struct Cli {
    /// Repository root.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print dependency waves and conflict-free sub-waves without running anything.
    Plan {
        #[arg(long, default_value = "tasks.json")]
        tasks: PathBuf,
    },
    /// Execute pending tasks wave by wave.
    Run {
        #[arg(long, default_value = "tasks.json")]
        tasks: PathBuf,
        /// Stop after the first wave.
        #[arg(long)]
        first_wave_only: bool,
        /// Merge with a merge commit instead of squashing.
        #[arg(long)]
        no_squash: bool,
        /// Override `parallel.max_workers`.
        #[arg(long)]
        max_workers: Option<usize>,
    },
    /// Print state, worktrees and provenance statistics as JSON.
    Status,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = cli
        .root
        .canonicalize()
        .with_context(|| format!("resolve {}", cli.root.display()))?;
    match cli.command {
        Command::Plan { tasks } => cmd_plan(&root, &tasks),
        Command::Run {
            tasks,
            first_wave_only,
            no_squash,
            max_workers,
        } => cmd_run(
            &root,
            &tasks,
            RunOptions {
                run_all: !first_wave_only,
                squash: !no_squash,
            },
            max_workers,
        ),
        Command::Status => cmd_status(&root),
    }
}

fn cmd_plan(root: &Path, tasks: &Path) -> Result<i32> {
    let store = StateStore::open(root)?;
    let source = TaskSource::new(resolve(root, tasks), store.lock_timeout());
    let planned = orchestrate::plan(&source.load()?, &PathTokenEstimator, &store.config().parallel)?;
    print_json(&planned)?;
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, tasks: &Path, opts: RunOptions, max_workers: Option<usize>) -> Result<i32> {
    let store = StateStore::open(root)?;
    let mut config = store.config();
    if let Some(max_workers) = max_workers {
        config.parallel.max_workers = max_workers;
    }
    let source = TaskSource::new(resolve(root, tasks), store.lock_timeout());
    let tasks = source.load()?;

    // The task file (and its lock) may change in the main checkout between merges.
    let mut dirty_allowed = Vec::new();
    if let Ok(rel) = source.path().strip_prefix(root) {
        dirty_allowed.push(rel.to_string_lossy().into_owned());
    }
    let worktrees = WorktreeManager::new(root, store.lock_timeout())?.allow_dirty(dirty_allowed);
    let knowledge = SharedKnowledge::new(store.up_dir(), store.lock_timeout());
    let executor = CliExecutor::from_config(&config.executor);
    let verifier = CommandVerifier::from_config(&config.verify);
    let events = JsonlSink::open(&store.up_dir().join(EVENTS_FILE))?;

    let cancel = CancelToken::new();
    let interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        warn!("interrupt received, rolling back running tasks");
        interrupt.cancel();
    })
    .context("install interrupt handler")?;

    let ctx = RunContext {
        store: &store,
        knowledge: &knowledge,
        worktrees: &worktrees,
        executor: &executor,
        verifier: &verifier,
        estimator: &PathTokenEstimator,
        events: &events,
        task_source: Some(&source),
        cancel,
        config,
    };
    let summary = orchestrate::run(&ctx, &tasks, opts)?;
    print_json(&summary)?;
    Ok(exit_code(&summary))
}

#[derive(Serialize)]
struct StatusReport {
    health: Health,
    state: UnifiedState,
    worktrees: Vec<WorktreeInfo>,
    provenance: ProvenanceStats,
}

/// Figures derived from the state document.
#[derive(Debug, PartialEq, Serialize)]
struct Health {
    success_rate: f64,
    context_usage_percent: f64,
    context_remaining_tokens: u64,
    context_status: ContextStatus,
}

impl Health {
    fn of(state: &UnifiedState) -> Self {
        Self {
            success_rate: state.metrics.success_rate(),
            context_usage_percent: state.context.usage_percent(),
            context_remaining_tokens: state.context.remaining_tokens(),
            context_status: state.context.status(),
        }
    }
}

fn cmd_status(root: &Path) -> Result<i32> {
    let store = StateStore::open(root)?;
    let worktrees = WorktreeManager::new(root, store.lock_timeout())?;
    let ledger = ProvenanceLedger::new(
        store.up_dir().join(PROVENANCE_DIR),
        String::new(),
        root.to_path_buf(),
        store.lock_timeout(),
    );
    let state = store.load()?;
    print_json(&StatusReport {
        health: Health::of(&state),
        state,
        worktrees: worktrees.list()?,
        provenance: ledger.get_stats()?,
    })?;
    Ok(exit_codes::OK)
}

fn exit_code(summary: &RunSummary) -> i32 {
    match summary.stop {
        RunStop::Interrupted => exit_codes::INTERRUPTED,
        RunStop::CircuitOpen => exit_codes::CIRCUIT_OPEN,
        RunStop::Complete | RunStop::FirstWaveOnly => {
            if summary.failed() + summary.skipped() > 0 {
                exit_codes::INCOMPLETE
            } else {
                exit_codes::OK
            }
        }
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{rendered}");
    Ok(())
}
