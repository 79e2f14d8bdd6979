//! Wave loop: schedule, split by file conflicts, provision worktrees, run
//! task pipelines concurrently, then merge passing tasks one at a time.
//!
//! Sub-waves run strictly in sequence. Tasks inside a sub-wave run on scoped
//! threads, at most `max_workers` at once. Provisioning and merges stay on the
//! calling thread because every worktree shares the repository's git metadata.

use std::collections::BTreeSet;
use std::thread;

use anyhow::{Result, anyhow};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::file_map::{FileConflict, TaskFileMap, TouchEstimator};
use crate::core::graph::{DependencyGraph, execution_waves};
use crate::core::types::{Task, WorktreeStatus};
use crate::error::{OrchestratorError, is_store_level};
use crate::events::{EventSink, ProgressEvent};
use crate::io::config::{OrchestratorConfig, ParallelConfig};
use crate::io::executor::TaskExecutor;
use crate::io::git::{Git, ResetMode};
use crate::io::knowledge::SharedKnowledge;
use crate::io::process::CancelToken;
use crate::io::provenance::ProvenanceLedger;
use crate::io::state_store::{AgentState, DoomLoopCheck, StateStore};
use crate::io::task_source::TaskSource;
use crate::io::verifier::Verifier;
use crate::io::worktree::{Worktree, WorktreeManager};
use crate::pipeline::{OutcomeKind, PROVENANCE_DIR, TaskOutcome, run_task};

/// Everything a run needs, shared by reference with every worker thread.
pub struct RunContext<'a> {
    pub store: &'a StateStore,
    pub knowledge: &'a SharedKnowledge,
    pub worktrees: &'a WorktreeManager,
    pub executor: &'a dyn TaskExecutor,
    pub verifier: &'a dyn Verifier,
    pub estimator: &'a dyn TouchEstimator,
    pub events: &'a dyn EventSink,
    /// Marked complete after each successful merge, when present.
    pub task_source: Option<&'a TaskSource>,
    pub cancel: CancelToken,
    pub config: OrchestratorConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Keep going after the first wave.
    pub run_all: bool,
    /// Squash each task branch into one commit on the base branch.
    pub squash: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            run_all: true,
            squash: true,
        }
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStop {
    /// Every wave was processed.
    Complete,
    /// Only the first wave was requested.
    FirstWaveOnly,
    CircuitOpen,
    Interrupted,
}

/// Per-wave task ids by result. Blocked and interrupted tasks count as skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WaveSummary {
    pub wave: usize,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
}

impl WaveSummary {
    fn new(wave: usize) -> Self {
        Self {
            wave,
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: &TaskOutcome) {
        let bucket = match outcome.kind {
            OutcomeKind::Passed => &mut self.completed,
            OutcomeKind::Failed => &mut self.failed,
            OutcomeKind::Blocked | OutcomeKind::Skipped | OutcomeKind::Interrupted => {
                &mut self.skipped
            }
        };
        bucket.push(outcome.task_id.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub waves: Vec<WaveSummary>,
    pub outcomes: Vec<TaskOutcome>,
    pub stop: RunStop,
}

impl RunSummary {
    pub fn completed(&self) -> usize {
        self.waves.iter().map(|wave| wave.completed.len()).sum()
    }

    pub fn failed(&self) -> usize {
        self.waves.iter().map(|wave| wave.failed.len()).sum()
    }

    pub fn skipped(&self) -> usize {
        self.waves.iter().map(|wave| wave.skipped.len()).sum()
    }

    pub fn outcome(&self, task_id: &str) -> Option<&TaskOutcome> {
        self.outcomes.iter().find(|outcome| outcome.task_id == task_id)
    }
}

/// A wave as it would run: sub-wave groups in order plus the conflicts that
/// forced the split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedWave {
    pub wave: usize,
    pub groups: Vec<Vec<String>>,
    pub conflicts: Vec<FileConflict>,
}

/// Waves and sub-waves for the pending tasks, without executing anything.
pub fn plan(
    tasks: &[Task],
    estimator: &dyn TouchEstimator,
    parallel: &ParallelConfig,
) -> Result<Vec<PlannedWave>> {
    let pending = pending_tasks(tasks);
    let file_map = TaskFileMap::analyze(&pending, estimator);
    let waves = execution_waves(&pending)?;
    Ok(waves
        .iter()
        .enumerate()
        .map(|(index, wave)| PlannedWave {
            wave: index + 1,
            groups: split_groups(&file_map, wave, parallel)
                .iter()
                .map(|group| task_ids(group))
                .collect(),
            conflicts: file_map.find_conflicts(wave),
        })
        .collect())
}

/// Run every pending task wave by wave.
///
/// Configuration errors (dependency cycle, unknown base branch) and
/// store-level errors abort the run. Anything else that goes wrong with one
/// task is reported in its outcome and does not stop its siblings.
#[instrument(skip_all, fields(tasks = tasks.len()))]
pub fn run(ctx: &RunContext<'_>, tasks: &[Task], opts: RunOptions) -> Result<RunSummary> {
    ctx.config.validate()?;
    let pending = pending_tasks(tasks);
    let waves = execution_waves(&pending)?;
    let graph = DependencyGraph::build(&pending)?;
    let file_map = TaskFileMap::analyze(&pending, ctx.estimator);

    ctx.store.begin_run(pending.len())?;
    ctx.knowledge.reset()?;
    ctx.events.emit(ProgressEvent::RunStarted {
        pending_tasks: pending.len(),
        waves: waves.len(),
    });
    info!(pending = pending.len(), waves = waves.len(), "run started");

    let mut batch = 0u64;
    let result = run_waves(ctx, &waves, &graph, &file_map, opts, &mut batch);
    // Cleared on failure too, so the store never reports workers that are gone.
    if let Err(err) = ctx.store.set_parallel_active(false, batch) {
        if result.is_ok() {
            return Err(err);
        }
        warn!(err = %format!("{err:#}"), "parallel flag not cleared after failed run");
    }
    let summary = result?;
    ctx.events.emit(ProgressEvent::RunFinished {
        stop: summary.stop,
        completed: summary.completed(),
        failed: summary.failed(),
        skipped: summary.skipped(),
    });
    info!(stop = ?summary.stop, "run finished");
    Ok(summary)
}

fn run_waves(
    ctx: &RunContext<'_>,
    waves: &[Vec<Task>],
    graph: &DependencyGraph,
    file_map: &TaskFileMap,
    opts: RunOptions,
    batch: &mut u64,
) -> Result<RunSummary> {
    let mut summary = RunSummary {
        waves: Vec::new(),
        outcomes: Vec::new(),
        stop: RunStop::Complete,
    };
    let mut unavailable: BTreeSet<String> = BTreeSet::new();
    let mut stop: Option<RunStop> = None;

    for (index, wave) in waves.iter().enumerate() {
        let number = index + 1;
        ctx.events.emit(ProgressEvent::WaveStarted {
            wave: number,
            total_waves: waves.len(),
            tasks: task_ids(wave),
        });
        let mut wave_summary = WaveSummary::new(number);
        let mut wave_outcomes = Vec::new();

        let mut runnable = Vec::new();
        for task in wave {
            match task.depends_on.iter().find(|dep| unavailable.contains(*dep)) {
                Some(dep) => {
                    let reason = format!("dependency {dep} did not complete");
                    ctx.events.emit(ProgressEvent::TaskSkipped {
                        task_id: task.id.clone(),
                        reason: reason.clone(),
                    });
                    wave_outcomes.push(TaskOutcome::skipped(&task.id, reason));
                }
                None => runnable.push(task.clone()),
            }
        }

        let groups = split_groups(file_map, &runnable, &ctx.config.parallel);
        if groups.len() > 1 {
            ctx.events.emit(ProgressEvent::SubWaveSplit {
                wave: number,
                groups: groups.iter().map(|group| task_ids(group)).collect(),
                conflicts: file_map.find_conflicts(&runnable).len(),
            });
        }

        for group in &groups {
            if stop.is_none() {
                stop = halt_reason(ctx)?;
            }
            if let Some(reason) = stop {
                for task in group {
                    let reason = format!("run stopped: {}", stop_label(reason));
                    ctx.events.emit(ProgressEvent::TaskSkipped {
                        task_id: task.id.clone(),
                        reason: reason.clone(),
                    });
                    wave_outcomes.push(TaskOutcome::skipped(&task.id, reason));
                }
                continue;
            }
            *batch += 1;
            let outcomes = run_group(ctx, group, file_map, opts, *batch)?;
            if outcomes
                .iter()
                .any(|outcome| outcome.kind == OutcomeKind::Interrupted)
            {
                stop = Some(RunStop::Interrupted);
            }
            wave_outcomes.extend(outcomes);
        }

        for outcome in wave_outcomes {
            if outcome.kind != OutcomeKind::Passed {
                let dependents = graph.dependents_of(&outcome.task_id);
                if !dependents.is_empty() {
                    info!(task_id = %outcome.task_id, ?dependents, "dependents will be skipped");
                }
                unavailable.insert(outcome.task_id.clone());
            }
            wave_summary.record(&outcome);
            summary.outcomes.push(outcome);
        }
        info!(
            wave = number,
            completed = wave_summary.completed.len(),
            failed = wave_summary.failed.len(),
            skipped = wave_summary.skipped.len(),
            "wave finished"
        );
        ctx.events.emit(ProgressEvent::WaveFinished {
            summary: wave_summary.clone(),
        });
        summary.waves.push(wave_summary);

        if stop.is_none() {
            stop = halt_reason(ctx)?;
        }
        if stop.is_some() {
            break;
        }
        if !opts.run_all && number < waves.len() {
            stop = Some(RunStop::FirstWaveOnly);
            break;
        }
    }

    summary.stop = stop.unwrap_or(RunStop::Complete);
    Ok(summary)
}

/// Provision, execute and settle one conflict-free group.
fn run_group(
    ctx: &RunContext<'_>,
    group: &[Task],
    file_map: &TaskFileMap,
    opts: RunOptions,
    batch: u64,
) -> Result<Vec<TaskOutcome>> {
    ctx.store.set_parallel_active(true, batch)?;
    let mut outcomes = Vec::new();
    let mut provisioned: Vec<(&Task, Worktree, BTreeSet<String>)> = Vec::new();

    for task in group {
        match prepare_worktree(ctx, task) {
            Ok(worktree) => {
                ctx.store.add_agent(AgentState {
                    task_id: task.id.clone(),
                    task_title: task.display_title().to_string(),
                    branch: worktree.branch.clone(),
                    worktree_path: worktree.path.display().to_string(),
                    status: worktree.status,
                    started_at: Utc::now(),
                    completed_at: None,
                    error: None,
                    checkpoint: None,
                })?;
                let touched = file_map.files_for(&task.id).cloned().unwrap_or_default();
                let conflicts = ctx.knowledge.claim_files(&task.id, &touched)?;
                if !conflicts.is_empty() {
                    warn!(task_id = %task.id, files = ?conflicts, "files already claimed by another worker");
                }
                provisioned.push((task, worktree, touched));
            }
            Err(err) if is_store_level(&err) || is_configuration(&err) => return Err(err),
            Err(err) => {
                warn!(task_id = %task.id, err = %format!("{err:#}"), "worktree provisioning failed");
                outcomes.push(TaskOutcome::failed(
                    &task.id,
                    format!("provisioning failed: {err:#}"),
                ));
            }
        }
    }
    debug!(batch, workers = provisioned.len(), "starting workers");

    let results: Vec<Result<TaskOutcome>> = thread::scope(|scope| {
        let handles: Vec<_> = provisioned
            .iter()
            .map(|(task, worktree, touched)| {
                scope.spawn(move || run_task(ctx, task, worktree, touched))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("worker thread panicked")))
            })
            .collect()
    });

    let mut store_error = None;
    for ((task, _, _), result) in provisioned.iter().zip(results) {
        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(err) if is_store_level(&err) => {
                store_error.get_or_insert(err);
                continue;
            }
            Err(err) => TaskOutcome::failed(&task.id, format!("{err:#}")),
        };
        if store_error.is_none() {
            settle(ctx, task, &mut outcome, opts)?;
        }
        ctx.knowledge.release_files(&task.id)?;
        outcomes.push(outcome);
    }
    match store_error {
        Some(err) => Err(err),
        None => Ok(outcomes),
    }
}

/// Merge a passing task, or record and clean up anything else.
fn settle(ctx: &RunContext<'_>, task: &Task, outcome: &mut TaskOutcome, opts: RunOptions) -> Result<()> {
    match outcome.kind {
        OutcomeKind::Passed => {
            let base = &ctx.config.parallel.base_branch;
            match ctx.worktrees.merge(&task.id, base, opts.squash, None) {
                Ok(merged) => {
                    outcome.merge_commit = Some(merged.commit_sha.clone());
                    ctx.store.record_task_complete(&task.id)?;
                    ctx.knowledge.mark_complete(&task.id)?;
                    mark_source_complete(ctx, &task.id)?;
                    ctx.store.remove_agent(&task.id)?;
                    ctx.events.emit(ProgressEvent::MergeResult {
                        task_id: task.id.clone(),
                        success: true,
                        commit_sha: Some(merged.commit_sha),
                        error: None,
                    });
                }
                Err(err) if is_store_level(&err) => return Err(err),
                Err(err) => {
                    let reason = format!("merge failed: {err:#}");
                    warn!(task_id = %task.id, reason = %reason, "merge failed, worktree kept");
                    ctx.events.emit(ProgressEvent::MergeResult {
                        task_id: task.id.clone(),
                        success: false,
                        commit_sha: None,
                        error: Some(reason.clone()),
                    });
                    revert_provenance(ctx, task, outcome, &reason)?;
                    ctx.store
                        .update_agent_status(&task.id, WorktreeStatus::Passed, Some(reason.clone()))?;
                    outcome.kind = OutcomeKind::Failed;
                    outcome.reason = Some(reason);
                    record_failure(ctx, &task.id)?;
                }
            }
        }
        OutcomeKind::Failed => {
            record_failure(ctx, &task.id)?;
            discard_worktree(ctx, &task.id)?;
        }
        OutcomeKind::Blocked => discard_worktree(ctx, &task.id)?,
        // Kept for the next run to resume from its last checkpoint.
        OutcomeKind::Interrupted | OutcomeKind::Skipped => {}
    }
    Ok(())
}

fn record_failure(ctx: &RunContext<'_>, task_id: &str) -> Result<()> {
    ctx.store.record_task_failed(task_id)?;
    let check = ctx.store.check_doom_loop()?;
    if let Some(message) = check.message() {
        warn!(message = %message, "doom loop check");
        let (failures, threshold) = match check {
            DoomLoopCheck::Warning {
                failures,
                threshold,
            }
            | DoomLoopCheck::DoomLoop {
                failures,
                threshold,
            } => (failures, threshold),
            DoomLoopCheck::Clear => (0, 0),
        };
        ctx.events.emit(ProgressEvent::DoomLoopWarning {
            message,
            failures,
            threshold,
        });
    }
    Ok(())
}

/// The accepted entry never reached the base branch.
fn revert_provenance(
    ctx: &RunContext<'_>,
    task: &Task,
    outcome: &TaskOutcome,
    reason: &str,
) -> Result<()> {
    let Some(id) = outcome.last_provenance_id() else {
        return Ok(());
    };
    let ledger = ProvenanceLedger::new(
        ctx.store.up_dir().join(PROVENANCE_DIR),
        WorktreeManager::branch_name(&task.id),
        ctx.worktrees.worktree_path(&task.id),
        ctx.store.lock_timeout(),
    );
    match ledger.mark_reverted(id, reason) {
        Ok(_) => Ok(()),
        Err(err) if is_store_level(&err) => Err(err),
        Err(err) => {
            warn!(id, err = %format!("{err:#}"), "could not mark provenance entry reverted");
            Ok(())
        }
    }
}

fn discard_worktree(ctx: &RunContext<'_>, task_id: &str) -> Result<()> {
    if let Err(err) = ctx.worktrees.remove(task_id, true) {
        if is_store_level(&err) {
            return Err(err);
        }
        warn!(task_id, err = %format!("{err:#}"), "could not remove worktree");
    }
    ctx.store.remove_agent(task_id)
}

/// Set `passes` in the task file; commit it when the file is tracked in the
/// repository so the main checkout stays clean for the next merge.
fn mark_source_complete(ctx: &RunContext<'_>, task_id: &str) -> Result<()> {
    let Some(source) = ctx.task_source else {
        return Ok(());
    };
    if let Err(err) = source.mark_complete(task_id) {
        if is_store_level(&err) {
            return Err(err);
        }
        warn!(task_id, err = %format!("{err:#}"), "could not mark task complete in task file");
        return Ok(());
    }
    let root = ctx.worktrees.root();
    let Ok(absolute) = source.path().canonicalize() else {
        return Ok(());
    };
    let Some(rel) = absolute.strip_prefix(root).ok().and_then(|rel| rel.to_str()) else {
        return Ok(());
    };
    let git = Git::new(root);
    if git.is_tracked(rel)? {
        git.commit_paths(&[rel], &format!("chore({task_id}): mark task complete"))?;
    }
    Ok(())
}

/// Create the task's worktree, resetting leftovers from an earlier run.
fn prepare_worktree(ctx: &RunContext<'_>, task: &Task) -> Result<Worktree> {
    let base = &ctx.config.parallel.base_branch;
    let worktree = ctx.worktrees.create(&task.id, task.display_title(), base)?;
    match worktree.status {
        WorktreeStatus::Created => Ok(worktree),
        WorktreeStatus::Passed | WorktreeStatus::Merged => {
            info!(task_id = %task.id, "discarding finished worktree from an earlier run");
            ctx.worktrees.remove(&task.id, true)?;
            ctx.worktrees.create(&task.id, task.display_title(), base)
        }
        WorktreeStatus::Executing | WorktreeStatus::Verifying | WorktreeStatus::Failed => {
            info!(task_id = %task.id, status = %worktree.status, "resetting abandoned worktree");
            let git = Git::new(&worktree.path);
            git.reset(ResetMode::Hard, "HEAD")?;
            git.clean_untracked()?;
            if worktree.status != WorktreeStatus::Failed {
                ctx.worktrees.set_status(
                    &task.id,
                    WorktreeStatus::Failed,
                    Some("abandoned by an earlier run".to_string()),
                )?;
            }
            ctx.worktrees
                .set_status(&task.id, WorktreeStatus::Created, None)
        }
    }
}

/// Stop when cancelled or when any circuit breaker refuses execution.
fn halt_reason(ctx: &RunContext<'_>) -> Result<Option<RunStop>> {
    if ctx.cancel.is_cancelled() {
        ctx.store.mark_interrupted(None)?;
        return Ok(Some(RunStop::Interrupted));
    }
    let now = Utc::now();
    let state = ctx.store.load()?;
    let open = state
        .circuit_breakers
        .values()
        .find(|breaker| !(*breaker).clone().can_execute(now));
    if let Some(breaker) = open {
        warn!(breaker = %breaker.name, failures = breaker.failures, "circuit breaker open, stopping run");
        return Ok(Some(RunStop::CircuitOpen));
    }
    Ok(None)
}

fn stop_label(stop: RunStop) -> &'static str {
    match stop {
        RunStop::Complete => "complete",
        RunStop::FirstWaveOnly => "first wave only",
        RunStop::CircuitOpen => "circuit breaker open",
        RunStop::Interrupted => "interrupted",
    }
}

fn split_groups(file_map: &TaskFileMap, wave: &[Task], parallel: &ParallelConfig) -> Vec<Vec<Task>> {
    let max_workers = parallel.max_workers.max(1);
    if parallel.conflict_check {
        file_map.split_wave_by_conflicts(wave, max_workers)
    } else {
        wave.chunks(max_workers).map(<[Task]>::to_vec).collect()
    }
}

fn pending_tasks(tasks: &[Task]) -> Vec<Task> {
    tasks.iter().filter(|task| !task.passes).cloned().collect()
}

fn task_ids(tasks: &[Task]) -> Vec<String> {
    tasks.iter().map(|task| task.id.clone()).collect()
}

fn is_configuration(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<OrchestratorError>()
            .is_some_and(OrchestratorError::is_configuration)
    })
}
