//! One task inside its worktree: checkpoint, execute, verify, then either
//! commit and accept the provenance entry or roll back and reject it.
//!
//! Attempts repeat up to `max_attempts_per_task` while the task's circuit
//! breaker allows them. Every failed attempt is rolled back to the checkpoint
//! taken before it, so the worktree never keeps unrecorded changes.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::circuit::BreakerState;
use crate::core::types::{Task, VerificationReport, WorktreeStatus};
use crate::error::is_store_level;
use crate::events::ProgressEvent;
use crate::io::checkpoint::{CheckpointManager, SaveOptions};
use crate::io::executor::ExecRequest;
use crate::io::git::Git;
use crate::io::knowledge::KnowledgeCategory;
use crate::io::prompt::{PromptInputs, render_task_prompt};
use crate::io::provenance::{Completion, ProvenanceLedger, ProvenanceStatus, StartOperation};
use crate::io::state_store::ContextStatus;
use crate::io::worktree::Worktree;
use crate::orchestrate::RunContext;

pub const DEFAULT_BREAKER: &str = "default";
pub const PROVENANCE_DIR: &str = "provenance";
const LOG_DIR: &str = "logs";
pub const INTERRUPTED: &str = "interrupted";

/// Circuit breaker guarding a task: one per category.
pub fn breaker_name(task: &Task) -> &str {
    task.category
        .as_deref()
        .map(str::trim)
        .filter(|category| !category.is_empty())
        .unwrap_or(DEFAULT_BREAKER)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Passed,
    Failed,
    /// Not attempted: the circuit breaker was open.
    Blocked,
    /// Not attempted: a dependency failed or the run stopped.
    Skipped,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub kind: OutcomeKind,
    pub attempts: u32,
    pub reason: Option<String>,
    /// Every provenance entry created for this task, oldest first.
    pub provenance_ids: Vec<String>,
    pub verification: Option<VerificationReport>,
    /// Commit on the base branch once merged.
    pub merge_commit: Option<String>,
}

impl TaskOutcome {
    fn new(task_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            kind: OutcomeKind::Failed,
            attempts: 0,
            reason: None,
            provenance_ids: Vec::new(),
            verification: None,
            merge_commit: None,
        }
    }

    pub fn skipped(task_id: &str, reason: impl Into<String>) -> Self {
        Self {
            kind: OutcomeKind::Skipped,
            reason: Some(reason.into()),
            ..Self::new(task_id)
        }
    }

    pub fn failed(task_id: &str, reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new(task_id)
        }
    }

    pub fn last_provenance_id(&self) -> Option<&str> {
        self.provenance_ids.last().map(String::as_str)
    }
}

enum AttemptResult {
    Passed(VerificationReport),
    Failed {
        reason: String,
        cancelled: bool,
        verification: Option<VerificationReport>,
    },
}

/// What an attempt created before it ended, so a failure can undo it.
#[derive(Default)]
struct AttemptProgress {
    checkpoint_id: Option<String>,
    provenance_id: Option<String>,
}

/// Run `task` in its provisioned worktree.
///
/// Task-level failures become a `TaskOutcome`; only store-level errors
/// (lock timeout, corrupt state) are returned as errors, after rollback.
#[instrument(skip_all, fields(task_id = %task.id))]
pub fn run_task(
    ctx: &RunContext<'_>,
    task: &Task,
    worktree: &Worktree,
    touched: &BTreeSet<String>,
) -> Result<TaskOutcome> {
    let breaker = breaker_name(task);
    let checkpoints = CheckpointManager::new(&worktree.path, ctx.store)?;
    let ledger = ProvenanceLedger::new(
        ctx.store.up_dir().join(PROVENANCE_DIR),
        worktree.branch.clone(),
        worktree.path.clone(),
        ctx.store.lock_timeout(),
    );
    let max_attempts = ctx.config.parallel.max_attempts_per_task.max(1);
    let mut outcome = TaskOutcome::new(&task.id);
    let mut previous_failure: Option<String> = None;

    for attempt in 1..=max_attempts {
        if ctx.cancel.is_cancelled() {
            outcome.kind = OutcomeKind::Interrupted;
            outcome.reason = Some(INTERRUPTED.to_string());
            ctx.store.mark_interrupted(Some(&task.id))?;
            return Ok(outcome);
        }
        let check = ctx.store.breaker_can_execute(breaker)?;
        if !check.allowed {
            ctx.events.emit(ProgressEvent::CircuitBreakerTripped {
                name: breaker.to_string(),
                failures: check.failures,
                cooldown_remaining_secs: check.cooldown_remaining.as_secs(),
            });
            outcome.kind = OutcomeKind::Blocked;
            outcome.reason = Some(format!("circuit breaker {breaker} is open"));
            return Ok(outcome);
        }

        outcome.attempts = attempt;
        let mut progress = AttemptProgress::default();
        let result = run_attempt(
            ctx,
            task,
            worktree,
            touched,
            &checkpoints,
            &ledger,
            attempt,
            previous_failure.as_deref(),
            &mut progress,
        );
        if let Some(id) = &progress.provenance_id {
            outcome.provenance_ids.push(id.clone());
        }

        let (reason, cancelled) = match result {
            Ok(AttemptResult::Passed(report)) => {
                ctx.store.record_breaker_success(breaker)?;
                outcome.kind = OutcomeKind::Passed;
                outcome.reason = None;
                outcome.verification = Some(report);
                info!(attempt, "task passed");
                return Ok(outcome);
            }
            Ok(AttemptResult::Failed {
                reason,
                cancelled,
                verification,
            }) => {
                outcome.verification = verification;
                (reason, cancelled)
            }
            Err(err) => {
                let reason = format!("{err:#}");
                if is_store_level(&err) {
                    // Undo what we can, then let the caller stop the run.
                    if let Err(undo) = undo_attempt(ctx, task, worktree, &checkpoints, &ledger, &progress, &reason) {
                        warn!(err = %format!("{undo:#}"), "rollback after store failure also failed");
                    }
                    return Err(err);
                }
                (reason, ctx.cancel.is_cancelled())
            }
        };

        warn!(attempt, reason = %reason, "task attempt failed");
        let reason = if cancelled { INTERRUPTED.to_string() } else { reason };
        outcome.reason = Some(reason.clone());
        if let Err(err) = undo_attempt(ctx, task, worktree, &checkpoints, &ledger, &progress, &reason) {
            if is_store_level(&err) {
                return Err(err);
            }
            // Without a clean rollback another attempt would build on partial changes.
            outcome.kind = OutcomeKind::Failed;
            outcome.reason = Some(format!("{reason}; rollback failed: {err:#}"));
            return Ok(outcome);
        }

        if cancelled {
            ctx.store.mark_interrupted(Some(&task.id))?;
            outcome.kind = OutcomeKind::Interrupted;
            return Ok(outcome);
        }
        let headline = reason.lines().next().unwrap_or_default();
        ctx.knowledge.add_warning(
            &task.id,
            &format!("task {} attempt {attempt} failed: {headline}", task.id),
        )?;

        let tripped = ctx.store.record_breaker_failure(breaker)?;
        if tripped.state == BreakerState::Open {
            let remaining = tripped.cooldown_remaining(chrono::Utc::now());
            ctx.events.emit(ProgressEvent::CircuitBreakerTripped {
                name: breaker.to_string(),
                failures: tripped.failures,
                cooldown_remaining_secs: remaining.as_secs(),
            });
            warn!(breaker, failures = tripped.failures, "circuit breaker opened");
            outcome.kind = OutcomeKind::Failed;
            return Ok(outcome);
        }

        if attempt < max_attempts {
            ctx.worktrees.set_status(&task.id, WorktreeStatus::Created, None)?;
            debug!(attempt, "retrying after rollback");
        }
        previous_failure = Some(reason);
    }

    outcome.kind = OutcomeKind::Failed;
    Ok(outcome)
}

#[allow(clippy::too_many_arguments)]
fn run_attempt(
    ctx: &RunContext<'_>,
    task: &Task,
    worktree: &Worktree,
    touched: &BTreeSet<String>,
    checkpoints: &CheckpointManager<'_>,
    ledger: &ProvenanceLedger,
    attempt: u32,
    previous_failure: Option<&str>,
    progress: &mut AttemptProgress,
) -> Result<AttemptResult> {
    set_status(ctx, task, WorktreeStatus::Executing, attempt, None)?;

    let message = format!("checkpoint before {} attempt {attempt}", task.id);
    let checkpoint = checkpoints.save(SaveOptions {
        message: Some(&message),
        task_id: Some(&task.id),
        agent_id: Some(&worktree.branch),
        auto_commit: true,
    })?;
    progress.checkpoint_id = Some(checkpoint.id.clone());
    ctx.worktrees
        .update_state(&task.id, |record| record.checkpoints.push(checkpoint.id.clone()))?;

    let shared_context = ctx.knowledge.get_context_for_agent(&task.id)?;
    let prompt = render_task_prompt(PromptInputs {
        task,
        shared_context: &shared_context,
        previous_failure,
    })?;
    let context_files: Vec<String> = touched
        .iter()
        .filter(|path| worktree.path.join(path).is_file())
        .cloned()
        .collect();
    let entry = ledger.start_operation(StartOperation {
        task_id: &task.id,
        task_title: task.display_title(),
        prompt: &prompt,
        ai_model: ctx.executor.model(),
        context_files: &context_files,
        branch: &worktree.branch,
    })?;
    progress.provenance_id = Some(entry.id.clone());

    let request = ExecRequest {
        task_id: task.id.clone(),
        workdir: worktree.path.clone(),
        prompt: prompt.clone(),
        log_path: ctx
            .store
            .up_dir()
            .join(LOG_DIR)
            .join(format!("{}-attempt-{attempt}.log", task.id)),
        timeout: Duration::from_secs(ctx.config.executor.timeout_secs),
        output_limit_bytes: ctx.config.executor.output_limit_bytes,
        cancel: Some(ctx.cancel.clone()),
    };
    let exec = ctx.executor.execute(&request)?;

    let tokens = ((prompt.len() + exec.output.len()) / 4) as u64;
    match ctx.store.record_context_usage(&task.id, tokens)? {
        ContextStatus::Ok => {}
        status => warn!(?status, "context budget running low"),
    }

    if !exec.success || ctx.cancel.is_cancelled() {
        return Ok(AttemptResult::Failed {
            reason: exec.failure_reason(),
            cancelled: exec.cancelled || ctx.cancel.is_cancelled(),
            verification: None,
        });
    }

    set_status(ctx, task, WorktreeStatus::Verifying, attempt, None)?;
    let report = ctx.verifier.verify(&worktree.path)?;
    let recorded = report.clone();
    ctx.worktrees
        .update_state(&task.id, |record| record.verification = Some(recorded))?;
    if !report.passed() {
        let mut reason = format!("verification failed: {}", report.failed_checks().join(", "));
        if let Some(detail) = &report.failure_detail {
            reason.push('\n');
            reason.push_str(detail);
        }
        return Ok(AttemptResult::Failed {
            reason,
            cancelled: false,
            verification: Some(report),
        });
    }

    let git = Git::new(&worktree.path);
    git.commit_all(&format!("feat({}): {}", task.id, task.display_title()))?;
    let head = git.head_sha()?;
    let stats = git.numstat(&checkpoint.commit_sha, &head)?;
    let files_modified: Vec<String> = stats.iter().map(|entry| entry.path.clone()).collect();
    ledger.complete_operation(
        &entry.id,
        Completion {
            lines_added: stats.iter().map(|entry| entry.added).sum(),
            lines_removed: stats.iter().map(|entry| entry.removed).sum(),
            files_modified: files_modified.clone(),
            commit_sha: Some(head),
            tests_passed: report.tests.as_bool(),
            lint_passed: report.lint.as_bool(),
            type_check_passed: report.type_check.as_bool(),
        },
    )?;
    set_status(ctx, task, WorktreeStatus::Passed, attempt, None)?;

    let note = if files_modified.is_empty() {
        format!("completed {}", task.display_title())
    } else {
        format!(
            "completed {}; changed {}",
            task.display_title(),
            files_modified.join(", ")
        )
    };
    ctx.knowledge
        .add_entry(&task.id, KnowledgeCategory::Discovery, &note)?;
    Ok(AttemptResult::Passed(report))
}

/// Reject the attempt's provenance entry and reset the worktree to the
/// checkpoint taken before the attempt.
fn undo_attempt(
    ctx: &RunContext<'_>,
    task: &Task,
    worktree: &Worktree,
    checkpoints: &CheckpointManager<'_>,
    ledger: &ProvenanceLedger,
    progress: &AttemptProgress,
    reason: &str,
) -> Result<()> {
    if let Some(id) = &progress.provenance_id {
        match ledger.get_entry(id)? {
            Some(entry) if entry.status == ProvenanceStatus::Pending => {
                ledger.reject_operation(id, reason)?;
            }
            _ => {}
        }
    }
    if let Some(id) = &progress.checkpoint_id {
        checkpoints.restore(Some(id.as_str()), true)?;
        Git::new(&worktree.path).clean_untracked()?;
    }
    let current = ctx
        .worktrees
        .load_state(&task.id)?
        .map(|record| record.status);
    if matches!(
        current,
        Some(WorktreeStatus::Executing | WorktreeStatus::Verifying)
    ) {
        set_status(ctx, task, WorktreeStatus::Failed, 0, Some(reason.to_string()))?;
    }
    Ok(())
}

fn set_status(
    ctx: &RunContext<'_>,
    task: &Task,
    status: WorktreeStatus,
    attempt: u32,
    error: Option<String>,
) -> Result<()> {
    ctx.worktrees.set_status(&task.id, status, error.clone())?;
    ctx.store.update_agent_status(&task.id, status, error)?;
    ctx.events.emit(ProgressEvent::TaskStatusChanged {
        task_id: task.id.clone(),
        status,
        attempt,
    });
    Ok(())
}
