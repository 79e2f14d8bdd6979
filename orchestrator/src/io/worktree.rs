//! Per-task git worktrees under `.worktrees/<task_id>` on `agent/<task_id>`.
//!
//! Each worktree has a JSON record in `.up/worktrees/<task_id>.json` tracking
//! its lifecycle status. Records are updated under a per-task file lock and
//! merges into the main checkout are serialized by `.up/merge.lock`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::types::{VerificationReport, WorktreeStatus};
use crate::error::OrchestratorError;
use crate::io::atomic::{read_json_if_exists, write_json};
use crate::io::git::{Git, ResetMode};
use crate::io::lock::FileLock;
use crate::io::state_store::{UP_DIR, ensure_self_ignored};

pub const WORKTREE_DIR: &str = ".worktrees";
pub const BRANCH_PREFIX: &str = "agent";
const RECORD_DIR: &str = "worktrees";
const MERGE_LOCK: &str = "merge.lock";
/// Local environment files copied into new worktrees when git ignores them.
const ENV_FILES: [&str; 3] = [".env", ".env.local", ".env.development"];

/// Persisted record of one task worktree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worktree {
    pub task_id: String,
    pub task_title: String,
    pub branch: String,
    pub path: PathBuf,
    pub base_branch: String,
    pub status: WorktreeStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub checkpoints: Vec<String>,
    #[serde(default)]
    pub verification: Option<VerificationReport>,
    #[serde(default)]
    pub error: Option<String>,
}

/// A `.worktrees/` entry from `git worktree list` with its record, if readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorktreeInfo {
    pub task_id: String,
    pub path: PathBuf,
    pub branch: Option<String>,
    pub head: Option<String>,
    /// `None` when the record is missing or unreadable.
    pub state: Option<Worktree>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeOutcome {
    pub task_id: String,
    pub target_branch: String,
    /// HEAD of the target after the merge.
    pub commit_sha: String,
    /// False when the branch had nothing new to bring in.
    pub committed: bool,
}

pub struct WorktreeManager {
    git: Git,
    root: PathBuf,
    record_dir: PathBuf,
    merge_lock: PathBuf,
    lock_timeout: Duration,
    /// Paths in the main checkout that may be dirty when merging.
    dirty_allowed: Vec<String>,
}

impl WorktreeManager {
    /// Manager for the repository checked out at `root`.
    pub fn new(root: &Path, lock_timeout: Duration) -> Result<Self> {
        Git::open(root)?;
        let root = fs::canonicalize(root).with_context(|| format!("resolve {}", root.display()))?;
        let up_dir = root.join(UP_DIR);
        Ok(Self {
            git: Git::new(&root),
            record_dir: up_dir.join(RECORD_DIR),
            merge_lock: up_dir.join(MERGE_LOCK),
            root,
            lock_timeout,
            dirty_allowed: Vec::new(),
        })
    }

    /// Tolerate uncommitted changes under `prefixes` in the main checkout
    /// (for example an untracked task file) when merging.
    pub fn allow_dirty(mut self, prefixes: Vec<String>) -> Self {
        self.dirty_allowed = prefixes;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.root.join(WORKTREE_DIR).join(task_id)
    }

    pub fn branch_name(task_id: &str) -> String {
        format!("{BRANCH_PREFIX}/{task_id}")
    }

    /// Provision (or reuse) the worktree for `task_id` branched from `base_branch`.
    #[instrument(skip_all, fields(task_id, base_branch))]
    pub fn create(&self, task_id: &str, task_title: &str, base_branch: &str) -> Result<Worktree> {
        if !self.git.branch_exists(base_branch)? {
            return Err(OrchestratorError::UnknownBranch {
                branch: base_branch.to_string(),
            }
            .into());
        }
        ensure_self_ignored(&self.root.join(WORKTREE_DIR))?;

        let path = self.worktree_path(task_id);
        let branch = Self::branch_name(task_id);

        if path.exists() {
            match self.load_state(task_id) {
                Ok(Some(existing)) if self.is_registered(&path)? => {
                    info!(task_id, status = %existing.status, "reusing existing worktree");
                    return Ok(existing);
                }
                _ => {
                    warn!(task_id, path = %path.display(), "stale worktree directory, recreating");
                    self.discard_directory(&path)?;
                }
            }
        }

        if let Err(err) = self.git.worktree_add_new_branch(&path, &branch, base_branch) {
            if !self.git.branch_exists(&branch)? {
                return Err(err);
            }
            debug!(task_id, branch, "branch exists, attaching worktree to it");
            self.git
                .worktree_add_existing(&path, &branch)
                .with_context(|| format!("attach worktree for {task_id}"))?;
        }

        self.copy_env_files(&path)?;

        let now = Utc::now();
        let record = Worktree {
            task_id: task_id.to_string(),
            task_title: task_title.to_string(),
            branch,
            path,
            base_branch: base_branch.to_string(),
            status: WorktreeStatus::Created,
            started_at: now,
            updated_at: now,
            checkpoints: Vec::new(),
            verification: None,
            error: None,
        };
        {
            let _lock = self.record_lock(task_id)?;
            write_json(&self.record_path(task_id), &record)?;
        }
        info!(task_id, path = %record.path.display(), "worktree created");
        Ok(record)
    }

    /// Remove the worktree, its branch and its record. Missing pieces are skipped.
    #[instrument(skip_all, fields(task_id, force))]
    pub fn remove(&self, task_id: &str, force: bool) -> Result<()> {
        let path = self.worktree_path(task_id);
        if path.exists() {
            if force {
                self.discard_directory(&path)?;
            } else {
                self.git.worktree_remove(&path, false)?;
            }
        }
        let branch = Self::branch_name(task_id);
        if self.git.branch_exists(&branch)? {
            self.git.delete_branch(&branch, force)?;
        }
        let record = self.record_path(task_id);
        if record.exists() {
            fs::remove_file(&record).with_context(|| format!("remove {}", record.display()))?;
        }
        debug!(task_id, "worktree removed");
        Ok(())
    }

    /// Task worktrees known to git, with their records attached.
    pub fn list(&self) -> Result<Vec<WorktreeInfo>> {
        let base = self.root.join(WORKTREE_DIR);
        let mut infos = Vec::new();
        for entry in self.git.worktree_list()? {
            let path = fs::canonicalize(&entry.path).unwrap_or(entry.path.clone());
            let Ok(rel) = path.strip_prefix(&base) else {
                continue;
            };
            let Some(task_id) = rel.to_str().map(str::to_string) else {
                continue;
            };
            let state = match self.load_state(&task_id) {
                Ok(state) => state,
                Err(err) => {
                    warn!(task_id, err = %format!("{err:#}"), "unreadable worktree record");
                    None
                }
            };
            infos.push(WorktreeInfo {
                task_id,
                path,
                branch: entry.branch,
                head: entry.head,
                state,
            });
        }
        Ok(infos)
    }

    pub fn load_state(&self, task_id: &str) -> Result<Option<Worktree>> {
        read_json_if_exists(&self.record_path(task_id))
    }

    /// Apply `f` to the record under its lock. A status change outside the
    /// lifecycle is refused and nothing is written.
    pub fn update_state(&self, task_id: &str, f: impl FnOnce(&mut Worktree)) -> Result<Worktree> {
        let _lock = self.record_lock(task_id)?;
        let mut record = self
            .load_state(task_id)?
            .ok_or_else(|| OrchestratorError::WorktreeNotFound {
                task_id: task_id.to_string(),
            })?;
        let from = record.status;
        f(&mut record);
        if !from.can_transition_to(record.status) {
            return Err(OrchestratorError::IllegalTransition {
                task_id: task_id.to_string(),
                from: from.to_string(),
                to: record.status.to_string(),
            }
            .into());
        }
        record.updated_at = Utc::now();
        write_json(&self.record_path(task_id), &record)?;
        if from != record.status {
            debug!(task_id, %from, to = %record.status, "worktree status changed");
        }
        Ok(record)
    }

    pub fn set_status(
        &self,
        task_id: &str,
        status: WorktreeStatus,
        error: Option<String>,
    ) -> Result<Worktree> {
        self.update_state(task_id, |record| {
            record.status = status;
            if error.is_some() {
                record.error = error;
            }
        })
    }

    /// Bring the task branch into `target_branch` in the main checkout.
    ///
    /// Squash merges commit with `message` (default `feat(<id>): <title>`).
    /// Any failure resets the main checkout to its pre-merge HEAD and leaves
    /// the worktree untouched; success tears the worktree down.
    #[instrument(skip_all, fields(task_id, target_branch, squash))]
    pub fn merge(
        &self,
        task_id: &str,
        target_branch: &str,
        squash: bool,
        message: Option<&str>,
    ) -> Result<MergeOutcome> {
        let _merge_guard = FileLock::acquire(&self.merge_lock, self.lock_timeout)?;
        let record = self
            .load_state(task_id)?
            .ok_or_else(|| OrchestratorError::WorktreeNotFound {
                task_id: task_id.to_string(),
            })?;
        if !record.status.can_transition_to(WorktreeStatus::Merged) {
            return Err(OrchestratorError::IllegalTransition {
                task_id: task_id.to_string(),
                from: record.status.to_string(),
                to: WorktreeStatus::Merged.to_string(),
            }
            .into());
        }

        let allowed: Vec<&str> = self.dirty_allowed.iter().map(String::as_str).collect();
        self.git
            .ensure_clean_except_prefixes(&allowed)
            .context("main checkout must be clean before merging")?;
        if self.git.current_branch()? != target_branch {
            self.git.checkout_branch(target_branch)?;
        }
        let before = self.git.head_sha()?;
        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| format!("feat({task_id}): {}", record.task_title));

        let attempt = if squash {
            self.git
                .merge_squash(&record.branch)
                .and_then(|()| self.git.commit_staged(&message))
        } else {
            self.git
                .merge_no_ff(&record.branch, &message)
                .map(|()| true)
        };
        let committed = match attempt {
            Ok(committed) => committed,
            Err(err) => {
                warn!(task_id, err = %format!("{err:#}"), "merge failed, restoring main checkout");
                self.git
                    .reset(ResetMode::Hard, &before)
                    .context("restore main checkout after failed merge")?;
                return Err(err.context(format!("merge {} into {target_branch}", record.branch)));
            }
        };

        let commit_sha = self.git.head_sha()?;
        self.set_status(task_id, WorktreeStatus::Merged, None)?;
        self.remove(task_id, true)?;
        info!(task_id, commit = %commit_sha, committed, "worktree merged");
        Ok(MergeOutcome {
            task_id: task_id.to_string(),
            target_branch: target_branch.to_string(),
            commit_sha,
            committed,
        })
    }

    fn record_path(&self, task_id: &str) -> PathBuf {
        self.record_dir.join(format!("{task_id}.json"))
    }

    fn record_lock(&self, task_id: &str) -> Result<FileLock> {
        FileLock::acquire(
            &self.record_dir.join(format!("{task_id}.json.lock")),
            self.lock_timeout,
        )
    }

    fn is_registered(&self, path: &Path) -> Result<bool> {
        let wanted = fs::canonicalize(path).unwrap_or(path.to_path_buf());
        Ok(self.git.worktree_list()?.iter().any(|entry| {
            fs::canonicalize(&entry.path).unwrap_or(entry.path.clone()) == wanted
        }))
    }

    /// Force-remove a worktree directory whether or not git still tracks it.
    fn discard_directory(&self, path: &Path) -> Result<()> {
        if let Err(err) = self.git.worktree_remove(path, true) {
            debug!(path = %path.display(), err = %format!("{err:#}"), "worktree remove failed, deleting directory");
        }
        if path.exists() {
            fs::remove_dir_all(path).with_context(|| format!("remove {}", path.display()))?;
        }
        self.git.worktree_prune()
    }

    fn copy_env_files(&self, worktree: &Path) -> Result<()> {
        for name in ENV_FILES {
            let source = self.root.join(name);
            if !source.is_file() {
                continue;
            }
            if !self.git.is_ignored(name)? {
                debug!(file = name, "env file is tracked or unignored, not copying");
                continue;
            }
            fs::copy(&source, worktree.join(name))
                .with_context(|| format!("copy {name} into {}", worktree.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    fn manager(repo: &TestRepo) -> WorktreeManager {
        WorktreeManager::new(repo.path(), Duration::from_secs(5)).expect("manager")
    }

    #[test]
    fn create_provisions_branch_and_record() {
        let repo = TestRepo::new();
        let manager = manager(&repo);
        let wt = manager.create("T1", "First", "main").expect("create");

        assert_eq!(wt.branch, "agent/T1");
        assert_eq!(wt.status, WorktreeStatus::Created);
        assert!(wt.path.join("README.md").exists());
        assert!(repo.git().branch_exists("agent/T1").expect("branch"));
        assert_eq!(manager.load_state("T1").expect("load"), Some(wt.clone()));

        let again = manager.create("T1", "First", "main").expect("reuse");
        assert_eq!(again.started_at, wt.started_at);
    }

    #[test]
    fn unknown_base_branch_is_a_configuration_error() {
        let repo = TestRepo::new();
        let err = manager(&repo)
            .create("T1", "First", "nope")
            .expect_err("unknown base");
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::UnknownBranch { .. })
        ));
    }

    #[test]
    fn stale_directory_without_record_is_recreated() {
        let repo = TestRepo::new();
        let manager = manager(&repo);
        let path = manager.worktree_path("T1");
        fs::create_dir_all(&path).expect("mkdir");
        fs::write(path.join("junk.txt"), "x").expect("write");

        let wt = manager.create("T1", "First", "main").expect("create");
        assert!(!wt.path.join("junk.txt").exists());
        assert!(wt.path.join("README.md").exists());
    }

    #[test]
    fn existing_branch_is_reattached() {
        let repo = TestRepo::new();
        let manager = manager(&repo);
        manager.create("T1", "First", "main").expect("create");
        fs::write(manager.worktree_path("T1").join("work.txt"), "done").expect("write");
        Git::new(manager.worktree_path("T1"))
            .commit_all("work")
            .expect("commit");
        // Drop the directory and record but keep the branch.
        manager.discard_directory(&manager.worktree_path("T1")).expect("discard");
        fs::remove_file(manager.record_path("T1")).expect("record");

        let wt = manager.create("T1", "First", "main").expect("recreate");
        assert!(wt.path.join("work.txt").exists());
    }

    #[test]
    fn env_files_are_copied_only_when_ignored() {
        let repo = TestRepo::new();
        repo.write(".gitignore", ".env\n");
        repo.commit_all("ignore env");
        repo.write(".env", "TOKEN=1\n");
        repo.write(".env.local", "LOCAL=1\n");
        repo.commit_all("track env.local");

        let wt = manager(&repo).create("T1", "First", "main").expect("create");
        assert_eq!(fs::read_to_string(wt.path.join(".env")).expect("env"), "TOKEN=1\n");
    }

    #[test]
    fn list_reports_records_and_tolerates_corruption() {
        let repo = TestRepo::new();
        let manager = manager(&repo);
        manager.create("T1", "First", "main").expect("create");
        manager.create("T2", "Second", "main").expect("create");
        fs::write(manager.record_path("T2"), "{broken").expect("corrupt");

        let mut infos = manager.list().expect("list");
        infos.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        assert_eq!(infos.len(), 2);
        assert_eq!(infos[0].branch.as_deref(), Some("agent/T1"));
        assert!(infos[0].state.is_some());
        assert!(infos[1].state.is_none());
    }

    #[test]
    fn illegal_transition_is_not_persisted() {
        let repo = TestRepo::new();
        let manager = manager(&repo);
        manager.create("T1", "First", "main").expect("create");

        let err = manager
            .set_status("T1", WorktreeStatus::Merged, None)
            .expect_err("created -> merged");
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::IllegalTransition { .. })
        ));
        let record = manager.load_state("T1").expect("load").expect("record");
        assert_eq!(record.status, WorktreeStatus::Created);

        manager
            .set_status("T1", WorktreeStatus::Executing, None)
            .expect("executing");
        manager
            .set_status("T1", WorktreeStatus::Failed, Some("boom".to_string()))
            .expect("failed");
        let record = manager
            .set_status("T1", WorktreeStatus::Created, None)
            .expect("rollback");
        assert_eq!(record.error.as_deref(), Some("boom"));
    }

    fn pass(manager: &WorktreeManager, task_id: &str) {
        for status in [
            WorktreeStatus::Executing,
            WorktreeStatus::Verifying,
            WorktreeStatus::Passed,
        ] {
            manager.set_status(task_id, status, None).expect("status");
        }
    }

    #[test]
    fn squash_merge_lands_on_target_and_tears_down() {
        let repo = TestRepo::new();
        let manager = manager(&repo);
        let wt = manager.create("T1", "Add feature", "main").expect("create");
        fs::write(wt.path.join("feature.txt"), "feature").expect("write");
        Git::new(&wt.path).commit_all("wip").expect("commit");
        pass(&manager, "T1");

        let outcome = manager.merge("T1", "main", true, None).expect("merge");
        assert!(outcome.committed);
        assert_eq!(repo.read("feature.txt"), "feature");
        assert!(!wt.path.exists());
        assert!(!repo.git().branch_exists("agent/T1").expect("branch"));
        assert_eq!(manager.load_state("T1").expect("load"), None);
    }

    #[test]
    fn conflicting_merge_restores_main_and_keeps_worktree() {
        let repo = TestRepo::new();
        let manager = manager(&repo);
        let wt = manager.create("T1", "Edit readme", "main").expect("create");
        fs::write(wt.path.join("README.md"), "from task\n").expect("write");
        Git::new(&wt.path).commit_all("task edit").expect("commit");
        pass(&manager, "T1");

        repo.write("README.md", "from main\n");
        repo.commit_all("main edit");
        let before = repo.git().head_sha().expect("head");

        manager
            .merge("T1", "main", true, None)
            .expect_err("conflict");
        assert_eq!(repo.git().head_sha().expect("head"), before);
        assert_eq!(repo.read("README.md"), "from main\n");
        assert!(repo.git().status_porcelain().expect("status").is_empty());
        assert!(wt.path.exists());
        assert_eq!(
            manager.load_state("T1").expect("load").map(|r| r.status),
            Some(WorktreeStatus::Passed)
        );
    }

    #[test]
    fn merge_requires_passed_status() {
        let repo = TestRepo::new();
        let manager = manager(&repo);
        manager.create("T1", "First", "main").expect("create");
        let err = manager.merge("T1", "main", true, None).expect_err("not passed");
        assert!(matches!(
            err.downcast_ref::<OrchestratorError>(),
            Some(OrchestratorError::IllegalTransition { .. })
        ));
    }
}
