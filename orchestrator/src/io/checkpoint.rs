//! Restorable snapshots built on commits and lightweight tags.
//!
//! A checkpoint is a commit tagged `checkpoint/<id>` plus a metadata file in
//! `.up/checkpoints/<id>.json`. The manager operates on one checkout (the
//! main repository or a task worktree); metadata and the id list live in the
//! shared state directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::OrchestratorError;
use crate::io::atomic::{read_json, write_json};
use crate::io::git::{Git, ResetMode};
use crate::io::state_store::StateStore;

pub const TAG_PREFIX: &str = "checkpoint";
const CHECKPOINT_DIR: &str = "checkpoints";

static FILES_CHANGED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) files? changed").expect("files regex"));
static INSERTIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) insertions?\(\+\)").expect("insertions regex"));
static DELETIONS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) deletions?\(-\)").expect("deletions regex"));

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub id: String,
    pub commit_sha: String,
    pub tag_name: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    pub branch: String,
    #[serde(default)]
    pub files_changed: usize,
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub files: u64,
    pub insertions: u64,
    pub deletions: u64,
}

/// Optional attribution for a checkpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions<'a> {
    pub message: Option<&'a str>,
    pub task_id: Option<&'a str>,
    pub agent_id: Option<&'a str>,
    /// Commit dirty files before tagging.
    pub auto_commit: bool,
}

pub struct CheckpointManager<'a> {
    git: Git,
    checkpoint_dir: PathBuf,
    store: &'a StateStore,
}

impl<'a> CheckpointManager<'a> {
    /// Manage checkpoints of the checkout at `workdir`. Fails with
    /// `NotAGitRepo` unless `workdir` is inside a git work tree.
    pub fn new(workdir: &Path, store: &'a StateStore) -> Result<Self> {
        Ok(Self {
            git: Git::open(workdir)?,
            checkpoint_dir: store.up_dir().join(CHECKPOINT_DIR),
            store,
        })
    }

    pub fn tag_name(id: &str) -> String {
        format!("{TAG_PREFIX}/{id}")
    }

    /// Commit (optionally), tag HEAD and record the checkpoint.
    #[instrument(skip_all, fields(task_id = opts.task_id))]
    pub fn save(&self, opts: SaveOptions<'_>) -> Result<CheckpointMetadata> {
        let now = Utc::now();
        let stamp = now.format("%Y%m%d-%H%M%S-%3f");
        let base = match opts.task_id {
            Some(task) => format!("cp-{task}-{stamp}"),
            None => format!("cp-{stamp}"),
        };
        let mut id = base.clone();
        let mut suffix = 1;
        while self.metadata_path(&id).exists() {
            id = format!("{base}-{suffix}");
            suffix += 1;
        }

        let mut files_changed = 0;
        if opts.auto_commit {
            let dirty = self.git.status_porcelain()?;
            if !dirty.is_empty() {
                files_changed = dirty.len();
                let commit_message = opts
                    .message
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("checkpoint: {id}"));
                self.git
                    .commit_all(&commit_message)
                    .context("commit checkpoint changes")?;
            }
        }

        let tag_name = Self::tag_name(&id);
        self.git.tag_create(&tag_name)?;
        let metadata = CheckpointMetadata {
            commit_sha: self.git.head_sha()?,
            branch: self.git.current_branch().unwrap_or_else(|_| "HEAD".to_string()),
            message: opts.message.map(str::to_string).unwrap_or_else(|| {
                format!("checkpoint before {}", opts.task_id.unwrap_or("operation"))
            }),
            created_at: now,
            files_changed,
            task_id: opts.task_id.map(str::to_string),
            agent_id: opts.agent_id.map(str::to_string),
            tag_name,
            id,
        };
        write_json(&self.metadata_path(&metadata.id), &metadata)?;

        let pruned = self.store.add_checkpoint(&metadata.id, opts.task_id)?;
        for old in &pruned {
            self.discard(old);
        }
        info!(id = %metadata.id, sha = %metadata.commit_sha, pruned = pruned.len(), "checkpoint saved");
        Ok(metadata)
    }

    /// Reset the checkout to a checkpoint (`None` = last recorded).
    ///
    /// Looks up metadata first, then the tag; neither → `CheckpointNotFound`.
    #[instrument(skip_all, fields(id = id, hard))]
    pub fn restore(&self, id: Option<&str>, hard: bool) -> Result<CheckpointMetadata> {
        let id = match id {
            Some(id) => id.to_string(),
            None => self
                .store
                .load()?
                .loop_state
                .last_checkpoint
                .ok_or(OrchestratorError::CheckpointNotFound { id: None })?,
        };
        let metadata = match self.load_metadata(&id)? {
            Some(metadata) => metadata,
            None => {
                let tag_name = Self::tag_name(&id);
                let sha = self
                    .git
                    .rev_parse(&format!("refs/tags/{tag_name}"))?
                    .ok_or_else(|| OrchestratorError::CheckpointNotFound {
                        id: Some(id.clone()),
                    })?;
                CheckpointMetadata {
                    id: id.clone(),
                    commit_sha: sha,
                    tag_name,
                    message: "restored from tag".to_string(),
                    created_at: Utc::now(),
                    branch: self.git.current_branch().unwrap_or_else(|_| "HEAD".to_string()),
                    files_changed: 0,
                    task_id: None,
                    agent_id: None,
                }
            }
        };

        let mode = if hard { ResetMode::Hard } else { ResetMode::Soft };
        self.git.reset(mode, &metadata.commit_sha)?;
        self.store.record_rollback()?;
        info!(id = %metadata.id, sha = %metadata.commit_sha, "checkpoint restored");
        Ok(metadata)
    }

    /// Recorded checkpoints with readable metadata, newest first.
    pub fn list(&self, limit: usize) -> Result<Vec<CheckpointMetadata>> {
        let state = self.store.load()?;
        let mut out = Vec::new();
        for id in state.checkpoints.iter().rev().take(limit) {
            if let Some(metadata) = self.load_metadata(id)? {
                out.push(metadata);
            }
        }
        Ok(out)
    }

    pub fn last(&self) -> Result<Option<CheckpointMetadata>> {
        match self.store.load()?.loop_state.last_checkpoint {
            Some(id) => self.load_metadata(&id),
            None => Ok(None),
        }
    }

    /// Unified diff of the checkout's tracked files against a checkpoint
    /// commit, or against HEAD when `id` is `None`.
    pub fn diff_from_checkpoint(&self, id: Option<&str>) -> Result<String> {
        self.git.diff(&self.base_rev(id)?)
    }

    pub fn diff_stats(&self, id: Option<&str>) -> Result<DiffStats> {
        Ok(parse_stat_summary(&self.git.diff_stat(&self.base_rev(id)?)?))
    }

    pub fn changed_files(&self, id: &str) -> Result<Vec<String>> {
        let sha = self.resolve(id)?;
        self.git.diff_name_only(&sha)
    }

    /// Drop all but the newest `keep` checkpoints. Returns how many were removed.
    pub fn cleanup(&self, keep: usize) -> Result<usize> {
        let ids = self.store.load()?.checkpoints;
        if ids.len() <= keep {
            return Ok(0);
        }
        let split = ids.len() - keep;
        for id in &ids[..split] {
            self.discard(id);
        }
        self.store.set_checkpoints(ids[split..].to_vec())?;
        debug!(removed = split, "checkpoints cleaned up");
        Ok(split)
    }

    fn base_rev(&self, id: Option<&str>) -> Result<String> {
        match id {
            Some(id) => self.resolve(id),
            None => Ok("HEAD".to_string()),
        }
    }

    fn resolve(&self, id: &str) -> Result<String> {
        if let Some(metadata) = self.load_metadata(id)? {
            return Ok(metadata.commit_sha);
        }
        self.git
            .rev_parse(&format!("refs/tags/{}", Self::tag_name(id)))?
            .ok_or_else(|| {
                OrchestratorError::CheckpointNotFound {
                    id: Some(id.to_string()),
                }
                .into()
            })
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.checkpoint_dir.join(format!("{id}.json"))
    }

    fn load_metadata(&self, id: &str) -> Result<Option<CheckpointMetadata>> {
        let path = self.metadata_path(id);
        if !path.exists() {
            return Ok(None);
        }
        match read_json(&path) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(err) => {
                warn!(id, err = %format!("{err:#}"), "unreadable checkpoint metadata");
                Ok(None)
            }
        }
    }

    /// Best effort: a missing tag or file is already gone.
    fn discard(&self, id: &str) {
        if let Err(err) = self.git.tag_delete(&Self::tag_name(id)) {
            debug!(id, err = %err, "checkpoint tag not deleted");
        }
        let path = self.metadata_path(id);
        if path.exists()
            && let Err(err) = fs::remove_file(&path)
        {
            warn!(id, err = %err, "checkpoint metadata not removed");
        }
    }
}

fn parse_stat_summary(stat: &str) -> DiffStats {
    let Some(summary) = stat.lines().rev().find(|line| !line.trim().is_empty()) else {
        return DiffStats::default();
    };
    let capture = |re: &Regex| {
        re.captures(summary)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0)
    };
    DiffStats {
        files: capture(&FILES_CHANGED),
        insertions: capture(&INSERTIONS),
        deletions: capture(&DELETIONS),
    }
}
