//! Content-addressed ledger of generation attempts.
//!
//! One JSON file per entry under `.up/provenance/`, plus `index.json` mapping
//! task ids to their latest entry and workspaces to their chain head. Entries
//! of one workspace form a linear chain through `parent_id`; the head moves
//! when an entry is finalized (accepted or rejected).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::provenance_id::{derive_id, hash_context, hash_prompt};
use crate::error::OrchestratorError;
use crate::io::atomic::{read_json, read_json_if_exists, write_json};
use crate::io::lock::FileLock;

const INDEX_FILE: &str = "index.json";
const INDEX_LOCK: &str = "index.json.lock";
const PREVIEW_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvenanceStatus {
    Pending,
    Accepted,
    Rejected,
    Reverted,
}

impl ProvenanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProvenanceStatus::Pending => "pending",
            ProvenanceStatus::Accepted => "accepted",
            ProvenanceStatus::Rejected => "rejected",
            ProvenanceStatus::Reverted => "reverted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceEntry {
    pub id: String,
    pub parent_id: Option<String>,
    /// Chain the entry belongs to (one per worktree branch).
    pub workspace: String,
    pub ai_model: String,
    pub task_id: String,
    pub task_title: String,
    pub prompt_hash: String,
    pub prompt_preview: String,
    pub context_files: Vec<String>,
    pub context_hash: String,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub lines_added: u64,
    #[serde(default)]
    pub lines_removed: u64,
    #[serde(default)]
    pub commit_sha: Option<String>,
    pub branch: String,
    #[serde(default)]
    pub tests_passed: Option<bool>,
    #[serde(default)]
    pub lint_passed: Option<bool>,
    #[serde(default)]
    pub type_check_passed: Option<bool>,
    #[serde(default)]
    pub verification_notes: Option<String>,
    pub status: ProvenanceStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Inputs recorded when an operation starts.
#[derive(Debug, Clone)]
pub struct StartOperation<'a> {
    pub task_id: &'a str,
    pub task_title: &'a str,
    pub prompt: &'a str,
    pub ai_model: &'a str,
    /// Paths relative to the ledger's context root.
    pub context_files: &'a [String],
    pub branch: &'a str,
}

/// Results recorded when an operation is finalized.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    pub files_modified: Vec<String>,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub commit_sha: Option<String>,
    pub tests_passed: Option<bool>,
    pub lint_passed: Option<bool>,
    pub type_check_passed: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProvenanceStats {
    pub total_operations: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub pending: usize,
    pub reverted: usize,
    pub acceptance_rate: f64,
    pub total_lines_added: u64,
    pub total_lines_removed: u64,
    pub tests_run: usize,
    pub tests_passed: usize,
    pub test_pass_rate: f64,
    pub models_used: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct LedgerIndex {
    /// task id -> latest entry id
    tasks: BTreeMap<String, String>,
    /// workspace -> id of the most recently finalized entry
    heads: BTreeMap<String, String>,
}

pub struct ProvenanceLedger {
    dir: PathBuf,
    workspace: String,
    context_root: PathBuf,
    lock_timeout: Duration,
}

impl ProvenanceLedger {
    /// Ledger stored in `dir`, chaining entries under `workspace`. Context
    /// files are read relative to `context_root`.
    pub fn new(
        dir: impl Into<PathBuf>,
        workspace: impl Into<String>,
        context_root: impl Into<PathBuf>,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            dir: dir.into(),
            workspace: workspace.into(),
            context_root: context_root.into(),
            lock_timeout,
        }
    }

    pub fn workspace(&self) -> &str {
        &self.workspace
    }

    /// Record a pending entry. Its id is derived from the task id, prompt hash,
    /// context hash and the current chain head.
    #[instrument(skip_all, fields(task_id = op.task_id, workspace = %self.workspace))]
    pub fn start_operation(&self, op: StartOperation<'_>) -> Result<ProvenanceEntry> {
        let mut context_files: Vec<String> = op.context_files.to_vec();
        context_files.sort();
        context_files.dedup();
        let contents = self.read_context(&context_files);
        let context_hash = hash_context(
            contents
                .iter()
                .map(|(path, bytes)| (path.as_str(), bytes.as_slice())),
        );
        let prompt_hash = hash_prompt(op.prompt);

        let _guard = self.lock()?;
        let mut index = self.load_index()?;
        let parent_id = index.heads.get(&self.workspace).cloned();
        let id = derive_id(op.task_id, &prompt_hash, &context_hash, parent_id.as_deref());

        if let Some(existing) = self.load_entry(&id)?
            && existing.status != ProvenanceStatus::Pending
        {
            return Err(OrchestratorError::AlreadyFinalized {
                id,
                status: existing.status.as_str().to_string(),
            }
            .into());
        }

        let entry = ProvenanceEntry {
            id: id.clone(),
            parent_id,
            workspace: self.workspace.clone(),
            ai_model: op.ai_model.to_string(),
            task_id: op.task_id.to_string(),
            task_title: op.task_title.to_string(),
            prompt_hash,
            prompt_preview: preview(op.prompt),
            context_files,
            context_hash,
            files_modified: Vec::new(),
            lines_added: 0,
            lines_removed: 0,
            commit_sha: None,
            branch: op.branch.to_string(),
            tests_passed: None,
            lint_passed: None,
            type_check_passed: None,
            verification_notes: None,
            status: ProvenanceStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
        };
        write_json(&self.entry_path(&id), &entry)?;
        index.tasks.insert(entry.task_id.clone(), id);
        write_json(&self.dir.join(INDEX_FILE), &index)?;
        debug!(id = %entry.id, parent = ?entry.parent_id, "provenance entry started");
        Ok(entry)
    }

    /// Finalize a pending entry with its results.
    #[instrument(skip_all, fields(id))]
    pub fn complete_operation(&self, id: &str, completion: Completion) -> Result<ProvenanceEntry> {
        self.finalize(id, |entry| {
            entry.status = ProvenanceStatus::Accepted;
            entry.files_modified = completion.files_modified;
            entry.lines_added = completion.lines_added;
            entry.lines_removed = completion.lines_removed;
            entry.commit_sha = completion.commit_sha;
            entry.tests_passed = completion.tests_passed;
            entry.lint_passed = completion.lint_passed;
            entry.type_check_passed = completion.type_check_passed;
        })
    }

    /// Finalize a pending entry as rejected (verification failure, executor
    /// failure or interruption).
    #[instrument(skip_all, fields(id))]
    pub fn reject_operation(&self, id: &str, reason: &str) -> Result<ProvenanceEntry> {
        self.finalize(id, |entry| {
            entry.status = ProvenanceStatus::Rejected;
            entry.verification_notes = Some(reason.to_string());
        })
    }

    /// Explicit correction: an accepted entry whose change was later undone.
    pub fn mark_reverted(&self, id: &str, reason: &str) -> Result<ProvenanceEntry> {
        let _guard = self.lock()?;
        let mut entry = self.require_entry(id)?;
        if entry.status != ProvenanceStatus::Accepted {
            return Err(OrchestratorError::AlreadyFinalized {
                id: id.to_string(),
                status: entry.status.as_str().to_string(),
            }
            .into());
        }
        entry.status = ProvenanceStatus::Reverted;
        entry.verification_notes = Some(reason.to_string());
        write_json(&self.entry_path(id), &entry)?;
        info!(id, "provenance entry reverted");
        Ok(entry)
    }

    pub fn get_entry(&self, id: &str) -> Result<Option<ProvenanceEntry>> {
        self.load_entry(id)
    }

    pub fn entry_for_task(&self, task_id: &str) -> Result<Option<ProvenanceEntry>> {
        let index = self.load_index()?;
        match index.tasks.get(task_id) {
            Some(id) => self.load_entry(id),
            None => Ok(None),
        }
    }

    /// Id of the most recently finalized entry of this ledger's workspace.
    pub fn head(&self) -> Result<Option<String>> {
        Ok(self.load_index()?.heads.get(&self.workspace).cloned())
    }

    /// Entries newest first, optionally filtered by status.
    pub fn list_entries(
        &self,
        limit: usize,
        status: Option<ProvenanceStatus>,
    ) -> Result<Vec<ProvenanceEntry>> {
        let mut entries = self.all_entries()?;
        entries.retain(|entry| status.is_none_or(|wanted| entry.status == wanted));
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        entries.truncate(limit);
        Ok(entries)
    }

    pub fn get_stats(&self) -> Result<ProvenanceStats> {
        let entries = self.all_entries()?;
        let mut stats = ProvenanceStats {
            total_operations: entries.len(),
            ..ProvenanceStats::default()
        };
        for entry in &entries {
            match entry.status {
                ProvenanceStatus::Pending => stats.pending += 1,
                ProvenanceStatus::Accepted => stats.accepted += 1,
                ProvenanceStatus::Rejected => stats.rejected += 1,
                ProvenanceStatus::Reverted => stats.reverted += 1,
            }
            stats.total_lines_added += entry.lines_added;
            stats.total_lines_removed += entry.lines_removed;
            if let Some(passed) = entry.tests_passed {
                stats.tests_run += 1;
                if passed {
                    stats.tests_passed += 1;
                }
            }
            *stats.models_used.entry(entry.ai_model.clone()).or_default() += 1;
        }
        stats.acceptance_rate = ratio(stats.accepted, stats.total_operations);
        stats.test_pass_rate = ratio(stats.tests_passed, stats.tests_run);
        Ok(stats)
    }

    fn finalize(&self, id: &str, apply: impl FnOnce(&mut ProvenanceEntry)) -> Result<ProvenanceEntry> {
        let _guard = self.lock()?;
        let mut entry = self.require_entry(id)?;
        if entry.status != ProvenanceStatus::Pending {
            return Err(OrchestratorError::AlreadyFinalized {
                id: id.to_string(),
                status: entry.status.as_str().to_string(),
            }
            .into());
        }
        apply(&mut entry);
        entry.completed_at = Some(Utc::now());
        write_json(&self.entry_path(id), &entry)?;

        let mut index = self.load_index()?;
        index.heads.insert(entry.workspace.clone(), entry.id.clone());
        write_json(&self.dir.join(INDEX_FILE), &index)?;
        info!(id, status = entry.status.as_str(), "provenance entry finalized");
        Ok(entry)
    }

    fn lock(&self) -> Result<FileLock> {
        FileLock::acquire(&self.dir.join(INDEX_LOCK), self.lock_timeout)
    }

    fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// A corrupt index would break the chain, so it is reported, not rebuilt.
    fn load_index(&self) -> Result<LedgerIndex> {
        let path = self.dir.join(INDEX_FILE);
        match read_json_if_exists(&path) {
            Ok(index) => Ok(index.unwrap_or_default()),
            Err(err) => Err(OrchestratorError::CorruptState {
                path,
                reason: format!("{err:#}"),
            }
            .into()),
        }
    }

    fn load_entry(&self, id: &str) -> Result<Option<ProvenanceEntry>> {
        read_json_if_exists(&self.entry_path(id))
    }

    fn require_entry(&self, id: &str) -> Result<ProvenanceEntry> {
        self.load_entry(id)?.ok_or_else(|| {
            OrchestratorError::ProvenanceNotFound { id: id.to_string() }.into()
        })
    }

    fn all_entries(&self) -> Result<Vec<ProvenanceEntry>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for item in fs::read_dir(&self.dir).with_context(|| format!("read {}", self.dir.display()))? {
            let path = item.context("read provenance entry")?.path();
            if path.extension().is_none_or(|ext| ext != "json")
                || path.file_name().is_some_and(|name| name == INDEX_FILE)
            {
                continue;
            }
            match read_json::<ProvenanceEntry>(&path) {
                Ok(entry) => entries.push(entry),
                Err(err) => warn!(path = %path.display(), err = %format!("{err:#}"), "skipping unreadable provenance entry"),
            }
        }
        Ok(entries)
    }

    fn read_context(&self, files: &[String]) -> Vec<(String, Vec<u8>)> {
        files
            .iter()
            .filter_map(|rel| {
                let path: &Path = rel.as_ref();
                match fs::read(self.context_root.join(path)) {
                    Ok(bytes) => Some((rel.clone(), bytes)),
                    Err(err) => {
                        debug!(path = %rel, err = %err, "context file not hashed");
                        None
                    }
                }
            })
            .collect()
    }
}

fn preview(prompt: &str) -> String {
    let mut chars = prompt.chars();
    let head: String = chars.by_ref().take(PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

fn ratio(part: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}
