//! Cross-agent notes, file claims and completion markers.
//!
//! Stored as one JSON document at `.up/shared_knowledge.json`. Every operation
//! reads, mutates and rewrites the document while holding both an in-process
//! mutex and the document's file lock, so concurrent workers and processes
//! never lose each other's writes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::OrchestratorError;
use crate::io::atomic::{read_json_if_exists, write_json};
use crate::io::lock::FileLock;

pub const KNOWLEDGE_FILE: &str = "shared_knowledge.json";
const RECENT_ENTRIES: usize = 20;
const RECENT_WARNINGS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeCategory {
    Discovery,
    Decision,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub agent: String,
    pub category: KnowledgeCategory,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeDocument {
    pub entries: Vec<KnowledgeEntry>,
    /// path -> claiming agent
    pub file_claims: BTreeMap<String, String>,
    pub completed_tasks: Vec<String>,
}

pub struct SharedKnowledge {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
    guard: Mutex<()>,
}

impl SharedKnowledge {
    /// Knowledge document inside the `.up` directory `up_dir`.
    pub fn new(up_dir: &Path, lock_timeout: Duration) -> Self {
        let path = up_dir.join(KNOWLEDGE_FILE);
        let lock_path = up_dir.join(format!("{KNOWLEDGE_FILE}.lock"));
        Self {
            path,
            lock_path,
            lock_timeout,
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<KnowledgeDocument> {
        let _held = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout)?;
        self.read()
    }

    pub fn add_entry(&self, agent: &str, category: KnowledgeCategory, content: &str) -> Result<()> {
        self.update(|doc| {
            doc.entries.push(KnowledgeEntry {
                agent: agent.to_string(),
                category,
                content: content.to_string(),
                timestamp: Utc::now(),
            });
        })
    }

    pub fn add_warning(&self, agent: &str, warning: &str) -> Result<()> {
        self.add_entry(agent, KnowledgeCategory::Warning, warning)
    }

    /// Recent notes and warnings written by other agents, one per line.
    /// Empty when there is nothing to share.
    pub fn get_context_for_agent(&self, agent: &str) -> Result<String> {
        let doc = self.load()?;
        let from_others = |entry: &&KnowledgeEntry| entry.agent != agent;

        let notes: Vec<&KnowledgeEntry> = doc
            .entries
            .iter()
            .filter(|entry| entry.category != KnowledgeCategory::Warning)
            .filter(from_others)
            .collect();
        let warnings: Vec<&KnowledgeEntry> = doc
            .entries
            .iter()
            .filter(|entry| entry.category == KnowledgeCategory::Warning)
            .filter(from_others)
            .collect();

        let mut lines = Vec::new();
        for entry in &notes[notes.len().saturating_sub(RECENT_ENTRIES)..] {
            lines.push(format!("[{}] {}", entry.agent, entry.content));
        }
        for entry in &warnings[warnings.len().saturating_sub(RECENT_WARNINGS)..] {
            lines.push(format!("WARNING from {}: {}", entry.agent, entry.content));
        }
        Ok(lines.join("\n"))
    }

    pub fn entries_for_agent(&self, agent: &str) -> Result<Vec<KnowledgeEntry>> {
        Ok(self
            .load()?
            .entries
            .into_iter()
            .filter(|entry| entry.agent == agent)
            .collect())
    }

    /// Claim `paths` for `agent`. Paths held by another agent are returned as
    /// conflicts and stay with their owner; the rest are claimed.
    #[instrument(skip_all, fields(agent))]
    pub fn claim_files<'a, I>(&self, agent: &str, paths: I) -> Result<Vec<String>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let paths: Vec<&String> = paths.into_iter().collect();
        let mut conflicts = Vec::new();
        self.update(|doc| {
            for path in paths {
                match doc.file_claims.get(path) {
                    Some(owner) if owner != agent => conflicts.push(path.clone()),
                    _ => {
                        doc.file_claims.insert(path.clone(), agent.to_string());
                    }
                }
            }
        })?;
        if !conflicts.is_empty() {
            debug!(count = conflicts.len(), "file claims conflict");
        }
        Ok(conflicts)
    }

    pub fn release_files(&self, agent: &str) -> Result<()> {
        self.update(|doc| doc.file_claims.retain(|_, owner| owner != agent))
    }

    /// Record `task_id` as complete. Repeated calls keep a single marker.
    pub fn mark_complete(&self, task_id: &str) -> Result<()> {
        self.update(|doc| {
            if !doc.completed_tasks.iter().any(|done| done == task_id) {
                doc.completed_tasks.push(task_id.to_string());
            }
        })
    }

    pub fn completed_tasks(&self) -> Result<Vec<String>> {
        Ok(self.load()?.completed_tasks)
    }

    /// Clear everything before a new batch.
    pub fn reset(&self) -> Result<()> {
        self.update(|doc| *doc = KnowledgeDocument::default())
    }

    fn update(&self, apply: impl FnOnce(&mut KnowledgeDocument)) -> Result<()> {
        let _held = self.guard.lock().unwrap_or_else(PoisonError::into_inner);
        let _lock = FileLock::acquire(&self.lock_path, self.lock_timeout)?;
        let mut doc = self.read()?;
        apply(&mut doc);
        write_json(&self.path, &doc)
    }

    fn read(&self) -> Result<KnowledgeDocument> {
        match read_json_if_exists(&self.path) {
            Ok(doc) => Ok(doc.unwrap_or_default()),
            Err(err) => Err(OrchestratorError::CorruptState {
                path: self.path.clone(),
                reason: format!("{err:#}"),
            }
            .into()),
        }
    }
}
