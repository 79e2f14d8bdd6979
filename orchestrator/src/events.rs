//! Progress events published while a run executes.
//!
//! Events are product output for a presentation layer; tracing stays
//! developer diagnostics. Sinks never fail the run: write errors are logged
//! and dropped.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::core::types::WorktreeStatus;
use crate::orchestrate::{RunStop, WaveSummary};

pub const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        pending_tasks: usize,
        waves: usize,
    },
    WaveStarted {
        wave: usize,
        total_waves: usize,
        tasks: Vec<String>,
    },
    /// A wave was split because some of its tasks touch the same files.
    SubWaveSplit {
        wave: usize,
        groups: Vec<Vec<String>>,
        conflicts: usize,
    },
    TaskStatusChanged {
        task_id: String,
        status: WorktreeStatus,
        attempt: u32,
    },
    TaskSkipped {
        task_id: String,
        reason: String,
    },
    CircuitBreakerTripped {
        name: String,
        failures: u32,
        cooldown_remaining_secs: u64,
    },
    MergeResult {
        task_id: String,
        success: bool,
        commit_sha: Option<String>,
        error: Option<String>,
    },
    DoomLoopWarning {
        message: String,
        failures: u32,
        threshold: u32,
    },
    WaveFinished {
        summary: WaveSummary,
    },
    RunFinished {
        stop: RunStop,
        completed: usize,
        failed: usize,
        skipped: usize,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Forwards events to an in-process consumer.
pub struct ChannelSink {
    tx: Sender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new(tx: Sender<ProgressEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        // A dropped receiver just means nobody is watching.
        let _ = self.tx.send(event);
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    at: DateTime<Utc>,
    #[serde(flatten)]
    event: &'a ProgressEvent,
}

/// Appends one JSON object per line, for a consumer in another process.
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    fn write(&self, event: &ProgressEvent) -> Result<()> {
        let mut line = serde_json::to_string(&Envelope {
            at: Utc::now(),
            event,
        })?;
        line.push('\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(line.as_bytes())?;
        file.flush()?;
        Ok(())
    }
}

impl EventSink for JsonlSink {
    fn emit(&self, event: ProgressEvent) {
        if let Err(err) = self.write(&event) {
            warn!(path = %self.path.display(), err = %err, "dropping progress event");
        }
    }
}
