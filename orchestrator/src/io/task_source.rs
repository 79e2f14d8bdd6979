//! JSON task file: load, schema validation, pending selection and completion.
//!
//! Tasks live in a `tasks` array (or the older `userStories` array). Other
//! top-level fields are preserved when the file is rewritten.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, info, instrument};

use crate::core::types::Task;
use crate::io::atomic::{read_json, write_json};
use crate::io::lock::FileLock;

pub const TASKS_SCHEMA: &str = include_str!("../../schemas/tasks.schema.json");
const TASK_KEYS: [&str; 2] = ["tasks", "userStories"];

pub struct TaskSource {
    path: PathBuf,
    lock_timeout: Duration,
}

impl TaskSource {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every task in file order.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn load(&self) -> Result<Vec<Task>> {
        let doc: Value = read_json(&self.path)?;
        let tasks = parse_tasks(&doc).with_context(|| format!("load tasks from {}", self.path.display()))?;
        debug!(count = tasks.len(), "tasks loaded");
        Ok(tasks)
    }

    /// Tasks not yet marked as passing.
    pub fn pending(&self) -> Result<Vec<Task>> {
        Ok(self.load()?.into_iter().filter(|task| !task.passes).collect())
    }

    /// Set `passes: true` on `task_id` and rewrite the file atomically.
    #[instrument(skip_all, fields(task_id))]
    pub fn mark_complete(&self, task_id: &str) -> Result<()> {
        let _lock = FileLock::acquire(&self.lock_path(), self.lock_timeout)?;
        let mut doc: Value = read_json(&self.path)?;
        let key = task_key(&doc)?;
        let task = doc
            .get_mut(key)
            .and_then(Value::as_array_mut)
            .and_then(|items| {
                items
                    .iter_mut()
                    .find(|item| item.get("id").and_then(Value::as_str) == Some(task_id))
            })
            .ok_or_else(|| anyhow!("task {task_id} not found in {}", self.path.display()))?;
        let Some(fields) = task.as_object_mut() else {
            bail!("task {task_id} is not an object");
        };
        fields.insert("passes".to_string(), Value::Bool(true));
        write_json(&self.path, &doc)?;
        info!(task_id, "task marked complete");
        Ok(())
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        self.path.with_file_name(name)
    }
}

/// Validate a task document against the embedded schema and deserialize it.
pub fn parse_tasks(doc: &Value) -> Result<Vec<Task>> {
    validate_schema(doc)?;
    let key = task_key(doc)?;
    let items = doc.get(key).cloned().unwrap_or(Value::Array(Vec::new()));
    serde_json::from_value(items).with_context(|| format!("deserialize {key}"))
}

fn task_key(doc: &Value) -> Result<&'static str> {
    TASK_KEYS
        .into_iter()
        .find(|key| doc.get(key).is_some_and(Value::is_array))
        .ok_or_else(|| anyhow!("task file needs a `tasks` or `userStories` array"))
}

fn validate_schema(instance: &Value) -> Result<()> {
    let schema: Value = serde_json::from_str(TASKS_SCHEMA).context("parse tasks schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile tasks schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        bail!("task file failed schema validation:\n- {}", messages.join("\n- "));
    }
    Ok(())
}
