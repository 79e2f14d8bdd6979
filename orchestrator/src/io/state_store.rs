//! Unified, crash-safe state document under `.up/state.json`.
//!
//! Every mutation runs as one locked read-modify-write cycle
//! ([`StateStore::atomic_update`]), so concurrent threads and processes never
//! lose updates and readers never see a torn file. Each save first copies the
//! current primary to `state.json.bak`, so the backup lags by one generation.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::circuit::{BreakerState, CircuitBreakerState};
use crate::core::types::WorktreeStatus;
use crate::io::atomic::{read_json, write_atomic, write_json};
use crate::io::config::{OrchestratorConfig, load_config, write_config};
use crate::io::lock::FileLock;

pub const STATE_VERSION: &str = "2.0";
pub const UP_DIR: &str = ".up";
const STATE_FILE: &str = "state.json";
const BACKUP_FILE: &str = "state.json.bak";
const LOCK_FILE: &str = "state.json.lock";
const CONFIG_FILE: &str = "config.toml";
/// Context usage entries kept in the state document.
const CONTEXT_ENTRY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopPhase {
    #[default]
    Idle,
    Observe,
    Checkpoint,
    Execute,
    Verify,
    Commit,
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopState {
    pub iteration: u64,
    pub phase: LoopPhase,
    pub current_task: Option<String>,
    pub tasks_completed: Vec<String>,
    pub tasks_failed: Vec<String>,
    pub last_checkpoint: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub interrupted_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub doom_loop_threshold: u32,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            iteration: 0,
            phase: LoopPhase::Idle,
            current_task: None,
            tasks_completed: Vec::new(),
            tasks_failed: Vec::new(),
            last_checkpoint: None,
            started_at: None,
            interrupted_at: None,
            consecutive_failures: 0,
            doom_loop_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextStatus {
    Ok,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextEntry {
    pub task_id: String,
    pub tokens: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Token budget accounting across a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextState {
    pub budget: u64,
    pub total_tokens: u64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub session_start: DateTime<Utc>,
    pub entries: Vec<ContextEntry>,
}

impl Default for ContextState {
    fn default() -> Self {
        Self {
            budget: 100_000,
            total_tokens: 0,
            warning_threshold: 0.8,
            critical_threshold: 0.9,
            session_start: Utc::now(),
            entries: Vec::new(),
        }
    }
}

impl ContextState {
    fn ratio(&self) -> f64 {
        if self.budget == 0 {
            return 0.0;
        }
        self.total_tokens as f64 / self.budget as f64
    }

    pub fn usage_percent(&self) -> f64 {
        self.ratio() * 100.0
    }

    pub fn remaining_tokens(&self) -> u64 {
        self.budget.saturating_sub(self.total_tokens)
    }

    pub fn status(&self) -> ContextStatus {
        let ratio = self.ratio();
        if ratio >= self.critical_threshold {
            ContextStatus::Critical
        } else if ratio >= self.warning_threshold {
            ContextStatus::Warning
        } else {
            ContextStatus::Ok
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelState {
    pub active: bool,
    pub max_workers: usize,
    pub current_batch: u64,
    /// Task ids of agents currently provisioned.
    pub agents: Vec<String>,
}

impl Default for ParallelState {
    fn default() -> Self {
        Self {
            active: false,
            max_workers: 3,
            current_batch: 0,
            agents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsState {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub total_rollbacks: u64,
    pub total_checkpoints: u64,
}

impl MetricsState {
    pub fn success_rate(&self) -> f64 {
        let total = self.completed_tasks + self.failed_tasks;
        if total == 0 {
            return 0.0;
        }
        self.completed_tasks as f64 / total as f64
    }
}

/// One provisioned worker as seen by the unified state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    pub task_id: String,
    #[serde(default)]
    pub task_title: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub worktree_path: String,
    pub status: WorktreeStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    /// Checkpoint the current attempt rolls back to; never pruned while set.
    #[serde(default)]
    pub checkpoint: Option<String>,
}

/// Root persisted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnifiedState {
    pub version: String,
    #[serde(rename = "loop")]
    pub loop_state: LoopState,
    pub context: ContextState,
    pub parallel: ParallelState,
    pub metrics: MetricsState,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerState>,
    pub agents: BTreeMap<String, AgentState>,
    /// Checkpoint ids, oldest first, bounded by retention.
    pub checkpoints: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for UnifiedState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION.to_string(),
            loop_state: LoopState::default(),
            context: ContextState::default(),
            parallel: ParallelState::default(),
            metrics: MetricsState::default(),
            circuit_breakers: BTreeMap::new(),
            agents: BTreeMap::new(),
            checkpoints: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

impl UnifiedState {
    /// Get or create a named breaker, with thresholds taken from `cfg`.
    pub fn breaker_mut(&mut self, name: &str, cfg: &OrchestratorConfig) -> &mut CircuitBreakerState {
        self.circuit_breakers
            .entry(name.to_string())
            .or_insert_with(|| breaker_with_config(name, cfg))
    }

    /// Push configured thresholds into every sub-state that mirrors them.
    pub fn apply_config(&mut self, cfg: &OrchestratorConfig) {
        self.loop_state.doom_loop_threshold = cfg.doom_loop_threshold;
        self.context.budget = cfg.context.budget_tokens;
        self.context.warning_threshold = cfg.context.warning_threshold;
        self.context.critical_threshold = cfg.context.critical_threshold;
        self.parallel.max_workers = cfg.parallel.max_workers;
        for breaker in self.circuit_breakers.values_mut() {
            breaker.failure_threshold = cfg.circuit_breaker.failure_threshold;
            breaker.success_threshold = cfg.circuit_breaker.success_threshold;
            breaker.cooldown_minutes = cfg.circuit_breaker.cooldown_minutes;
        }
    }
}

fn breaker_with_config(name: &str, cfg: &OrchestratorConfig) -> CircuitBreakerState {
    CircuitBreakerState::new(name).with_thresholds(
        cfg.circuit_breaker.failure_threshold,
        cfg.circuit_breaker.success_threshold,
        cfg.circuit_breaker.cooldown_minutes,
    )
}

/// Advisory signal on consecutive task failures. Independent of the
/// circuit breaker, which is the hard stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoomLoopCheck {
    Clear,
    /// One failure away from the threshold.
    Warning { failures: u32, threshold: u32 },
    DoomLoop { failures: u32, threshold: u32 },
}

impl DoomLoopCheck {
    pub fn evaluate(failures: u32, threshold: u32) -> Self {
        if failures >= threshold {
            DoomLoopCheck::DoomLoop {
                failures,
                threshold,
            }
        } else if failures > 0 && failures + 1 >= threshold {
            DoomLoopCheck::Warning {
                failures,
                threshold,
            }
        } else {
            DoomLoopCheck::Clear
        }
    }

    pub fn message(&self) -> Option<String> {
        match self {
            DoomLoopCheck::Clear => None,
            DoomLoopCheck::Warning { failures, .. } => Some(format!(
                "{failures} consecutive failures; one more triggers doom-loop detection"
            )),
            DoomLoopCheck::DoomLoop { failures, .. } => Some(format!(
                "doom loop detected: {failures} consecutive failures; consider resetting instead of continuing"
            )),
        }
    }
}

/// Snapshot returned when consulting a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerCheck {
    pub allowed: bool,
    pub state: BreakerState,
    pub failures: u32,
    pub cooldown_remaining: Duration,
}

/// Owner of `.up/state.json`, its backup, lock and configuration.
#[derive(Debug)]
pub struct StateStore {
    up_dir: PathBuf,
    state_path: PathBuf,
    backup_path: PathBuf,
    lock_path: PathBuf,
    config_path: PathBuf,
    config: RwLock<OrchestratorConfig>,
}

impl StateStore {
    /// Open the store rooted at `<root>/.up`, loading `config.toml` if present.
    pub fn open(root: &Path) -> Result<Self> {
        let up_dir = root.join(UP_DIR);
        let config = load_config(&up_dir.join(CONFIG_FILE))?;
        Self::with_config(root, config)
    }

    /// Open with an explicit configuration (the file on disk is not read).
    pub fn with_config(root: &Path, config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        let up_dir = root.join(UP_DIR);
        ensure_self_ignored(&up_dir)?;
        Ok(Self {
            state_path: up_dir.join(STATE_FILE),
            backup_path: up_dir.join(BACKUP_FILE),
            lock_path: up_dir.join(LOCK_FILE),
            config_path: up_dir.join(CONFIG_FILE),
            up_dir,
            config: RwLock::new(config),
        })
    }

    pub fn up_dir(&self) -> &Path {
        &self.up_dir
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    pub fn config(&self) -> OrchestratorConfig {
        match self.config.read() {
            Ok(cfg) => cfg.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.config().lock_timeout_secs)
    }

    fn lock(&self) -> Result<FileLock> {
        FileLock::acquire(&self.lock_path, self.lock_timeout())
    }

    /// Load the current document (backup fallback, then fresh state).
    pub fn load(&self) -> Result<UnifiedState> {
        let _guard = self.lock()?;
        self.load_unlocked()
    }

    /// Save `state` (rolling backup, then temp + rename).
    pub fn save(&self, state: &mut UnifiedState) -> Result<()> {
        let _guard = self.lock()?;
        self.save_unlocked(state)
    }

    /// Locked read-modify-write: load, apply configuration, run `f`, save.
    #[instrument(skip_all)]
    pub fn atomic_update<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut UnifiedState, &OrchestratorConfig) -> R,
    {
        let _guard = self.lock()?;
        let mut state = self.load_unlocked()?;
        let cfg = self.config();
        let out = f(&mut state, &cfg);
        self.save_unlocked(&mut state)?;
        Ok(out)
    }

    fn load_unlocked(&self) -> Result<UnifiedState> {
        let cfg = self.config();
        if !self.state_path.exists() {
            let mut state = UnifiedState::default();
            state.apply_config(&cfg);
            return Ok(state);
        }
        match read_json::<UnifiedState>(&self.state_path) {
            Ok(mut state) => {
                state.apply_config(&cfg);
                Ok(state)
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "state file corrupt, trying backup");
                let mut state = match read_json::<UnifiedState>(&self.backup_path) {
                    Ok(state) => {
                        info!("recovered state from backup");
                        state
                    }
                    Err(backup_err) => {
                        warn!(err = %format!("{backup_err:#}"), "backup unusable, starting fresh state");
                        UnifiedState::default()
                    }
                };
                state.apply_config(&cfg);
                // Repair the primary without rotating the corrupt copy into the backup slot.
                write_json(&self.state_path, &state).context("repair state file")?;
                Ok(state)
            }
        }
    }

    fn save_unlocked(&self, state: &mut UnifiedState) -> Result<()> {
        state.updated_at = Utc::now();
        if self.state_path.exists()
            && let Err(err) = fs::copy(&self.state_path, &self.backup_path)
        {
            warn!(err = %err, "could not rotate state backup");
        }
        write_json(&self.state_path, state)?;
        debug!(path = %self.state_path.display(), "state saved");
        Ok(())
    }

    pub fn update_loop(&self, f: impl FnOnce(&mut LoopState)) -> Result<()> {
        self.atomic_update(|state, _| f(&mut state.loop_state))
    }

    /// Mark a run as started over `total_tasks` pending tasks.
    pub fn begin_run(&self, total_tasks: usize) -> Result<()> {
        self.atomic_update(|state, _| {
            state.metrics.total_tasks = total_tasks as u64;
            state.loop_state.phase = LoopPhase::Observe;
            state.loop_state.started_at = Some(Utc::now());
            state.loop_state.interrupted_at = None;
        })
    }

    pub fn record_task_complete(&self, task_id: &str) -> Result<()> {
        self.atomic_update(|state, _| {
            let lp = &mut state.loop_state;
            if !lp.tasks_completed.iter().any(|id| id == task_id) {
                lp.tasks_completed.push(task_id.to_string());
                state.metrics.completed_tasks += 1;
            }
            lp.consecutive_failures = 0;
            if lp.current_task.as_deref() == Some(task_id) {
                lp.current_task = None;
            }
        })
    }

    /// Returns the consecutive failure count after this failure.
    pub fn record_task_failed(&self, task_id: &str) -> Result<u32> {
        self.atomic_update(|state, _| {
            let lp = &mut state.loop_state;
            if !lp.tasks_failed.iter().any(|id| id == task_id) {
                lp.tasks_failed.push(task_id.to_string());
            }
            lp.consecutive_failures += 1;
            state.metrics.failed_tasks += 1;
            lp.consecutive_failures
        })
    }

    /// Append a checkpoint id, pruning the oldest beyond retention.
    ///
    /// With `task_id` the checkpoint becomes that agent's rollback target.
    /// The new id and the rollback targets of registered agents are never
    /// pruned, so the list may exceed retention while workers are live.
    pub fn add_checkpoint(&self, checkpoint_id: &str, task_id: Option<&str>) -> Result<Vec<String>> {
        self.atomic_update(|state, cfg| {
            state.checkpoints.push(checkpoint_id.to_string());
            state.loop_state.last_checkpoint = Some(checkpoint_id.to_string());
            state.metrics.total_checkpoints += 1;
            if let Some(agent) = task_id.and_then(|id| state.agents.get_mut(id)) {
                agent.checkpoint = Some(checkpoint_id.to_string());
            }
            let in_use: BTreeSet<&str> = state
                .agents
                .values()
                .filter_map(|agent| agent.checkpoint.as_deref())
                .collect();
            let mut excess = state
                .checkpoints
                .len()
                .saturating_sub(cfg.checkpoint_retention_count);
            let mut pruned = Vec::new();
            let older = &state.checkpoints[..state.checkpoints.len() - 1];
            for id in older {
                if excess == 0 {
                    break;
                }
                if !in_use.contains(id.as_str()) {
                    pruned.push(id.clone());
                    excess -= 1;
                }
            }
            state.checkpoints.retain(|id| !pruned.contains(id));
            pruned
        })
    }

    pub fn set_checkpoints(&self, ids: Vec<String>) -> Result<()> {
        self.atomic_update(|state, _| {
            state.loop_state.last_checkpoint = ids.last().cloned();
            state.checkpoints = ids;
        })
    }

    pub fn record_rollback(&self) -> Result<()> {
        self.atomic_update(|state, _| state.metrics.total_rollbacks += 1)
    }

    pub fn add_agent(&self, agent: AgentState) -> Result<()> {
        self.atomic_update(|state, _| {
            if !state.parallel.agents.contains(&agent.task_id) {
                state.parallel.agents.push(agent.task_id.clone());
            }
            state.agents.insert(agent.task_id.clone(), agent);
        })
    }

    pub fn update_agent_status(
        &self,
        task_id: &str,
        status: WorktreeStatus,
        error: Option<String>,
    ) -> Result<()> {
        self.atomic_update(|state, _| {
            if let Some(agent) = state.agents.get_mut(task_id) {
                agent.status = status;
                if matches!(
                    status,
                    WorktreeStatus::Passed | WorktreeStatus::Failed | WorktreeStatus::Merged
                ) {
                    agent.completed_at = Some(Utc::now());
                }
                if error.is_some() {
                    agent.error = error;
                }
            }
        })
    }

    pub fn remove_agent(&self, task_id: &str) -> Result<()> {
        self.atomic_update(|state, _| {
            state.agents.remove(task_id);
            state.parallel.agents.retain(|id| id != task_id);
        })
    }

    pub fn set_parallel_active(&self, active: bool, batch: u64) -> Result<()> {
        self.atomic_update(|state, _| {
            state.parallel.active = active;
            state.parallel.current_batch = batch;
            if active {
                state.loop_state.iteration += 1;
                state.loop_state.phase = LoopPhase::Execute;
            } else if state.loop_state.phase != LoopPhase::Interrupted {
                state.loop_state.phase = LoopPhase::Idle;
            }
        })
    }

    pub fn mark_interrupted(&self, task_id: Option<&str>) -> Result<()> {
        self.atomic_update(|state, _| {
            state.loop_state.phase = LoopPhase::Interrupted;
            state.loop_state.interrupted_at = Some(Utc::now());
            if let Some(task_id) = task_id {
                state.loop_state.current_task = Some(task_id.to_string());
            }
            state.parallel.active = false;
        })
    }

    /// Add estimated token usage and return the resulting budget status.
    pub fn record_context_usage(&self, task_id: &str, tokens: u64) -> Result<ContextStatus> {
        self.atomic_update(|state, _| {
            let ctx = &mut state.context;
            ctx.total_tokens = ctx.total_tokens.saturating_add(tokens);
            ctx.entries.push(ContextEntry {
                task_id: task_id.to_string(),
                tokens,
                recorded_at: Utc::now(),
            });
            let excess = ctx.entries.len().saturating_sub(CONTEXT_ENTRY_LIMIT);
            ctx.entries.drain(..excess);
            ctx.status()
        })
    }

    /// Edit, validate and persist the configuration, then re-apply it to state.
    pub fn update_config(&self, f: impl FnOnce(&mut OrchestratorConfig)) -> Result<()> {
        let mut cfg = self.config();
        f(&mut cfg);
        cfg.validate()?;
        write_config(&self.config_path, &cfg)?;
        {
            let mut slot = self
                .config
                .write()
                .map_err(|_| anyhow!("configuration lock poisoned"))?;
            *slot = cfg;
        }
        self.atomic_update(|_, _| ())
    }

    /// Consult a breaker, moving it to HALF_OPEN when its cooldown has elapsed.
    pub fn breaker_can_execute(&self, name: &str) -> Result<BreakerCheck> {
        self.atomic_update(|state, cfg| {
            let now = Utc::now();
            let breaker = state.breaker_mut(name, cfg);
            let allowed = breaker.can_execute(now);
            BreakerCheck {
                allowed,
                state: breaker.state,
                failures: breaker.failures,
                cooldown_remaining: breaker.cooldown_remaining(now),
            }
        })
    }

    pub fn record_breaker_success(&self, name: &str) -> Result<BreakerState> {
        self.atomic_update(|state, cfg| state.breaker_mut(name, cfg).record_success())
    }

    /// Returns the breaker after the failure is counted.
    pub fn record_breaker_failure(&self, name: &str) -> Result<CircuitBreakerState> {
        self.atomic_update(|state, cfg| {
            let breaker = state.breaker_mut(name, cfg);
            breaker.record_failure(Utc::now());
            breaker.clone()
        })
    }

    pub fn check_doom_loop(&self) -> Result<DoomLoopCheck> {
        let state = self.load()?;
        Ok(DoomLoopCheck::evaluate(
            state.loop_state.consecutive_failures,
            self.config().doom_loop_threshold,
        ))
    }

    /// Replace the document with fresh state.
    pub fn reset(&self) -> Result<UnifiedState> {
        let _guard = self.lock()?;
        let mut state = UnifiedState::default();
        state.apply_config(&self.config());
        self.save_unlocked(&mut state)?;
        Ok(state)
    }
}

/// Create `dir` with a `.gitignore` that ignores everything inside it.
pub fn ensure_self_ignored(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let ignore = dir.join(".gitignore");
    if !ignore.exists() {
        write_atomic(&ignore, b"*\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn store(root: &Path) -> StateStore {
        StateStore::with_config(root, OrchestratorConfig::default()).expect("store")
    }

    #[test]
    fn fresh_store_loads_default_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        let state = store.load().expect("load");
        assert_eq!(state.version, STATE_VERSION);
        assert_eq!(state.loop_state.iteration, 0);
        assert!(temp.path().join(".up/.gitignore").exists());
    }

    #[test]
    fn round_trip_preserves_loop_checkpoints_and_breakers() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store
            .update_loop(|lp| {
                lp.iteration = 7;
                lp.current_task = Some("T3".to_string());
            })
            .expect("loop");
        store.add_checkpoint("cp-1", None).expect("cp1");
        store.add_checkpoint("cp-2", None).expect("cp2");
        store.record_breaker_failure("task").expect("breaker");

        let raw = fs::read_to_string(store.state_path()).expect("read");
        let parsed: UnifiedState = serde_json::from_str(&raw).expect("parse");
        let loaded = store.load().expect("load");
        assert_eq!(parsed.loop_state, loaded.loop_state);
        assert_eq!(loaded.loop_state.iteration, 7);
        assert_eq!(loaded.loop_state.current_task.as_deref(), Some("T3"));
        assert_eq!(loaded.checkpoints, vec!["cp-1".to_string(), "cp-2".to_string()]);
        assert_eq!(parsed.circuit_breakers, loaded.circuit_breakers);
        assert_eq!(loaded.circuit_breakers["task"].failures, 1);
        assert!(raw.contains("\"loop\""));
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(store(temp.path()));
        thread::scope(|scope| {
            for _ in 0..10 {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    store
                        .atomic_update(|state, _| state.loop_state.iteration += 1)
                        .expect("update");
                });
            }
        });
        assert_eq!(store.load().expect("load").loop_state.iteration, 10);
    }

    #[test]
    fn separate_store_instances_share_the_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path().to_path_buf();
        thread::scope(|scope| {
            for _ in 0..4 {
                let root = root.clone();
                scope.spawn(move || {
                    let store = store(&root);
                    for _ in 0..5 {
                        store.record_rollback().expect("rollback");
                    }
                });
            }
        });
        let state = store(&root).load().expect("load");
        assert_eq!(state.metrics.total_rollbacks, 20);
    }

    #[test]
    fn corrupted_primary_recovers_from_backup() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.update_loop(|lp| lp.iteration = 1).expect("first");
        store.update_loop(|lp| lp.iteration = 2).expect("second");

        fs::write(store.state_path(), "{ not json").expect("corrupt");
        let state = store.load().expect("load");
        assert_eq!(state.loop_state.iteration, 1);

        // The primary is repaired and the backup is left intact.
        let repaired: UnifiedState = read_json(store.state_path()).expect("repaired");
        assert_eq!(repaired.loop_state.iteration, 1);
        let backup: UnifiedState = read_json(store.backup_path()).expect("backup");
        assert_eq!(backup.loop_state.iteration, 1);
    }

    #[test]
    fn both_files_corrupt_starts_fresh() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.update_loop(|lp| lp.iteration = 4).expect("write");
        fs::write(store.state_path(), "garbage").expect("corrupt primary");
        fs::write(store.backup_path(), "garbage").expect("corrupt backup");
        let state = store.load().expect("load");
        assert_eq!(state.loop_state.iteration, 0);
    }

    #[test]
    fn checkpoint_retention_prunes_oldest() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = OrchestratorConfig::default();
        cfg.checkpoint_retention_count = 2;
        let store = StateStore::with_config(temp.path(), cfg).expect("store");
        store.add_checkpoint("a", None).expect("a");
        store.add_checkpoint("b", None).expect("b");
        let pruned = store.add_checkpoint("c", None).expect("c");
        assert_eq!(pruned, vec!["a".to_string()]);
        let state = store.load().expect("load");
        assert_eq!(state.checkpoints, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(state.loop_state.last_checkpoint.as_deref(), Some("c"));
        assert_eq!(state.metrics.total_checkpoints, 3);
    }

    #[test]
    fn retention_skips_checkpoints_of_live_agents() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut cfg = OrchestratorConfig::default();
        cfg.checkpoint_retention_count = 1;
        let store = StateStore::with_config(temp.path(), cfg).expect("store");
        for id in ["A", "B"] {
            store
                .add_agent(AgentState {
                    task_id: id.to_string(),
                    task_title: String::new(),
                    branch: format!("agent/{id}"),
                    worktree_path: String::new(),
                    status: WorktreeStatus::Executing,
                    started_at: Utc::now(),
                    completed_at: None,
                    error: None,
                    checkpoint: None,
                })
                .expect("add");
        }

        assert!(store.add_checkpoint("cp-A-1", Some("A")).expect("a").is_empty());
        assert!(store.add_checkpoint("cp-B-1", Some("B")).expect("b").is_empty());
        let state = store.load().expect("load");
        assert_eq!(state.checkpoints, vec!["cp-A-1".to_string(), "cp-B-1".to_string()]);
        assert_eq!(state.agents["A"].checkpoint.as_deref(), Some("cp-A-1"));

        // A's next attempt releases its previous checkpoint.
        let pruned = store.add_checkpoint("cp-A-2", Some("A")).expect("a2");
        assert_eq!(pruned, vec!["cp-A-1".to_string()]);

        store.remove_agent("B").expect("remove");
        let pruned = store.add_checkpoint("cp-main", None).expect("main");
        assert_eq!(pruned, vec!["cp-B-1".to_string()]);
        let state = store.load().expect("load");
        assert_eq!(state.checkpoints, vec!["cp-A-2".to_string(), "cp-main".to_string()]);
    }

    #[test]
    fn doom_loop_is_advisory_and_resets_on_success() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.record_task_failed("a").expect("fail");
        assert_eq!(store.check_doom_loop().expect("check"), DoomLoopCheck::Clear);
        store.record_task_failed("b").expect("fail");
        assert!(matches!(
            store.check_doom_loop().expect("check"),
            DoomLoopCheck::Warning { failures: 2, .. }
        ));
        store.record_task_failed("c").expect("fail");
        assert!(matches!(
            store.check_doom_loop().expect("check"),
            DoomLoopCheck::DoomLoop { failures: 3, .. }
        ));
        store.record_task_complete("d").expect("complete");
        assert_eq!(store.check_doom_loop().expect("check"), DoomLoopCheck::Clear);
    }

    #[test]
    fn completing_a_task_twice_counts_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.record_task_complete("a").expect("complete");
        store.record_task_complete("a").expect("complete again");
        store.record_task_complete("b").expect("complete");
        let state = store.load().expect("load");
        assert_eq!(state.metrics.completed_tasks, 2);
        assert_eq!(
            state.loop_state.tasks_completed,
            vec!["a".to_string(), "b".to_string()]
        );
    }

    #[test]
    fn breaker_thresholds_follow_config_updates() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.record_breaker_failure("task").expect("failure");
        store
            .update_config(|cfg| cfg.circuit_breaker.failure_threshold = 2)
            .expect("config");

        let breaker = store.record_breaker_failure("task").expect("failure");
        assert_eq!(breaker.failure_threshold, 2);
        assert_eq!(breaker.state, BreakerState::Open);

        let check = store.breaker_can_execute("task").expect("check");
        assert!(!check.allowed);
        assert!(check.cooldown_remaining > Duration::ZERO);
        assert!(temp.path().join(".up/config.toml").exists());
    }

    #[test]
    fn context_usage_reports_budget_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        assert_eq!(
            store.record_context_usage("a", 50_000).expect("usage"),
            ContextStatus::Ok
        );
        assert_eq!(
            store.record_context_usage("b", 30_000).expect("usage"),
            ContextStatus::Warning
        );
        assert_eq!(
            store.record_context_usage("c", 15_000).expect("usage"),
            ContextStatus::Critical
        );
    }

    #[test]
    fn agents_track_parallel_membership() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store
            .add_agent(AgentState {
                task_id: "T1".to_string(),
                task_title: "One".to_string(),
                branch: "agent/T1".to_string(),
                worktree_path: ".worktrees/T1".to_string(),
                status: WorktreeStatus::Created,
                started_at: Utc::now(),
                completed_at: None,
                error: None,
                checkpoint: None,
            })
            .expect("add");
        store
            .update_agent_status("T1", WorktreeStatus::Executing, None)
            .expect("status");
        let state = store.load().expect("load");
        assert_eq!(state.parallel.agents, vec!["T1".to_string()]);
        assert_eq!(state.agents["T1"].status, WorktreeStatus::Executing);

        store.remove_agent("T1").expect("remove");
        let state = store.load().expect("load");
        assert!(state.parallel.agents.is_empty());
        assert!(state.agents.is_empty());
    }

    #[test]
    fn interrupt_is_persisted() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = store(temp.path());
        store.set_parallel_active(true, 1).expect("active");
        store.mark_interrupted(Some("T2")).expect("interrupt");
        store.set_parallel_active(false, 1).expect("inactive");
        let state = store.load().expect("load");
        assert_eq!(state.loop_state.phase, LoopPhase::Interrupted);
        assert!(state.loop_state.interrupted_at.is_some());
        assert_eq!(state.loop_state.current_task.as_deref(), Some("T2"));
    }
}
